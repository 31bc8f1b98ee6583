//! Application callback surface and the modification notifier. Entity
//! changes are funnelled through a channel, batched by the notifier task
//! and delivered on it; `flush()` round-trips an ack so a caller can
//! guarantee every prior modification was observed before, e.g., the idle
//! signal fires.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::model::thumbnail::ThumbnailSizeType;

/// Callbacks fired by the engine towards the embedding application.
/// Methods default to no-ops so implementors only override what they
/// observe. All of them may fire from background tasks.
#[allow(unused_variables)]
pub trait MediaLibraryCb: Send + Sync {
    fn on_media_added(&self, ids: &[i64]) {}
    fn on_media_updated(&self, ids: &[i64]) {}
    fn on_media_removed(&self, ids: &[i64]) {}

    fn on_album_added(&self, ids: &[i64]) {}
    fn on_album_updated(&self, ids: &[i64]) {}
    fn on_album_removed(&self, ids: &[i64]) {}

    fn on_artist_added(&self, ids: &[i64]) {}
    fn on_artist_updated(&self, ids: &[i64]) {}
    fn on_artist_removed(&self, ids: &[i64]) {}

    fn on_genre_added(&self, ids: &[i64]) {}
    fn on_genre_updated(&self, ids: &[i64]) {}
    fn on_genre_removed(&self, ids: &[i64]) {}

    fn on_playlist_added(&self, ids: &[i64]) {}
    fn on_playlist_updated(&self, ids: &[i64]) {}
    fn on_playlist_removed(&self, ids: &[i64]) {}

    fn on_media_group_added(&self, ids: &[i64]) {}
    fn on_media_group_updated(&self, ids: &[i64]) {}
    fn on_media_group_removed(&self, ids: &[i64]) {}

    fn on_folder_added(&self, ids: &[i64]) {}
    fn on_folder_updated(&self, ids: &[i64]) {}
    fn on_folder_removed(&self, ids: &[i64]) {}

    fn on_show_added(&self, ids: &[i64]) {}
    fn on_show_updated(&self, ids: &[i64]) {}
    fn on_show_removed(&self, ids: &[i64]) {}

    fn on_subscription_added(&self, ids: &[i64]) {}
    fn on_subscription_updated(&self, ids: &[i64]) {}
    fn on_subscription_removed(&self, ids: &[i64]) {}

    fn on_discovery_started(&self) {}
    fn on_discovery_progress(&self, root: &str) {}
    fn on_discovery_completed(&self) {}
    fn on_discovery_failed(&self, root: &str) {}
    fn on_root_added(&self, root: &str, success: bool) {}
    fn on_root_removed(&self, root: &str, success: bool) {}
    fn on_root_banned(&self, root: &str, success: bool) {}
    fn on_root_unbanned(&self, root: &str, success: bool) {}

    fn on_parsing_stats_updated(&self, done: u64, total: u64) {}
    fn on_background_tasks_idle_changed(&self, idle: bool) {}

    fn on_media_thumbnail_ready(&self, media_id: i64, size_type: ThumbnailSizeType, success: bool) {
    }

    fn on_cache_idle_changed(&self, idle: bool) {}
    fn on_subscription_cache_updated(&self, subscription_id: i64) {}
}

/// No-op implementation for tests and headless embedders.
pub struct NoopCb;
impl MediaLibraryCb for NoopCb {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Media,
    Album,
    Artist,
    Genre,
    Playlist,
    MediaGroup,
    Folder,
    Show,
    Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Change {
    Added,
    Updated,
    Removed,
}

enum Note {
    Entity(Entity, Change, i64),
    Flush(oneshot::Sender<()>),
}

/// Cheap cloneable handle used by workers to queue notifications.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Note>,
}

impl Notifier {
    pub fn notify(&self, entity: Entity, change: Change, id: i64) {
        let _ = self.tx.send(Note::Entity(entity, change, id));
    }

    /// Wait until every notification queued before this call has been
    /// delivered.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Note::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// The notifier worker: drains the channel, groups consecutive changes per
/// (entity, change) pair and invokes the application callback with id
/// batches.
pub struct NotifierWorker {
    rx: mpsc::UnboundedReceiver<Note>,
    cb: Arc<dyn MediaLibraryCb>,
}

impl NotifierWorker {
    pub fn new(cb: Arc<dyn MediaLibraryCb>) -> (Notifier, NotifierWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Notifier { tx }, NotifierWorker { rx, cb })
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                note = self.rx.recv() => match note {
                    Some(note) => note,
                    None => break,
                },
            };

            let mut batches: HashMap<(Entity, Change), Vec<i64>> = HashMap::new();
            let mut flushes: Vec<oneshot::Sender<()>> = Vec::new();
            let mut queue = vec![first];
            // Drain whatever is immediately available so bulk imports
            // produce batched callbacks rather than one call per row.
            while let Ok(note) = self.rx.try_recv() {
                queue.push(note);
            }
            for note in queue {
                match note {
                    Note::Entity(entity, change, id) => {
                        batches.entry((entity, change)).or_default().push(id);
                    }
                    Note::Flush(ack) => flushes.push(ack),
                }
            }

            for ((entity, change), ids) in batches {
                self.deliver(entity, change, &ids);
            }
            for ack in flushes {
                let _ = ack.send(());
            }
        }
        tracing::debug!("Notifier worker stopped");
    }

    fn deliver(&self, entity: Entity, change: Change, ids: &[i64]) {
        use Change::*;
        use Entity::*;
        let cb = &*self.cb;
        match (entity, change) {
            (Media, Added) => cb.on_media_added(ids),
            (Media, Updated) => cb.on_media_updated(ids),
            (Media, Removed) => cb.on_media_removed(ids),
            (Album, Added) => cb.on_album_added(ids),
            (Album, Updated) => cb.on_album_updated(ids),
            (Album, Removed) => cb.on_album_removed(ids),
            (Artist, Added) => cb.on_artist_added(ids),
            (Artist, Updated) => cb.on_artist_updated(ids),
            (Artist, Removed) => cb.on_artist_removed(ids),
            (Genre, Added) => cb.on_genre_added(ids),
            (Genre, Updated) => cb.on_genre_updated(ids),
            (Genre, Removed) => cb.on_genre_removed(ids),
            (Playlist, Added) => cb.on_playlist_added(ids),
            (Playlist, Updated) => cb.on_playlist_updated(ids),
            (Playlist, Removed) => cb.on_playlist_removed(ids),
            (MediaGroup, Added) => cb.on_media_group_added(ids),
            (MediaGroup, Updated) => cb.on_media_group_updated(ids),
            (MediaGroup, Removed) => cb.on_media_group_removed(ids),
            (Folder, Added) => cb.on_folder_added(ids),
            (Folder, Updated) => cb.on_folder_updated(ids),
            (Folder, Removed) => cb.on_folder_removed(ids),
            (Show, Added) => cb.on_show_added(ids),
            (Show, Updated) => cb.on_show_updated(ids),
            (Show, Removed) => cb.on_show_removed(ids),
            (Subscription, Added) => cb.on_subscription_added(ids),
            (Subscription, Updated) => cb.on_subscription_updated(ids),
            (Subscription, Removed) => cb.on_subscription_removed(ids),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        added: Mutex<Vec<i64>>,
    }

    impl MediaLibraryCb for Recorder {
        fn on_media_added(&self, ids: &[i64]) {
            self.added.lock().unwrap().extend_from_slice(ids);
        }
    }

    #[tokio::test]
    async fn test_flush_observes_prior_notifications() {
        let recorder = Arc::new(Recorder {
            added: Mutex::new(Vec::new()),
        });
        let (notifier, worker) = NotifierWorker::new(recorder.clone());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        notifier.notify(Entity::Media, Change::Added, 1);
        notifier.notify(Entity::Media, Change::Added, 2);
        notifier.flush().await;

        assert_eq!(&*recorder.added.lock().unwrap(), &[1, 2]);
        shutdown.cancel();
        let _ = handle.await;
    }
}
