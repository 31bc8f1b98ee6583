//! Link service: materialises deferred associations (playlist membership,
//! subscription membership, attached subtitle/soundtrack files) once the
//! target entities exist.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::is_foreign_key_violation;
use crate::model::file::{File, FileType};
use crate::model::media::Media;
use crate::model::playlist::Playlist;
use crate::model::subscription::Subscription;
use crate::model::task::{LinkType, Step, TaskType};
use crate::mrl;
use crate::notifier::{Change, Entity};
use crate::parser::item::Item;
use crate::parser::{ParserCtx, ParserService, Status};

pub struct LinkService {
    ctx: Arc<ParserCtx>,
}

impl LinkService {
    pub fn new(ctx: Arc<ParserCtx>) -> LinkService {
        LinkService { ctx }
    }

    /// A creation task for the same mrl may be pending or in flight on
    /// another worker; linking must wait for it rather than race it into
    /// a duplicate media.
    async fn creation_pending(&self, item: &Item) -> bool {
        let pending: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE type = 1 AND mrl = ?")
                .bind(&item.mrl)
                .fetch_one(&self.ctx.pool)
                .await
                .unwrap_or((0,));
        pending.0 > 0
    }

    /// Resolve the media a link task points at, creating an external media
    /// when the target was never ingested (e.g. a playlist entry living
    /// outside every library root). If the file later gets discovered, the
    /// analyzer promotes the external media in place, so the association
    /// survives.
    async fn find_or_create_media(&self, item: &Item) -> crate::error::Result<Media> {
        if let Some(media) = Media::by_mrl(&self.ctx.pool, &item.mrl).await? {
            return Ok(media);
        }
        let title = item
            .meta(crate::parser::item::Metadata::Title)
            .map(String::from)
            .unwrap_or_else(|| {
                mrl::decode(mrl::file_name(&item.mrl))
                    .unwrap_or_else(|_| mrl::file_name(&item.mrl).to_string())
            });
        let media = Media::create_external(&self.ctx.pool, &item.mrl, &title, None).await?;
        self.ctx.notifier.notify(Entity::Media, Change::Added, media.id);
        Ok(media)
    }

    async fn link_playlist(&self, item: &Item) -> Status {
        let playlist_id = item.task.link_to_id;
        if Playlist::by_id(&self.ctx.pool, playlist_id)
            .await
            .ok()
            .flatten()
            .is_none()
        {
            tracing::debug!("Playlist {} vanished, discarding link task", playlist_id);
            return Status::Discarded;
        }
        if self.creation_pending(item).await {
            return Status::Requeue;
        }
        let media = match self.find_or_create_media(item).await {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!("Cannot resolve media for playlist link: {}", e);
                return Status::Fatal;
            }
        };
        let position = item.task.link_extra;
        match Playlist::add_media(&self.ctx.pool, playlist_id, media.id, Some(position)).await {
            Ok(()) => {
                self.ctx
                    .notifier
                    .notify(Entity::Playlist, Change::Updated, playlist_id);
                Status::Completed
            }
            Err(crate::error::Error::Database(e)) if is_foreign_key_violation(&e) => {
                Status::Discarded
            }
            Err(e) => {
                tracing::warn!("Failed to add media to playlist {}: {}", playlist_id, e);
                Status::Fatal
            }
        }
    }

    async fn link_subscription(&self, item: &Item) -> Status {
        let subscription_id = item.task.link_to_id;
        if Subscription::by_id(&self.ctx.pool, subscription_id)
            .await
            .ok()
            .flatten()
            .is_none()
        {
            return Status::Discarded;
        }
        if self.creation_pending(item).await {
            return Status::Requeue;
        }
        let media = match self.find_or_create_media(item).await {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!("Cannot resolve media for subscription link: {}", e);
                return Status::Fatal;
            }
        };
        match Subscription::add_media(&self.ctx.pool, subscription_id, media.id).await {
            Ok(()) => {
                self.ctx
                    .notifier
                    .notify(Entity::Subscription, Change::Updated, subscription_id);
                Status::Completed
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to add media to subscription {}: {}",
                    subscription_id,
                    e
                );
                Status::Fatal
            }
        }
    }

    /// The discoverer schedules companion links before the main media
    /// exists; resolve it at link time by matching the longest stem among
    /// the folder's media-owning files.
    async fn resolve_companion_target(&self, item: &Item) -> crate::error::Result<Option<i64>> {
        if item.task.link_to_id != 0 {
            return Ok(Some(item.task.link_to_id));
        }
        let Some(folder) = &item.parent_folder else {
            return Ok(None);
        };
        let stem = stem_lowercase(&mrl::file_name(&item.mrl).to_lowercase());
        let files = File::in_folder(&self.ctx.pool, folder.id).await?;
        let mut best: Option<(usize, i64)> = None;
        for file in files {
            let Some(media_id) = file.media_id else { continue };
            let candidate = stem_lowercase(&mrl::file_name(&file.mrl).to_lowercase());
            if stem.starts_with(&candidate) || candidate.starts_with(&stem) {
                let score = candidate.len().min(stem.len());
                if best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, media_id));
                }
            }
        }
        Ok(best.map(|(_, media_id)| media_id))
    }

    /// Attach a companion file (subtitle, soundtrack) to an existing
    /// media.
    async fn link_media_file(&self, item: &Item) -> Status {
        let media_id = match self.resolve_companion_target(item).await {
            Ok(Some(media_id)) => media_id,
            Ok(None) => {
                // The main media may still be pending in a creation task
                // of the same folder; once none remain, give up through
                // the retry budget instead of spinning.
                let pending: (i64,) = sqlx::query_as(
                    "SELECT COUNT(*) FROM tasks WHERE type = 1 AND parent_folder_id = ?",
                )
                .bind(item.task.parent_folder_id)
                .fetch_one(&self.ctx.pool)
                .await
                .unwrap_or((0,));
                return if pending.0 > 0 {
                    Status::Requeue
                } else {
                    Status::Fatal
                };
            }
            Err(e) => {
                tracing::warn!("Companion resolution failed for {}: {}", item.mrl, e);
                return Status::Fatal;
            }
        };
        if Media::by_id(&self.ctx.pool, media_id).await.ok().flatten().is_none() {
            return Status::Discarded;
        }
        let file_type = FileType::from_i64(item.task.link_extra);
        let new_file = crate::model::file::NewFile {
            folder_id: item.parent_folder.as_ref().map(|f| f.id),
            mrl: &item.mrl,
            file_type,
            last_modified: item.fs_last_modified,
            size: item.fs_size,
            is_removable: false,
            is_network: false,
        };
        match File::create_for_media(&self.ctx.pool, media_id, &new_file).await {
            Ok(_) => {
                self.ctx.notifier.notify(Entity::Media, Change::Updated, media_id);
                Status::Completed
            }
            Err(crate::error::Error::Database(e)) if is_foreign_key_violation(&e) => {
                Status::Discarded
            }
            Err(crate::error::Error::Database(e))
                if crate::error::is_unique_violation(&e) =>
            {
                // The companion file is already attached.
                Status::Completed
            }
            Err(e) => {
                tracing::warn!("Failed to attach file to media {}: {}", media_id, e);
                Status::Fatal
            }
        }
    }
}

fn stem_lowercase(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

#[async_trait]
impl ParserService for LinkService {
    fn name(&self) -> &'static str {
        "linking"
    }

    fn targeted_step(&self) -> Step {
        Step::Linking
    }

    fn priority(&self) -> u8 {
        10
    }

    async fn run(&self, item: &mut Item) -> Status {
        if item.task.task_type() != TaskType::Link {
            // Creation/refresh tasks have nothing left to link by the time
            // they reach this step.
            return Status::Success;
        }
        match item.task.link_type() {
            LinkType::Playlist => self.link_playlist(item).await,
            LinkType::Subscription => self.link_subscription(item).await,
            LinkType::Media => self.link_media_file(item).await,
            LinkType::NoLink => Status::Discarded,
        }
    }
}
