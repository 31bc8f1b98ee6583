//! Subscription cache worker: a single task draining a FIFO of
//! cache/uncache jobs, bounded by a global size budget and per-
//! subscription media counts, with startup reconciliation against the
//! on-disk cache folder.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use sqlx::SqlitePool;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::file::File;
use crate::model::subscription::Subscription;
use crate::mrl;
use crate::notifier::MediaLibraryCb;

/// One queued job. A `None` media means "run the subscription cache
/// pass".
#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheJob {
    media_id: Option<i64>,
    cache: bool,
}

pub struct CacheWorker {
    inner: Arc<Inner>,
}

struct Inner {
    pool: SqlitePool,
    cb: Arc<dyn MediaLibraryCb>,
    cache_dir: PathBuf,
    max_total_size: u64,
    // Current on-disk usage; guarded so eviction math is atomic with the
    // row updates.
    used_size: Mutex<u64>,
    queue: StdMutex<VecDeque<CacheJob>>,
    notify: Notify,
}

impl CacheWorker {
    pub fn new(
        pool: SqlitePool,
        cb: Arc<dyn MediaLibraryCb>,
        cache_dir: PathBuf,
        max_total_size: u64,
    ) -> CacheWorker {
        CacheWorker {
            inner: Arc::new(Inner {
                pool,
                cb,
                cache_dir,
                max_total_size,
                used_size: Mutex::new(0),
                queue: StdMutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Manual cache request for one media.
    pub fn cache_media(&self, media_id: i64) {
        self.push(CacheJob {
            media_id: Some(media_id),
            cache: true,
        });
    }

    pub fn remove_cached(&self, media_id: i64) {
        self.push(CacheJob {
            media_id: Some(media_id),
            cache: false,
        });
    }

    /// Sweep every subscription and fill its quota.
    pub fn cache_subscriptions(&self) {
        self.push(CacheJob {
            media_id: None,
            cache: true,
        });
    }

    fn push(&self, job: CacheJob) {
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.contains(&job) {
            return;
        }
        queue.push_back(job);
        drop(queue);
        self.inner.notify.notify_waiters();
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.reconcile().await {
                tracing::error!("Cache reconciliation failed: {}", e);
            }
            let mut idle = true;
            loop {
                let job = inner.queue.lock().unwrap().pop_front();
                match job {
                    Some(job) => {
                        if idle {
                            idle = false;
                            inner.cb.on_cache_idle_changed(false);
                        }
                        if let Err(e) = inner.process(&job).await {
                            tracing::warn!("Cache job failed: {}", e);
                        }
                    }
                    None => {
                        if !idle {
                            idle = true;
                            inner.cb.on_cache_idle_changed(true);
                        }
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = inner.notify.notified() => {}
                        }
                    }
                }
            }
            tracing::debug!("Cache worker stopped");
        })
    }

    #[cfg(test)]
    fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl Inner {
    async fn process(&self, job: &CacheJob) -> Result<()> {
        match (job.media_id, job.cache) {
            (None, _) => self.subscription_pass().await,
            (Some(media_id), true) => {
                let Some(file) = File::main_file(&self.pool, media_id).await? else {
                    return Ok(());
                };
                if file.is_cached {
                    return Ok(());
                }
                // Manual requests only respect the global budget.
                self.cache_file(&file, None).await
            }
            (Some(media_id), false) => {
                let Some(file) = File::main_file(&self.pool, media_id).await? else {
                    return Ok(());
                };
                if file.is_cached {
                    self.uncache_file(&file).await?;
                }
                Ok(())
            }
        }
    }

    /// Fill each subscription's quota in import order, evicting its
    /// oldest cached media when the per-subscription bound is reached.
    async fn subscription_pass(&self) -> Result<()> {
        for subscription in Subscription::all(&self.pool).await? {
            let quota = subscription.max_cached_media;
            let files = Subscription::media_files(&self.pool, subscription.id).await?;
            let mut changed = false;
            for file in files.iter().filter(|f| !f.is_cached) {
                if quota >= 0 {
                    while Subscription::cached_count(&self.pool, subscription.id).await? >= quota
                    {
                        match Subscription::oldest_cached(&self.pool, subscription.id).await? {
                            Some(victim) => self.uncache_file(&victim).await?,
                            None => break,
                        }
                        changed = true;
                    }
                    if quota == 0 {
                        continue;
                    }
                }
                match self.cache_file(file, Some(subscription.id)).await {
                    Ok(()) => changed = true,
                    Err(e) => tracing::warn!("Could not cache {}: {}", file.mrl, e),
                }
            }
            Subscription::set_new_media_handled(&self.pool, subscription.id).await?;
            if changed {
                self.cb.on_subscription_cache_updated(subscription.id);
            }
        }
        Ok(())
    }

    /// Copy one file into the cache folder. The global budget must hold
    /// before any byte lands on disk; oldest cached files across all
    /// subscriptions are evicted to make room.
    async fn cache_file(&self, file: &File, _subscription: Option<i64>) -> Result<()> {
        let source = mrl::to_local_path(&file.mrl)?;
        let metadata = tokio::fs::metadata(&source).await.map_err(Error::from_io)?;
        let size = metadata.len();
        if size > self.max_total_size {
            return Err(Error::System {
                code: 0,
                message: format!(
                    "{} ({} bytes) exceeds the whole cache budget",
                    file.mrl, size
                ),
            });
        }

        {
            let mut used = self.used_size.lock().await;
            while *used + size > self.max_total_size {
                let victims = File::cached_files(&self.pool).await?;
                let Some(victim) = victims.first() else { break };
                let victim_size = self.remove_cached_file(victim).await?;
                *used = used.saturating_sub(victim_size);
            }
            if *used + size > self.max_total_size {
                return Err(Error::System {
                    code: 0,
                    message: "cache budget exhausted".to_string(),
                });
            }

            tokio::fs::create_dir_all(&self.cache_dir)
                .await
                .map_err(Error::from_io)?;
            let extension = mrl::extension(&file.mrl).unwrap_or_else(|| "bin".to_string());
            let destination = self.cache_dir.join(format!("{}.{}", file.id, extension));
            // Copy under a temporary name and rename, so an interrupted
            // copy never leaves a partial file under the final name.
            let staging = self
                .cache_dir
                .join(format!(".{}.{}", uuid::Uuid::new_v4(), extension));
            if let Err(e) = tokio::fs::copy(&source, &staging).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(Error::from_io(e));
            }
            if let Err(e) = tokio::fs::rename(&staging, &destination).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(Error::from_io(e));
            }
            let cache_mrl = mrl::from_local_path(&destination);
            File::set_cached(&self.pool, file.id, &cache_mrl, size as i64).await?;
            *used += size;
        }
        tracing::debug!("Cached {} ({} bytes)", file.mrl, size);
        Ok(())
    }

    async fn uncache_file(&self, file: &File) -> Result<()> {
        let size = self.remove_cached_file(file).await?;
        let mut used = self.used_size.lock().await;
        *used = used.saturating_sub(size);
        Ok(())
    }

    /// Unlink the on-disk copy and clear the row; returns the bytes
    /// released.
    async fn remove_cached_file(&self, file: &File) -> Result<u64> {
        if let Some(cache_mrl) = &file.cache_mrl {
            if let Ok(path) = mrl::to_local_path(cache_mrl) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::from_io(e)),
                }
            }
        }
        let released = file.cache_size.max(0) as u64;
        File::set_uncached(&self.pool, file.id).await?;
        Ok(released)
    }

    /// Startup reconciliation: rebuild `used_size` from rows that still
    /// have their on-disk copy, clear the ones that lost it and unlink
    /// stray files nothing claims.
    async fn reconcile(&self) -> Result<()> {
        let mut on_disk: Vec<PathBuf> = Vec::new();
        match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await.map_err(Error::from_io)? {
                    if entry.file_type().await.map_or(false, |t| t.is_file()) {
                        on_disk.push(entry.path());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::from_io(e)),
        }
        on_disk.sort();

        let mut used = self.used_size.lock().await;
        *used = 0;
        let mut claimed: Vec<PathBuf> = Vec::new();
        for file in File::cached_files(&self.pool).await? {
            let path = file
                .cache_mrl
                .as_deref()
                .and_then(|m| mrl::to_local_path(m).ok());
            match path {
                Some(path) if on_disk.binary_search(&path).is_ok() => {
                    let size = tokio::fs::metadata(&path)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(file.cache_size.max(0) as u64);
                    *used += size;
                    claimed.push(path);
                }
                _ => {
                    tracing::info!("Cached copy of {} vanished, clearing row", file.mrl);
                    File::set_uncached(&self.pool, file.id).await?;
                }
            }
        }
        for stray in on_disk {
            if !claimed.contains(&stray) {
                tracing::info!("Removing unclaimed cache file {:?}", stray);
                let _ = tokio::fs::remove_file(&stray).await;
            }
        }
        tracing::debug!("Cache reconciled: {} bytes in use", *used);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect_in_memory, schema};
    use crate::model::media::Media;
    use crate::notifier::NoopCb;

    async fn setup(max_size: u64) -> (SqlitePool, CacheWorker, tempfile::TempDir) {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let worker = CacheWorker::new(
            pool.clone(),
            Arc::new(NoopCb),
            dir.path().join("cache"),
            max_size,
        );
        (pool, worker, dir)
    }

    async fn add_subscription_media(
        pool: &SqlitePool,
        dir: &std::path::Path,
        subscription_id: i64,
        name: &str,
        contents: &[u8],
    ) -> i64 {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        let file_mrl = mrl::from_local_path(&path);
        let media = Media::create_external(pool, &file_mrl, name, None).await.unwrap();
        Subscription::add_media(pool, subscription_id, media.id).await.unwrap();
        media.id
    }

    #[tokio::test]
    async fn test_subscription_quota_evicts_oldest() {
        let (pool, worker, dir) = setup(1024 * 1024).await;
        let subscription = Subscription::create(&pool, "podcast", "feed", None)
            .await
            .unwrap();
        Subscription::set_max_cached_media(&pool, subscription.id, 2)
            .await
            .unwrap();

        let m1 = add_subscription_media(&pool, dir.path(), subscription.id, "m1.mp3", b"one").await;
        // The pass caches in import order; run it between insertions so
        // cached_at ordering is deterministic.
        worker.inner().subscription_pass().await.unwrap();
        let m2 = add_subscription_media(&pool, dir.path(), subscription.id, "m2.mp3", b"two").await;
        worker.inner().subscription_pass().await.unwrap();
        let m3 =
            add_subscription_media(&pool, dir.path(), subscription.id, "m3.mp3", b"three").await;
        worker.inner().subscription_pass().await.unwrap();

        let cached: Vec<(Option<i64>, bool, Option<String>)> = sqlx::query_as(
            "SELECT media_id, is_cached, cache_mrl FROM files ORDER BY id",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let is_cached = |media: i64| {
            cached
                .iter()
                .find(|(m, _, _)| *m == Some(media))
                .map(|(_, c, _)| *c)
                .unwrap()
        };
        assert!(!is_cached(m1), "oldest must have been evicted");
        assert!(is_cached(m2));
        assert!(is_cached(m3));

        // m1's on-disk copy is gone.
        let remaining: Vec<_> = std::fs::read_dir(dir.path().join("cache"))
            .unwrap()
            .collect();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_file_is_rejected_without_partial() {
        let (pool, worker, dir) = setup(2).await;
        let subscription = Subscription::create(&pool, "podcast", "feed", None)
            .await
            .unwrap();
        add_subscription_media(&pool, dir.path(), subscription.id, "big.mp3", b"way too big")
            .await;
        worker.inner().subscription_pass().await.unwrap();

        let (cached,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files WHERE is_cached = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(cached, 0);
        let cache_dir = dir.path().join("cache");
        let empty = !cache_dir.exists()
            || std::fs::read_dir(&cache_dir).unwrap().next().is_none();
        assert!(empty, "no partial file may remain");
    }

    #[tokio::test]
    async fn test_global_budget_evicts_across_subscriptions() {
        let (pool, worker, dir) = setup(8).await;
        let s1 = Subscription::create(&pool, "podcast", "one", None).await.unwrap();
        let s2 = Subscription::create(&pool, "podcast", "two", None).await.unwrap();
        let m1 = add_subscription_media(&pool, dir.path(), s1.id, "a.mp3", b"aaaaa").await;
        worker.inner().subscription_pass().await.unwrap();
        let _m2 = add_subscription_media(&pool, dir.path(), s2.id, "b.mp3", b"bbbbb").await;
        worker.inner().subscription_pass().await.unwrap();

        // 5 + 5 > 8: the first cached file was evicted for the second.
        let rows: Vec<(Option<i64>, bool)> =
            sqlx::query_as("SELECT media_id, is_cached FROM files ORDER BY id")
                .fetch_all(&pool)
                .await
                .unwrap();
        let cached: Vec<i64> = rows
            .iter()
            .filter(|(_, c)| *c)
            .filter_map(|(m, _)| *m)
            .collect();
        assert_eq!(cached.len(), 1);
        assert!(!cached.contains(&m1));
    }

    #[tokio::test]
    async fn test_reconcile_clears_rows_without_disk_copy() {
        let (pool, worker, dir) = setup(1024).await;
        let subscription = Subscription::create(&pool, "podcast", "feed", None)
            .await
            .unwrap();
        add_subscription_media(&pool, dir.path(), subscription.id, "m.mp3", b"data").await;
        worker.inner().subscription_pass().await.unwrap();

        // Wipe the disk behind the worker's back.
        std::fs::remove_dir_all(dir.path().join("cache")).unwrap();
        worker.inner().reconcile().await.unwrap();

        let (cached,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files WHERE is_cached = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(cached, 0);
        assert_eq!(*worker.inner().used_size.lock().await, 0);
    }
}
