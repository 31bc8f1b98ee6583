//! The orchestrator: owns the store connection, the worker fleet, the
//! migrations and the lifecycle (initialize, pause/resume, idle
//! aggregation, force rescan, shutdown). One long-lived instance per
//! process and per library folder, fenced by the lock file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheWorker;
use crate::config::InitOptions;
use crate::db::access::PriorityAccess;
use crate::db::migrations::{self, MigrationOutcome};
use crate::db::{self, schema};
use crate::discoverer::DiscovererWorker;
use crate::error::{Error, Result};
use crate::fs::local::LocalFsFactory;
use crate::fs::{FileSystemFactory, FsHolder};
use crate::lockfile::LockFile;
use crate::model::device::Device;
use crate::model::task::Task;
use crate::model::thumbnail::ThumbnailSizeType;
use crate::notifier::{MediaLibraryCb, Notifier, NotifierWorker};
use crate::parser::probe::FfprobeProbe;
use crate::parser::{Parser, ParserCtx};
use crate::thumbnailer::{FfmpegThumbnailer, ThumbnailRequest, ThumbnailerWorker};

/// Outcome of [`MediaLibrary::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitResult {
    Success,
    AlreadyInitialized,
    Failed,
    /// The database was too old or too new and was wiped; playlists were
    /// backed up and will be restored as their media reappear.
    DbReset,
    DbCorrupted,
}

/// Tracks the background task handles for graceful shutdown.
struct BackgroundTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    fn new() -> Self {
        Self {
            handles: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn track(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.push((name, handle));
    }

    async fn shutdown(self) {
        tracing::info!("Initiating graceful shutdown...");
        self.shutdown.cancel();
        for (name, handle) in self.handles {
            tracing::debug!("Waiting for {} to finish...", name);
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(Ok(())) => tracing::debug!("{} finished cleanly", name),
                Ok(Err(e)) => tracing::warn!("{} panicked: {}", name, e),
                Err(_) => tracing::warn!("{} timed out during shutdown", name),
            }
        }
        tracing::info!("All background tasks stopped");
    }
}

struct Runtime {
    pool: SqlitePool,
    _lock: Option<LockFile>,
    notifier: Notifier,
    fs: Arc<FsHolder>,
    access: PriorityAccess,
    parser: Arc<Parser>,
    discoverer: DiscovererWorker,
    cache: CacheWorker,
    thumbnailer: ThumbnailerWorker,
    bg: Option<BackgroundTasks>,
}

pub struct MediaLibrary {
    options: InitOptions,
    cb: Arc<dyn MediaLibraryCb>,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
}

impl MediaLibrary {
    pub fn new(options: InitOptions, cb: Arc<dyn MediaLibraryCb>) -> MediaLibrary {
        MediaLibrary {
            options,
            cb,
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    fn thumbnails_dir(&self) -> PathBuf {
        self.options.ml_folder_path.join("thumbnails")
    }

    fn cache_dir(&self) -> PathBuf {
        self.options.ml_folder_path.join("cache")
    }

    fn playlists_dir(&self) -> PathBuf {
        self.options.ml_folder_path.join("playlists")
    }

    /// Bring the engine up: folders, lock, database (creating, migrating
    /// or resetting it) and the background workers.
    pub async fn initialize(&self) -> Result<InitResult> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(InitResult::AlreadyInitialized);
        }

        for dir in [
            self.options.ml_folder_path.clone(),
            self.thumbnails_dir(),
            self.playlists_dir(),
            self.cache_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await.map_err(Error::from_io)?;
        }
        if let Some(parent) = self.options.db_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::from_io)?;
        }

        let lock = if self.options.lock_file {
            match LockFile::acquire(&self.options.ml_folder_path) {
                Ok(lock) => Some(lock),
                Err(e) => {
                    tracing::error!("Cannot lock the library folder: {}", e);
                    return Ok(InitResult::Failed);
                }
            }
        } else {
            None
        };

        let pool = db::connect(&self.options.db_path).await?;
        let mut result = InitResult::Success;
        match db::model_version(&pool).await? {
            None => {
                schema::create_all(&pool).await?;
            }
            Some(version) => {
                match migrations::run(&pool, &self.options.ml_folder_path, version).await? {
                    MigrationOutcome::UpToDate | MigrationOutcome::Migrated => {
                        if !db::check_integrity(&pool).await? {
                            tracing::error!(
                                "Integrity check failed, resetting the database"
                            );
                            migrations::reset(&pool, &self.options.ml_folder_path).await?;
                            result = InitResult::DbReset;
                        }
                    }
                    MigrationOutcome::Reset => result = InitResult::DbReset,
                    MigrationOutcome::Corrupted => return Ok(InitResult::DbCorrupted),
                }
            }
        }

        *runtime = Some(self.build_runtime(pool, lock).await?);
        tracing::info!("Media library initialized ({:?})", result);
        Ok(result)
    }

    async fn build_runtime(&self, pool: SqlitePool, lock: Option<LockFile>) -> Result<Runtime> {
        let mut bg = BackgroundTasks::new();
        let shutdown = bg.token();

        let (notifier, notifier_worker) = NotifierWorker::new(self.cb.clone());
        bg.track("notifier", tokio::spawn(notifier_worker.run(shutdown.clone())));

        // The application's factories win over the built-in local one for
        // the schemes they claim.
        let mut factories: Vec<Arc<dyn FileSystemFactory>> = self.options.fs_factories.clone();
        if !factories.iter().any(|f| f.scheme() == "file://") {
            let lister = self.options.device_listers.get("file://").cloned();
            factories.push(LocalFsFactory::new(lister));
        }
        let fs = FsHolder::new(pool.clone(), factories);

        let access = PriorityAccess::new();
        let probe = self
            .options
            .probe
            .clone()
            .unwrap_or_else(|| Arc::new(FfprobeProbe::new()));
        let parser_ctx = Arc::new(ParserCtx {
            pool: pool.clone(),
            notifier: notifier.clone(),
            cb: self.cb.clone(),
            fs: fs.clone(),
            access: access.clone(),
            thumbnails_dir: self.thumbnails_dir(),
            probe,
            probe_timeout: self.options.probe_timeout,
        });
        let parser = Arc::new(Parser::new(
            parser_ctx,
            self.options.parser_services.clone(),
        ));
        for (index, handle) in parser
            .spawn_workers(self.options.parser_workers, shutdown.clone())
            .into_iter()
            .enumerate()
        {
            let name: &'static str = match index {
                0 => "parser-0",
                1 => "parser-1",
                2 => "parser-2",
                _ => "parser-n",
            };
            bg.track(name, handle);
        }

        let discoverer = DiscovererWorker::new(
            pool.clone(),
            fs.clone(),
            self.cb.clone(),
            notifier.clone(),
            parser.clone(),
        );
        bg.track("discoverer", discoverer.spawn(shutdown.clone()));
        fs.set_listener(Arc::new(discoverer.clone())).await;
        fs.start().await?;

        let cache = CacheWorker::new(
            pool.clone(),
            self.cb.clone(),
            self.cache_dir(),
            self.options.cache_max_size,
        );
        bg.track("cache", cache.spawn(shutdown.clone()));

        let thumbnailer_impl = self
            .options
            .thumbnailer
            .clone()
            .unwrap_or_else(|| Arc::new(FfmpegThumbnailer::new()));
        let thumbnailer = ThumbnailerWorker::new(
            pool.clone(),
            self.cb.clone(),
            thumbnailer_impl,
            self.thumbnails_dir(),
        );
        bg.track("thumbnailer", thumbnailer.spawn(shutdown.clone()));
        // Retry whatever deletions a previous run left behind.
        thumbnailer.request_cleanup();

        // Idle aggregation: the composed signal only fires after the
        // notifier flushed, so consumers observe every modification first.
        {
            let mut parser_idle = parser.idle();
            let mut discoverer_idle = discoverer.idle();
            let notifier = notifier.clone();
            let cb = self.cb.clone();
            let shutdown = shutdown.clone();
            bg.track(
                "idle-aggregator",
                tokio::spawn(async move {
                    let mut last = None::<bool>;
                    loop {
                        let idle = *parser_idle.borrow() && *discoverer_idle.borrow();
                        if last != Some(idle) {
                            notifier.flush().await;
                            cb.on_background_tasks_idle_changed(idle);
                            last = Some(idle);
                        }
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = parser_idle.changed() => {}
                            _ = discoverer_idle.changed() => {}
                        }
                    }
                }),
            );
        }

        let pruned = Device::prune_outdated(
            &pool,
            self.options.device_ttl.as_secs() as i64,
        )
        .await?;
        if pruned > 0 {
            tracing::info!("{} stale device(s) pruned at startup", pruned);
        }
        // Wake the parser for tasks that survived the previous run.
        parser.signal();

        Ok(Runtime {
            pool,
            _lock: lock,
            notifier,
            fs,
            access,
            parser,
            discoverer,
            cache,
            thumbnailer,
            bg: Some(bg),
        })
    }

    async fn with_runtime<T>(&self, f: impl FnOnce(&Runtime) -> T) -> Result<T> {
        let runtime = self.runtime.lock().await;
        match runtime.as_ref() {
            Some(runtime) => Ok(f(runtime)),
            None => Err(Error::System {
                code: 0,
                message: "media library is not initialized".to_string(),
            }),
        }
    }

    // ---- discovery surface ----------------------------------------------

    /// Add a root folder to the library and scan it.
    pub async fn discover(&self, root: &str) -> Result<bool> {
        self.with_runtime(|rt| rt.discoverer.discover(root)).await
    }

    pub async fn remove_root(&self, root: &str) -> Result<()> {
        self.with_runtime(|rt| rt.discoverer.remove_root(root)).await
    }

    /// Reload every root folder.
    pub async fn reload(&self) -> Result<()> {
        self.with_runtime(|rt| rt.discoverer.reload_all()).await
    }

    pub async fn reload_root(&self, root: &str) -> Result<()> {
        self.with_runtime(|rt| rt.discoverer.reload_root(root)).await
    }

    pub async fn ban_folder(&self, root: &str) -> Result<()> {
        self.with_runtime(|rt| rt.discoverer.ban(root)).await
    }

    pub async fn unban_folder(&self, root: &str) -> Result<()> {
        self.with_runtime(|rt| rt.discoverer.unban(root)).await
    }

    pub async fn refresh_devices(&self) -> Result<()> {
        let fs = self.with_runtime(|rt| rt.fs.clone()).await?;
        fs.refresh_devices().await;
        Ok(())
    }

    // ---- background control ----------------------------------------------

    /// Pause every worker; returns once the in-flight units completed.
    pub async fn pause_background_tasks(&self) -> Result<()> {
        let (parser, discoverer) = self
            .with_runtime(|rt| (rt.parser.clone(), rt.discoverer.clone()))
            .await?;
        parser.pause();
        discoverer.pause();
        parser.wait_paused().await;
        discoverer.wait_paused().await;
        Ok(())
    }

    pub async fn resume_background_tasks(&self) -> Result<()> {
        let (parser, discoverer) = self
            .with_runtime(|rt| (rt.parser.clone(), rt.discoverer.clone()))
            .await?;
        parser.resume();
        discoverer.resume();
        Ok(())
    }

    /// Composed idleness of the discoverer and the parser.
    pub async fn is_idle(&self) -> Result<bool> {
        self.with_runtime(|rt| {
            *rt.parser.idle().borrow() && *rt.discoverer.idle().borrow()
        })
        .await
    }

    /// Exclusive store access that preempts background writers.
    pub async fn acquire_priority_access(
        &self,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<()>> {
        let access = self.with_runtime(|rt| rt.access.clone()).await?;
        Ok(access.acquire_priority().await)
    }

    /// Wipe the derived entities and re-run every parser step over the
    /// known files.
    pub async fn force_rescan(&self) -> Result<()> {
        let (parser, pool) = self
            .with_runtime(|rt| (rt.parser.clone(), rt.pool.clone()))
            .await?;
        parser.flush().await;

        let mut tx = pool.begin().await?;
        for statement in [
            "DELETE FROM album_tracks",
            "DELETE FROM albums",
            "DELETE FROM show_episodes",
            "DELETE FROM shows WHERE id != 1",
            "UPDATE shows SET nb_episodes = 0",
            "DELETE FROM genres",
            "DELETE FROM media_groups",
            "DELETE FROM audio_tracks",
            "DELETE FROM video_tracks",
            "DELETE FROM subtitle_tracks",
            "DELETE FROM thumbnail_links",
            "DELETE FROM thumbnails",
            "DELETE FROM artists WHERE id NOT IN (1, 2)",
            "UPDATE artists SET nb_albums = 0, nb_tracks = 0",
            "UPDATE media SET subtype = 0, group_id = NULL",
        ] {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Task::reset_parsing(&pool).await?;
        // Files already ingested re-enter the pipeline as refresh tasks;
        // tasks still pending rerun from their first step.
        sqlx::query(
            "INSERT INTO tasks (type, mrl, file_type, file_id, parent_folder_id)
             SELECT 2, f.mrl, f.file_type, f.id, f.folder_id FROM files f
             WHERE (f.media_id IS NOT NULL OR f.playlist_id IS NOT NULL
                    OR f.subscription_id IS NOT NULL)
               AND f.is_external = 0
               AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.file_id = f.id)",
        )
        .execute(&pool)
        .await?;
        parser.signal();
        tracing::info!("Forced rescan: derived entities dropped, tasks requeued");
        Ok(())
    }

    // ---- cache & thumbnails ----------------------------------------------

    pub async fn cache_media(&self, media_id: i64) -> Result<()> {
        self.with_runtime(|rt| rt.cache.cache_media(media_id)).await
    }

    pub async fn remove_cached(&self, media_id: i64) -> Result<()> {
        self.with_runtime(|rt| rt.cache.remove_cached(media_id)).await
    }

    pub async fn cache_subscriptions(&self) -> Result<()> {
        self.with_runtime(|rt| rt.cache.cache_subscriptions()).await
    }

    /// Request a thumbnail; `position` is a fraction of the media
    /// duration. Returns false when the media is already queued.
    pub async fn request_thumbnail(
        &self,
        media_id: i64,
        size_type: ThumbnailSizeType,
        width: u32,
        height: u32,
        position: f64,
    ) -> Result<bool> {
        self.with_runtime(|rt| {
            rt.thumbnailer.request(ThumbnailRequest {
                media_id,
                size_type,
                desired_width: width,
                desired_height: height,
                position,
            })
        })
        .await
    }

    /// Direct pool handle for the embedding application's queries.
    pub async fn pool(&self) -> Result<SqlitePool> {
        self.with_runtime(|rt| rt.pool.clone()).await
    }

    /// Ensure every queued notification reached the application.
    pub async fn flush_notifications(&self) -> Result<()> {
        let notifier = self.with_runtime(|rt| rt.notifier.clone()).await?;
        notifier.flush().await;
        Ok(())
    }

    /// Stop every worker and release the lock file.
    pub async fn shutdown(&self) {
        let mut runtime = self.runtime.lock().await;
        if let Some(mut rt) = runtime.take() {
            rt.fs.stop().await;
            if let Some(bg) = rt.bg.take() {
                bg.shutdown().await;
            }
            rt.pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::file::FileType;
    use crate::model::media::MediaType;
    use crate::notifier::NoopCb;
    use crate::parser::item::{TrackInfo, TrackType};
    use crate::parser::probe::{MediaProbe, ProbeResult};
    use std::path::Path;

    /// Probe stub keyed on extension, standing in for the external
    /// decoder.
    struct ExtensionProbe;

    impl MediaProbe for ExtensionProbe {
        fn probe(&self, path: &Path, _artwork_dir: &Path) -> anyhow::Result<ProbeResult> {
            let mut result = ProbeResult::default();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();
            match ext {
                "mp3" | "flac" => {
                    result.tracks.push(TrackInfo::new(TrackType::Audio));
                    result.duration = Some(180_000);
                }
                "avi" | "mp4" | "mkv" => {
                    result.tracks.push(TrackInfo::new(TrackType::Video));
                    result.duration = Some(3_600_000);
                }
                _ => {}
            }
            Ok(result)
        }
    }

    fn options_for(dir: &Path) -> InitOptions {
        let mut options = InitOptions::new(dir.join("ml.db"), dir.join("ml"));
        options.lock_file = false;
        options.probe = Some(Arc::new(ExtensionProbe));
        options.parser_workers = 2;
        options
    }

    async fn wait_for_drain(library: &MediaLibrary) {
        let pool = library.pool().await.unwrap();
        for _ in 0..400 {
            let pending = Task::count_incomplete(&pool).await.unwrap();
            if pending == 0 && library.is_idle().await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("library did not drain in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fresh_scan_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("media");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("video.avi"), b"v").unwrap();
        std::fs::write(root.join("audio.mp3"), b"a").unwrap();
        std::fs::write(root.join("sub/subfile.mp4"), b"s").unwrap();
        std::fs::write(root.join("not_a_media.something"), b"x").unwrap();

        let library = MediaLibrary::new(options_for(dir.path()), Arc::new(NoopCb));
        assert_eq!(library.initialize().await.unwrap(), InitResult::Success);
        assert_eq!(
            library.initialize().await.unwrap(),
            InitResult::AlreadyInitialized
        );

        let root_mrl = crate::mrl::from_local_path(&root);
        assert!(library.discover(&root_mrl).await.unwrap());
        wait_for_drain(&library).await;

        let pool = library.pool().await.unwrap();
        let (media_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM media")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(media_count, 3);
        let (folder_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM folders")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(folder_count, 2);
        let (unknown_files,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM files WHERE file_type = ? AND media_id IS NULL",
        )
        .bind(FileType::Unknown as i64)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(unknown_files, 1);

        // Types follow the probed tracks.
        let (audio,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM media WHERE type = ?")
            .bind(MediaType::Audio as i64)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(audio, 1);

        library.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_playlist_ingestion_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("media");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.mp3"), b"a").unwrap();
        std::fs::write(root.join("b.mp3"), b"b").unwrap();
        std::fs::write(root.join("pl.m3u"), "./a.mp3\n./b.mp3\n").unwrap();

        let library = MediaLibrary::new(options_for(dir.path()), Arc::new(NoopCb));
        library.initialize().await.unwrap();
        let root_mrl = crate::mrl::from_local_path(&root);
        library.discover(&root_mrl).await.unwrap();
        wait_for_drain(&library).await;

        let pool = library.pool().await.unwrap();
        let playlists: Vec<(i64, String)> = sqlx::query_as("SELECT id, name FROM playlists")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(playlists.len(), 1);
        assert_eq!(playlists[0].1, "pl");

        let items: Vec<(String,)> = sqlx::query_as(
            "SELECT m.filename FROM playlist_media pm
             INNER JOIN media m ON m.id = pm.media_id
             WHERE pm.playlist_id = ?
             ORDER BY pm.position",
        )
        .bind(playlists[0].0)
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(
            items.into_iter().map(|(n,)| n).collect::<Vec<_>>(),
            vec!["a.mp3", "b.mp3"]
        );

        // Playlist media were promoted to internal media, not duplicated.
        let (media_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM media WHERE is_external = 0",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(media_count, 2);

        library.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_refresh_preserves_media_id() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("media");
        std::fs::create_dir_all(&root).unwrap();
        let track = root.join("audio.mp3");
        std::fs::write(&track, b"a").unwrap();

        let library = MediaLibrary::new(options_for(dir.path()), Arc::new(NoopCb));
        library.initialize().await.unwrap();
        let root_mrl = crate::mrl::from_local_path(&root);
        library.discover(&root_mrl).await.unwrap();
        wait_for_drain(&library).await;

        let pool = library.pool().await.unwrap();
        let (media_id,): (i64,) = sqlx::query_as("SELECT id FROM media")
            .fetch_one(&pool)
            .await
            .unwrap();

        // Move the mtime forward and rescan: one refresh task, same id.
        let file = std::fs::File::options().write(true).open(&track).unwrap();
        let future = std::time::SystemTime::now() + Duration::from_secs(3600);
        file.set_modified(future).unwrap();
        drop(file);

        library.reload().await.unwrap();
        wait_for_drain(&library).await;

        let ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM media")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(ids, vec![(media_id,)]);
        library.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_force_rescan_clears_step_bitmaps() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("media");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("song.mp3"), b"a").unwrap();

        let library = MediaLibrary::new(options_for(dir.path()), Arc::new(NoopCb));
        library.initialize().await.unwrap();
        library
            .discover(&crate::mrl::from_local_path(&root))
            .await
            .unwrap();
        wait_for_drain(&library).await;

        library.pause_background_tasks().await.unwrap();
        library.force_rescan().await.unwrap();

        let pool = library.pool().await.unwrap();
        let steps: Vec<(i64,)> = sqlx::query_as("SELECT step FROM tasks")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert!(!steps.is_empty(), "known files must be requeued");
        assert!(steps.iter().all(|(s,)| *s == 0));
        let (albums,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM albums")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(albums, 0);

        // Resuming rebuilds the derived entities from the refresh tasks.
        library.resume_background_tasks().await.unwrap();
        wait_for_drain(&library).await;
        let (tracks,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audio_tracks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(tracks, 1);
        library.shutdown().await;
    }
}
