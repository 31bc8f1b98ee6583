//! Thumbnailer worker: a de-duplicating FIFO of thumbnail requests
//! delegating to an injected thumbnailer. A crash marker is recorded
//! before calling out so an input that crashes the generator is not
//! retried forever; a request for media id 0 sweeps the cleanup table.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result as AnyResult};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::file::File;
use crate::model::media::Media;
use crate::model::thumbnail::{
    Thumbnail, ThumbnailEntity, ThumbnailOrigin, ThumbnailSizeType, ThumbnailStatus,
};
use crate::mrl;
use crate::notifier::MediaLibraryCb;

/// The external image generator. Blocking; driven through
/// `spawn_blocking`. Replace it through `InitOptions::thumbnailer`.
pub trait Thumbnailer: Send + Sync {
    /// Extract a frame of `source` at `position` (seconds) into
    /// `destination`, scaled to the desired size.
    fn generate(
        &self,
        source: &Path,
        destination: &Path,
        width: u32,
        height: u32,
        position: f64,
    ) -> AnyResult<()>;
}

/// Default thumbnailer shelling out to ffmpeg.
pub struct FfmpegThumbnailer {
    ffmpeg: String,
}

impl Default for FfmpegThumbnailer {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegThumbnailer {
    pub fn new() -> FfmpegThumbnailer {
        let ffmpeg = std::env::var("FFMPEG_PATH").unwrap_or_else(|_| {
            ["/usr/bin/ffmpeg", "/usr/local/bin/ffmpeg", "/opt/homebrew/bin/ffmpeg"]
                .iter()
                .find(|p| Path::new(p).exists())
                .map(|p| p.to_string())
                .unwrap_or_else(|| "ffmpeg".to_string())
        });
        FfmpegThumbnailer { ffmpeg }
    }
}

impl Thumbnailer for FfmpegThumbnailer {
    fn generate(
        &self,
        source: &Path,
        destination: &Path,
        width: u32,
        height: u32,
        position: f64,
    ) -> AnyResult<()> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let scale = if height == 0 {
            format!("scale={width}:-1")
        } else {
            format!("scale={width}:{height}")
        };
        // Fast seek first (-ss before -i); falls back to accurate seek
        // for files whose index defeats it.
        let output = Command::new(&self.ffmpeg)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-ss",
                &format!("{position:.3}"),
                "-i",
            ])
            .arg(source)
            .args(["-vframes", "1", "-vf", &scale, "-q:v", "5", "-y"])
            .arg(destination)
            .output()
            .with_context(|| format!("Failed to run ffmpeg at '{}'", self.ffmpeg))?;

        if !output.status.success() || !destination.exists() {
            let output = Command::new(&self.ffmpeg)
                .args(["-hide_banner", "-loglevel", "error", "-i"])
                .arg(source)
                .args([
                    "-ss",
                    &format!("{position:.3}"),
                    "-vframes",
                    "1",
                    "-vf",
                    &scale,
                    "-q:v",
                    "5",
                    "-y",
                ])
                .arg(destination)
                .output()?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!("ffmpeg thumbnail extraction failed: {}", stderr);
            }
        }
        if !destination.exists() {
            anyhow::bail!("thumbnail was not created at {:?}", destination);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailRequest {
    pub media_id: i64,
    pub size_type: ThumbnailSizeType,
    pub desired_width: u32,
    pub desired_height: u32,
    /// Position in the media, as a fraction of its duration in [0, 1].
    pub position: f64,
}

pub struct ThumbnailerWorker {
    inner: Arc<Inner>,
}

struct Inner {
    pool: SqlitePool,
    cb: Arc<dyn MediaLibraryCb>,
    thumbnailer: Arc<dyn Thumbnailer>,
    thumbnails_dir: PathBuf,
    queue: StdMutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    requests: VecDeque<ThumbnailRequest>,
    // Second index preventing the same media from being queued twice.
    queued_media: HashSet<i64>,
}

impl ThumbnailerWorker {
    pub fn new(
        pool: SqlitePool,
        cb: Arc<dyn MediaLibraryCb>,
        thumbnailer: Arc<dyn Thumbnailer>,
        thumbnails_dir: PathBuf,
    ) -> ThumbnailerWorker {
        ThumbnailerWorker {
            inner: Arc::new(Inner {
                pool,
                cb,
                thumbnailer,
                thumbnails_dir,
                queue: StdMutex::new(QueueState {
                    requests: VecDeque::new(),
                    queued_media: HashSet::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue a request; a media already queued is not queued twice.
    /// Returns whether the request was accepted.
    pub fn request(&self, request: ThumbnailRequest) -> bool {
        let mut queue = self.inner.queue.lock().unwrap();
        if request.media_id != 0 && !queue.queued_media.insert(request.media_id) {
            return false;
        }
        queue.requests.push_back(request);
        drop(queue);
        self.inner.notify.notify_waiters();
        true
    }

    /// Queue the pending-cleanup sweep.
    pub fn request_cleanup(&self) {
        self.request(ThumbnailRequest {
            media_id: 0,
            size_type: ThumbnailSizeType::Thumbnail,
            desired_width: 0,
            desired_height: 0,
            position: 0.0,
        });
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let request = {
                    let mut queue = inner.queue.lock().unwrap();
                    let request = queue.requests.pop_front();
                    if let Some(request) = &request {
                        queue.queued_media.remove(&request.media_id);
                    }
                    request
                };
                match request {
                    Some(request) if request.media_id == 0 => {
                        if let Err(e) = inner.cleanup_sweep().await {
                            tracing::warn!("Thumbnail cleanup sweep failed: {}", e);
                        }
                    }
                    Some(request) => {
                        if let Err(e) = inner.process(&request, &shutdown).await {
                            tracing::warn!(
                                "Thumbnail generation failed for media {}: {}",
                                request.media_id,
                                e
                            );
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = inner.notify.notified() => {}
                        }
                    }
                }
            }
            tracing::debug!("Thumbnailer worker stopped");
        })
    }
}

impl Inner {
    /// Remove every file recorded in the cleanup table. A removal that
    /// fails while the file is already gone still clears the row.
    async fn cleanup_sweep(&self) -> Result<()> {
        for (cleanup_id, target) in Thumbnail::cleanup_list(&self.pool).await? {
            let Ok(path) = mrl::to_local_path(&target) else {
                Thumbnail::cleanup_remove(&self.pool, cleanup_id).await?;
                continue;
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    Thumbnail::cleanup_remove(&self.pool, cleanup_id).await?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Thumbnail::cleanup_remove(&self.pool, cleanup_id).await?;
                }
                Err(e) => {
                    tracing::warn!("Still cannot remove {:?}: {}", path, e);
                }
            }
        }
        Ok(())
    }

    async fn process(&self, request: &ThumbnailRequest, shutdown: &CancellationToken) -> Result<()> {
        let Some(media) = Media::by_id(&self.pool, request.media_id).await? else {
            return Ok(());
        };
        let Some(main_file) = File::main_file(&self.pool, media.id).await? else {
            return Ok(());
        };
        let Ok(source) = mrl::to_local_path(&main_file.mrl) else {
            self.cb
                .on_media_thumbnail_ready(media.id, request.size_type, false);
            return Ok(());
        };

        // Pre-insert a Crash record before calling out: if the generator
        // takes the process down, the marker survives the restart and the
        // input is not retried.
        let existing =
            Thumbnail::for_entity(&self.pool, ThumbnailEntity::Media, media.id, request.size_type)
                .await?;
        let (record, first_attempt) = match existing {
            // A Crash record means a previous attempt never came back: the
            // generator took the process down before any status update.
            Some(record) if record.status() == ThumbnailStatus::Crash => {
                tracing::warn!(
                    "Media {} previously crashed the thumbnailer, not retrying",
                    media.id
                );
                self.cb
                    .on_media_thumbnail_ready(media.id, request.size_type, false);
                return Ok(());
            }
            Some(record) if record.status() == ThumbnailStatus::Available => {
                self.cb
                    .on_media_thumbnail_ready(media.id, request.size_type, true);
                return Ok(());
            }
            Some(record) => (record, false),
            None => {
                let record = Thumbnail::insert(
                    &self.pool,
                    None,
                    ThumbnailOrigin::Media,
                    request.size_type,
                    ThumbnailStatus::Crash,
                    false,
                )
                .await?;
                Thumbnail::link(
                    &self.pool,
                    ThumbnailEntity::Media,
                    media.id,
                    request.size_type,
                    record.id,
                )
                .await?;
                (record, true)
            }
        };

        let destination = self.thumbnails_dir.join(format!("{}.jpg", record.id));
        let duration_secs = (media.duration.max(0) as f64) / 1000.0;
        let position = (duration_secs * request.position.clamp(0.0, 1.0)).max(0.0);
        let thumbnailer = self.thumbnailer.clone();
        let gen_source = source.clone();
        let gen_destination = destination.clone();
        let (width, height) = (request.desired_width.max(1), request.desired_height);
        let generated = tokio::task::spawn_blocking(move || {
            thumbnailer.generate(&gen_source, &gen_destination, width, height, position)
        })
        .await;

        if shutdown.is_cancelled() {
            // Interrupted mid-flight: on a first attempt the record must
            // not stay stuck as Crash.
            if first_attempt {
                Thumbnail::unlink(
                    &self.pool,
                    ThumbnailEntity::Media,
                    media.id,
                    request.size_type,
                )
                .await?;
            }
            return Ok(());
        }

        match generated {
            Ok(Ok(())) => {
                let size = tokio::fs::metadata(&destination)
                    .await
                    .map(|m| m.len() as i64)
                    .unwrap_or(0);
                let thumb_mrl = mrl::from_local_path(&destination);
                Thumbnail::update_success(
                    &self.pool,
                    record.id,
                    &thumb_mrl,
                    ThumbnailOrigin::Media,
                    None,
                    size,
                )
                .await?;
                self.cb
                    .on_media_thumbnail_ready(media.id, request.size_type, true);
            }
            Ok(Err(e)) => {
                tracing::warn!("Thumbnailer failed on {:?}: {}", source, e);
                Thumbnail::mark_failure(&self.pool, record.id).await?;
                self.cb
                    .on_media_thumbnail_ready(media.id, request.size_type, false);
            }
            Err(join_error) => {
                // The generator task blew up; keep the Crash marker and
                // record the attempt.
                tracing::error!("Thumbnailer task crashed on {:?}: {}", source, join_error);
                sqlx::query("UPDATE thumbnails SET nb_attempts = nb_attempts + 1 WHERE id = ?")
                    .bind(record.id)
                    .execute(&self.pool)
                    .await?;
                self.cb
                    .on_media_thumbnail_ready(media.id, request.size_type, false);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect_in_memory, schema};
    use crate::model::file::{FileType, NewFile};
    use crate::model::media::MediaType;
    use crate::notifier::NoopCb;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingThumbnailer {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Thumbnailer for CountingThumbnailer {
        fn generate(
            &self,
            _source: &Path,
            destination: &Path,
            _width: u32,
            _height: u32,
            _position: f64,
        ) -> AnyResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("simulated failure");
            }
            std::fs::write(destination, b"jpg")?;
            Ok(())
        }
    }

    async fn media_with_file(pool: &SqlitePool, dir: &Path) -> Media {
        let media = Media::create(pool, MediaType::Video, "v", "v.mkv").await.unwrap();
        let path = dir.join("v.mkv");
        std::fs::write(&path, b"videodata").unwrap();
        let file_mrl = mrl::from_local_path(&path);
        let new_file = NewFile {
            folder_id: None,
            mrl: &file_mrl,
            file_type: FileType::Main,
            last_modified: 0,
            size: 9,
            is_removable: false,
            is_network: false,
        };
        File::create_for_media(pool, media.id, &new_file).await.unwrap();
        media
    }

    fn request_for(media_id: i64) -> ThumbnailRequest {
        ThumbnailRequest {
            media_id,
            size_type: ThumbnailSizeType::Thumbnail,
            desired_width: 320,
            desired_height: 0,
            position: 0.1,
        }
    }

    #[tokio::test]
    async fn test_dedupe_index_rejects_double_queue() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let worker = ThumbnailerWorker::new(
            pool,
            Arc::new(NoopCb),
            Arc::new(FfmpegThumbnailer::new()),
            std::env::temp_dir(),
        );
        assert!(worker.request(request_for(1)));
        assert!(!worker.request(request_for(1)));
        assert!(worker.request(request_for(2)));
    }

    #[tokio::test]
    async fn test_success_records_available_thumbnail() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let media = media_with_file(&pool, dir.path()).await;
        let thumbnailer = Arc::new(CountingThumbnailer {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let worker = ThumbnailerWorker::new(
            pool.clone(),
            Arc::new(NoopCb),
            thumbnailer.clone(),
            dir.path().join("thumbnails"),
        );
        std::fs::create_dir_all(dir.path().join("thumbnails")).unwrap();

        let shutdown = CancellationToken::new();
        worker
            .inner
            .process(&request_for(media.id), &shutdown)
            .await
            .unwrap();

        let record = Thumbnail::for_entity(
            &pool,
            ThumbnailEntity::Media,
            media.id,
            ThumbnailSizeType::Thumbnail,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(record.status(), ThumbnailStatus::Available);
        assert!(record.is_owned);
        assert_eq!(thumbnailer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_bumps_attempts_and_crash_marker_stops_retry() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let media = media_with_file(&pool, dir.path()).await;
        let thumbnailer = Arc::new(CountingThumbnailer {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let worker = ThumbnailerWorker::new(
            pool.clone(),
            Arc::new(NoopCb),
            thumbnailer.clone(),
            dir.path().join("thumbnails"),
        );

        let shutdown = CancellationToken::new();
        worker
            .inner
            .process(&request_for(media.id), &shutdown)
            .await
            .unwrap();
        let record = Thumbnail::for_entity(
            &pool,
            ThumbnailEntity::Media,
            media.id,
            ThumbnailSizeType::Thumbnail,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(record.status(), ThumbnailStatus::Failure);
        assert_eq!(record.nb_attempts, 1);

        // Simulate a crash marker left by a previous run: no further
        // generator invocation.
        Thumbnail::set_status(&pool, record.id, ThumbnailStatus::Crash)
            .await
            .unwrap();
        worker
            .inner
            .process(&request_for(media.id), &shutdown)
            .await
            .unwrap();
        assert_eq!(thumbnailer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_sweep_clears_rows_for_missing_files() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("1.jpg");
        std::fs::write(&present, b"x").unwrap();
        sqlx::query("INSERT INTO thumbnail_cleanups (mrl) VALUES (?)")
            .bind(mrl::from_local_path(&present))
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO thumbnail_cleanups (mrl) VALUES (?)")
            .bind(mrl::from_local_path(&dir.path().join("gone.jpg")))
            .execute(&pool)
            .await
            .unwrap();

        let worker = ThumbnailerWorker::new(
            pool.clone(),
            Arc::new(NoopCb),
            Arc::new(FfmpegThumbnailer::new()),
            dir.path().to_path_buf(),
        );
        worker.inner.cleanup_sweep().await.unwrap();

        let (remaining,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM thumbnail_cleanups")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        assert!(!present.exists());
    }
}
