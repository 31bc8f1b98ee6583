//! The parser: a pool of workers draining the persistent task table and
//! pushing each task through the ordered chain of parser services.
//! Progress is persisted per service through the task step bitmap, so an
//! interrupted task resumes from its first unset step after a restart.

pub mod extractor;
pub mod item;
pub mod linker;
pub mod probe;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::access::PriorityAccess;
use crate::error::Error;
use crate::fs::FsHolder;
use crate::model::file::FileType;
use crate::model::folder::Folder;
use crate::model::media::Media;
use crate::model::task::{Step, Task, MAX_RETRIES};
use crate::notifier::{MediaLibraryCb, Notifier};
use crate::parser::item::Item;
use crate::parser::probe::MediaProbe;

/// Outcome of one service run over one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Continue to the next service.
    Success,
    /// Stop the chain and mark the whole task done.
    Completed,
    /// Remove the task; retrying cannot help.
    Discarded,
    /// Transient condition: re-insert the task at the tail.
    Requeue,
    /// Bump the retry counter; discard past the threshold.
    Fatal,
}

/// A parser service. Built-in services cover metadata extraction, metadata
/// analysis and linking; applications may register extra services, which
/// must target the extraction step. Ordering is by decreasing priority,
/// ties broken by registration order.
#[async_trait]
pub trait ParserService: Send + Sync {
    fn name(&self) -> &'static str;
    fn targeted_step(&self) -> Step;
    fn priority(&self) -> u8 {
        50
    }
    async fn run(&self, item: &mut Item) -> Status;
    /// Clear per-service caches; called at pause, rescan and before a
    /// destructive migration.
    async fn flush(&self) {}
}

/// Shared context handed to every service.
pub struct ParserCtx {
    pub pool: SqlitePool,
    pub notifier: Notifier,
    pub cb: Arc<dyn MediaLibraryCb>,
    pub fs: Arc<FsHolder>,
    pub access: PriorityAccess,
    pub thumbnails_dir: PathBuf,
    pub probe: Arc<dyn MediaProbe>,
    pub probe_timeout: Duration,
}

impl ParserCtx {
    pub fn artwork_dir(&self) -> PathBuf {
        self.thumbnails_dir.join("embedded")
    }
}

struct ParserState {
    in_flight: StdMutex<HashSet<i64>>,
    notify: Notify,
    paused: AtomicBool,
    done: AtomicU64,
    idle_tx: watch::Sender<bool>,
}

pub struct Parser {
    ctx: Arc<ParserCtx>,
    services: Arc<Vec<Arc<dyn ParserService>>>,
    state: Arc<ParserState>,
    idle_rx: watch::Receiver<bool>,
}

impl Parser {
    /// Assemble the service chain: the three built-in services plus the
    /// application-registered ones, ordered by decreasing priority with
    /// registration order breaking ties.
    pub fn new(ctx: Arc<ParserCtx>, extra_services: Vec<Arc<dyn ParserService>>) -> Parser {
        let mut services: Vec<Arc<dyn ParserService>> = vec![
            Arc::new(extractor::MetadataExtractionService::new(ctx.clone())),
            Arc::new(crate::analyzer::MetadataAnalyzer::new(ctx.clone())),
            Arc::new(linker::LinkService::new(ctx.clone())),
        ];
        services.extend(extra_services);
        // Stable: registration order persists among equal priorities.
        services.sort_by_key(|s| std::cmp::Reverse(s.priority()));

        let (idle_tx, idle_rx) = watch::channel(true);
        Parser {
            ctx,
            services: Arc::new(services),
            state: Arc::new(ParserState {
                in_flight: StdMutex::new(HashSet::new()),
                notify: Notify::new(),
                paused: AtomicBool::new(false),
                done: AtomicU64::new(0),
                idle_tx,
            }),
            idle_rx,
        }
    }

    /// Observe parser idleness; the orchestrator composes this with the
    /// discoverer's.
    pub fn idle(&self) -> watch::Receiver<bool> {
        self.idle_rx.clone()
    }

    /// Wake the workers after task insertion.
    pub fn signal(&self) {
        let _ = self.state.idle_tx.send(false);
        self.state.notify.notify_waiters();
    }

    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
    }

    /// Wait until every in-flight task completed its current unit; paused
    /// workers then park before claiming anything new.
    pub async fn wait_paused(&self) {
        while !self.state.in_flight.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn resume(&self) {
        self.state.paused.store(false, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    /// Drain the in-flight work and clear every per-service cache. A
    /// parser paused by the caller stays paused.
    pub async fn flush(&self) {
        let was_paused = self.state.paused.swap(true, Ordering::SeqCst);
        self.wait_paused().await;
        for service in self.services.iter() {
            service.flush().await;
        }
        if !was_paused {
            self.resume();
        }
    }

    pub fn spawn_workers(
        &self,
        count: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|idx| {
                let ctx = self.ctx.clone();
                let services = self.services.clone();
                let state = self.state.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(idx, ctx, services, state, shutdown).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(
    idx: usize,
    ctx: Arc<ParserCtx>,
    services: Arc<Vec<Arc<dyn ParserService>>>,
    state: Arc<ParserState>,
    shutdown: CancellationToken,
) {
    tracing::debug!("Parser worker {} started", idx);
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        if state.paused.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = state.notify.notified() => continue,
            }
        }

        let claimed = claim_next(&ctx.pool, &state).await;
        let task = match claimed {
            Ok(Some(task)) => task,
            Ok(None) => {
                // Nothing runnable: report idle when the whole pool is
                // parked, then wait for a signal (or poll, matching the
                // durable-queue model where tasks appear behind our back).
                let all_parked = state.in_flight.lock().unwrap().is_empty();
                if all_parked {
                    let _ = state.idle_tx.send(true);
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = state.notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
                continue;
            }
            Err(e) => {
                tracing::error!("Parser worker {} failed to claim a task: {}", idx, e);
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let _ = state.idle_tx.send(false);
        let task_id = task.id;
        process_task(&ctx, &services, task).await;
        state.in_flight.lock().unwrap().remove(&task_id);

        state.done.fetch_add(1, Ordering::SeqCst);
        let done = state.done.load(Ordering::SeqCst);
        let pending = Task::count_incomplete(&ctx.pool).await.unwrap_or(0) as u64;
        ctx.cb.on_parsing_stats_updated(done, done + pending);
    }
    tracing::debug!("Parser worker {} stopped", idx);
}

async fn claim_next(
    pool: &SqlitePool,
    state: &Arc<ParserState>,
) -> crate::error::Result<Option<Task>> {
    let exclude: Vec<i64> = state.in_flight.lock().unwrap().iter().copied().collect();
    let candidates = Task::fetch_runnable(pool, &exclude, 4).await?;
    let mut in_flight = state.in_flight.lock().unwrap();
    for candidate in candidates {
        if in_flight.insert(candidate.id) {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

async fn process_task(ctx: &Arc<ParserCtx>, services: &[Arc<dyn ParserService>], task: Task) {
    // Background work holds a read context so a priority acquirer can
    // drain the pool.
    let _guard = ctx.access.read().await;
    let task_id = task.id;

    let mut item = match build_item(ctx, &task).await {
        Ok(item) => item,
        Err(e) => {
            tracing::warn!("Failed to build item for task {}: {}", task_id, e);
            fail_task(ctx, task_id, e.is_recoverable()).await;
            return;
        }
    };

    for service in services {
        let step = service.targeted_step();
        if item.task.has_step(step) {
            continue;
        }
        let status = service.run(&mut item).await;
        tracing::trace!(
            "Service {} on task {} -> {:?}",
            service.name(),
            task_id,
            status
        );
        match status {
            Status::Success => {
                if let Err(e) = Task::add_step(&ctx.pool, task_id, step).await {
                    tracing::error!("Failed to persist step for task {}: {}", task_id, e);
                    return;
                }
                item.task.step |= step as i64;
            }
            Status::Completed => {
                let _ = Task::add_step(&ctx.pool, task_id, step).await;
                let _ = Task::mark_completed(&ctx.pool, task_id).await;
                let _ = Task::remove(&ctx.pool, task_id).await;
                return;
            }
            Status::Discarded => {
                let _ = Task::remove(&ctx.pool, task_id).await;
                return;
            }
            Status::Requeue => {
                if let Err(e) = Task::requeue(&ctx.pool, task_id).await {
                    tracing::error!("Failed to requeue task {}: {}", task_id, e);
                }
                return;
            }
            Status::Fatal => {
                fail_task(ctx, task_id, false).await;
                return;
            }
        }
    }

    if item.task.all_steps_done() {
        let _ = Task::remove(&ctx.pool, task_id).await;
    }
}

async fn fail_task(ctx: &Arc<ParserCtx>, task_id: i64, recoverable: bool) {
    if recoverable {
        // Recoverable conditions (device gone, interruption) keep the
        // retry budget intact; the task reruns when circumstances change.
        return;
    }
    match Task::bump_retry_count(&ctx.pool, task_id).await {
        Ok(count) if count >= MAX_RETRIES => {
            tracing::warn!(
                "Task {} failed {} times, permanently discarding",
                task_id,
                count
            );
            let _ = Task::remove(&ctx.pool, task_id).await;
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Failed to bump retry count for task {}: {}", task_id, e),
    }
}

async fn build_item(ctx: &Arc<ParserCtx>, task: &Task) -> crate::error::Result<Item> {
    let mut mrl = task.mrl.clone().unwrap_or_default();
    let mut file_type = FileType::from_i64(task.file_type);
    let mut item;

    let file = match task.file_id {
        Some(file_id) => crate::model::file::File::by_id(&ctx.pool, file_id).await?,
        None => None,
    };
    if let Some(file) = &file {
        if mrl.is_empty() {
            mrl = file.mrl.clone();
        }
        file_type = file.file_type();
    }
    if mrl.is_empty() {
        return Err(Error::NotFound {
            target: "mrl",
            container: format!("task {}", task.id),
        });
    }
    item = Item::new(task.clone(), mrl, file_type);
    if let Some(file) = file {
        if let Some(media_id) = file.media_id {
            item.media = Media::by_id(&ctx.pool, media_id).await?;
        }
        item.file = Some(file);
    }
    if let Some(folder_id) = task.parent_folder_id {
        item.parent_folder = Folder::by_id(&ctx.pool, folder_id).await?;
    }
    Ok(item)
}
