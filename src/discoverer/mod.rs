//! Discoverer worker: a single task fed by a priority-biased queue of
//! discovery requests. Redundant requests collapse against the queue
//! content; urgent short requests jump ahead of long-running scans and
//! preempt the one in flight.

pub mod fs_discoverer;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fs::{DeviceEventListener, FsHolder};
use crate::model::device::Device;
use crate::model::folder::Folder;
use crate::mrl;
use crate::notifier::{Change, Entity, MediaLibraryCb, Notifier};
use crate::parser::Parser;
use fs_discoverer::{FsDiscoverer, InterruptProbe};

/// A discovery request. `Reload(None)` reloads every non-banned root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    AddRoot(String),
    Reload(Option<String>),
    Remove(String),
    Ban(String),
    Unban(String),
    ReloadDevice(i64),
}

impl Request {
    /// Long-running requests walk the filesystem; everything else only
    /// touches rows.
    fn is_long_running(&self) -> bool {
        matches!(self, Request::Reload(_) | Request::AddRoot(_))
    }

    /// Urgent requests are inserted before the first long-running one.
    fn is_urgent(&self) -> bool {
        matches!(
            self,
            Request::Remove(_)
                | Request::Ban(_)
                | Request::Unban(_)
                | Request::ReloadDevice(_)
                | Request::AddRoot(_)
        )
    }

    fn root(&self) -> Option<&str> {
        match self {
            Request::AddRoot(r)
            | Request::Remove(r)
            | Request::Ban(r)
            | Request::Unban(r) => Some(r),
            Request::Reload(Some(r)) => Some(r),
            _ => None,
        }
    }
}

/// Collapse a new request against the queued ones. Returns true when the
/// new request must be dropped. Must run under the queue lock.
fn filter_queue(queue: &mut VecDeque<Request>, new: &Request) -> bool {
    match new {
        Request::AddRoot(root) => {
            let mut drop_new = false;
            queue.retain(|queued| match queued {
                Request::Remove(r) | Request::Reload(Some(r)) if r == root => false,
                Request::AddRoot(r) if r == root => {
                    drop_new = true;
                    true
                }
                _ => true,
            });
            drop_new
        }
        Request::Reload(root) => queue.iter().any(|queued| match (queued, root) {
            (Request::Reload(r), _) => r == root,
            (Request::Remove(r) | Request::Ban(r), Some(new_root)) => r == new_root,
            _ => false,
        }),
        Request::Remove(root) => {
            let mut drop_new = false;
            queue.retain(|queued| match queued {
                Request::AddRoot(r) | Request::Reload(Some(r)) if r == root => false,
                Request::Remove(r) if r == root => {
                    drop_new = true;
                    true
                }
                _ => true,
            });
            drop_new
        }
        Request::Ban(root) => {
            let mut drop_new = false;
            queue.retain(|queued| match queued {
                Request::AddRoot(r) | Request::Reload(Some(r)) | Request::Unban(r)
                    if r == root =>
                {
                    false
                }
                Request::Ban(r) if r == root => {
                    drop_new = true;
                    true
                }
                _ => true,
            });
            drop_new
        }
        Request::Unban(root) => {
            // A queued Ban and this Unban annihilate each other.
            let before = queue.len();
            queue.retain(|queued| !matches!(queued, Request::Ban(r) if r == root));
            queue.len() != before
        }
        Request::ReloadDevice(device_id) => queue
            .iter()
            .any(|queued| matches!(queued, Request::ReloadDevice(d) if d == device_id)),
    }
}

fn insert_request(queue: &mut VecDeque<Request>, new: Request) {
    if new.is_urgent() {
        let position = queue
            .iter()
            .position(Request::is_long_running)
            .unwrap_or(queue.len());
        queue.insert(position, new);
    } else {
        queue.push_back(new);
    }
}

struct QueueState {
    queue: VecDeque<Request>,
    current: Option<(Request, CancellationToken)>,
    running: bool,
}

struct Inner {
    pool: SqlitePool,
    fs: Arc<FsHolder>,
    cb: Arc<dyn MediaLibraryCb>,
    notifier: Notifier,
    parser: Arc<Parser>,
    state: StdMutex<QueueState>,
    notify: Notify,
    paused: AtomicBool,
    idle_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct DiscovererWorker {
    inner: Arc<Inner>,
    idle_rx: watch::Receiver<bool>,
}

impl DiscovererWorker {
    pub fn new(
        pool: SqlitePool,
        fs: Arc<FsHolder>,
        cb: Arc<dyn MediaLibraryCb>,
        notifier: Notifier,
        parser: Arc<Parser>,
    ) -> DiscovererWorker {
        let (idle_tx, idle_rx) = watch::channel(true);
        DiscovererWorker {
            inner: Arc::new(Inner {
                pool,
                fs,
                cb,
                notifier,
                parser,
                state: StdMutex::new(QueueState {
                    queue: VecDeque::new(),
                    current: None,
                    running: true,
                }),
                notify: Notify::new(),
                paused: AtomicBool::new(false),
                idle_tx,
            }),
            idle_rx,
        }
    }

    pub fn idle(&self) -> watch::Receiver<bool> {
        self.idle_rx.clone()
    }

    /// Add a root to the library and scan it.
    pub fn discover(&self, root: &str) -> bool {
        if root.is_empty() {
            return false;
        }
        let root = mrl::to_folder_mrl(root);
        tracing::info!("Adding {} to the folder discovery list", root);
        self.enqueue(Request::AddRoot(root.clone()));
        self.enqueue(Request::Reload(Some(root)));
        true
    }

    pub fn remove_root(&self, root: &str) {
        self.enqueue(Request::Remove(mrl::to_folder_mrl(root)));
    }

    pub fn reload_all(&self) {
        self.enqueue(Request::Reload(None));
    }

    pub fn reload_root(&self, root: &str) {
        self.enqueue(Request::Reload(Some(mrl::to_folder_mrl(root))));
    }

    pub fn ban(&self, root: &str) {
        self.enqueue(Request::Ban(mrl::to_folder_mrl(root)));
    }

    pub fn unban(&self, root: &str) {
        self.enqueue(Request::Unban(mrl::to_folder_mrl(root)));
    }

    pub fn reload_device(&self, device_id: i64) {
        self.enqueue(Request::ReloadDevice(device_id));
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// Wait for the in-flight request to finish; the worker then parks
    /// until resume.
    pub async fn wait_paused(&self) {
        loop {
            if self.inner.state.lock().unwrap().current.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    fn enqueue(&self, request: Request) {
        let mut state = self.inner.state.lock().unwrap();
        if filter_queue(&mut state.queue, &request) {
            tracing::debug!("Dropping redundant discovery request {:?}", request);
            return;
        }
        // Urgent requests preempt a long-running scan; the run loop
        // reschedules the interrupted root unless this request just
        // invalidated it.
        if request.is_urgent() {
            if let Some((current, token)) = &state.current {
                if current.is_long_running() {
                    tracing::debug!("Interrupting {:?} for {:?}", current, request);
                    token.cancel();
                }
            }
        }
        insert_request(&mut state.queue, request);
        let _ = self.inner.idle_tx.send(false);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_loop(inner, shutdown).await;
        })
    }
}

#[async_trait]
impl DeviceEventListener for DiscovererWorker {
    async fn on_device_reappeared(&self, device_id: i64) {
        tracing::info!("Device {} is back, scheduling reload", device_id);
        self.enqueue(Request::ReloadDevice(device_id));
    }

    async fn on_device_gone(&self, device_id: i64) {
        tracing::info!("Device {} went away", device_id);
        // The running discovery aborts at its next probe point; paths on
        // the gone device keep failing with DeviceRemoved meanwhile.
        let state = self.inner.state.lock().unwrap();
        if let Some((current, token)) = &state.current {
            if current.is_long_running() {
                token.cancel();
            }
        }
    }
}

async fn run_loop(inner: Arc<Inner>, shutdown: CancellationToken) {
    tracing::debug!("Discoverer worker started");
    loop {
        let request = {
            let mut state = inner.state.lock().unwrap();
            if !state.running || shutdown.is_cancelled() {
                break;
            }
            if inner.paused.load(Ordering::SeqCst) || state.queue.is_empty() {
                if state.queue.is_empty() && state.current.is_none() {
                    let _ = inner.idle_tx.send(true);
                }
                None
            } else {
                let request = state.queue.pop_front();
                if let Some(request) = &request {
                    state.current = Some((request.clone(), CancellationToken::new()));
                }
                request
            }
        };

        let Some(request) = request else {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = inner.notify.notified() => {}
            }
            continue;
        };

        let token = inner
            .state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .map(|(_, t)| t.clone())
            .expect("current request was just set");
        let probe = InterruptProbe::new(token);

        let outcome = handle_request(&inner, &request, &probe).await;
        if let Err(Error::Interrupted) = outcome {
            reschedule_interrupted(&inner, &request);
        }

        inner.state.lock().unwrap().current = None;
        let idle = {
            let state = inner.state.lock().unwrap();
            state.queue.is_empty()
        };
        if idle {
            let _ = inner.idle_tx.send(true);
        }
    }
    tracing::debug!("Discoverer worker stopped");
}

/// An interrupted scan resumes as a Reload of its root, unless an urgent
/// request that invalidates the root (remove, ban) is pending.
fn reschedule_interrupted(inner: &Arc<Inner>, request: &Request) {
    let Some(root) = request.root() else { return };
    let mut state = inner.state.lock().unwrap();
    let invalidated = state.queue.iter().any(|queued| {
        matches!(queued, Request::Remove(r) | Request::Ban(r) if r == root)
    });
    if invalidated {
        return;
    }
    let reload = Request::Reload(Some(root.to_string()));
    if !filter_queue(&mut state.queue, &reload) {
        insert_request(&mut state.queue, reload);
    }
}

async fn handle_request(
    inner: &Arc<Inner>,
    request: &Request,
    probe: &InterruptProbe,
) -> Result<()> {
    match request {
        Request::AddRoot(root) => {
            let ok = add_root(inner, root).await;
            inner.cb.on_root_added(root, ok);
            Ok(())
        }
        Request::Reload(root) => reload(inner, root.as_deref(), probe).await,
        Request::Remove(root) => {
            let ok = remove_root(inner, root).await;
            inner.cb.on_root_removed(root, ok);
            Ok(())
        }
        Request::Ban(root) => {
            let ok = ban_root(inner, root).await;
            inner.cb.on_root_banned(root, ok);
            Ok(())
        }
        Request::Unban(root) => {
            let ok = unban_root(inner, root).await;
            inner.cb.on_root_unbanned(root, ok);
            Ok(())
        }
        Request::ReloadDevice(device_id) => reload_device(inner, *device_id, probe).await,
    }
}

/// Resolve an mrl to its device row and folder row, without creating
/// either.
async fn resolve_folder(inner: &Arc<Inner>, root: &str) -> Result<Option<(Device, Folder)>> {
    let factory = inner
        .fs
        .factory_for_mrl(root)
        .ok_or_else(|| Error::UnhandledScheme(root.to_string()))?;
    let Some(fs_device) = factory.create_device_from_mrl(root).await else {
        return Ok(None);
    };
    let Some(device) = Device::by_uuid(&inner.pool, &fs_device.uuid(), factory.scheme()).await?
    else {
        return Ok(None);
    };
    let stored = if device.is_removable {
        fs_device.relative_mrl(root)
    } else {
        root.to_string()
    };
    let folder = Folder::by_mrl(&inner.pool, device.id, &stored).await?;
    Ok(folder.map(|folder| (device, folder)))
}

async fn add_root(inner: &Arc<Inner>, root: &str) -> bool {
    match try_add_root(inner, root).await {
        Ok(added) => added,
        Err(e) => {
            tracing::error!("Failed to add root {}: {}", root, e);
            false
        }
    }
}

async fn try_add_root(inner: &Arc<Inner>, root: &str) -> Result<bool> {
    let factory = inner
        .fs
        .factory_for_mrl(root)
        .ok_or_else(|| Error::UnhandledScheme(root.to_string()))?;
    let fs_device = match factory.create_device_from_mrl(root).await {
        Some(device) => device,
        None => {
            factory.refresh_devices().await;
            factory
                .create_device_from_mrl(root)
                .await
                .ok_or(Error::DeviceRemoved)?
        }
    };

    let device = match Device::by_uuid(&inner.pool, &fs_device.uuid(), factory.scheme()).await? {
        Some(device) => {
            Device::update_last_seen(&inner.pool, device.id).await?;
            device
        }
        None => {
            Device::create(
                &inner.pool,
                &fs_device.uuid(),
                factory.scheme(),
                fs_device.is_removable(),
                fs_device.is_network(),
            )
            .await?
        }
    };
    for mountpoint in fs_device.mountpoints() {
        Device::add_mountpoint(&inner.pool, device.id, &mountpoint).await?;
    }

    let stored = if device.is_removable {
        fs_device.relative_mrl(root)
    } else {
        root.to_string()
    };
    if let Some(existing) = Folder::by_mrl(&inner.pool, device.id, &stored).await? {
        if existing.is_banned {
            return Ok(false);
        }
        return Ok(true);
    }
    let name = mrl::decode(mrl::file_name(root)).unwrap_or_else(|_| mrl::file_name(root).into());
    let folder = Folder::create(&inner.pool, &stored, &name, device.id, None, 0, true).await?;
    inner.notifier.notify(Entity::Folder, Change::Added, folder.id);
    Ok(true)
}

async fn reload(inner: &Arc<Inner>, root: Option<&str>, probe: &InterruptProbe) -> Result<()> {
    let roots = match root {
        Some(root) => match resolve_folder(inner, root).await? {
            Some((_, folder)) => vec![folder],
            None => {
                tracing::warn!("Reload requested for unknown root {}", root);
                inner.cb.on_discovery_failed(root);
                return Ok(());
            }
        },
        None => Folder::roots(&inner.pool).await?,
    };
    run_discovery(inner, roots, probe).await
}

async fn reload_device(
    inner: &Arc<Inner>,
    device_id: i64,
    probe: &InterruptProbe,
) -> Result<()> {
    let roots: Vec<Folder> = Folder::roots(&inner.pool)
        .await?
        .into_iter()
        .filter(|f| f.device_id == device_id)
        .collect();
    if roots.is_empty() {
        return Ok(());
    }
    run_discovery(inner, roots, probe).await
}

async fn run_discovery(
    inner: &Arc<Inner>,
    roots: Vec<Folder>,
    probe: &InterruptProbe,
) -> Result<()> {
    if roots.is_empty() {
        return Ok(());
    }
    inner.cb.on_discovery_started();
    let discoverer = FsDiscoverer::new(inner.pool.clone(), inner.fs.clone(), inner.notifier.clone());
    let mut result = Ok(());
    for folder in roots {
        inner.cb.on_discovery_progress(&folder.mrl);
        match discoverer.reload_root(&folder, probe).await {
            Ok(()) => {}
            Err(Error::Interrupted) => {
                result = Err(Error::Interrupted);
                break;
            }
            Err(Error::DeviceRemoved) => {
                tracing::info!("Device removed while scanning {}", folder.mrl);
            }
            Err(e) => {
                tracing::error!("Discovery of {} failed: {}", folder.mrl, e);
                inner.cb.on_discovery_failed(&folder.mrl);
            }
        }
    }
    inner.cb.on_discovery_completed();
    // New tasks may be waiting; wake the parser pool.
    inner.parser.signal();
    result
}

async fn remove_root(inner: &Arc<Inner>, root: &str) -> bool {
    let resolved = match resolve_folder(inner, root).await {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::error!("Failed to resolve {} for removal: {}", root, e);
            return false;
        }
    };
    let Some((_, folder)) = resolved else {
        return false;
    };
    let removed = async {
        Folder::remove(&inner.pool, folder.id).await?;
        Folder::cleanup_orphaned_media(&inner.pool).await?;
        Ok::<_, Error>(())
    }
    .await;
    match removed {
        Ok(()) => {
            inner.notifier.notify(Entity::Folder, Change::Removed, folder.id);
            true
        }
        Err(e) => {
            tracing::error!("Failed to remove root {}: {}", root, e);
            false
        }
    }
}

async fn ban_root(inner: &Arc<Inner>, root: &str) -> bool {
    let result = async {
        match resolve_folder(inner, root).await? {
            Some((_, folder)) => Folder::ban(&inner.pool, folder.id).await,
            None => {
                // Ban before discovery: record the folder banned so a
                // later scan skips it.
                let factory = inner
                    .fs
                    .factory_for_mrl(root)
                    .ok_or_else(|| Error::UnhandledScheme(root.to_string()))?;
                let fs_device = factory
                    .create_device_from_mrl(root)
                    .await
                    .ok_or(Error::DeviceRemoved)?;
                let device =
                    match Device::by_uuid(&inner.pool, &fs_device.uuid(), factory.scheme())
                        .await?
                    {
                        Some(device) => device,
                        None => {
                            Device::create(
                                &inner.pool,
                                &fs_device.uuid(),
                                factory.scheme(),
                                fs_device.is_removable(),
                                fs_device.is_network(),
                            )
                            .await?
                        }
                    };
                let stored = if device.is_removable {
                    fs_device.relative_mrl(root)
                } else {
                    root.to_string()
                };
                let name = mrl::decode(mrl::file_name(root))
                    .unwrap_or_else(|_| mrl::file_name(root).into());
                let folder =
                    Folder::create(&inner.pool, &stored, &name, device.id, None, 0, false)
                        .await?;
                Folder::ban(&inner.pool, folder.id).await
            }
        }
    }
    .await;
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Failed to ban {}: {}", root, e);
            false
        }
    }
}

async fn unban_root(inner: &Arc<Inner>, root: &str) -> bool {
    let resolved = match resolve_folder(inner, root).await {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::error!("Failed to resolve {} for unban: {}", root, e);
            return false;
        }
    };
    let Some((_, folder)) = resolved else {
        return false;
    };
    if !folder.is_banned {
        return false;
    }
    if let Err(e) = Folder::unban(&inner.pool, folder.id).await {
        tracing::error!("Failed to unban {}: {}", root, e);
        return false;
    }
    // The folder's content needs to come back.
    let mut state = inner.state.lock().unwrap();
    let reload = Request::Reload(Some(root.to_string()));
    if !filter_queue(&mut state.queue, &reload) {
        insert_request(&mut state.queue, reload);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_of(requests: &[Request]) -> VecDeque<Request> {
        requests.iter().cloned().collect()
    }

    #[test]
    fn test_add_root_collapses_remove_and_reload() {
        let mut queue = queue_of(&[
            Request::Remove("file:///a/".into()),
            Request::Reload(Some("file:///a/".into())),
            Request::Reload(Some("file:///b/".into())),
        ]);
        let new = Request::AddRoot("file:///a/".into());
        assert!(!filter_queue(&mut queue, &new));
        assert_eq!(queue, queue_of(&[Request::Reload(Some("file:///b/".into()))]));
    }

    #[test]
    fn test_duplicate_add_root_dropped() {
        let mut queue = queue_of(&[Request::AddRoot("file:///a/".into())]);
        assert!(filter_queue(&mut queue, &Request::AddRoot("file:///a/".into())));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reload_dropped_when_shadowed() {
        let mut queue = queue_of(&[Request::Reload(Some("file:///a/".into()))]);
        assert!(filter_queue(
            &mut queue,
            &Request::Reload(Some("file:///a/".into()))
        ));

        let mut queue = queue_of(&[Request::Remove("file:///a/".into())]);
        assert!(filter_queue(
            &mut queue,
            &Request::Reload(Some("file:///a/".into()))
        ));

        let mut queue = queue_of(&[Request::Ban("file:///a/".into())]);
        assert!(filter_queue(
            &mut queue,
            &Request::Reload(Some("file:///a/".into()))
        ));

        let mut queue = queue_of(&[Request::Reload(Some("file:///b/".into()))]);
        assert!(!filter_queue(
            &mut queue,
            &Request::Reload(Some("file:///a/".into()))
        ));
    }

    #[test]
    fn test_remove_collapses_add_and_reload() {
        let mut queue = queue_of(&[
            Request::AddRoot("file:///a/".into()),
            Request::Reload(Some("file:///a/".into())),
        ]);
        assert!(!filter_queue(&mut queue, &Request::Remove("file:///a/".into())));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ban_collapses_related() {
        let mut queue = queue_of(&[
            Request::AddRoot("file:///a/".into()),
            Request::Unban("file:///a/".into()),
            Request::Reload(Some("file:///a/".into())),
            Request::AddRoot("file:///b/".into()),
        ]);
        assert!(!filter_queue(&mut queue, &Request::Ban("file:///a/".into())));
        assert_eq!(queue, queue_of(&[Request::AddRoot("file:///b/".into())]));
    }

    #[test]
    fn test_ban_and_unban_annihilate() {
        let mut queue = queue_of(&[Request::Ban("file:///a/".into())]);
        assert!(filter_queue(&mut queue, &Request::Unban("file:///a/".into())));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_reload_device_dropped() {
        let mut queue = queue_of(&[Request::ReloadDevice(3)]);
        assert!(filter_queue(&mut queue, &Request::ReloadDevice(3)));
        assert!(!filter_queue(&mut queue, &Request::ReloadDevice(4)));
    }

    #[test]
    fn test_urgent_requests_jump_long_running() {
        let mut queue = queue_of(&[
            Request::Reload(Some("file:///a/".into())),
            Request::Reload(Some("file:///b/".into())),
        ]);
        insert_request(&mut queue, Request::Remove("file:///c/".into()));
        assert_eq!(queue[0], Request::Remove("file:///c/".into()));

        // Non-urgent requests stay FIFO.
        insert_request(&mut queue, Request::Reload(Some("file:///d/".into())));
        assert_eq!(queue[3], Request::Reload(Some("file:///d/".into())));
    }
}
