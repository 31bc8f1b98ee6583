//! Filesystem abstraction. A factory is registered per scheme and hands
//! out directory/file/device handles; a device lister reports the
//! authoritative set of `(uuid, mountpoints, removable)` tuples and the
//! factory diffs successive reports into mount/unmount events.

pub mod local;
#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::mrl;

/// One device as reported by a lister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub uuid: String,
    pub mountpoints: Vec<String>,
    pub removable: bool,
}

/// Produces the authoritative device list for one scheme. Network listers
/// may discover devices continuously; the factory polls this on refresh
/// and diffs against its previous snapshot.
pub trait DeviceLister: Send + Sync {
    fn devices(&self) -> Vec<DeviceDescription>;
}

/// Receives factory-level device events after the diff. Callbacks may fire
/// from arbitrary factory tasks.
#[async_trait]
pub trait DeviceCallbacks: Send + Sync {
    async fn on_device_mounted(&self, description: &DeviceDescription, mountpoint: &str);
    async fn on_device_unmounted(&self, description: &DeviceDescription, mountpoint: &str);
}

/// Engine-side listener wired by the orchestrator, fired once the store
/// has been updated.
#[async_trait]
pub trait DeviceEventListener: Send + Sync {
    async fn on_device_reappeared(&self, device_id: i64);
    async fn on_device_gone(&self, device_id: i64);
}

pub trait FsDevice: Send + Sync {
    fn uuid(&self) -> String;
    fn scheme(&self) -> String;
    fn is_removable(&self) -> bool;
    fn is_network(&self) -> bool;
    fn is_present(&self) -> bool;
    fn mountpoints(&self) -> Vec<String>;

    /// The mountpoint this mrl lives under, if any. The longest matching
    /// prefix wins so nested mounts resolve to the innermost device.
    fn matches_mountpoint(&self, target: &str) -> Option<String> {
        self.mountpoints()
            .into_iter()
            .filter(|mp| mountpoint_matches(mp, target))
            .max_by_key(|mp| mp.len())
    }

    /// Strip the matching mountpoint, yielding the device-relative form
    /// stored for removable folders and files. Only a literal (case-folded)
    /// prefix is stripped: a mountpoint that matched through port
    /// normalisation keeps the mrl absolute rather than mis-slicing it.
    fn relative_mrl(&self, absolute: &str) -> String {
        match self.matches_mountpoint(absolute) {
            Some(mp)
                if absolute.len() >= mp.len()
                    && absolute[..mp.len()].eq_ignore_ascii_case(&mp) =>
            {
                absolute[mp.len()..].trim_start_matches('/').to_string()
            }
            _ => absolute.to_string(),
        }
    }

    /// Recompose an absolute mrl from a stored relative one, using the
    /// first current mountpoint.
    fn absolute_mrl(&self, relative: &str) -> String {
        match self.mountpoints().into_iter().next() {
            Some(mp) => format!("{}{}", mrl::to_folder_mrl(&mp), relative),
            None => relative.to_string(),
        }
    }
}

pub trait FsFile: Send + Sync {
    fn mrl(&self) -> String;
    /// Decoded leaf name.
    fn name(&self) -> String;
    fn extension(&self) -> Option<String> {
        mrl::extension(&self.mrl())
    }
    fn last_modified(&self) -> i64;
    fn size(&self) -> i64;
}

#[async_trait]
pub trait FsDirectory: Send + Sync {
    fn mrl(&self) -> String;
    /// Decoded leaf name.
    fn name(&self) -> String {
        mrl::decode(mrl::file_name(&self.mrl())).unwrap_or_else(|_| mrl::file_name(&self.mrl()).to_string())
    }
    /// Listing is lazy and cached per instance.
    async fn files(&self) -> Result<Vec<Arc<dyn FsFile>>>;
    async fn dirs(&self) -> Result<Vec<Arc<dyn FsDirectory>>>;
    async fn device(&self) -> Option<Arc<dyn FsDevice>>;
}

#[async_trait]
pub trait FileSystemFactory: Send + Sync {
    /// Scheme handled by this factory, including the separator
    /// (`"file://"`).
    fn scheme(&self) -> &str;
    fn is_network(&self) -> bool;
    fn accepts(&self, target: &str) -> bool {
        mrl::scheme_is(self.scheme(), target)
    }
    async fn create_directory(&self, target: &str) -> Result<Arc<dyn FsDirectory>>;
    async fn create_file(&self, target: &str) -> Result<Arc<dyn FsFile>>;
    async fn create_device(&self, uuid: &str) -> Option<Arc<dyn FsDevice>>;
    async fn create_device_from_mrl(&self, target: &str) -> Option<Arc<dyn FsDevice>>;
    /// Re-probe the device lister, firing mount/unmount callbacks for the
    /// difference against the previous snapshot.
    async fn refresh_devices(&self);
    async fn start(&self, cb: Arc<dyn DeviceCallbacks>) -> Result<()>;
    async fn stop(&self);
}

/// Case-insensitive, scheme-aware prefix comparison between a mountpoint
/// and an mrl. Default ports are equivalent to absent ones (e.g. smb on
/// 445).
pub fn mountpoint_matches(mountpoint: &str, target: &str) -> bool {
    let mp = normalize_authority(mountpoint);
    let target = normalize_authority(target);
    let mp = mp.to_lowercase();
    let target = target.to_lowercase();
    let mp = mrl::to_folder_mrl(&mp);
    target.starts_with(&mp) || target == mp[..mp.len() - 1]
}

fn default_port(scheme: &str) -> Option<&'static str> {
    match scheme {
        "smb" => Some("445"),
        "ftp" => Some("21"),
        "sftp" => Some("22"),
        "nfs" => Some("2049"),
        _ => None,
    }
}

/// Strip an explicit default port from the host segment so
/// `smb://nas:445/x` and `smb://nas/x` compare equal.
fn normalize_authority(target: &str) -> String {
    let Some(scheme_pos) = target.find("://") else {
        return target.to_string();
    };
    let scheme = &target[..scheme_pos];
    let Some(port) = default_port(scheme) else {
        return target.to_string();
    };
    let after = &target[scheme_pos + 3..];
    let host_end = after.find('/').unwrap_or(after.len());
    let host = &after[..host_end];
    let suffix = format!(":{port}");
    if let Some(stripped) = host.strip_suffix(suffix.as_str()) {
        format!("{}://{}{}", scheme, stripped, &after[host_end..])
    } else {
        target.to_string()
    }
}

/// Registry of filesystem factories, owned by the orchestrator. Resolves
/// an mrl to its factory and fans device events out to the engine after
/// recording them in the store.
pub struct FsHolder {
    pool: sqlx::SqlitePool,
    factories: Vec<Arc<dyn FileSystemFactory>>,
    listener: tokio::sync::RwLock<Option<Arc<dyn DeviceEventListener>>>,
}

impl FsHolder {
    pub fn new(pool: sqlx::SqlitePool, factories: Vec<Arc<dyn FileSystemFactory>>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            factories,
            listener: tokio::sync::RwLock::new(None),
        })
    }

    pub async fn set_listener(&self, listener: Arc<dyn DeviceEventListener>) {
        *self.listener.write().await = Some(listener);
    }

    pub fn factory_for_mrl(&self, target: &str) -> Option<Arc<dyn FileSystemFactory>> {
        self.factories.iter().find(|f| f.accepts(target)).cloned()
    }

    pub fn factories(&self) -> &[Arc<dyn FileSystemFactory>] {
        &self.factories
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let cb: Arc<dyn DeviceCallbacks> = Arc::new(HolderCallbacks {
            holder: Arc::downgrade(self),
        });
        for factory in &self.factories {
            factory.start(cb.clone()).await?;
            factory.refresh_devices().await;
        }
        Ok(())
    }

    pub async fn stop(&self) {
        for factory in &self.factories {
            factory.stop().await;
        }
    }

    pub async fn refresh_devices(&self) {
        // Network factories may block on their lister; probe them all
        // concurrently.
        futures::future::join_all(
            self.factories.iter().map(|factory| factory.refresh_devices()),
        )
        .await;
    }

    async fn handle_mounted(&self, description: &DeviceDescription, mountpoint: &str, scheme: &str, network: bool) {
        use crate::model::device::Device;
        let known = Device::by_uuid(&self.pool, &description.uuid, scheme).await;
        let device = match known {
            Ok(Some(device)) => {
                if let Err(e) = Device::set_present(&self.pool, device.id, true).await {
                    tracing::error!("Failed to mark device {} present: {}", description.uuid, e);
                    return;
                }
                Some(device)
            }
            Ok(None) => {
                match Device::create(
                    &self.pool,
                    &description.uuid,
                    scheme,
                    description.removable,
                    network,
                )
                .await
                {
                    Ok(device) => Some(device),
                    Err(e) => {
                        tracing::error!("Failed to record device {}: {}", description.uuid, e);
                        None
                    }
                }
            }
            Err(e) => {
                tracing::error!("Device lookup failed for {}: {}", description.uuid, e);
                None
            }
        };
        let Some(device) = device else { return };
        if let Err(e) = Device::add_mountpoint(&self.pool, device.id, mountpoint).await {
            tracing::warn!("Failed to cache mountpoint {}: {}", mountpoint, e);
        }
        if let Some(listener) = self.listener.read().await.clone() {
            listener.on_device_reappeared(device.id).await;
        }
    }

    async fn handle_unmounted(&self, description: &DeviceDescription, scheme: &str) {
        use crate::model::device::Device;
        match Device::by_uuid(&self.pool, &description.uuid, scheme).await {
            Ok(Some(device)) => {
                if let Err(e) = Device::set_present(&self.pool, device.id, false).await {
                    tracing::error!("Failed to mark device {} absent: {}", description.uuid, e);
                    return;
                }
                if let Some(listener) = self.listener.read().await.clone() {
                    listener.on_device_gone(device.id).await;
                }
            }
            Ok(None) => {
                tracing::warn!("Unmount event for unknown device {}", description.uuid);
            }
            Err(e) => {
                tracing::error!("Device lookup failed for {}: {}", description.uuid, e);
            }
        }
    }

    fn scheme_of(&self, description: &DeviceDescription) -> (String, bool) {
        for factory in &self.factories {
            if description
                .mountpoints
                .iter()
                .any(|mp| factory.accepts(mp))
            {
                return (factory.scheme().to_string(), factory.is_network());
            }
        }
        ("file://".to_string(), false)
    }
}

struct HolderCallbacks {
    holder: std::sync::Weak<FsHolder>,
}

#[async_trait]
impl DeviceCallbacks for HolderCallbacks {
    async fn on_device_mounted(&self, description: &DeviceDescription, mountpoint: &str) {
        if let Some(holder) = self.holder.upgrade() {
            let (scheme, network) = holder.scheme_of(description);
            holder
                .handle_mounted(description, mountpoint, &scheme, network)
                .await;
        }
    }

    async fn on_device_unmounted(&self, description: &DeviceDescription, _mountpoint: &str) {
        if let Some(holder) = self.holder.upgrade() {
            let (scheme, _) = holder.scheme_of(description);
            holder.handle_unmounted(description, &scheme).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mountpoint_match_case_insensitive() {
        assert!(mountpoint_matches("file:///Mnt/Disk/", "file:///mnt/disk/music/a.mp3"));
        assert!(mountpoint_matches("file:///mnt/disk", "file:///mnt/disk/"));
        assert!(!mountpoint_matches("file:///mnt/disk/", "file:///mnt/diskette/a.mp3"));
    }

    #[test]
    fn test_smb_default_port_equivalence() {
        assert!(mountpoint_matches("smb://nas:445/share/", "smb://nas/share/file.mkv"));
        assert!(mountpoint_matches("smb://nas/share/", "smb://NAS:445/share/file.mkv"));
        assert!(!mountpoint_matches("smb://nas:139/share/", "smb://nas/share/file.mkv"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        struct Dev;
        impl FsDevice for Dev {
            fn uuid(&self) -> String {
                "u".into()
            }
            fn scheme(&self) -> String {
                "file://".into()
            }
            fn is_removable(&self) -> bool {
                true
            }
            fn is_network(&self) -> bool {
                false
            }
            fn is_present(&self) -> bool {
                true
            }
            fn mountpoints(&self) -> Vec<String> {
                vec!["file:///mnt/".into(), "file:///mnt/disk/".into()]
            }
        }
        let device = Dev;
        assert_eq!(
            device.matches_mountpoint("file:///mnt/disk/music/a.mp3"),
            Some("file:///mnt/disk/".to_string())
        );
        assert_eq!(
            device.relative_mrl("file:///mnt/disk/music/a.mp3"),
            "music/a.mp3"
        );
    }
}
