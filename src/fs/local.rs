//! `file://` filesystem implementation over the local disk. Blocking
//! `std::fs` calls run inside `spawn_blocking`; directory listings are
//! computed once per handle and cached.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::fs::{
    DeviceCallbacks, DeviceDescription, DeviceLister, FileSystemFactory, FsDevice, FsDirectory,
    FsFile,
};
use crate::mrl;

/// Mount prefixes treated as removable media on unix.
const REMOVABLE_MOUNT_PREFIXES: &[&str] = &["/media/", "/run/media/", "/mnt/"];

const ENOTDIR: i32 = 20;

/// Default lister: one permanent device for the root filesystem plus one
/// removable device per mount under the usual removable prefixes.
pub struct LocalDeviceLister;

impl DeviceLister for LocalDeviceLister {
    fn devices(&self) -> Vec<DeviceDescription> {
        let mut devices = vec![DeviceDescription {
            uuid: "local-root".to_string(),
            mountpoints: vec!["file:///".to_string()],
            removable: false,
        }];
        devices.extend(removable_mounts());
        devices
    }
}

fn removable_mounts() -> Vec<DeviceDescription> {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return Vec::new();
    };
    let mut devices = Vec::new();
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_source), Some(target)) = (fields.next(), fields.next()) else {
            continue;
        };
        if !REMOVABLE_MOUNT_PREFIXES
            .iter()
            .any(|p| target.starts_with(p))
        {
            continue;
        }
        // /proc/mounts octal-escapes spaces as \040
        let target = target.replace("\\040", " ");
        devices.push(DeviceDescription {
            uuid: format!("removable{}", target.replace('/', "-")),
            mountpoints: vec![mrl::to_folder_mrl(&mrl::from_local_path(Path::new(&target)))],
            removable: true,
        });
    }
    devices
}

struct LocalDevice {
    description: DeviceDescription,
    present: bool,
}

impl FsDevice for LocalDevice {
    fn uuid(&self) -> String {
        self.description.uuid.clone()
    }
    fn scheme(&self) -> String {
        "file://".to_string()
    }
    fn is_removable(&self) -> bool {
        self.description.removable
    }
    fn is_network(&self) -> bool {
        false
    }
    fn is_present(&self) -> bool {
        self.present
    }
    fn mountpoints(&self) -> Vec<String> {
        self.description.mountpoints.clone()
    }
}

pub struct LocalFile {
    mrl: String,
    last_modified: i64,
    size: i64,
}

impl FsFile for LocalFile {
    fn mrl(&self) -> String {
        self.mrl.clone()
    }
    fn name(&self) -> String {
        mrl::decode(mrl::file_name(&self.mrl)).unwrap_or_else(|_| mrl::file_name(&self.mrl).to_string())
    }
    fn last_modified(&self) -> i64 {
        self.last_modified
    }
    fn size(&self) -> i64 {
        self.size
    }
}

type Listing = (Vec<Arc<dyn FsFile>>, Vec<Arc<dyn FsDirectory>>);

pub struct LocalDirectory {
    mrl: String,
    factory: Arc<LocalFsFactory>,
    listing: Mutex<Option<Listing>>,
}

impl LocalDirectory {
    fn new(target: &str, factory: Arc<LocalFsFactory>) -> LocalDirectory {
        LocalDirectory {
            mrl: mrl::to_folder_mrl(target),
            factory,
            listing: Mutex::new(None),
        }
    }

    async fn list(&self) -> Result<Listing> {
        let mut cached = self.listing.lock().await;
        if let Some(listing) = cached.as_ref() {
            return Ok(listing.clone());
        }
        let path = mrl::to_local_path(&self.mrl)?;
        let entries = tokio::task::spawn_blocking(move || read_dir_entries(&path))
            .await
            .map_err(|e| Error::System {
                code: -1,
                message: format!("listing task failed: {e}"),
            })??;

        let mut files: Vec<Arc<dyn FsFile>> = Vec::new();
        let mut dirs: Vec<Arc<dyn FsDirectory>> = Vec::new();
        for entry in entries {
            let entry_mrl = mrl::from_local_path(&entry.path);
            if entry.is_dir {
                dirs.push(Arc::new(LocalDirectory::new(
                    &entry_mrl,
                    self.factory.clone(),
                )));
            } else {
                files.push(Arc::new(LocalFile {
                    mrl: entry_mrl,
                    last_modified: entry.last_modified,
                    size: entry.size,
                }));
            }
        }
        *cached = Some((files.clone(), dirs.clone()));
        Ok((files, dirs))
    }
}

struct DirEntryInfo {
    path: PathBuf,
    is_dir: bool,
    last_modified: i64,
    size: i64,
}

fn read_dir_entries(path: &Path) -> Result<Vec<DirEntryInfo>> {
    let mut entries = Vec::new();
    let read = std::fs::read_dir(path).map_err(Error::from_io)?;
    for entry in read {
        let entry = entry.map_err(Error::from_io)?;
        let name = entry.file_name();
        // Hidden entries are not media; .nomedia is probed separately by
        // name through the files() listing, so keep dotfiles out of dirs
        // but keep them in files.
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Cannot stat {:?}: {}", entry.path(), e);
                continue;
            }
        };
        let is_dir = metadata.is_dir();
        if is_dir && name.to_string_lossy().starts_with('.') {
            continue;
        }
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        entries.push(DirEntryInfo {
            path: entry.path(),
            is_dir,
            last_modified,
            size: metadata.len() as i64,
        });
    }
    Ok(entries)
}

#[async_trait]
impl FsDirectory for LocalDirectory {
    fn mrl(&self) -> String {
        self.mrl.clone()
    }

    async fn files(&self) -> Result<Vec<Arc<dyn FsFile>>> {
        Ok(self.list().await?.0)
    }

    async fn dirs(&self) -> Result<Vec<Arc<dyn FsDirectory>>> {
        Ok(self.list().await?.1)
    }

    async fn device(&self) -> Option<Arc<dyn FsDevice>> {
        self.factory.create_device_from_mrl(&self.mrl).await
    }
}

/// Factory for the `file://` scheme.
pub struct LocalFsFactory {
    lister: Arc<dyn DeviceLister>,
    devices: Mutex<HashMap<String, DeviceDescription>>,
    callbacks: Mutex<Option<Arc<dyn DeviceCallbacks>>>,
    // Directories hold a reference back to their factory to resolve their
    // device lazily.
    self_ref: std::sync::Weak<LocalFsFactory>,
}

impl LocalFsFactory {
    pub fn new(lister: Option<Arc<dyn DeviceLister>>) -> Arc<LocalFsFactory> {
        Arc::new_cyclic(|weak| LocalFsFactory {
            lister: lister.unwrap_or_else(|| Arc::new(LocalDeviceLister)),
            devices: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    async fn device_by<F>(&self, predicate: F) -> Option<Arc<dyn FsDevice>>
    where
        F: Fn(&DeviceDescription) -> bool,
    {
        let devices = self.devices.lock().await;
        // Prefer the device with the longest matching mountpoint so nested
        // mounts resolve to the innermost device.
        devices
            .values()
            .filter(|d| predicate(d))
            .max_by_key(|d| d.mountpoints.iter().map(|m| m.len()).max().unwrap_or(0))
            .map(|d| {
                Arc::new(LocalDevice {
                    description: d.clone(),
                    present: true,
                }) as Arc<dyn FsDevice>
            })
    }
}

#[async_trait]
impl FileSystemFactory for LocalFsFactory {
    fn scheme(&self) -> &str {
        "file://"
    }

    fn is_network(&self) -> bool {
        false
    }

    async fn create_directory(&self, target: &str) -> Result<Arc<dyn FsDirectory>> {
        let factory = self.self_ref.upgrade().ok_or_else(|| Error::System {
            code: -1,
            message: "factory torn down".to_string(),
        })?;
        let path = mrl::to_local_path(target)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => {
                Ok(Arc::new(LocalDirectory::new(target, factory)))
            }
            Ok(_) => Err(Error::System {
                code: ENOTDIR,
                message: format!("{} is not a directory", path.display()),
            }),
            Err(e) => {
                // The path may have vanished with its device.
                match self.create_device_from_mrl(target).await {
                    Some(device) if !device.is_present() => Err(Error::DeviceRemoved),
                    _ => Err(Error::from_io(e)),
                }
            }
        }
    }

    async fn create_file(&self, target: &str) -> Result<Arc<dyn FsFile>> {
        let path = mrl::to_local_path(target)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(Error::from_io)?;
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(Arc::new(LocalFile {
            mrl: target.to_string(),
            last_modified,
            size: metadata.len() as i64,
        }))
    }

    async fn create_device(&self, uuid: &str) -> Option<Arc<dyn FsDevice>> {
        self.device_by(|d| d.uuid == uuid).await
    }

    async fn create_device_from_mrl(&self, target: &str) -> Option<Arc<dyn FsDevice>> {
        self.device_by(|d| {
            d.mountpoints
                .iter()
                .any(|mp| super::mountpoint_matches(mp, target))
        })
        .await
    }

    async fn refresh_devices(&self) {
        let fresh: HashMap<String, DeviceDescription> = self
            .lister
            .devices()
            .into_iter()
            .map(|d| (d.uuid.clone(), d))
            .collect();
        let previous = {
            let mut devices = self.devices.lock().await;
            std::mem::replace(&mut *devices, fresh.clone())
        };
        let cb = self.callbacks.lock().await.clone();
        let Some(cb) = cb else { return };

        for (uuid, description) in &fresh {
            if !previous.contains_key(uuid) {
                for mountpoint in &description.mountpoints {
                    cb.on_device_mounted(description, mountpoint).await;
                }
            }
        }
        for (uuid, description) in &previous {
            if !fresh.contains_key(uuid) {
                for mountpoint in &description.mountpoints {
                    cb.on_device_unmounted(description, mountpoint).await;
                }
            }
        }
    }

    async fn start(&self, cb: Arc<dyn DeviceCallbacks>) -> Result<()> {
        *self.callbacks.lock().await = Some(cb);
        Ok(())
    }

    async fn stop(&self) {
        *self.callbacks.lock().await = None;
    }
}
