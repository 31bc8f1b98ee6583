//! In-memory filesystem used by the discoverer and orchestrator tests:
//! a mutable tree of folders/files plus pluggable devices whose presence
//! tests can toggle.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::fs::{
    DeviceCallbacks, DeviceDescription, FileSystemFactory, FsDevice, FsDirectory, FsFile,
};
use crate::mrl;

#[derive(Debug, Clone)]
struct MockFileData {
    mrl: String,
    last_modified: i64,
    size: i64,
}

#[derive(Debug, Clone)]
struct MockDeviceData {
    description: DeviceDescription,
    present: bool,
}

#[derive(Default)]
struct MockState {
    // folder mrl -> files inside it
    folders: BTreeMap<String, Vec<MockFileData>>,
    devices: HashMap<String, MockDeviceData>,
}

#[derive(Clone)]
pub struct MockFs {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFs {
    /// A mock with a single permanent device covering `file:///`.
    pub fn new() -> MockFs {
        let fs = MockFs {
            state: Arc::new(Mutex::new(MockState::default())),
        };
        fs.add_device("mock-root", "file:///", false);
        fs
    }

    pub fn add_device(&self, uuid: &str, mountpoint: &str, removable: bool) {
        let mut state = self.state.lock().unwrap();
        state.devices.insert(
            uuid.to_string(),
            MockDeviceData {
                description: DeviceDescription {
                    uuid: uuid.to_string(),
                    mountpoints: vec![mrl::to_folder_mrl(mountpoint)],
                    removable,
                },
                present: true,
            },
        );
    }

    pub fn set_device_present(&self, uuid: &str, present: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(device) = state.devices.get_mut(uuid) {
            device.present = present;
        }
    }

    pub fn device_description(&self, uuid: &str) -> Option<DeviceDescription> {
        let state = self.state.lock().unwrap();
        state.devices.get(uuid).map(|d| d.description.clone())
    }

    /// Create a folder (and its missing ancestors).
    pub fn add_folder(&self, folder_mrl: &str) {
        let folder_mrl = mrl::to_folder_mrl(folder_mrl);
        let mut state = self.state.lock().unwrap();
        let mut current = folder_mrl.as_str();
        loop {
            state.folders.entry(current.to_string()).or_default();
            let parent = mrl::directory(current);
            if parent.is_empty() || parent == current || mrl::strip_scheme(parent).map_or(true, |p| p.is_empty()) {
                if !parent.is_empty() && parent != current {
                    state.folders.entry(parent.to_string()).or_default();
                }
                break;
            }
            current = parent;
        }
    }

    pub fn add_file(&self, file_mrl: &str, last_modified: i64, size: i64) {
        self.add_folder(mrl::directory(file_mrl));
        let mut state = self.state.lock().unwrap();
        let folder = mrl::directory(file_mrl).to_string();
        let files = state.folders.entry(folder).or_default();
        files.retain(|f| f.mrl != file_mrl);
        files.push(MockFileData {
            mrl: file_mrl.to_string(),
            last_modified,
            size,
        });
    }

    pub fn remove_file(&self, file_mrl: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(files) = state.folders.get_mut(mrl::directory(file_mrl)) {
            files.retain(|f| f.mrl != file_mrl);
        }
    }

    pub fn remove_folder(&self, folder_mrl: &str) {
        let folder_mrl = mrl::to_folder_mrl(folder_mrl);
        let mut state = self.state.lock().unwrap();
        state.folders.retain(|k, _| !k.starts_with(&folder_mrl));
    }

    pub fn touch_file(&self, file_mrl: &str, last_modified: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(files) = state.folders.get_mut(mrl::directory(file_mrl)) {
            for file in files.iter_mut() {
                if file.mrl == file_mrl {
                    file.last_modified = last_modified;
                }
            }
        }
    }

    fn device_for(&self, target: &str) -> Option<MockDeviceData> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .values()
            .filter(|d| {
                d.description
                    .mountpoints
                    .iter()
                    .any(|mp| super::mountpoint_matches(mp, target))
            })
            .max_by_key(|d| {
                d.description
                    .mountpoints
                    .iter()
                    .map(|m| m.len())
                    .max()
                    .unwrap_or(0)
            })
            .cloned()
    }
}

struct MockDevice {
    data: MockDeviceData,
}

impl FsDevice for MockDevice {
    fn uuid(&self) -> String {
        self.data.description.uuid.clone()
    }
    fn scheme(&self) -> String {
        "file://".to_string()
    }
    fn is_removable(&self) -> bool {
        self.data.description.removable
    }
    fn is_network(&self) -> bool {
        false
    }
    fn is_present(&self) -> bool {
        self.data.present
    }
    fn mountpoints(&self) -> Vec<String> {
        self.data.description.mountpoints.clone()
    }
}

struct MockFile {
    data: MockFileData,
}

impl FsFile for MockFile {
    fn mrl(&self) -> String {
        self.data.mrl.clone()
    }
    fn name(&self) -> String {
        mrl::decode(mrl::file_name(&self.data.mrl))
            .unwrap_or_else(|_| mrl::file_name(&self.data.mrl).to_string())
    }
    fn last_modified(&self) -> i64 {
        self.data.last_modified
    }
    fn size(&self) -> i64 {
        self.data.size
    }
}

struct MockDirectory {
    mrl: String,
    fs: MockFs,
}

#[async_trait]
impl FsDirectory for MockDirectory {
    fn mrl(&self) -> String {
        self.mrl.clone()
    }

    async fn files(&self) -> Result<Vec<Arc<dyn FsFile>>> {
        if let Some(device) = self.fs.device_for(&self.mrl) {
            if !device.present {
                return Err(Error::DeviceRemoved);
            }
        }
        let state = self.fs.state.lock().unwrap();
        let files = state
            .folders
            .get(&self.mrl)
            .ok_or(Error::DeviceRemoved)?
            .iter()
            .map(|f| Arc::new(MockFile { data: f.clone() }) as Arc<dyn FsFile>)
            .collect();
        Ok(files)
    }

    async fn dirs(&self) -> Result<Vec<Arc<dyn FsDirectory>>> {
        if let Some(device) = self.fs.device_for(&self.mrl) {
            if !device.present {
                return Err(Error::DeviceRemoved);
            }
        }
        let state = self.fs.state.lock().unwrap();
        let dirs = state
            .folders
            .keys()
            .filter(|k| *k != &self.mrl && k.starts_with(&self.mrl))
            // Direct children only: one more path segment.
            .filter(|k| {
                let rest = &k[self.mrl.len()..];
                rest.matches('/').count() == 1 && rest.ends_with('/')
            })
            .map(|k| {
                Arc::new(MockDirectory {
                    mrl: k.clone(),
                    fs: self.fs.clone(),
                }) as Arc<dyn FsDirectory>
            })
            .collect();
        Ok(dirs)
    }

    async fn device(&self) -> Option<Arc<dyn FsDevice>> {
        self.fs
            .device_for(&self.mrl)
            .map(|data| Arc::new(MockDevice { data }) as Arc<dyn FsDevice>)
    }
}

#[async_trait]
impl FileSystemFactory for MockFs {
    fn scheme(&self) -> &str {
        "file://"
    }

    fn is_network(&self) -> bool {
        false
    }

    async fn create_directory(&self, target: &str) -> Result<Arc<dyn FsDirectory>> {
        let target = mrl::to_folder_mrl(target);
        if let Some(device) = self.device_for(&target) {
            if !device.present {
                return Err(Error::DeviceRemoved);
            }
        }
        let state = self.state.lock().unwrap();
        if !state.folders.contains_key(&target) {
            return Err(Error::System {
                code: 2,
                message: format!("no such mock folder: {target}"),
            });
        }
        Ok(Arc::new(MockDirectory {
            mrl: target,
            fs: self.clone(),
        }))
    }

    async fn create_file(&self, target: &str) -> Result<Arc<dyn FsFile>> {
        let state = self.state.lock().unwrap();
        let folder = mrl::directory(target);
        state
            .folders
            .get(folder)
            .and_then(|files| files.iter().find(|f| f.mrl == target))
            .map(|f| Arc::new(MockFile { data: f.clone() }) as Arc<dyn FsFile>)
            .ok_or(Error::System {
                code: 2,
                message: format!("no such mock file: {target}"),
            })
    }

    async fn create_device(&self, uuid: &str) -> Option<Arc<dyn FsDevice>> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .get(uuid)
            .map(|data| Arc::new(MockDevice { data: data.clone() }) as Arc<dyn FsDevice>)
    }

    async fn create_device_from_mrl(&self, target: &str) -> Option<Arc<dyn FsDevice>> {
        self.device_for(target)
            .map(|data| Arc::new(MockDevice { data }) as Arc<dyn FsDevice>)
    }

    async fn refresh_devices(&self) {}

    async fn start(&self, _cb: Arc<dyn DeviceCallbacks>) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}
}
