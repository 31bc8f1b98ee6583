//! Depth-first reconciliation of one root folder: diff the filesystem
//! state against the store, emit tasks for new/modified files and drop
//! folders/files that vanished. Interruption is cooperative through an
//! [`InterruptProbe`] consulted between units of work.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::config::ext;
use crate::error::{Error, Result};
use crate::fs::{FsDevice, FsDirectory, FsFile, FsHolder};
use crate::model::device::Device;
use crate::model::file::{File, FileType, NewFile};
use crate::model::folder::Folder;
use crate::model::media::Media;
use crate::model::task::{LinkType, Task};
use crate::mrl;
use crate::notifier::{Change, Entity, Notifier};

/// Cooperative interruption: long loops poll this between folders and
/// before committing a file change.
#[derive(Clone)]
pub struct InterruptProbe {
    token: CancellationToken,
}

impl InterruptProbe {
    pub fn new(token: CancellationToken) -> InterruptProbe {
        InterruptProbe { token }
    }

    pub fn interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    fn check(&self) -> Result<()> {
        if self.interrupted() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}

pub struct FsDiscoverer {
    pool: SqlitePool,
    fs: Arc<FsHolder>,
    notifier: Notifier,
}

struct StackEntry {
    fs_dir: Arc<dyn FsDirectory>,
    db_folder: Option<Folder>,
    parent: Option<Folder>,
}

impl FsDiscoverer {
    pub fn new(pool: SqlitePool, fs: Arc<FsHolder>, notifier: Notifier) -> FsDiscoverer {
        FsDiscoverer {
            pool,
            fs,
            notifier,
        }
    }

    /// Reconcile one root folder. Absent removable devices make this a
    /// no-op; a device vanishing mid-crawl unwinds with `DeviceRemoved`
    /// after the device list was re-probed.
    pub async fn reload_root(&self, root: &Folder, probe: &InterruptProbe) -> Result<()> {
        let device = Device::by_id(&self.pool, root.device_id)
            .await?
            .ok_or(Error::DeviceRemoved)?;
        if !device.is_present {
            if device.is_removable {
                tracing::debug!("Skipping root on absent removable device: {}", root.mrl);
                return Ok(());
            }
            return Err(Error::DeviceRemoved);
        }

        let absolute = self.absolute_root_mrl(root, &device).await?;
        let factory = self
            .fs
            .factory_for_mrl(&absolute)
            .ok_or_else(|| Error::UnhandledScheme(absolute.clone()))?;

        let fs_dir = match factory.create_directory(&absolute).await {
            Ok(dir) => dir,
            Err(Error::DeviceRemoved) => {
                Device::set_present(&self.pool, device.id, false).await?;
                return Err(Error::DeviceRemoved);
            }
            Err(e) => {
                // An I/O error may hide a device removal: re-probe and
                // decide.
                factory.refresh_devices().await;
                match factory.create_device_from_mrl(&absolute).await {
                    Some(fs_device) if !fs_device.is_present() => {
                        Device::set_present(&self.pool, device.id, false).await?;
                        return Err(Error::DeviceRemoved);
                    }
                    None => {
                        Device::set_present(&self.pool, device.id, false).await?;
                        return Err(Error::DeviceRemoved);
                    }
                    Some(_) => return Err(e),
                }
            }
        };

        let mut stack = vec![StackEntry {
            fs_dir,
            db_folder: Some(root.clone()),
            parent: None,
        }];
        while let Some(entry) = stack.pop() {
            probe.check()?;
            self.process_folder(&device, entry, &mut stack, probe).await?;
        }
        Ok(())
    }

    async fn absolute_root_mrl(&self, root: &Folder, device: &Device) -> Result<String> {
        if !device.is_removable {
            return Ok(root.mrl.clone());
        }
        let factory = self
            .fs
            .factories()
            .iter()
            .find(|f| f.scheme() == device.scheme)
            .cloned()
            .ok_or_else(|| Error::UnhandledScheme(device.scheme.clone()))?;
        let fs_device = factory
            .create_device(&device.uuid)
            .await
            .filter(|d| d.is_present())
            .ok_or(Error::DeviceRemoved)?;
        Ok(fs_device.absolute_mrl(&root.mrl))
    }

    /// Stored (possibly device-relative) mrl for a folder.
    fn stored_folder_mrl(device: &Device, fs_device: Option<&Arc<dyn FsDevice>>, m: &str) -> String {
        if device.is_removable {
            if let Some(fs_device) = fs_device {
                return fs_device.relative_mrl(m);
            }
        }
        m.to_string()
    }

    async fn process_folder(
        &self,
        device: &Device,
        entry: StackEntry,
        stack: &mut Vec<StackEntry>,
        probe: &InterruptProbe,
    ) -> Result<()> {
        let fs_dir = entry.fs_dir;
        let fs_files = fs_dir.files().await?;
        let fs_device = fs_dir.device().await;

        // A `.nomedia` marker wipes the whole subtree from the store.
        if fs_files.iter().any(|f| f.name() == ".nomedia") {
            if let Some(db_folder) = entry.db_folder {
                tracing::info!("Found .nomedia in {}, removing subtree", fs_dir.mrl());
                Folder::remove(&self.pool, db_folder.id).await?;
                let removed = Folder::cleanup_orphaned_media(&self.pool).await?;
                if removed > 0 {
                    tracing::debug!("{} media removed with {}", removed, fs_dir.mrl());
                }
                self.notifier
                    .notify(Entity::Folder, Change::Removed, db_folder.id);
            }
            return Ok(());
        }

        let db_folder = match entry.db_folder {
            Some(folder) => folder,
            None => {
                let stored =
                    Self::stored_folder_mrl(device, fs_device.as_ref(), &fs_dir.mrl());
                let folder = Folder::create(
                    &self.pool,
                    &stored,
                    &fs_dir.name(),
                    device.id,
                    entry.parent.as_ref().map(|p| p.id),
                    0,
                    false,
                )
                .await?;
                self.notifier.notify(Entity::Folder, Change::Added, folder.id);
                folder
            }
        };

        self.diff_subfolders(&fs_dir, &db_folder, stack).await?;
        self.diff_files(device, fs_device.as_ref(), &fs_files, &db_folder, probe)
            .await?;
        Ok(())
    }

    async fn diff_subfolders(
        &self,
        fs_dir: &Arc<dyn FsDirectory>,
        db_folder: &Folder,
        stack: &mut Vec<StackEntry>,
    ) -> Result<()> {
        let fs_subdirs = fs_dir.dirs().await?;
        let mut db_children: HashMap<String, Folder> = Folder::children(&self.pool, db_folder.id)
            .await?
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();

        for fs_subdir in fs_subdirs {
            match db_children.remove(&fs_subdir.name()) {
                Some(known) => stack.push(StackEntry {
                    fs_dir: fs_subdir,
                    db_folder: Some(known),
                    parent: Some(db_folder.clone()),
                }),
                None => stack.push(StackEntry {
                    fs_dir: fs_subdir,
                    db_folder: None,
                    parent: Some(db_folder.clone()),
                }),
            }
        }
        // Whatever remains vanished from the filesystem.
        for (_, orphan) in db_children {
            tracing::info!("Folder {} disappeared, removing from store", orphan.mrl);
            Folder::remove(&self.pool, orphan.id).await?;
            Folder::cleanup_orphaned_media(&self.pool).await?;
            self.notifier.notify(Entity::Folder, Change::Removed, orphan.id);
        }
        Ok(())
    }

    async fn diff_files(
        &self,
        device: &Device,
        fs_device: Option<&Arc<dyn FsDevice>>,
        fs_files: &[Arc<dyn FsFile>],
        db_folder: &Folder,
        probe: &InterruptProbe,
    ) -> Result<()> {
        let mut db_files: HashMap<String, File> = File::in_folder(&self.pool, db_folder.id)
            .await?
            .into_iter()
            .map(|f| {
                let name = mrl::decode(mrl::file_name(&f.mrl))
                    .unwrap_or_else(|_| mrl::file_name(&f.mrl).to_string());
                (name, f)
            })
            .collect();

        // Stems of media files in this folder, to spot companion files
        // (subtitles, soundtracks) that belong to a media rather than
        // owning one.
        let media_stems: Vec<String> = fs_files
            .iter()
            .filter(|f| f.extension().is_some_and(|e| ext::is_media(&e)))
            .map(|f| stem(&f.name()).to_lowercase())
            .collect();
        let video_stems: Vec<String> = fs_files
            .iter()
            .filter(|f| {
                f.extension()
                    .is_some_and(|e| ext::is_media(&e) && !ext::is_audio(&e))
            })
            .map(|f| stem(&f.name()).to_lowercase())
            .collect();

        for fs_file in fs_files {
            probe.check()?;
            let name = fs_file.name();
            if name.starts_with('.') {
                continue;
            }
            match db_files.remove(&name) {
                None => {
                    self.handle_new_file(
                        device,
                        fs_device,
                        fs_file,
                        &media_stems,
                        &video_stems,
                        db_folder,
                    )
                    .await?;
                }
                Some(known) => {
                    if known.last_modified != fs_file.last_modified() {
                        // The task carries the absolute mrl: stored file
                        // mrls are device-relative on removable media.
                        if Task::create_refresh(&self.pool, known.id, &fs_file.mrl())
                            .await?
                            .is_some()
                        {
                            tracing::debug!("Scheduled refresh for {}", known.mrl);
                        }
                    } else if known.size != fs_file.size() && fs_file.size() > u32::MAX as i64 {
                        // Sizes of files over 4GB were truncated before
                        // 64-bit support; fix them in place without a
                        // re-parse.
                        File::update_size(&self.pool, known.id, fs_file.size()).await?;
                    }
                }
            }
        }

        // Files only present in the store are gone from disk.
        for (_, orphan) in db_files {
            probe.check()?;
            let media_id = orphan.media_id;
            let was_main = orphan.file_type() == FileType::Main;
            File::remove(&self.pool, orphan.id).await?;
            if let (Some(media_id), true) = (media_id, was_main) {
                if Media::remove_if_orphaned(&self.pool, media_id).await? {
                    self.notifier.notify(Entity::Media, Change::Removed, media_id);
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_new_file(
        &self,
        device: &Device,
        fs_device: Option<&Arc<dyn FsDevice>>,
        fs_file: &Arc<dyn FsFile>,
        media_stems: &[String],
        video_stems: &[String],
        db_folder: &Folder,
    ) -> Result<()> {
        let file_mrl = fs_file.mrl();
        let extension = fs_file.extension();
        let file_type = FileType::from_extension(extension.as_deref());

        // A subtitle sharing a media file's stem (or extending it, as in
        // `movie.eng.srt`) is a companion of that media, not a media of
        // its own. Likewise an audio file named after a video file is its
        // soundtrack.
        let lowered_stem = stem(&fs_file.name()).to_lowercase();
        let linked_type = match file_type {
            FileType::Subtitle => media_stems
                .iter()
                .any(|m| lowered_stem.starts_with(m.as_str()))
                .then_some(FileType::Subtitle),
            FileType::Main
                if extension.as_deref().is_some_and(ext::is_audio)
                    && video_stems.contains(&lowered_stem) =>
            {
                Some(FileType::Soundtrack)
            }
            _ => None,
        };

        match (file_type, linked_type) {
            (_, Some(companion)) => {
                if Task::create_link(
                    &self.pool,
                    LinkType::Media,
                    0,
                    companion as i64,
                    &file_mrl,
                    Some(db_folder.id),
                )
                .await?
                .is_some()
                {
                    tracing::debug!("Scheduled companion link for {}", file_mrl);
                }
            }
            (FileType::Main | FileType::Playlist | FileType::Subscription, None) => {
                if Task::create(&self.pool, &file_mrl, file_type, db_folder.id)
                    .await?
                    .is_some()
                {
                    tracing::debug!("Scheduled creation task for {}", file_mrl);
                }
            }
            (other, None) => {
                // Not a media: keep a bare row so the next scan does not
                // re-examine it.
                let stored = if device.is_removable {
                    match fs_device {
                        Some(fs_device) => fs_device.relative_mrl(&file_mrl),
                        None => file_mrl.clone(),
                    }
                } else {
                    file_mrl.clone()
                };
                let new_file = NewFile {
                    folder_id: Some(db_folder.id),
                    mrl: &stored,
                    file_type: other,
                    last_modified: fs_file.last_modified(),
                    size: fs_file.size(),
                    is_removable: device.is_removable,
                    is_network: device.is_network,
                };
                File::create_unparsed(&self.pool, &new_file).await?;
            }
        }
        Ok(())
    }
}

fn stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((s, _)) if !s.is_empty() => s,
        _ => name,
    }
}
