//! The unit of work flowing through the parser services: a task joined
//! with its filesystem and store context, progressively enriched by each
//! service (meta strings and tracks by the extractor, entities by the
//! analyzer).

use std::collections::HashMap;

use crate::model::file::{File, FileType};
use crate::model::folder::Folder;
use crate::model::media::Media;
use crate::model::task::Task;

/// Well-known metadata keys produced by the extraction step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metadata {
    Title,
    Album,
    AlbumArtist,
    Artist,
    Genre,
    Date,
    TrackNumber,
    TrackTotal,
    DiscNumber,
    DiscTotal,
    ShowName,
    Episode,
    Season,
    Description,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    Audio,
    Video,
    Subtitle,
}

/// One track descriptor as reported by the probe.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub track_type: TrackType,
    pub codec: Option<String>,
    pub bitrate: i64,
    pub samplerate: i64,
    pub nb_channels: i64,
    pub width: i64,
    pub height: i64,
    pub fps_num: i64,
    pub fps_den: i64,
    pub sar_num: i64,
    pub sar_den: i64,
    pub language: Option<String>,
    pub description: Option<String>,
    pub encoding: Option<String>,
}

impl TrackInfo {
    pub fn new(track_type: TrackType) -> TrackInfo {
        TrackInfo {
            track_type,
            codec: None,
            bitrate: 0,
            samplerate: 0,
            nb_channels: 0,
            width: 0,
            height: 0,
            fps_num: 0,
            fps_den: 1,
            sar_num: 1,
            sar_den: 1,
            language: None,
            description: None,
            encoding: None,
        }
    }
}

/// An entry of a playlist or subscription feed, scheduled as a Link task.
#[derive(Debug, Clone)]
pub struct SubItem {
    pub mrl: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub release_date: Option<i64>,
    pub index: i64,
}

#[derive(Debug, Clone)]
pub struct Item {
    pub task: Task,
    /// Absolute mrl of the input.
    pub mrl: String,
    pub file_type: FileType,
    pub file: Option<File>,
    pub media: Option<Media>,
    pub parent_folder: Option<Folder>,
    /// Filesystem identity captured at discovery time.
    pub fs_last_modified: i64,
    pub fs_size: i64,

    // Filled by the extraction step.
    pub meta: HashMap<Metadata, String>,
    pub tracks: Vec<TrackInfo>,
    pub sub_items: Vec<SubItem>,
    /// mrls of artwork exported by the probe, first entry preferred.
    pub embedded_thumbnails: Vec<String>,
    /// Duration in milliseconds.
    pub duration: Option<i64>,
}

impl Item {
    pub fn new(task: Task, mrl: String, file_type: FileType) -> Item {
        Item {
            task,
            mrl,
            file_type,
            file: None,
            media: None,
            parent_folder: None,
            fs_last_modified: 0,
            fs_size: 0,
            meta: HashMap::new(),
            tracks: Vec::new(),
            sub_items: Vec::new(),
            embedded_thumbnails: Vec::new(),
            duration: None,
        }
    }

    pub fn meta(&self, key: Metadata) -> Option<&str> {
        self.meta.get(&key).map(String::as_str)
    }

    /// Numeric interpretation of a meta value; tolerates `3/12` forms by
    /// keeping the numerator.
    pub fn meta_i64(&self, key: Metadata) -> Option<i64> {
        let raw = self.meta(key)?;
        let head = raw.split('/').next().unwrap_or(raw).trim();
        head.parse().ok()
    }

    pub fn has_video_track(&self) -> bool {
        self.tracks.iter().any(|t| t.track_type == TrackType::Video)
    }

    pub fn has_audio_track(&self) -> bool {
        self.tracks.iter().any(|t| t.track_type == TrackType::Audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::{Task, TaskType};

    fn dummy_task() -> Task {
        Task {
            id: 1,
            task_type: TaskType::Creation as i64,
            step: 0,
            retry_count: 0,
            mrl: Some("file:///a.mp3".to_string()),
            file_type: FileType::Main as i64,
            file_id: None,
            parent_folder_id: None,
            is_completed: false,
            link_to_type: 0,
            link_to_id: 0,
            link_extra: 0,
        }
    }

    #[test]
    fn test_meta_i64_tolerates_slash_forms() {
        let mut item = Item::new(dummy_task(), "file:///a.mp3".into(), FileType::Main);
        item.meta.insert(Metadata::TrackNumber, "3/12".to_string());
        item.meta.insert(Metadata::DiscNumber, " 2 ".to_string());
        item.meta.insert(Metadata::Date, "199x".to_string());
        assert_eq!(item.meta_i64(Metadata::TrackNumber), Some(3));
        assert_eq!(item.meta_i64(Metadata::DiscNumber), Some(2));
        assert_eq!(item.meta_i64(Metadata::Date), None);
    }
}
