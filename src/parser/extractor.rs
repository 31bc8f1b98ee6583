//! Metadata extraction service: probes media containers through the
//! injected decoder and parses playlist/subscription files into sub-item
//! lists for the later services.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ext;
use crate::model::file::FileType;
use crate::model::task::{Step, TaskType};
use crate::mrl;
use crate::parser::item::{Item, Metadata, SubItem};
use crate::parser::{ParserCtx, ParserService, Status};

pub struct MetadataExtractionService {
    ctx: Arc<ParserCtx>,
}

impl MetadataExtractionService {
    pub fn new(ctx: Arc<ParserCtx>) -> MetadataExtractionService {
        MetadataExtractionService { ctx }
    }

    async fn probe_media(&self, item: &mut Item) -> Status {
        let Ok(path) = mrl::to_local_path(&item.mrl) else {
            // Network media cannot be probed through the local decoder;
            // the analyzer falls back to extension heuristics.
            return Status::Success;
        };
        let probe = self.ctx.probe.clone();
        let artwork_dir = self.ctx.artwork_dir();
        let handle =
            tokio::task::spawn_blocking(move || probe.probe(&path, &artwork_dir));
        let joined = tokio::time::timeout(self.ctx.probe_timeout, handle).await;
        match joined {
            Err(_) => {
                tracing::warn!("Probe timed out for {}", item.mrl);
                Status::Fatal
            }
            Ok(Err(e)) => {
                tracing::error!("Probe task panicked for {}: {}", item.mrl, e);
                Status::Fatal
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!("Probe failed for {}: {}", item.mrl, e);
                Status::Fatal
            }
            Ok(Ok(Ok(result))) => {
                item.meta.extend(result.meta);
                item.tracks = result.tracks;
                item.duration = result.duration;
                item.embedded_thumbnails = result.artwork;
                Status::Success
            }
        }
    }

    async fn parse_playlist(&self, item: &mut Item) -> Status {
        let Ok(path) = mrl::to_local_path(&item.mrl) else {
            return Status::Fatal;
        };
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("Cannot read playlist {}: {}", item.mrl, e);
                return Status::Fatal;
            }
        };
        let base = mrl::directory(&item.mrl).to_string();
        let (name, entries) = match mrl::extension(&item.mrl).as_deref() {
            Some("pls") => parse_pls(&contents, &base),
            _ => parse_m3u(&contents, &base),
        };
        if let Some(name) = name {
            item.meta.insert(Metadata::Title, name);
        }
        item.sub_items = entries;
        Status::Success
    }

    async fn parse_subscription(&self, item: &mut Item) -> Status {
        let Ok(path) = mrl::to_local_path(&item.mrl) else {
            return Status::Fatal;
        };
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("Cannot read subscription feed {}: {}", item.mrl, e);
                return Status::Fatal;
            }
        };
        match parse_rss(&contents) {
            Ok((title, entries)) => {
                if let Some(title) = title {
                    item.meta.insert(Metadata::Title, title);
                }
                item.sub_items = entries;
                Status::Success
            }
            Err(e) => {
                tracing::warn!("Malformed feed {}: {}", item.mrl, e);
                Status::Discarded
            }
        }
    }
}

#[async_trait]
impl ParserService for MetadataExtractionService {
    fn name(&self) -> &'static str {
        "metadata-extraction"
    }

    fn targeted_step(&self) -> Step {
        Step::MetadataExtraction
    }

    fn priority(&self) -> u8 {
        100
    }

    async fn run(&self, item: &mut Item) -> Status {
        if item.task.task_type() == TaskType::Restore {
            // Restore inputs are m3u backups regardless of the task's
            // recorded file type.
            return self.parse_playlist(item).await;
        }
        match item.file_type {
            FileType::Playlist => self.parse_playlist(item).await,
            FileType::Subscription => self.parse_subscription(item).await,
            FileType::Subtitle | FileType::Soundtrack => Status::Success,
            _ => self.probe_media(item).await,
        }
    }
}

/// Resolve a playlist entry against the playlist's directory.
fn resolve_entry(base: &str, entry: &str) -> String {
    let entry = entry.trim();
    if entry.contains("://") {
        return entry.to_string();
    }
    if let Some(absolute) = entry.strip_prefix('/') {
        return format!("file:///{}", mrl::encode(absolute));
    }
    let entry = entry.strip_prefix("./").unwrap_or(entry);
    format!("{}{}", base, mrl::encode(entry))
}

/// Parse an m3u/m3u8 document into `(playlist name, entries)`.
fn parse_m3u(contents: &str, base: &str) -> (Option<String>, Vec<SubItem>) {
    let mut name = None;
    let mut pending_title: Option<String> = None;
    let mut entries = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(playlist_name) = line.strip_prefix("#PLAYLIST:") {
            name = Some(playlist_name.trim().to_string());
            continue;
        }
        if let Some(extinf) = line.strip_prefix("#EXTINF:") {
            pending_title = extinf.split_once(',').map(|(_, t)| t.trim().to_string());
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        entries.push(SubItem {
            mrl: resolve_entry(base, line),
            title: pending_title.take(),
            description: None,
            release_date: None,
            index: entries.len() as i64,
        });
    }
    (name, entries)
}

/// Parse a pls document (`[playlist]`, `FileN=`, `TitleN=`).
fn parse_pls(contents: &str, base: &str) -> (Option<String>, Vec<SubItem>) {
    let mut files: Vec<(i64, String)> = Vec::new();
    let mut titles: Vec<(i64, String)> = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if let Some(index) = key.strip_prefix("File").and_then(|n| n.parse::<i64>().ok()) {
            files.push((index, value.to_string()));
        } else if let Some(index) = key.strip_prefix("Title").and_then(|n| n.parse::<i64>().ok())
        {
            titles.push((index, value.to_string()));
        }
    }
    files.sort_by_key(|(index, _)| *index);
    let entries = files
        .into_iter()
        .enumerate()
        .map(|(position, (index, file))| SubItem {
            mrl: resolve_entry(base, &file),
            title: titles
                .iter()
                .find(|(title_index, _)| *title_index == index)
                .map(|(_, t)| t.clone()),
            description: None,
            release_date: None,
            index: position as i64,
        })
        .collect();
    (None, entries)
}

/// Parse an RSS feed into `(channel title, items)`; each item needs an
/// enclosure url to become a sub-item.
fn parse_rss(contents: &str) -> anyhow::Result<(Option<String>, Vec<SubItem>)> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(contents);
    reader.trim_text(true);

    let mut channel_title = None;
    let mut entries: Vec<SubItem> = Vec::new();
    let mut in_item = false;
    let mut current_tag: Option<String> = None;
    let mut item_title: Option<String> = None;
    let mut item_description: Option<String> = None;
    let mut item_date: Option<i64> = None;
    let mut item_url: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(tag) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).to_string();
                if name == "item" {
                    in_item = true;
                    item_title = None;
                    item_description = None;
                    item_date = None;
                    item_url = None;
                }
                current_tag = Some(name);
            }
            Event::Empty(tag) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).to_string();
                if in_item && name == "enclosure" {
                    for attr in tag.attributes().flatten() {
                        if attr.key.as_ref() == b"url" {
                            item_url =
                                Some(String::from_utf8_lossy(&attr.value).to_string());
                        }
                    }
                }
            }
            Event::Text(text) => {
                let value = text.unescape()?.trim().to_string();
                if value.is_empty() {
                    continue;
                }
                match (in_item, current_tag.as_deref()) {
                    (false, Some("title")) if channel_title.is_none() => {
                        channel_title = Some(value);
                    }
                    (true, Some("title")) => item_title = Some(value),
                    (true, Some("description")) => item_description = Some(value),
                    (true, Some("pubDate")) => {
                        item_date = chrono::DateTime::parse_from_rfc2822(&value)
                            .map(|d| d.timestamp())
                            .ok();
                    }
                    _ => {}
                }
            }
            Event::End(tag) => {
                if tag.name().as_ref() == b"item" {
                    in_item = false;
                    if let Some(url) = item_url.take() {
                        entries.push(SubItem {
                            mrl: url,
                            title: item_title.take(),
                            description: item_description.take(),
                            release_date: item_date.take(),
                            index: entries.len() as i64,
                        });
                    }
                }
                current_tag = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok((channel_title, entries))
}

/// True when a playlist entry points at something the library can ingest.
pub fn is_ingestible(target: &str) -> bool {
    mrl::extension(target).map_or(false, |e| ext::is_media(&e) || ext::is_playlist(&e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_m3u_relative_entries() {
        let contents = "#EXTM3U\n#PLAYLIST:road trip\n#EXTINF:123,First Song\n./a.mp3\nsub/b.mp3\n/abs/c.mp3\nhttp://host/d.mp3\n";
        let (name, entries) = parse_m3u(contents, "file:///root/");
        assert_eq!(name.as_deref(), Some("road trip"));
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].mrl, "file:///root/a.mp3");
        assert_eq!(entries[0].title.as_deref(), Some("First Song"));
        assert_eq!(entries[1].mrl, "file:///root/sub/b.mp3");
        assert_eq!(entries[2].mrl, "file:///abs/c.mp3");
        assert_eq!(entries[3].mrl, "http://host/d.mp3");
        assert_eq!(entries[3].index, 3);
        assert!(entries[1].title.is_none());
    }

    #[test]
    fn test_parse_m3u_encodes_spaces() {
        let (_, entries) = parse_m3u("a b.mp3\n", "file:///root/");
        assert_eq!(entries[0].mrl, "file:///root/a%20b.mp3");
    }

    #[test]
    fn test_parse_pls() {
        let contents = "[playlist]\nFile1=./x.mp3\nTitle1=X\nFile2=http://host/y.mp3\nNumberOfEntries=2\n";
        let (_, entries) = parse_pls(contents, "file:///root/");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mrl, "file:///root/x.mp3");
        assert_eq!(entries[0].title.as_deref(), Some("X"));
        assert_eq!(entries[1].mrl, "http://host/y.mp3");
    }

    #[test]
    fn test_parse_rss() {
        let feed = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
<title>My Podcast</title>
<item>
  <title>Episode 1</title>
  <description>The first one</description>
  <pubDate>Tue, 10 Jun 2008 04:00:00 GMT</pubDate>
  <enclosure url="https://cdn/ep1.mp3" length="123" type="audio/mpeg"/>
</item>
<item>
  <title>No enclosure</title>
</item>
</channel></rss>"#;
        let (title, entries) = parse_rss(feed).unwrap();
        assert_eq!(title.as_deref(), Some("My Podcast"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mrl, "https://cdn/ep1.mp3");
        assert_eq!(entries[0].title.as_deref(), Some("Episode 1"));
        assert!(entries[0].release_date.is_some());
    }
}
