// Media probing via ffprobe, the default metadata extractor backend.
// The decoder is an external collaborator: replace it through
// `InitOptions::probe`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::parser::item::{Metadata, TrackInfo, TrackType};

/// Everything a probe run can report about one input file.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub meta: HashMap<Metadata, String>,
    pub tracks: Vec<TrackInfo>,
    /// Duration in milliseconds.
    pub duration: Option<i64>,
    /// mrls of embedded artwork exported next to the cache, first entry
    /// preferred.
    pub artwork: Vec<String>,
}

/// The external media decoder used to probe containers. Blocking; the
/// extraction service drives it through `spawn_blocking` under a wall
/// clock timeout.
pub trait MediaProbe: Send + Sync {
    /// Probe `path`, exporting embedded artwork (if any) under
    /// `artwork_dir`.
    fn probe(&self, path: &Path, artwork_dir: &Path) -> Result<ProbeResult>;
}

/// ffprobe JSON output structure
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    channels: Option<i64>,
    sample_rate: Option<String>,
    bit_rate: Option<String>,
    avg_frame_rate: Option<String>,
    sample_aspect_ratio: Option<String>,
    disposition: Option<FfprobeDisposition>,
    tags: Option<FfprobeStreamTags>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStreamTags {
    language: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeDisposition {
    attached_pic: Option<i64>,
}

/// Find ffprobe - checks FFPROBE_PATH env var, then common locations
fn find_ffprobe() -> String {
    if let Ok(path) = std::env::var("FFPROBE_PATH") {
        return path;
    }
    for path in ["/usr/bin/ffprobe", "/usr/local/bin/ffprobe", "/opt/homebrew/bin/ffprobe"] {
        if Path::new(path).exists() {
            return path.to_string();
        }
    }
    "ffprobe".to_string()
}

fn find_ffmpeg() -> String {
    if let Ok(path) = std::env::var("FFMPEG_PATH") {
        return path;
    }
    for path in ["/usr/bin/ffmpeg", "/usr/local/bin/ffmpeg", "/opt/homebrew/bin/ffmpeg"] {
        if Path::new(path).exists() {
            return path.to_string();
        }
    }
    "ffmpeg".to_string()
}

pub struct FfprobeProbe {
    ffprobe: String,
    ffmpeg: String,
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl FfprobeProbe {
    pub fn new() -> FfprobeProbe {
        FfprobeProbe {
            ffprobe: find_ffprobe(),
            ffmpeg: find_ffmpeg(),
        }
    }

    fn export_artwork(&self, path: &Path, artwork_dir: &Path) -> Option<PathBuf> {
        let stem = path.file_stem()?.to_string_lossy().to_string();
        let output = artwork_dir.join(format!("{stem}.embedded.jpg"));
        if std::fs::create_dir_all(artwork_dir).is_err() {
            return None;
        }
        let status = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(path)
            .args(["-map", "0:v", "-frames:v", "1"])
            .arg(&output)
            .status()
            .ok()?;
        if status.success() && output.exists() {
            Some(output)
        } else {
            None
        }
    }
}

impl MediaProbe for FfprobeProbe {
    fn probe(&self, path: &Path, artwork_dir: &Path) -> Result<ProbeResult> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .with_context(|| {
                format!(
                    "Failed to run ffprobe at '{}'. Is ffmpeg installed?",
                    self.ffprobe
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffprobe failed: {}", stderr);
        }

        let json_output = String::from_utf8_lossy(&output.stdout);
        let probe: FfprobeOutput =
            serde_json::from_str(&json_output).context("Failed to parse ffprobe output")?;

        let mut result = ProbeResult::default();
        let mut has_attached_pic = false;

        if let Some(format) = probe.format {
            if let Some(duration) = format.duration.as_deref().and_then(|d| d.parse::<f64>().ok())
            {
                result.duration = Some((duration * 1000.0) as i64);
            }
            if let Some(tags) = format.tags {
                result.meta = map_format_tags(&tags);
            }
        }

        for stream in probe.streams.unwrap_or_default() {
            let attached_pic = stream
                .disposition
                .as_ref()
                .and_then(|d| d.attached_pic)
                .unwrap_or(0)
                == 1;
            match stream.codec_type.as_deref() {
                Some("video") if !attached_pic => {
                    let mut track = TrackInfo::new(TrackType::Video);
                    track.codec = stream.codec_name;
                    track.width = stream.width.unwrap_or(0);
                    track.height = stream.height.unwrap_or(0);
                    track.bitrate = stream
                        .bit_rate
                        .as_deref()
                        .and_then(|b| b.parse().ok())
                        .unwrap_or(0);
                    if let Some((num, den)) = parse_ratio(stream.avg_frame_rate.as_deref()) {
                        track.fps_num = num;
                        track.fps_den = den;
                    }
                    if let Some((num, den)) = parse_ratio(stream.sample_aspect_ratio.as_deref()) {
                        track.sar_num = num;
                        track.sar_den = den;
                    }
                    track.language = stream.tags.as_ref().and_then(|t| t.language.clone());
                    track.description = stream.tags.as_ref().and_then(|t| t.title.clone());
                    result.tracks.push(track);
                }
                Some("video") => has_attached_pic = true,
                Some("audio") => {
                    let mut track = TrackInfo::new(TrackType::Audio);
                    track.codec = stream.codec_name;
                    track.nb_channels = stream.channels.unwrap_or(0);
                    track.samplerate = stream
                        .sample_rate
                        .as_deref()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    track.bitrate = stream
                        .bit_rate
                        .as_deref()
                        .and_then(|b| b.parse().ok())
                        .unwrap_or(0);
                    track.language = stream.tags.as_ref().and_then(|t| t.language.clone());
                    track.description = stream.tags.as_ref().and_then(|t| t.title.clone());
                    result.tracks.push(track);
                }
                Some("subtitle") => {
                    let mut track = TrackInfo::new(TrackType::Subtitle);
                    track.codec = stream.codec_name;
                    track.language = stream.tags.as_ref().and_then(|t| t.language.clone());
                    track.description = stream.tags.as_ref().and_then(|t| t.title.clone());
                    result.tracks.push(track);
                }
                _ => {}
            }
        }

        if has_attached_pic {
            if let Some(artwork) = self.export_artwork(path, artwork_dir) {
                result.artwork.push(crate::mrl::from_local_path(&artwork));
            }
        }

        Ok(result)
    }
}

/// Map ffprobe format tags (lowercased by mux convention, but not always)
/// onto the metadata keys.
fn map_format_tags(tags: &HashMap<String, String>) -> HashMap<Metadata, String> {
    let mut meta = HashMap::new();
    for (key, value) in tags {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let mapped = match key.to_lowercase().as_str() {
            "title" => Some(Metadata::Title),
            "album" => Some(Metadata::Album),
            "album_artist" | "albumartist" => Some(Metadata::AlbumArtist),
            "artist" => Some(Metadata::Artist),
            "genre" => Some(Metadata::Genre),
            "date" | "year" => Some(Metadata::Date),
            "track" => Some(Metadata::TrackNumber),
            "tracktotal" | "totaltracks" => Some(Metadata::TrackTotal),
            "disc" => Some(Metadata::DiscNumber),
            "disctotal" | "totaldiscs" => Some(Metadata::DiscTotal),
            "show" | "series" => Some(Metadata::ShowName),
            "episode_id" | "episode_sort" => Some(Metadata::Episode),
            "season_number" => Some(Metadata::Season),
            "comment" | "description" => Some(Metadata::Description),
            _ => None,
        };
        if let Some(mapped) = mapped {
            meta.insert(mapped, value.to_string());
        }
    }
    meta
}

fn parse_ratio(raw: Option<&str>) -> Option<(i64, i64)> {
    let raw = raw?;
    let (num, den) = raw.split_once([':', '/'])?;
    let num = num.trim().parse().ok()?;
    let den: i64 = den.trim().parse().ok()?;
    if den == 0 {
        return None;
    }
    Some((num, den))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_format_tags() {
        let mut tags = HashMap::new();
        tags.insert("TITLE".to_string(), "Song".to_string());
        tags.insert("album_artist".to_string(), "Band".to_string());
        tags.insert("track".to_string(), "3/12".to_string());
        tags.insert("ignored".to_string(), "x".to_string());
        tags.insert("genre".to_string(), "  ".to_string());
        let meta = map_format_tags(&tags);
        assert_eq!(meta.get(&Metadata::Title).map(String::as_str), Some("Song"));
        assert_eq!(
            meta.get(&Metadata::AlbumArtist).map(String::as_str),
            Some("Band")
        );
        assert_eq!(
            meta.get(&Metadata::TrackNumber).map(String::as_str),
            Some("3/12")
        );
        assert!(!meta.contains_key(&Metadata::Genre));
        assert_eq!(meta.len(), 3);
    }

    #[test]
    fn test_parse_ratio() {
        assert_eq!(parse_ratio(Some("24000/1001")), Some((24000, 1001)));
        assert_eq!(parse_ratio(Some("16:9")), Some((16, 9)));
        assert_eq!(parse_ratio(Some("0/0")), None);
        assert_eq!(parse_ratio(None), None);
        assert_eq!(parse_ratio(Some("nonsense")), None);
    }
}
