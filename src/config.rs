// Configuration module for mediadex
// Initialisation options plus the hard-coded supported extension tables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::fs::{DeviceLister, FileSystemFactory};
use crate::parser::probe::MediaProbe;
use crate::parser::ParserService;
use crate::thumbnailer::Thumbnailer;

const APP_NAME: &str = "mediadex";
const CONFIG_FILENAME: &str = "mediadex.toml";

/// Verbosity requested through the init options; mapped onto an `EnvFilter`
/// directive by [`crate::init_logging`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Verbose => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Options consumed by [`crate::MediaLibrary::new`].
#[derive(Clone)]
pub struct InitOptions {
    /// Absolute path of the database file.
    pub db_path: PathBuf,

    /// Base directory for the thumbnails/, playlists/ and cache/ subfolders
    /// and the `ml.lock` file.
    pub ml_folder_path: PathBuf,

    /// Whether to acquire `ml.lock`. Disabled by tests which run several
    /// engines over distinct temp folders in one process.
    pub lock_file: bool,

    pub log_level: LogLevel,

    /// Number of parser workers draining the task table.
    pub parser_workers: usize,

    /// Per-scheme device listers overriding the factory defaults.
    pub device_listers: HashMap<String, Arc<dyn DeviceLister>>,

    /// Extra filesystem factories, registered after the built-in local one.
    pub fs_factories: Vec<Arc<dyn FileSystemFactory>>,

    /// Application parser services; they must target the metadata
    /// extraction step and run ordered by priority.
    pub parser_services: Vec<Arc<dyn ParserService>>,

    /// Replacement for the default ffprobe-based metadata extractor.
    pub probe: Option<Arc<dyn MediaProbe>>,

    /// Replacement for the default ffmpeg-based thumbnailer.
    pub thumbnailer: Option<Arc<dyn Thumbnailer>>,

    /// Total on-disk budget for the subscription cache.
    pub cache_max_size: u64,

    /// How long a removable device may stay unseen before it is pruned,
    /// together with its cached mountpoints.
    pub device_ttl: Duration,

    /// Wall clock budget for one probe invocation.
    pub probe_timeout: Duration,
}

impl InitOptions {
    pub fn new(db_path: impl Into<PathBuf>, ml_folder_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ml_folder_path: ml_folder_path.into(),
            lock_file: true,
            log_level: LogLevel::Info,
            parser_workers: 2,
            device_listers: HashMap::new(),
            fs_factories: Vec::new(),
            parser_services: Vec::new(),
            probe: None,
            thumbnailer: None,
            cache_max_size: 2 * 1024 * 1024 * 1024,
            device_ttl: Duration::from_secs(3600 * 24 * 30 * 6),
            probe_timeout: Duration::from_secs(5),
        }
    }

    /// Build options from the user config file (if any) and environment.
    ///
    /// Priority (highest to lowest): environment variables, TOML config
    /// file, XDG defaults.
    pub fn load() -> Self {
        // Load .env overrides if present.
        dotenvy::dotenv().ok();

        let config_dir = std::env::var("MEDIADEX_CONFIG_DIR")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::config_dir().map(|d| d.join(APP_NAME)))
            .unwrap_or_else(|| PathBuf::from("."));
        let file = Self::load_config_file(&config_dir);

        let data_dir = std::env::var("MEDIADEX_DATA_DIR")
            .map(PathBuf::from)
            .ok()
            .or(file.paths.data_dir)
            .or_else(|| dirs::data_dir().map(|d| d.join(APP_NAME)))
            .unwrap_or_else(|| PathBuf::from("."));

        let mut opts = Self::new(data_dir.join("mediadex.db"), data_dir);
        if let Some(workers) = file.engine.parser_workers {
            opts.parser_workers = workers.max(1);
        }
        if let Some(size) = file.engine.cache_max_size {
            opts.cache_max_size = size;
        }
        if let Some(level) = file.engine.log_level {
            opts.log_level = level;
        }
        opts
    }

    fn load_config_file(config_dir: &std::path::Path) -> ConfigFile {
        let config_path = config_dir.join(CONFIG_FILENAME);
        if !config_path.exists() {
            tracing::debug!(
                "No config file found at {}, using defaults",
                config_path.display()
            );
            return ConfigFile::default();
        }
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse config file {}: {}. Using defaults.",
                        config_path.display(),
                        e
                    );
                    ConfigFile::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}. Using defaults.",
                    config_path.display(),
                    e
                );
                ConfigFile::default()
            }
        }
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.db_path.display())
    }
}

impl std::fmt::Debug for InitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitOptions")
            .field("db_path", &self.db_path)
            .field("ml_folder_path", &self.ml_folder_path)
            .field("lock_file", &self.lock_file)
            .field("log_level", &self.log_level)
            .field("parser_workers", &self.parser_workers)
            .field("fs_factories", &self.fs_factories.len())
            .field("parser_services", &self.parser_services.len())
            .field("cache_max_size", &self.cache_max_size)
            .finish()
    }
}

/// TOML configuration file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    paths: PathsConfig,
    engine: EngineConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct EngineConfig {
    parser_workers: Option<usize>,
    cache_max_size: Option<u64>,
    log_level: Option<LogLevel>,
}

/// Supported extensions, case-folded and alphabetically sorted so that
/// membership is a binary search.
pub mod ext {
    pub const MEDIA: &[&str] = &[
        "3g2", "3gp", "aac", "ac3", "aif", "aiff", "alac", "amr", "ape", "asf", "avi", "divx",
        "flac", "flv", "m2ts", "m4a", "m4v", "mka", "mkv", "mov", "mp2", "mp3", "mp4", "mpc",
        "mpeg", "mpg", "mts", "oga", "ogg", "ogm", "ogv", "opus", "ps", "rm", "rmvb", "spx", "ts",
        "vob", "wav", "webm", "wma", "wmv", "wv", "xvid",
    ];

    pub const PLAYLIST: &[&str] = &["asx", "b4s", "m3u", "m3u8", "pls", "wpl", "xspf"];

    pub const SUBSCRIPTION: &[&str] = &["rss", "xml"];

    pub const SUBTITLES: &[&str] = &[
        "ass", "idx", "smi", "srt", "ssa", "sub", "utf", "utf-8", "utf8", "vtt",
    ];

    /// Audio-only extensions, used to pick a media type when the probe did
    /// not report any track.
    pub const AUDIO: &[&str] = &[
        "aac", "ac3", "aif", "aiff", "alac", "amr", "ape", "flac", "m4a", "mka", "mp2", "mp3",
        "mpc", "oga", "ogg", "opus", "spx", "wav", "wma", "wv",
    ];

    fn contains(table: &[&str], ext: &str) -> bool {
        let lowered = ext.to_lowercase();
        table.binary_search(&lowered.as_str()).is_ok()
    }

    pub fn is_media(ext: &str) -> bool {
        contains(MEDIA, ext)
    }

    pub fn is_playlist(ext: &str) -> bool {
        contains(PLAYLIST, ext)
    }

    pub fn is_subscription(ext: &str) -> bool {
        contains(SUBSCRIPTION, ext)
    }

    pub fn is_subtitle(ext: &str) -> bool {
        contains(SUBTITLES, ext)
    }

    pub fn is_audio(ext: &str) -> bool {
        contains(AUDIO, ext)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_tables_sorted() {
            for table in [MEDIA, PLAYLIST, SUBSCRIPTION, SUBTITLES, AUDIO] {
                let mut sorted = table.to_vec();
                sorted.sort_unstable();
                assert_eq!(sorted, table);
            }
        }

        #[test]
        fn test_membership() {
            assert!(is_media("mkv"));
            assert!(is_media("MKV"));
            assert!(is_media("flac"));
            assert!(!is_media("txt"));
            assert!(is_playlist("m3u"));
            assert!(is_subtitle("srt"));
            assert!(is_audio("mp3"));
            assert!(!is_audio("mkv"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = InitOptions::new("/tmp/ml.db", "/tmp/ml");
        assert!(opts.lock_file);
        assert_eq!(opts.parser_workers, 2);
        assert_eq!(opts.database_url(), "sqlite:/tmp/ml.db?mode=rwc");
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
[paths]
data_dir = "/custom/data"

[engine]
parser_workers = 4
cache_max_size = 1048576
log_level = "Debug"
"#;
        let config: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(config.paths.data_dir, Some(PathBuf::from("/custom/data")));
        assert_eq!(config.engine.parser_workers, Some(4));
        assert_eq!(config.engine.cache_max_size, Some(1048576));
        assert_eq!(config.engine.log_level, Some(LogLevel::Debug));
    }

    #[test]
    fn test_partial_config_toml() {
        let config: ConfigFile = toml::from_str("[engine]\nparser_workers = 1\n").unwrap();
        assert_eq!(config.engine.parser_workers, Some(1));
        assert!(config.paths.data_dir.is_none());
    }
}
