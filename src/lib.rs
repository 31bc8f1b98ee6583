//! mediadex is a local media-library indexing engine. Given a set of root
//! folders it discovers audio, video, playlist and subscription files,
//! extracts structural metadata from each of them and materialises the
//! catalogue (media, albums, artists, shows, playlists, thumbnails) in a
//! SQLite store the embedding application can query.
//!
//! The engine owns a small fleet of background workers: a discoverer that
//! walks mountpoints, a parser pool that drains the persistent task table,
//! a thumbnailer and a subscription cache worker. All of them are driven by
//! [`MediaLibrary`], the long-lived orchestrator created through
//! [`MediaLibrary::new`] and brought up with [`MediaLibrary::initialize`].

pub mod analyzer;
pub mod cache;
pub mod config;
pub mod db;
pub mod discoverer;
pub mod error;
pub mod fs;
pub mod library;
pub mod lockfile;
pub mod model;
pub mod mrl;
pub mod notifier;
pub mod parser;
pub mod thumbnailer;

pub use config::{InitOptions, LogLevel};
pub use error::{Error, Result};
pub use library::{InitResult, MediaLibrary};
pub use notifier::MediaLibraryCb;
pub use parser::item::{Item, Metadata, TrackInfo};
pub use parser::probe::MediaProbe;
pub use parser::{ParserService, Status};
pub use thumbnailer::Thumbnailer;

/// Install a default `tracing` subscriber honouring `RUST_LOG`, falling back
/// to the level requested through the init options. Embedding applications
/// that already own a subscriber should skip this and ignore `log_level`.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let default_filter = format!("mediadex={}", level.as_filter());
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
