//! Canonical DDL for the current model version. The strings below are the
//! reference the integrity check compares `sqlite_master` against, so they
//! must stay byte-stable modulo whitespace.
//!
//! Tables that gained columns through migrations (`files`, `thumbnails`,
//! `tasks`) keep those columns last and express uniqueness through separate
//! indexes: `ALTER TABLE ADD COLUMN` appends at the end of the stored DDL
//! and a migrated database must compare equal to a fresh one.

use sqlx::SqlitePool;

use crate::error::Result;

pub const DB_MODEL_VERSION: u32 = 18;

/// Oldest model version migrations can start from. Anything older gets a
/// full reset.
pub const OLDEST_MIGRATABLE_VERSION: u32 = 15;

pub const TABLES: &[(&str, &str)] = &[
    (
        "settings",
        "CREATE TABLE settings (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            db_model_version INTEGER NOT NULL
        )",
    ),
    (
        "devices",
        "CREATE TABLE devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL,
            scheme TEXT NOT NULL,
            is_removable INTEGER NOT NULL DEFAULT 0,
            is_network INTEGER NOT NULL DEFAULT 0,
            is_present INTEGER NOT NULL DEFAULT 1,
            last_seen INTEGER NOT NULL DEFAULT 0,
            UNIQUE(uuid, scheme)
        )",
    ),
    (
        "device_mountpoints",
        "CREATE TABLE device_mountpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            mrl TEXT NOT NULL,
            last_seen INTEGER NOT NULL DEFAULT 0,
            UNIQUE(device_id, mrl)
        )",
    ),
    (
        "folders",
        "CREATE TABLE folders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mrl TEXT NOT NULL,
            name TEXT NOT NULL,
            device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            parent_id INTEGER REFERENCES folders(id) ON DELETE CASCADE,
            last_modified INTEGER NOT NULL DEFAULT 0,
            is_present INTEGER NOT NULL DEFAULT 1,
            is_banned INTEGER NOT NULL DEFAULT 0,
            is_root INTEGER NOT NULL DEFAULT 0,
            UNIQUE(device_id, mrl)
        )",
    ),
    (
        "media_groups",
        "CREATE TABLE media_groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            nb_media INTEGER NOT NULL DEFAULT 0
        )",
    ),
    (
        "media",
        "CREATE TABLE media (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type INTEGER NOT NULL DEFAULT 0,
            subtype INTEGER NOT NULL DEFAULT 0,
            title TEXT,
            filename TEXT,
            duration INTEGER NOT NULL DEFAULT -1,
            play_count INTEGER NOT NULL DEFAULT 0,
            release_date INTEGER,
            is_external INTEGER NOT NULL DEFAULT 0,
            is_present INTEGER NOT NULL DEFAULT 1,
            import_date INTEGER NOT NULL DEFAULT 0,
            group_id INTEGER REFERENCES media_groups(id) ON DELETE SET NULL
        )",
    ),
    (
        "playlists",
        "CREATE TABLE playlists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            creation_date INTEGER NOT NULL DEFAULT 0,
            nb_media INTEGER NOT NULL DEFAULT 0
        )",
    ),
    (
        "subscriptions",
        "CREATE TABLE subscriptions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service TEXT NOT NULL,
            name TEXT NOT NULL,
            artwork_mrl TEXT,
            max_cached_media INTEGER NOT NULL DEFAULT -1,
            new_media_notify INTEGER NOT NULL DEFAULT 1
        )",
    ),
    (
        "files",
        "CREATE TABLE files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            media_id INTEGER REFERENCES media(id) ON DELETE CASCADE,
            playlist_id INTEGER REFERENCES playlists(id) ON DELETE CASCADE,
            subscription_id INTEGER REFERENCES subscriptions(id) ON DELETE CASCADE,
            folder_id INTEGER REFERENCES folders(id) ON DELETE CASCADE,
            mrl TEXT NOT NULL,
            file_type INTEGER NOT NULL DEFAULT 0,
            last_modified INTEGER NOT NULL DEFAULT 0,
            size INTEGER NOT NULL DEFAULT 0,
            is_removable INTEGER NOT NULL DEFAULT 0,
            is_external INTEGER NOT NULL DEFAULT 0,
            is_network INTEGER NOT NULL DEFAULT 0,
            is_cached INTEGER NOT NULL DEFAULT 0,
            cache_mrl TEXT,
            cache_size INTEGER NOT NULL DEFAULT 0,
            cached_at INTEGER
        )",
    ),
    (
        "audio_tracks",
        "CREATE TABLE audio_tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            media_id INTEGER NOT NULL REFERENCES media(id) ON DELETE CASCADE,
            codec TEXT,
            bitrate INTEGER NOT NULL DEFAULT 0,
            samplerate INTEGER NOT NULL DEFAULT 0,
            nb_channels INTEGER NOT NULL DEFAULT 0,
            language TEXT,
            description TEXT,
            attached_file_id INTEGER REFERENCES files(id) ON DELETE CASCADE
        )",
    ),
    (
        "video_tracks",
        "CREATE TABLE video_tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            media_id INTEGER NOT NULL REFERENCES media(id) ON DELETE CASCADE,
            codec TEXT,
            bitrate INTEGER NOT NULL DEFAULT 0,
            width INTEGER NOT NULL DEFAULT 0,
            height INTEGER NOT NULL DEFAULT 0,
            fps_num INTEGER NOT NULL DEFAULT 0,
            fps_den INTEGER NOT NULL DEFAULT 1,
            sar_num INTEGER NOT NULL DEFAULT 1,
            sar_den INTEGER NOT NULL DEFAULT 1,
            language TEXT,
            description TEXT
        )",
    ),
    (
        "subtitle_tracks",
        "CREATE TABLE subtitle_tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            media_id INTEGER NOT NULL REFERENCES media(id) ON DELETE CASCADE,
            codec TEXT,
            language TEXT,
            description TEXT,
            encoding TEXT,
            attached_file_id INTEGER REFERENCES files(id) ON DELETE CASCADE
        )",
    ),
    (
        "artists",
        "CREATE TABLE artists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT COLLATE NOCASE,
            bio TEXT,
            nb_albums INTEGER NOT NULL DEFAULT 0,
            nb_tracks INTEGER NOT NULL DEFAULT 0,
            is_present INTEGER NOT NULL DEFAULT 1,
            UNIQUE(name)
        )",
    ),
    (
        "albums",
        "CREATE TABLE albums (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT COLLATE NOCASE,
            artist_id INTEGER REFERENCES artists(id) ON DELETE SET NULL,
            release_year INTEGER,
            nb_tracks INTEGER NOT NULL DEFAULT 0,
            nb_discs INTEGER NOT NULL DEFAULT 1,
            duration INTEGER NOT NULL DEFAULT 0
        )",
    ),
    (
        "genres",
        "CREATE TABLE genres (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL COLLATE NOCASE,
            UNIQUE(name)
        )",
    ),
    (
        "album_tracks",
        "CREATE TABLE album_tracks (
            media_id INTEGER PRIMARY KEY REFERENCES media(id) ON DELETE CASCADE,
            album_id INTEGER NOT NULL REFERENCES albums(id) ON DELETE CASCADE,
            artist_id INTEGER REFERENCES artists(id) ON DELETE SET NULL,
            genre_id INTEGER REFERENCES genres(id) ON DELETE SET NULL,
            track_number INTEGER NOT NULL DEFAULT 0,
            disc_number INTEGER NOT NULL DEFAULT 1
        )",
    ),
    (
        "shows",
        "CREATE TABLE shows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT,
            tvdb_id TEXT,
            release_date INTEGER,
            summary TEXT,
            nb_episodes INTEGER NOT NULL DEFAULT 0
        )",
    ),
    (
        "show_episodes",
        "CREATE TABLE show_episodes (
            media_id INTEGER PRIMARY KEY REFERENCES media(id) ON DELETE CASCADE,
            show_id INTEGER NOT NULL REFERENCES shows(id) ON DELETE CASCADE,
            season_number INTEGER NOT NULL DEFAULT 0,
            episode_number INTEGER NOT NULL DEFAULT 0,
            title TEXT
        )",
    ),
    (
        "playlist_media",
        "CREATE TABLE playlist_media (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            playlist_id INTEGER NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
            media_id INTEGER NOT NULL REFERENCES media(id) ON DELETE CASCADE,
            position INTEGER NOT NULL
        )",
    ),
    (
        "subscription_media",
        "CREATE TABLE subscription_media (
            subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
            media_id INTEGER NOT NULL REFERENCES media(id) ON DELETE CASCADE,
            PRIMARY KEY(subscription_id, media_id)
        )",
    ),
    (
        "thumbnails",
        "CREATE TABLE thumbnails (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mrl TEXT,
            origin INTEGER NOT NULL DEFAULT 0,
            size_type INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 0,
            nb_attempts INTEGER NOT NULL DEFAULT 0,
            is_owned INTEGER NOT NULL DEFAULT 0,
            shared_counter INTEGER NOT NULL DEFAULT 0,
            file_size INTEGER NOT NULL DEFAULT 0,
            hash TEXT
        )",
    ),
    (
        "thumbnail_links",
        "CREATE TABLE thumbnail_links (
            entity_type INTEGER NOT NULL,
            entity_id INTEGER NOT NULL,
            size_type INTEGER NOT NULL,
            thumbnail_id INTEGER NOT NULL REFERENCES thumbnails(id) ON DELETE CASCADE,
            PRIMARY KEY(entity_type, entity_id, size_type)
        )",
    ),
    (
        "thumbnail_cleanups",
        "CREATE TABLE thumbnail_cleanups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mrl TEXT NOT NULL
        )",
    ),
    (
        "tasks",
        "CREATE TABLE tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type INTEGER NOT NULL,
            step INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            mrl TEXT,
            file_type INTEGER NOT NULL DEFAULT 0,
            file_id INTEGER REFERENCES files(id) ON DELETE CASCADE,
            parent_folder_id INTEGER REFERENCES folders(id) ON DELETE CASCADE,
            is_completed INTEGER NOT NULL DEFAULT 0,
            link_to_type INTEGER NOT NULL DEFAULT 0,
            link_to_id INTEGER NOT NULL DEFAULT 0,
            link_extra INTEGER NOT NULL DEFAULT 0
        )",
    ),
];

pub const INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_files_mrl_folder ON files(mrl, folder_id)",
    "CREATE INDEX IF NOT EXISTS idx_files_media ON files(media_id)",
    "CREATE INDEX IF NOT EXISTS idx_files_playlist ON files(playlist_id)",
    "CREATE INDEX IF NOT EXISTS idx_files_subscription ON files(subscription_id)",
    "CREATE INDEX IF NOT EXISTS idx_files_folder ON files(folder_id)",
    "CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_folders_device ON folders(device_id)",
    "CREATE INDEX IF NOT EXISTS idx_media_group ON media(group_id)",
    "CREATE INDEX IF NOT EXISTS idx_audio_tracks_media ON audio_tracks(media_id)",
    "CREATE INDEX IF NOT EXISTS idx_video_tracks_media ON video_tracks(media_id)",
    "CREATE INDEX IF NOT EXISTS idx_subtitle_tracks_media ON subtitle_tracks(media_id)",
    "CREATE INDEX IF NOT EXISTS idx_albums_title ON albums(title)",
    "CREATE INDEX IF NOT EXISTS idx_album_tracks_album ON album_tracks(album_id)",
    "CREATE INDEX IF NOT EXISTS idx_album_tracks_genre ON album_tracks(genre_id)",
    "CREATE INDEX IF NOT EXISTS idx_album_tracks_artist ON album_tracks(artist_id)",
    "CREATE INDEX IF NOT EXISTS idx_show_episodes_show ON show_episodes(show_id)",
    "CREATE INDEX IF NOT EXISTS idx_playlist_media_playlist ON playlist_media(playlist_id, position)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_creation ON tasks(mrl, parent_folder_id) WHERE type = 1",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_link ON tasks(link_to_type, link_to_id, link_extra, mrl) WHERE type = 3",
    "CREATE INDEX IF NOT EXISTS idx_tasks_runnable ON tasks(is_completed, retry_count)",
];

/// Reserved artist rows. Both always exist.
pub const UNKNOWN_ARTIST_ID: i64 = 1;
pub const VARIOUS_ARTISTS_ID: i64 = 2;

/// Reserved show row used when an episode pattern matched but the show name
/// was empty.
pub const UNKNOWN_SHOW_ID: i64 = 1;

/// Create the whole schema for the current model version, including the
/// reserved rows and the settings row.
pub async fn create_all(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (_, ddl) in TABLES {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }
    for index in INDEXES {
        sqlx::query(index).execute(&mut *tx).await?;
    }
    sqlx::query("INSERT INTO settings (id, db_model_version) VALUES (1, ?)")
        .bind(DB_MODEL_VERSION as i64)
        .execute(&mut *tx)
        .await?;
    create_reserved_rows(&mut tx).await?;
    tx.commit().await?;
    tracing::info!("Created database schema, model version {}", DB_MODEL_VERSION);
    Ok(())
}

async fn create_reserved_rows(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    sqlx::query("INSERT INTO artists (id, name) VALUES (?, NULL)")
        .bind(UNKNOWN_ARTIST_ID)
        .execute(&mut **tx)
        .await?;
    sqlx::query("INSERT INTO artists (id, name) VALUES (?, 'Various Artists')")
        .bind(VARIOUS_ARTISTS_ID)
        .execute(&mut **tx)
        .await?;
    sqlx::query("INSERT INTO shows (id, title) VALUES (?, NULL)")
        .bind(UNKNOWN_SHOW_ID)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// The canonical DDL for one table; migrations creating a table introduced
/// by a newer model version reuse it so a migrated database compares equal
/// to a fresh one.
pub fn ddl_for(table: &str) -> Option<&'static str> {
    TABLES.iter().find(|(name, _)| *name == table).map(|(_, d)| *d)
}
