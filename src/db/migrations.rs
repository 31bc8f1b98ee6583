//! In-place schema migrations. Each step runs in its own transaction and
//! gets up to three attempts; a constraint violation during a step means
//! the database content does not match what the step expects and is
//! treated as corruption. Databases older than the oldest migratable
//! version (or newer than the current one) are fully reset after backing
//! the playlists up.

use std::path::{Path, PathBuf};

use sqlx::SqlitePool;

use crate::db::schema;
use crate::error::{is_constraint_violation, Result};
use crate::model::task::TaskType;
use crate::mrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    UpToDate,
    Migrated,
    /// The database was wiped and recreated; playlists were backed up and
    /// restore tasks created.
    Reset,
    Corrupted,
}

const MAX_ATTEMPTS: u32 = 3;

/// Bring a database at `version` up to [`schema::DB_MODEL_VERSION`].
pub async fn run(pool: &SqlitePool, ml_folder: &Path, version: u32) -> Result<MigrationOutcome> {
    if version == schema::DB_MODEL_VERSION {
        return Ok(MigrationOutcome::UpToDate);
    }
    if version < schema::OLDEST_MIGRATABLE_VERSION || version > schema::DB_MODEL_VERSION {
        tracing::warn!(
            "Unsupported model version {} (supported: {}..={}), resetting the database",
            version,
            schema::OLDEST_MIGRATABLE_VERSION,
            schema::DB_MODEL_VERSION
        );
        reset(pool, ml_folder).await?;
        return Ok(MigrationOutcome::Reset);
    }

    for from in version..schema::DB_MODEL_VERSION {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match apply_step(pool, from).await {
                Ok(()) => {
                    tracing::info!("Migrated model version {} -> {}", from, from + 1);
                    break;
                }
                Err(crate::error::Error::Database(e)) if is_constraint_violation(&e) => {
                    tracing::error!(
                        "Constraint violation while migrating {} -> {}: {}",
                        from,
                        from + 1,
                        e
                    );
                    return Ok(MigrationOutcome::Corrupted);
                }
                Err(e) if attempt >= MAX_ATTEMPTS => {
                    tracing::error!(
                        "Migration {} -> {} failed after {} attempts: {}",
                        from,
                        from + 1,
                        attempt,
                        e
                    );
                    return Ok(MigrationOutcome::Corrupted);
                }
                Err(e) => {
                    tracing::warn!(
                        "Migration {} -> {} failed (attempt {}): {}",
                        from,
                        from + 1,
                        attempt,
                        e
                    );
                }
            }
        }
    }
    Ok(MigrationOutcome::Migrated)
}

async fn apply_step(pool: &SqlitePool, from: u32) -> Result<()> {
    let mut tx = pool.begin().await?;
    let statements: Vec<String> = match from {
        15 => vec![
            "ALTER TABLE files ADD COLUMN is_cached INTEGER NOT NULL DEFAULT 0".into(),
            "ALTER TABLE files ADD COLUMN cache_mrl TEXT".into(),
            "ALTER TABLE files ADD COLUMN cache_size INTEGER NOT NULL DEFAULT 0".into(),
            "ALTER TABLE files ADD COLUMN cached_at INTEGER".into(),
        ],
        16 => vec![
            "ALTER TABLE thumbnails ADD COLUMN file_size INTEGER NOT NULL DEFAULT 0".into(),
            "ALTER TABLE thumbnails ADD COLUMN hash TEXT".into(),
            schema::ddl_for("thumbnail_cleanups")
                .expect("thumbnail_cleanups ddl")
                .into(),
        ],
        17 => vec![
            schema::ddl_for("subscriptions")
                .expect("subscriptions ddl")
                .into(),
            schema::ddl_for("subscription_media")
                .expect("subscription_media ddl")
                .into(),
            "ALTER TABLE tasks ADD COLUMN link_to_type INTEGER NOT NULL DEFAULT 0".into(),
            "ALTER TABLE tasks ADD COLUMN link_to_id INTEGER NOT NULL DEFAULT 0".into(),
            "ALTER TABLE tasks ADD COLUMN link_extra INTEGER NOT NULL DEFAULT 0".into(),
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_link ON \
             tasks(link_to_type, link_to_id, link_extra, mrl) WHERE type = 3"
                .into(),
            "CREATE INDEX IF NOT EXISTS idx_files_subscription ON files(subscription_id)".into(),
        ],
        _ => unreachable!("no migration registered from version {from}"),
    };
    for statement in &statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query("UPDATE settings SET db_model_version = ?")
        .bind((from + 1) as i64)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Wipe and recreate the database. User playlists are exported as m3u
/// backups first and a Restore task is created for each of them so the
/// parser can rebuild them once discovery repopulates the media.
pub async fn reset(pool: &SqlitePool, ml_folder: &Path) -> Result<()> {
    let backups = backup_playlists(pool, ml_folder).await.unwrap_or_else(|e| {
        tracing::warn!("Playlist backup failed, continuing with reset: {}", e);
        Vec::new()
    });

    // Foreign keys must be disabled for the drop pass; this cannot happen
    // inside a transaction.
    sqlx::query("PRAGMA foreign_keys = OFF").execute(pool).await?;
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )
    .fetch_all(pool)
    .await?;
    for (table,) in &tables {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(pool)
            .await?;
    }
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    schema::create_all(pool).await?;

    for backup in &backups {
        let backup_mrl = mrl::from_local_path(backup);
        if let Err(e) = sqlx::query("INSERT INTO tasks (type, mrl) VALUES (?, ?)")
            .bind(TaskType::Restore as i64)
            .bind(&backup_mrl)
            .execute(pool)
            .await
        {
            tracing::warn!("Failed to create restore task for {}: {}", backup_mrl, e);
        }
    }
    tracing::info!(
        "Database reset complete, {} playlist backup(s) scheduled for restore",
        backups.len()
    );
    Ok(())
}

/// Export every playlist to `<mlFolder>/playlists/<epoch>/<id>.m3u`.
/// Best effort: a playlist that fails to export is logged and skipped.
pub async fn backup_playlists(pool: &SqlitePool, ml_folder: &Path) -> Result<Vec<PathBuf>> {
    let playlists: Vec<(i64, String)> = match sqlx::query_as("SELECT id, name FROM playlists")
        .fetch_all(pool)
        .await
    {
        Ok(rows) => rows,
        // A database too old to have the playlists table has nothing to save.
        Err(e) => {
            tracing::warn!("Could not enumerate playlists for backup: {}", e);
            return Ok(Vec::new());
        }
    };
    if playlists.is_empty() {
        return Ok(Vec::new());
    }

    let backup_dir = ml_folder
        .join("playlists")
        .join(chrono::Utc::now().timestamp().to_string());
    tokio::fs::create_dir_all(&backup_dir).await?;

    let mut backups = Vec::new();
    for (playlist_id, name) in playlists {
        let items: Vec<(String,)> = sqlx::query_as(
            "SELECT f.mrl FROM playlist_media pm
             INNER JOIN files f ON f.media_id = pm.media_id
             WHERE pm.playlist_id = ? AND f.file_type = 1
             ORDER BY pm.position",
        )
        .bind(playlist_id)
        .fetch_all(pool)
        .await?;

        let mut contents = format!("#EXTM3U\n#PLAYLIST:{name}\n");
        for (item_mrl,) in &items {
            contents.push_str(item_mrl);
            contents.push('\n');
        }
        let path = backup_dir.join(format!("{playlist_id}.m3u"));
        match tokio::fs::write(&path, contents).await {
            Ok(()) => backups.push(path),
            Err(e) => tracing::warn!("Failed to back up playlist {}: {}", playlist_id, e),
        }
    }
    Ok(backups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{check_integrity, connect_in_memory, model_version};

    /// Replays the v15 schema: current DDL minus everything later
    /// migrations add.
    async fn create_v15(pool: &SqlitePool) {
        for (name, ddl) in schema::TABLES {
            let ddl = match *name {
                "files" => {
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
                        is_network INTEGER NOT NULL DEFAULT 0
                    )"
                }
                "thumbnails" => {
                    "CREATE TABLE thumbnails (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        mrl TEXT,
                        origin INTEGER NOT NULL DEFAULT 0,
                        size_type INTEGER NOT NULL DEFAULT 0,
                        status INTEGER NOT NULL DEFAULT 0,
                        nb_attempts INTEGER NOT NULL DEFAULT 0,
                        is_owned INTEGER NOT NULL DEFAULT 0,
                        shared_counter INTEGER NOT NULL DEFAULT 0
                    )"
                }
                "tasks" => {
                    "CREATE TABLE tasks (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        type INTEGER NOT NULL,
                        step INTEGER NOT NULL DEFAULT 0,
                        retry_count INTEGER NOT NULL DEFAULT 0,
                        mrl TEXT,
                        file_type INTEGER NOT NULL DEFAULT 0,
                        file_id INTEGER REFERENCES files(id) ON DELETE CASCADE,
                        parent_folder_id INTEGER REFERENCES folders(id) ON DELETE CASCADE,
                        is_completed INTEGER NOT NULL DEFAULT 0
                    )"
                }
                "thumbnail_cleanups" | "subscriptions" | "subscription_media" => continue,
                _ => ddl,
            };
            sqlx::query(ddl).execute(pool).await.unwrap();
        }
        sqlx::query("INSERT INTO settings (id, db_model_version) VALUES (1, 15)")
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_migrate_15_to_current() {
        let pool = connect_in_memory().await.unwrap();
        create_v15(&pool).await;
        let outcome = run(&pool, Path::new("/nonexistent"), 15).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Migrated);
        assert_eq!(
            model_version(&pool).await.unwrap(),
            Some(schema::DB_MODEL_VERSION)
        );
        // A migrated database must be indistinguishable from a fresh one.
        assert!(check_integrity(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_up_to_date_is_noop() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let outcome = run(&pool, Path::new("/nonexistent"), schema::DB_MODEL_VERSION)
            .await
            .unwrap();
        assert_eq!(outcome, MigrationOutcome::UpToDate);
    }

    #[tokio::test]
    async fn test_too_old_version_resets() {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        sqlx::query("UPDATE settings SET db_model_version = 3")
            .execute(&pool)
            .await
            .unwrap();
        let outcome = run(&pool, dir.path(), 3).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Reset);
        assert_eq!(
            model_version(&pool).await.unwrap(),
            Some(schema::DB_MODEL_VERSION)
        );
    }

    #[tokio::test]
    async fn test_reset_backs_up_playlists_and_creates_restore_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        sqlx::query("INSERT INTO playlists (name) VALUES ('road trip')")
            .execute(&pool)
            .await
            .unwrap();

        reset(&pool, dir.path()).await.unwrap();

        let tasks: Vec<(i64, Option<String>)> =
            sqlx::query_as("SELECT type, mrl FROM tasks")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].0, TaskType::Restore as i64);
        let backup_mrl = tasks[0].1.clone().unwrap();
        let backup_path = mrl::to_local_path(&backup_mrl).unwrap();
        let contents = std::fs::read_to_string(backup_path).unwrap();
        assert!(contents.contains("#PLAYLIST:road trip"));
    }
}
