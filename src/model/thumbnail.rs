use sqlx::SqlitePool;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailSizeType {
    Thumbnail = 0,
    Banner = 1,
    Small = 2,
}

impl ThumbnailSizeType {
    pub fn from_i64(value: i64) -> ThumbnailSizeType {
        match value {
            1 => ThumbnailSizeType::Banner,
            2 => ThumbnailSizeType::Small,
            _ => ThumbnailSizeType::Thumbnail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailOrigin {
    UserProvided = 0,
    Media = 1,
    CoverFile = 2,
    AlbumArtist = 3,
    Artist = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailStatus {
    Missing = 0,
    Available = 1,
    Failure = 2,
    /// The thumbnailer crashed on this input; pre-inserted before calling
    /// out so a crashing file is not retried forever.
    Crash = 3,
}

impl ThumbnailStatus {
    pub fn from_i64(value: i64) -> ThumbnailStatus {
        match value {
            1 => ThumbnailStatus::Available,
            2 => ThumbnailStatus::Failure,
            3 => ThumbnailStatus::Crash,
            _ => ThumbnailStatus::Missing,
        }
    }
}

/// What a thumbnail link row points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailEntity {
    Media = 0,
    Album = 1,
    Artist = 2,
}

/// A thumbnail record, shared between owners through `thumbnail_links`;
/// `shared_counter` equals the number of distinct owners and drives
/// deletion. On-disk files are named `<id>.<ext>`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Thumbnail {
    pub id: i64,
    pub mrl: Option<String>,
    pub origin: i64,
    pub size_type: i64,
    pub status: i64,
    pub nb_attempts: i64,
    pub is_owned: bool,
    pub shared_counter: i64,
    pub file_size: i64,
    pub hash: Option<String>,
}

const COLUMNS: &str =
    "id, mrl, origin, size_type, status, nb_attempts, is_owned, shared_counter, file_size, hash";

impl Thumbnail {
    pub fn status(&self) -> ThumbnailStatus {
        ThumbnailStatus::from_i64(self.status)
    }

    pub async fn insert(
        pool: &SqlitePool,
        mrl: Option<&str>,
        origin: ThumbnailOrigin,
        size_type: ThumbnailSizeType,
        status: ThumbnailStatus,
        is_owned: bool,
    ) -> Result<Thumbnail> {
        let id = sqlx::query(
            "INSERT INTO thumbnails (mrl, origin, size_type, status, is_owned)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(mrl)
        .bind(origin as i64)
        .bind(size_type as i64)
        .bind(status as i64)
        .bind(is_owned)
        .execute(pool)
        .await?
        .last_insert_rowid();
        Ok(Thumbnail {
            id,
            mrl: mrl.map(String::from),
            origin: origin as i64,
            size_type: size_type as i64,
            status: status as i64,
            nb_attempts: 0,
            is_owned,
            shared_counter: 0,
            file_size: 0,
            hash: None,
        })
    }

    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Thumbnail>> {
        let thumbnail = sqlx::query_as::<_, Thumbnail>(&format!(
            "SELECT {COLUMNS} FROM thumbnails WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(thumbnail)
    }

    /// A previously computed thumbnail with the same content hash, reused
    /// instead of duplicating the file on disk.
    pub async fn by_hash(
        pool: &SqlitePool,
        hash: &str,
        size_type: ThumbnailSizeType,
    ) -> Result<Option<Thumbnail>> {
        let thumbnail = sqlx::query_as::<_, Thumbnail>(&format!(
            "SELECT {COLUMNS} FROM thumbnails WHERE hash = ? AND size_type = ? LIMIT 1"
        ))
        .bind(hash)
        .bind(size_type as i64)
        .fetch_optional(pool)
        .await?;
        Ok(thumbnail)
    }

    /// An existing record for the same source file, shared instead of
    /// re-inserted.
    pub async fn by_mrl(
        pool: &SqlitePool,
        mrl: &str,
        size_type: ThumbnailSizeType,
    ) -> Result<Option<Thumbnail>> {
        let thumbnail = sqlx::query_as::<_, Thumbnail>(&format!(
            "SELECT {COLUMNS} FROM thumbnails WHERE mrl = ? AND size_type = ? LIMIT 1"
        ))
        .bind(mrl)
        .bind(size_type as i64)
        .fetch_optional(pool)
        .await?;
        Ok(thumbnail)
    }

    pub async fn for_entity(
        pool: &SqlitePool,
        entity: ThumbnailEntity,
        entity_id: i64,
        size_type: ThumbnailSizeType,
    ) -> Result<Option<Thumbnail>> {
        let thumbnail = sqlx::query_as::<_, Thumbnail>(&format!(
            "SELECT t.{} FROM thumbnails t
             INNER JOIN thumbnail_links l ON l.thumbnail_id = t.id
             WHERE l.entity_type = ? AND l.entity_id = ? AND l.size_type = ?",
            COLUMNS.replace(", ", ", t.")
        ))
        .bind(entity as i64)
        .bind(entity_id)
        .bind(size_type as i64)
        .fetch_optional(pool)
        .await?;
        Ok(thumbnail)
    }

    /// Link a thumbnail to an owner, bumping the share counter. A previous
    /// link for the same (entity, size) is released first.
    pub async fn link(
        pool: &SqlitePool,
        entity: ThumbnailEntity,
        entity_id: i64,
        size_type: ThumbnailSizeType,
        thumbnail_id: i64,
    ) -> Result<()> {
        Self::unlink(pool, entity, entity_id, size_type).await?;
        let mut tx = pool.begin().await?;
        sqlx::query(
            "INSERT INTO thumbnail_links (entity_type, entity_id, size_type, thumbnail_id)
             VALUES (?, ?, ?, ?)",
        )
        .bind(entity as i64)
        .bind(entity_id)
        .bind(size_type as i64)
        .bind(thumbnail_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE thumbnails SET shared_counter = shared_counter + 1 WHERE id = ?")
            .bind(thumbnail_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop an owner's link. When the last owner goes away and the engine
    /// owns the file, its name is recorded in the cleanup table for the
    /// thumbnailer sweep to unlink from disk.
    pub async fn unlink(
        pool: &SqlitePool,
        entity: ThumbnailEntity,
        entity_id: i64,
        size_type: ThumbnailSizeType,
    ) -> Result<()> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT thumbnail_id FROM thumbnail_links
             WHERE entity_type = ? AND entity_id = ? AND size_type = ?",
        )
        .bind(entity as i64)
        .bind(entity_id)
        .bind(size_type as i64)
        .fetch_optional(pool)
        .await?;
        let Some((thumbnail_id,)) = row else {
            return Ok(());
        };
        let mut tx = pool.begin().await?;
        sqlx::query(
            "DELETE FROM thumbnail_links
             WHERE entity_type = ? AND entity_id = ? AND size_type = ?",
        )
        .bind(entity as i64)
        .bind(entity_id)
        .bind(size_type as i64)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE thumbnails SET shared_counter = MAX(shared_counter - 1, 0) WHERE id = ?",
        )
        .bind(thumbnail_id)
        .execute(&mut *tx)
        .await?;
        let (counter, is_owned, mrl): (i64, bool, Option<String>) =
            sqlx::query_as("SELECT shared_counter, is_owned, mrl FROM thumbnails WHERE id = ?")
                .bind(thumbnail_id)
                .fetch_one(&mut *tx)
                .await?;
        if counter == 0 {
            if let (true, Some(mrl)) = (is_owned, mrl) {
                sqlx::query("INSERT INTO thumbnail_cleanups (mrl) VALUES (?)")
                    .bind(&mrl)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("DELETE FROM thumbnails WHERE id = ?")
                .bind(thumbnail_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_success(
        pool: &SqlitePool,
        id: i64,
        mrl: &str,
        origin: ThumbnailOrigin,
        hash: Option<&str>,
        file_size: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE thumbnails SET mrl = ?, origin = ?, status = ?, is_owned = 1, hash = ?,
                                   file_size = ?
             WHERE id = ?",
        )
        .bind(mrl)
        .bind(origin as i64)
        .bind(ThumbnailStatus::Available as i64)
        .bind(hash)
        .bind(file_size)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(pool: &SqlitePool, id: i64, status: ThumbnailStatus) -> Result<()> {
        sqlx::query("UPDATE thumbnails SET status = ? WHERE id = ?")
            .bind(status as i64)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failure(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE thumbnails SET status = ?, nb_attempts = nb_attempts + 1 WHERE id = ?",
        )
        .bind(ThumbnailStatus::Failure as i64)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn remove(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM thumbnails WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Pending filesystem deletions whose earlier unlink failed.
    pub async fn cleanup_list(pool: &SqlitePool) -> Result<Vec<(i64, String)>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, mrl FROM thumbnail_cleanups ORDER BY id")
                .fetch_all(pool)
                .await?;
        Ok(rows)
    }

    pub async fn cleanup_remove(pool: &SqlitePool, cleanup_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM thumbnail_cleanups WHERE id = ?")
            .bind(cleanup_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
