use sqlx::SqlitePool;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Unknown = 0,
    Audio = 1,
    Video = 2,
}

impl MediaType {
    pub fn from_i64(value: i64) -> MediaType {
        match value {
            1 => MediaType::Audio,
            2 => MediaType::Video,
            _ => MediaType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSubtype {
    Unknown = 0,
    ShowEpisode = 1,
    Movie = 2,
    AlbumTrack = 3,
}

impl MediaSubtype {
    pub fn from_i64(value: i64) -> MediaSubtype {
        match value {
            1 => MediaSubtype::ShowEpisode,
            2 => MediaSubtype::Movie,
            3 => MediaSubtype::AlbumTrack,
            _ => MediaSubtype::Unknown,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Media {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub media_type: i64,
    pub subtype: i64,
    pub title: Option<String>,
    pub filename: Option<String>,
    pub duration: i64,
    pub play_count: i64,
    pub release_date: Option<i64>,
    pub is_external: bool,
    pub is_present: bool,
    pub import_date: i64,
    pub group_id: Option<i64>,
}

const COLUMNS: &str = "id, type, subtype, title, filename, duration, play_count, release_date, \
                       is_external, is_present, import_date, group_id";

impl Media {
    pub fn media_type(&self) -> MediaType {
        MediaType::from_i64(self.media_type)
    }

    pub fn subtype(&self) -> MediaSubtype {
        MediaSubtype::from_i64(self.subtype)
    }

    pub async fn create(
        pool: &SqlitePool,
        media_type: MediaType,
        title: &str,
        filename: &str,
    ) -> Result<Media> {
        let now = super::timestamp();
        let id = sqlx::query(
            "INSERT INTO media (type, title, filename, import_date) VALUES (?, ?, ?, ?)",
        )
        .bind(media_type as i64)
        .bind(title)
        .bind(filename)
        .bind(now)
        .execute(pool)
        .await?
        .last_insert_rowid();
        Ok(Media {
            id,
            media_type: media_type as i64,
            subtype: MediaSubtype::Unknown as i64,
            title: Some(title.to_string()),
            filename: Some(filename.to_string()),
            duration: -1,
            play_count: 0,
            release_date: None,
            is_external: false,
            is_present: true,
            import_date: now,
            group_id: None,
        })
    }

    /// External media (subscription items, app-provided streams) carry
    /// their own mrl through an external file row and are not bound to an
    /// indexed folder.
    pub async fn create_external(
        pool: &SqlitePool,
        mrl: &str,
        title: &str,
        release_date: Option<i64>,
    ) -> Result<Media> {
        let now = super::timestamp();
        let id = sqlx::query(
            "INSERT INTO media (type, title, filename, release_date, is_external, import_date)
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(MediaType::Unknown as i64)
        .bind(title)
        .bind(crate::mrl::file_name(mrl))
        .bind(release_date)
        .bind(now)
        .execute(pool)
        .await?
        .last_insert_rowid();
        super::file::File::create_external(pool, id, mrl).await?;
        let media = Self::by_id(pool, id).await?.expect("media just created");
        Ok(media)
    }

    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Media>> {
        let media = sqlx::query_as::<_, Media>(&format!("SELECT {COLUMNS} FROM media WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(media)
    }

    /// Find a media through any of its files' mrl.
    pub async fn by_mrl(pool: &SqlitePool, mrl: &str) -> Result<Option<Media>> {
        let media = sqlx::query_as::<_, Media>(&format!(
            "SELECT m.{} FROM media m
             INNER JOIN files f ON f.media_id = m.id
             WHERE f.mrl = ? LIMIT 1",
            COLUMNS.replace(", ", ", m.")
        ))
        .bind(mrl)
        .fetch_optional(pool)
        .await?;
        Ok(media)
    }

    /// Promote an external media to an internal one, preserving its id so
    /// existing references (playlists, subscriptions) stay valid.
    pub async fn convert_to_internal(
        pool: &SqlitePool,
        id: i64,
        media_type: MediaType,
        title: &str,
        filename: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE media SET is_external = 0, type = ?, title = ?, filename = ?
             WHERE id = ?",
        )
        .bind(media_type as i64)
        .bind(title)
        .bind(filename)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_type(pool: &SqlitePool, id: i64, media_type: MediaType) -> Result<()> {
        sqlx::query("UPDATE media SET type = ? WHERE id = ?")
            .bind(media_type as i64)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_subtype(pool: &SqlitePool, id: i64, subtype: MediaSubtype) -> Result<()> {
        sqlx::query("UPDATE media SET subtype = ? WHERE id = ?")
            .bind(subtype as i64)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_duration(pool: &SqlitePool, id: i64, duration: i64) -> Result<()> {
        sqlx::query("UPDATE media SET duration = ? WHERE id = ?")
            .bind(duration)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_title(pool: &SqlitePool, id: i64, title: &str) -> Result<()> {
        sqlx::query("UPDATE media SET title = ? WHERE id = ?")
            .bind(title)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_release_date(pool: &SqlitePool, id: i64, date: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE media SET release_date = ? WHERE id = ?")
            .bind(date)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_group(pool: &SqlitePool, id: i64, group_id: i64) -> Result<()> {
        sqlx::query("UPDATE media SET group_id = ? WHERE id = ?")
            .bind(group_id)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Remove a media when its last non-external file went away.
    /// Returns true when the row was deleted.
    pub async fn remove_if_orphaned(pool: &SqlitePool, id: i64) -> Result<bool> {
        let res = sqlx::query(
            "DELETE FROM media WHERE id = ? AND is_external = 0 AND NOT EXISTS (
                SELECT 1 FROM files WHERE media_id = ?
            )",
        )
        .bind(id)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn remove(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM media WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect_in_memory, schema};

    #[tokio::test]
    async fn test_external_promotion_preserves_id() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let external = Media::create_external(&pool, "file:///x/a.mp3", "A song", None)
            .await
            .unwrap();
        assert!(external.is_external);

        Media::convert_to_internal(&pool, external.id, MediaType::Audio, "A song", "a.mp3")
            .await
            .unwrap();
        let media = Media::by_id(&pool, external.id).await.unwrap().unwrap();
        assert!(!media.is_external);
        assert_eq!(media.media_type(), MediaType::Audio);
        assert_eq!(media.id, external.id);
    }

    #[tokio::test]
    async fn test_by_mrl_goes_through_files() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let media = Media::create_external(&pool, "file:///x/b.mp3", "B", None)
            .await
            .unwrap();
        let found = Media::by_mrl(&pool, "file:///x/b.mp3").await.unwrap();
        assert_eq!(found.unwrap().id, media.id);
        assert!(Media::by_mrl(&pool, "file:///x/none.mp3")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_orphan_removal_spares_external() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let media = Media::create(&pool, MediaType::Video, "V", "v.mkv").await.unwrap();
        assert!(Media::remove_if_orphaned(&pool, media.id).await.unwrap());

        let ext = Media::create_external(&pool, "file:///x/c.mp3", "C", None)
            .await
            .unwrap();
        assert!(!Media::remove_if_orphaned(&pool, ext.id).await.unwrap());
    }
}
