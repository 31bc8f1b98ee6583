use sqlx::SqlitePool;

use crate::config::ext;
use crate::error::Result;

/// Role of a file within the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Unknown = 0,
    /// Owns a media.
    Main = 1,
    Part = 2,
    Soundtrack = 3,
    Subtitle = 4,
    /// Owns a playlist.
    Playlist = 5,
    Disc = 6,
    Cache = 7,
    /// Owns a subscription.
    Subscription = 8,
}

impl FileType {
    pub fn from_i64(value: i64) -> FileType {
        match value {
            1 => FileType::Main,
            2 => FileType::Part,
            3 => FileType::Soundtrack,
            4 => FileType::Subtitle,
            5 => FileType::Playlist,
            6 => FileType::Disc,
            7 => FileType::Cache,
            8 => FileType::Subscription,
            _ => FileType::Unknown,
        }
    }

    /// Pick a type from a filename extension alone.
    pub fn from_extension(extension: Option<&str>) -> FileType {
        match extension {
            Some(e) if ext::is_media(e) => FileType::Main,
            Some(e) if ext::is_playlist(e) => FileType::Playlist,
            Some(e) if ext::is_subtitle(e) => FileType::Subtitle,
            Some(e) if ext::is_subscription(e) => FileType::Subscription,
            _ => FileType::Unknown,
        }
    }
}

/// A file row. Owned by exactly one of media / playlist / subscription
/// (or nothing for FileType::Unknown leftovers kept for bookkeeping).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct File {
    pub id: i64,
    pub media_id: Option<i64>,
    pub playlist_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub folder_id: Option<i64>,
    pub mrl: String,
    pub file_type: i64,
    pub last_modified: i64,
    pub size: i64,
    pub is_removable: bool,
    pub is_external: bool,
    pub is_network: bool,
    pub is_cached: bool,
    pub cache_mrl: Option<String>,
    pub cache_size: i64,
    pub cached_at: Option<i64>,
}

const COLUMNS: &str = "id, media_id, playlist_id, subscription_id, folder_id, mrl, file_type, \
                       last_modified, size, is_removable, is_external, is_network, is_cached, \
                       cache_mrl, cache_size, cached_at";

/// Parameters shared by every insertion path.
#[derive(Debug, Clone)]
pub struct NewFile<'a> {
    pub folder_id: Option<i64>,
    pub mrl: &'a str,
    pub file_type: FileType,
    pub last_modified: i64,
    pub size: i64,
    pub is_removable: bool,
    pub is_network: bool,
}

impl File {
    pub fn file_type(&self) -> FileType {
        FileType::from_i64(self.file_type)
    }

    async fn insert(
        pool: &SqlitePool,
        new: &NewFile<'_>,
        media_id: Option<i64>,
        playlist_id: Option<i64>,
        subscription_id: Option<i64>,
        is_external: bool,
    ) -> Result<File> {
        let id = sqlx::query(
            "INSERT INTO files (media_id, playlist_id, subscription_id, folder_id, mrl,
                                file_type, last_modified, size, is_removable, is_external,
                                is_network)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(media_id)
        .bind(playlist_id)
        .bind(subscription_id)
        .bind(new.folder_id)
        .bind(new.mrl)
        .bind(new.file_type as i64)
        .bind(new.last_modified)
        .bind(new.size)
        .bind(new.is_removable)
        .bind(is_external)
        .bind(new.is_network)
        .execute(pool)
        .await?
        .last_insert_rowid();
        Ok(File {
            id,
            media_id,
            playlist_id,
            subscription_id,
            folder_id: new.folder_id,
            mrl: new.mrl.to_string(),
            file_type: new.file_type as i64,
            last_modified: new.last_modified,
            size: new.size,
            is_removable: new.is_removable,
            is_external,
            is_network: new.is_network,
            is_cached: false,
            cache_mrl: None,
            cache_size: 0,
            cached_at: None,
        })
    }

    pub async fn create_for_media(
        pool: &SqlitePool,
        media_id: i64,
        new: &NewFile<'_>,
    ) -> Result<File> {
        Self::insert(pool, new, Some(media_id), None, None, false).await
    }

    /// External files live outside any indexed folder (e.g. subscription
    /// items): mrl is absolute, folder is null.
    pub async fn create_external(pool: &SqlitePool, media_id: i64, mrl: &str) -> Result<File> {
        let new = NewFile {
            folder_id: None,
            mrl,
            file_type: FileType::Main,
            last_modified: 0,
            size: 0,
            is_removable: false,
            is_network: !crate::mrl::scheme_is("file://", mrl),
        };
        Self::insert(pool, &new, Some(media_id), None, None, true).await
    }

    pub async fn create_for_playlist(
        pool: &SqlitePool,
        playlist_id: i64,
        new: &NewFile<'_>,
    ) -> Result<File> {
        Self::insert(pool, new, None, Some(playlist_id), None, false).await
    }

    pub async fn create_for_subscription(
        pool: &SqlitePool,
        subscription_id: i64,
        new: &NewFile<'_>,
    ) -> Result<File> {
        Self::insert(pool, new, None, None, Some(subscription_id), false).await
    }

    /// A file owned by nothing, recorded so rescans do not re-examine it.
    pub async fn create_unparsed(pool: &SqlitePool, new: &NewFile<'_>) -> Result<File> {
        Self::insert(pool, new, None, None, None, false).await
    }

    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<File>> {
        let file = sqlx::query_as::<_, File>(&format!("SELECT {COLUMNS} FROM files WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(file)
    }

    /// Lookup by stored mrl. Removable files store only their leaf name so
    /// this is meaningful per folder, not globally.
    pub async fn by_mrl_in_folder(
        pool: &SqlitePool,
        folder_id: i64,
        mrl: &str,
    ) -> Result<Option<File>> {
        let file = sqlx::query_as::<_, File>(&format!(
            "SELECT {COLUMNS} FROM files WHERE folder_id = ? AND mrl = ?"
        ))
        .bind(folder_id)
        .bind(mrl)
        .fetch_optional(pool)
        .await?;
        Ok(file)
    }

    pub async fn by_mrl(pool: &SqlitePool, mrl: &str) -> Result<Option<File>> {
        let file = sqlx::query_as::<_, File>(&format!(
            "SELECT {COLUMNS} FROM files WHERE mrl = ? LIMIT 1"
        ))
        .bind(mrl)
        .fetch_optional(pool)
        .await?;
        Ok(file)
    }

    pub async fn in_folder(pool: &SqlitePool, folder_id: i64) -> Result<Vec<File>> {
        let files = sqlx::query_as::<_, File>(&format!(
            "SELECT {COLUMNS} FROM files WHERE folder_id = ? ORDER BY mrl"
        ))
        .bind(folder_id)
        .fetch_all(pool)
        .await?;
        Ok(files)
    }

    pub async fn for_media(pool: &SqlitePool, media_id: i64) -> Result<Vec<File>> {
        let files = sqlx::query_as::<_, File>(&format!(
            "SELECT {COLUMNS} FROM files WHERE media_id = ? ORDER BY id"
        ))
        .bind(media_id)
        .fetch_all(pool)
        .await?;
        Ok(files)
    }

    /// Main file of a media, the one that owns it.
    pub async fn main_file(pool: &SqlitePool, media_id: i64) -> Result<Option<File>> {
        let file = sqlx::query_as::<_, File>(&format!(
            "SELECT {COLUMNS} FROM files WHERE media_id = ? AND file_type = ? LIMIT 1"
        ))
        .bind(media_id)
        .bind(FileType::Main as i64)
        .fetch_optional(pool)
        .await?;
        Ok(file)
    }

    pub async fn update_last_modified(pool: &SqlitePool, id: i64, last_modified: i64) -> Result<()> {
        sqlx::query("UPDATE files SET last_modified = ? WHERE id = ?")
            .bind(last_modified)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn update_size(pool: &SqlitePool, id: i64, size: i64) -> Result<()> {
        sqlx::query("UPDATE files SET size = ? WHERE id = ?")
            .bind(size)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn remove(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_cached(
        pool: &SqlitePool,
        id: i64,
        cache_mrl: &str,
        cache_size: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE files SET is_cached = 1, cache_mrl = ?, cache_size = ?, cached_at = ?
             WHERE id = ?",
        )
        .bind(cache_mrl)
        .bind(cache_size)
        .bind(super::timestamp())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_uncached(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE files SET is_cached = 0, cache_mrl = NULL, cache_size = 0, cached_at = NULL
             WHERE id = ?",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn cached_files(pool: &SqlitePool) -> Result<Vec<File>> {
        let files = sqlx::query_as::<_, File>(&format!(
            "SELECT {COLUMNS} FROM files WHERE is_cached = 1 ORDER BY cached_at"
        ))
        .fetch_all(pool)
        .await?;
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_from_extension() {
        assert_eq!(FileType::from_extension(Some("mkv")), FileType::Main);
        assert_eq!(FileType::from_extension(Some("m3u")), FileType::Playlist);
        assert_eq!(FileType::from_extension(Some("srt")), FileType::Subtitle);
        assert_eq!(FileType::from_extension(Some("something")), FileType::Unknown);
        assert_eq!(FileType::from_extension(None), FileType::Unknown);
    }

    #[test]
    fn test_type_roundtrip() {
        for t in [
            FileType::Unknown,
            FileType::Main,
            FileType::Part,
            FileType::Soundtrack,
            FileType::Subtitle,
            FileType::Playlist,
            FileType::Disc,
            FileType::Cache,
            FileType::Subscription,
        ] {
            assert_eq!(FileType::from_i64(t as i64), t);
        }
    }
}
