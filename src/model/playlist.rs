use sqlx::SqlitePool;

use crate::error::Result;

/// An ordered list of media, either user-created or backed by a playlist
/// file discovered on disk (the backing file's `playlist_id` points here).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Playlist {
    pub id: i64,
    pub name: String,
    pub creation_date: i64,
    pub nb_media: i64,
}

const COLUMNS: &str = "id, name, creation_date, nb_media";

impl Playlist {
    pub async fn create(pool: &SqlitePool, name: &str) -> Result<Playlist> {
        let now = super::timestamp();
        let id = sqlx::query("INSERT INTO playlists (name, creation_date) VALUES (?, ?)")
            .bind(name)
            .bind(now)
            .execute(pool)
            .await?
            .last_insert_rowid();
        Ok(Playlist {
            id,
            name: name.to_string(),
            creation_date: now,
            nb_media: 0,
        })
    }

    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Playlist>> {
        let playlist =
            sqlx::query_as::<_, Playlist>(&format!("SELECT {COLUMNS} FROM playlists WHERE id = ?"))
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(playlist)
    }

    /// The playlist owned by a given backing file, if any.
    pub async fn by_file(pool: &SqlitePool, file_id: i64) -> Result<Option<Playlist>> {
        let playlist = sqlx::query_as::<_, Playlist>(&format!(
            "SELECT p.{} FROM playlists p
             INNER JOIN files f ON f.playlist_id = p.id
             WHERE f.id = ?",
            COLUMNS.replace(", ", ", p.")
        ))
        .bind(file_id)
        .fetch_optional(pool)
        .await?;
        Ok(playlist)
    }

    /// Append or insert a media. `position` is the 0-based index requested
    /// by the playlist file; ties resolve by insertion order.
    pub async fn add_media(
        pool: &SqlitePool,
        playlist_id: i64,
        media_id: i64,
        position: Option<i64>,
    ) -> Result<()> {
        let mut tx = pool.begin().await?;
        let position = match position {
            Some(p) => p,
            None => {
                let row: (Option<i64>,) = sqlx::query_as(
                    "SELECT MAX(position) FROM playlist_media WHERE playlist_id = ?",
                )
                .bind(playlist_id)
                .fetch_one(&mut *tx)
                .await?;
                row.0.map_or(0, |max| max + 1)
            }
        };
        sqlx::query(
            "INSERT INTO playlist_media (playlist_id, media_id, position) VALUES (?, ?, ?)",
        )
        .bind(playlist_id)
        .bind(media_id)
        .bind(position)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE playlists SET nb_media = nb_media + 1 WHERE id = ?")
            .bind(playlist_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Media ids in playlist order.
    pub async fn media_ids(pool: &SqlitePool, playlist_id: i64) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT media_id FROM playlist_media WHERE playlist_id = ? ORDER BY position, id",
        )
        .bind(playlist_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Drop the playlist content before re-parsing its backing file.
    pub async fn clear(pool: &SqlitePool, playlist_id: i64) -> Result<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM playlist_media WHERE playlist_id = ?")
            .bind(playlist_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE playlists SET nb_media = 0 WHERE id = ?")
            .bind(playlist_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM playlists WHERE id = ?")
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
    use crate::model::media::{Media, MediaType};

    #[tokio::test]
    async fn test_ordering_and_counters() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let playlist = Playlist::create(&pool, "mix").await.unwrap();
        let a = Media::create(&pool, MediaType::Audio, "a", "a.mp3").await.unwrap();
        let b = Media::create(&pool, MediaType::Audio, "b", "b.mp3").await.unwrap();
        let c = Media::create(&pool, MediaType::Audio, "c", "c.mp3").await.unwrap();

        // b lands at an explicit index before a, c appends at the tail.
        Playlist::add_media(&pool, playlist.id, a.id, Some(1)).await.unwrap();
        Playlist::add_media(&pool, playlist.id, b.id, Some(0)).await.unwrap();
        Playlist::add_media(&pool, playlist.id, c.id, None).await.unwrap();

        assert_eq!(
            Playlist::media_ids(&pool, playlist.id).await.unwrap(),
            vec![b.id, a.id, c.id]
        );
        let playlist = Playlist::by_id(&pool, playlist.id).await.unwrap().unwrap();
        assert_eq!(playlist.nb_media, 3);
    }
}
