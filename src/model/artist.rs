use sqlx::SqlitePool;

use crate::db::schema::{UNKNOWN_ARTIST_ID, VARIOUS_ARTISTS_ID};
use crate::error::{is_unique_violation, Result};

/// An artist. Two reserved rows always exist: *Unknown Artist* (id 1, the
/// sentinel for missing tags) and *Various Artists* (id 2, the sentinel
/// for heterogeneous album tagging).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Artist {
    pub id: i64,
    pub name: Option<String>,
    pub bio: Option<String>,
    pub nb_albums: i64,
    pub nb_tracks: i64,
    pub is_present: bool,
}

const COLUMNS: &str = "id, name, bio, nb_albums, nb_tracks, is_present";

impl Artist {
    pub fn is_reserved(id: i64) -> bool {
        id == UNKNOWN_ARTIST_ID || id == VARIOUS_ARTISTS_ID
    }

    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Artist>> {
        let artist =
            sqlx::query_as::<_, Artist>(&format!("SELECT {COLUMNS} FROM artists WHERE id = ?"))
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(artist)
    }

    pub async fn by_name(pool: &SqlitePool, name: &str) -> Result<Option<Artist>> {
        let artist =
            sqlx::query_as::<_, Artist>(&format!("SELECT {COLUMNS} FROM artists WHERE name = ?"))
                .bind(name)
                .fetch_optional(pool)
                .await?;
        Ok(artist)
    }

    /// Case-insensitive get-or-create. Racing creators are resolved through
    /// the unique constraint.
    pub async fn create_or_get(pool: &SqlitePool, name: &str) -> Result<Artist> {
        if let Some(artist) = Self::by_name(pool, name).await? {
            return Ok(artist);
        }
        let res = sqlx::query("INSERT INTO artists (name) VALUES (?)")
            .bind(name)
            .execute(pool)
            .await;
        match res {
            Ok(done) => Ok(Artist {
                id: done.last_insert_rowid(),
                name: Some(name.to_string()),
                bio: None,
                nb_albums: 0,
                nb_tracks: 0,
                is_present: true,
            }),
            Err(e) if is_unique_violation(&e) => Self::by_name(pool, name)
                .await?
                .ok_or_else(|| crate::error::Error::NotFound {
                    target: "artist",
                    container: name.to_string(),
                }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn add_track_count(pool: &SqlitePool, id: i64, delta: i64) -> Result<()> {
        sqlx::query("UPDATE artists SET nb_tracks = nb_tracks + ? WHERE id = ?")
            .bind(delta)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn add_album_count(pool: &SqlitePool, id: i64, delta: i64) -> Result<()> {
        sqlx::query("UPDATE artists SET nb_albums = nb_albums + ? WHERE id = ?")
            .bind(delta)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Remove non-reserved artists left with no album and no track; used
    /// by the force-rescan cleanup pass.
    pub async fn drop_all_user_artists(pool: &SqlitePool) -> Result<()> {
        sqlx::query("DELETE FROM artists WHERE id NOT IN (?, ?)")
            .bind(UNKNOWN_ARTIST_ID)
            .bind(VARIOUS_ARTISTS_ID)
            .execute(pool)
            .await?;
        sqlx::query("UPDATE artists SET nb_albums = 0, nb_tracks = 0")
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
    async fn test_create_or_get_is_case_insensitive() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let a = Artist::create_or_get(&pool, "Daft Punk").await.unwrap();
        let b = Artist::create_or_get(&pool, "daft punk").await.unwrap();
        assert_eq!(a.id, b.id);
        assert!(!Artist::is_reserved(a.id));
    }

    #[tokio::test]
    async fn test_reserved_rows_survive_cleanup() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        Artist::create_or_get(&pool, "Someone").await.unwrap();
        Artist::drop_all_user_artists(&pool).await.unwrap();
        let remaining: Vec<(i64,)> = sqlx::query_as("SELECT id FROM artists ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(
            remaining,
            vec![(UNKNOWN_ARTIST_ID,), (VARIOUS_ARTISTS_ID,)]
        );
    }
}
