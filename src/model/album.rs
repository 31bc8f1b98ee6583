use sqlx::SqlitePool;

use crate::error::Result;
use crate::model::media::MediaSubtype;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Album {
    pub id: i64,
    pub title: Option<String>,
    pub artist_id: Option<i64>,
    pub release_year: Option<i64>,
    pub nb_tracks: i64,
    pub nb_discs: i64,
    pub duration: i64,
}

const COLUMNS: &str = "id, title, artist_id, release_year, nb_tracks, nb_discs, duration";

impl Album {
    pub async fn create(
        pool: &SqlitePool,
        title: &str,
        artist_id: Option<i64>,
        release_year: Option<i64>,
    ) -> Result<Album> {
        let id = sqlx::query("INSERT INTO albums (title, artist_id, release_year) VALUES (?, ?, ?)")
            .bind(title)
            .bind(artist_id)
            .bind(release_year)
            .execute(pool)
            .await?
            .last_insert_rowid();
        Ok(Album {
            id,
            title: Some(title.to_string()),
            artist_id,
            release_year,
            nb_tracks: 0,
            nb_discs: 1,
            duration: 0,
        })
    }

    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Album>> {
        let album =
            sqlx::query_as::<_, Album>(&format!("SELECT {COLUMNS} FROM albums WHERE id = ?"))
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(album)
    }

    /// All albums carrying this title (case-insensitive), oldest first.
    pub async fn by_title(pool: &SqlitePool, title: &str) -> Result<Vec<Album>> {
        let albums = sqlx::query_as::<_, Album>(&format!(
            "SELECT {COLUMNS} FROM albums WHERE title = ? ORDER BY id"
        ))
        .bind(title)
        .fetch_all(pool)
        .await?;
        Ok(albums)
    }

    /// Attach a media as a track of this album and flip its subtype. The
    /// album counters are maintained in the same transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_track(
        pool: &SqlitePool,
        album_id: i64,
        media_id: i64,
        artist_id: Option<i64>,
        genre_id: Option<i64>,
        track_number: i64,
        disc_number: i64,
        duration: i64,
    ) -> Result<()> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            "INSERT INTO album_tracks (media_id, album_id, artist_id, genre_id, track_number,
                                       disc_number)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(media_id)
        .bind(album_id)
        .bind(artist_id)
        .bind(genre_id)
        .bind(track_number)
        .bind(disc_number)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE albums SET nb_tracks = nb_tracks + 1,
                               duration = duration + MAX(?, 0),
                               nb_discs = MAX(nb_discs, ?)
             WHERE id = ?",
        )
        .bind(duration)
        .bind(disc_number)
        .bind(album_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE media SET subtype = ? WHERE id = ?")
            .bind(MediaSubtype::AlbumTrack as i64)
            .bind(media_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_album_artist(pool: &SqlitePool, album_id: i64, artist_id: i64) -> Result<()> {
        sqlx::query("UPDATE albums SET artist_id = ? WHERE id = ?")
            .bind(artist_id)
            .bind(album_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// True when any track of the album sits on a disc other than the
    /// first; multi-disc albums may spread over sibling folders.
    pub async fn has_multiple_discs(pool: &SqlitePool, album_id: i64) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM album_tracks WHERE album_id = ? AND disc_number > 1",
        )
        .bind(album_id)
        .fetch_one(pool)
        .await?;
        Ok(row.0 > 0)
    }

    /// Number of album tracks whose main file lives in the given folder.
    pub async fn nb_tracks_in_folder(
        pool: &SqlitePool,
        album_id: i64,
        folder_id: i64,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM album_tracks at
             INNER JOIN files f ON f.media_id = at.media_id
             WHERE at.album_id = ? AND f.folder_id = ?",
        )
        .bind(album_id)
        .bind(folder_id)
        .fetch_one(pool)
        .await?;
        Ok(row.0)
    }

    /// Remove a media from its album, rolling the counters back. Used by
    /// the refresh path before relinking.
    pub async fn remove_track(pool: &SqlitePool, media_id: i64) -> Result<()> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT album_id FROM album_tracks WHERE media_id = ?")
                .bind(media_id)
                .fetch_optional(pool)
                .await?;
        let Some((album_id,)) = row else {
            return Ok(());
        };
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM album_tracks WHERE media_id = ?")
            .bind(media_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE albums SET nb_tracks = MAX(nb_tracks - 1, 0) WHERE id = ?")
            .bind(album_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
