use sqlx::SqlitePool;

use crate::db::schema::UNKNOWN_SHOW_ID;
use crate::error::Result;
use crate::model::media::MediaSubtype;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Show {
    pub id: i64,
    pub title: Option<String>,
    pub tvdb_id: Option<String>,
    pub release_date: Option<i64>,
    pub summary: Option<String>,
    pub nb_episodes: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ShowEpisode {
    pub media_id: i64,
    pub show_id: i64,
    pub season_number: i64,
    pub episode_number: i64,
    pub title: Option<String>,
}

const COLUMNS: &str = "id, title, tvdb_id, release_date, summary, nb_episodes";

impl Show {
    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Show>> {
        let show = sqlx::query_as::<_, Show>(&format!("SELECT {COLUMNS} FROM shows WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(show)
    }

    /// Find or create a show by title. An empty title resolves to the
    /// reserved *Unknown Show* row.
    pub async fn create_or_get(pool: &SqlitePool, title: &str) -> Result<Show> {
        if title.is_empty() {
            return Self::by_id(pool, UNKNOWN_SHOW_ID)
                .await?
                .ok_or(crate::error::Error::NotFound {
                    target: "show",
                    container: "reserved rows".to_string(),
                });
        }
        let existing = sqlx::query_as::<_, Show>(&format!(
            "SELECT {COLUMNS} FROM shows WHERE title = ? COLLATE NOCASE"
        ))
        .bind(title)
        .fetch_optional(pool)
        .await?;
        if let Some(show) = existing {
            return Ok(show);
        }
        let id = sqlx::query("INSERT INTO shows (title) VALUES (?)")
            .bind(title)
            .execute(pool)
            .await?
            .last_insert_rowid();
        Ok(Show {
            id,
            title: Some(title.to_string()),
            tvdb_id: None,
            release_date: None,
            summary: None,
            nb_episodes: 0,
        })
    }

    /// Attach a media as an episode; each episode belongs to exactly one
    /// show so a pre-existing attachment is replaced.
    pub async fn add_episode(
        pool: &SqlitePool,
        show_id: i64,
        media_id: i64,
        season: i64,
        episode: i64,
        title: Option<&str>,
    ) -> Result<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM show_episodes WHERE media_id = ?")
            .bind(media_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO show_episodes (media_id, show_id, season_number, episode_number, title)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(media_id)
        .bind(show_id)
        .bind(season)
        .bind(episode)
        .bind(title)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE shows SET nb_episodes = nb_episodes + 1 WHERE id = ?")
            .bind(show_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE media SET subtype = ? WHERE id = ?")
            .bind(MediaSubtype::ShowEpisode as i64)
            .bind(media_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn episode_for_media(
        pool: &SqlitePool,
        media_id: i64,
    ) -> Result<Option<ShowEpisode>> {
        let episode = sqlx::query_as::<_, ShowEpisode>(
            "SELECT media_id, show_id, season_number, episode_number, title
             FROM show_episodes WHERE media_id = ?",
        )
        .bind(media_id)
        .fetch_optional(pool)
        .await?;
        Ok(episode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect_in_memory, schema};
    use crate::model::media::{Media, MediaType};

    #[tokio::test]
    async fn test_empty_title_resolves_to_unknown_show() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let show = Show::create_or_get(&pool, "").await.unwrap();
        assert_eq!(show.id, UNKNOWN_SHOW_ID);
    }

    #[tokio::test]
    async fn test_episode_attachment() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let show = Show::create_or_get(&pool, "Some Show").await.unwrap();
        let media = Media::create(&pool, MediaType::Video, "ep", "ep.mkv").await.unwrap();
        Show::add_episode(&pool, show.id, media.id, 1, 5, Some("Pilot v2"))
            .await
            .unwrap();

        let episode = Show::episode_for_media(&pool, media.id).await.unwrap().unwrap();
        assert_eq!(episode.season_number, 1);
        assert_eq!(episode.episode_number, 5);
        let media = Media::by_id(&pool, media.id).await.unwrap().unwrap();
        assert_eq!(media.subtype(), MediaSubtype::ShowEpisode);
        let show = Show::by_id(&pool, show.id).await.unwrap().unwrap();
        assert_eq!(show.nb_episodes, 1);
    }
}
