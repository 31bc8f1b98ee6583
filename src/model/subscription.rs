use sqlx::SqlitePool;

use crate::error::Result;
use crate::model::file::File;

/// A feed-like source (podcast, channel) whose items become external media
/// plus an optional local cache bounded by `max_cached_media`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub service: String,
    pub name: String,
    pub artwork_mrl: Option<String>,
    pub max_cached_media: i64,
    pub new_media_notify: bool,
}

const COLUMNS: &str = "id, service, name, artwork_mrl, max_cached_media, new_media_notify";

impl Subscription {
    pub async fn create(
        pool: &SqlitePool,
        service: &str,
        name: &str,
        artwork_mrl: Option<&str>,
    ) -> Result<Subscription> {
        let id = sqlx::query(
            "INSERT INTO subscriptions (service, name, artwork_mrl) VALUES (?, ?, ?)",
        )
        .bind(service)
        .bind(name)
        .bind(artwork_mrl)
        .execute(pool)
        .await?
        .last_insert_rowid();
        Ok(Subscription {
            id,
            service: service.to_string(),
            name: name.to_string(),
            artwork_mrl: artwork_mrl.map(String::from),
            max_cached_media: -1,
            new_media_notify: true,
        })
    }

    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {COLUMNS} FROM subscriptions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(subscription)
    }

    pub async fn by_file(pool: &SqlitePool, file_id: i64) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT s.{} FROM subscriptions s
             INNER JOIN files f ON f.subscription_id = s.id
             WHERE f.id = ?",
            COLUMNS.replace(", ", ", s.")
        ))
        .bind(file_id)
        .fetch_optional(pool)
        .await?;
        Ok(subscription)
    }

    pub async fn all(pool: &SqlitePool) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {COLUMNS} FROM subscriptions ORDER BY id"
        ))
        .fetch_all(pool)
        .await?;
        Ok(subscriptions)
    }

    pub async fn add_media(pool: &SqlitePool, subscription_id: i64, media_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO subscription_media (subscription_id, media_id) VALUES (?, ?)",
        )
        .bind(subscription_id)
        .bind(media_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_max_cached_media(pool: &SqlitePool, id: i64, max: i64) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET max_cached_media = ? WHERE id = ?")
            .bind(max)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_new_media_handled(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET new_media_notify = 0 WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Main files of the subscription's media, oldest imports first; the
    /// cache worker fills the per-subscription quota in that order.
    pub async fn media_files(pool: &SqlitePool, subscription_id: i64) -> Result<Vec<File>> {
        let files = sqlx::query_as::<_, File>(
            "SELECT f.id, f.media_id, f.playlist_id, f.subscription_id, f.folder_id, f.mrl,
                    f.file_type, f.last_modified, f.size, f.is_removable, f.is_external,
                    f.is_network, f.is_cached, f.cache_mrl, f.cache_size, f.cached_at
             FROM files f
             INNER JOIN subscription_media sm ON sm.media_id = f.media_id
             INNER JOIN media m ON m.id = f.media_id
             WHERE sm.subscription_id = ?
             ORDER BY m.import_date, m.id",
        )
        .bind(subscription_id)
        .fetch_all(pool)
        .await?;
        Ok(files)
    }

    pub async fn cached_count(pool: &SqlitePool, subscription_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM files f
             INNER JOIN subscription_media sm ON sm.media_id = f.media_id
             WHERE sm.subscription_id = ? AND f.is_cached = 1",
        )
        .bind(subscription_id)
        .fetch_one(pool)
        .await?;
        Ok(row.0)
    }

    /// Oldest cached file of the subscription, the eviction victim.
    pub async fn oldest_cached(pool: &SqlitePool, subscription_id: i64) -> Result<Option<File>> {
        let file = sqlx::query_as::<_, File>(
            "SELECT f.id, f.media_id, f.playlist_id, f.subscription_id, f.folder_id, f.mrl,
                    f.file_type, f.last_modified, f.size, f.is_removable, f.is_external,
                    f.is_network, f.is_cached, f.cache_mrl, f.cache_size, f.cached_at
             FROM files f
             INNER JOIN subscription_media sm ON sm.media_id = f.media_id
             WHERE sm.subscription_id = ? AND f.is_cached = 1
             ORDER BY f.cached_at, f.id LIMIT 1",
        )
        .bind(subscription_id)
        .fetch_optional(pool)
        .await?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect_in_memory, schema};
    use crate::model::media::Media;

    #[tokio::test]
    async fn test_media_membership() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let sub = Subscription::create(&pool, "podcast", "Some Feed", None)
            .await
            .unwrap();
        let m = Media::create_external(&pool, "https://feed/ep1.mp3", "ep1", None)
            .await
            .unwrap();
        Subscription::add_media(&pool, sub.id, m.id).await.unwrap();
        // Idempotent.
        Subscription::add_media(&pool, sub.id, m.id).await.unwrap();
        let files = Subscription::media_files(&pool, sub.id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(Subscription::cached_count(&pool, sub.id).await.unwrap(), 0);
    }
}
