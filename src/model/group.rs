use sqlx::SqlitePool;

use crate::error::Result;

/// Media groups cluster videos sharing a title stem so sequels and
/// multi-part rips browse together.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MediaGroup {
    pub id: i64,
    pub name: String,
    pub nb_media: i64,
}

impl MediaGroup {
    pub async fn by_name(pool: &SqlitePool, name: &str) -> Result<Option<MediaGroup>> {
        let group = sqlx::query_as::<_, MediaGroup>(
            "SELECT id, name, nb_media FROM media_groups WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(pool)
        .await?;
        Ok(group)
    }

    /// Get or create the group for a sanitised title, and attach the media
    /// to it.
    pub async fn assign(pool: &SqlitePool, name: &str, media_id: i64) -> Result<MediaGroup> {
        let group = match Self::by_name(pool, name).await? {
            Some(group) => group,
            None => {
                let id = sqlx::query("INSERT INTO media_groups (name) VALUES (?)")
                    .bind(name)
                    .execute(pool)
                    .await?
                    .last_insert_rowid();
                MediaGroup {
                    id,
                    name: name.to_string(),
                    nb_media: 0,
                }
            }
        };
        let mut tx = pool.begin().await?;
        sqlx::query("UPDATE media SET group_id = ? WHERE id = ?")
            .bind(group.id)
            .bind(media_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE media_groups SET nb_media = nb_media + 1 WHERE id = ?")
            .bind(group.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect_in_memory, schema};
    use crate::model::media::{Media, MediaType};

    #[tokio::test]
    async fn test_assign_reuses_group() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let m1 = Media::create(&pool, MediaType::Video, "Alien", "alien.mkv")
            .await
            .unwrap();
        let m2 = Media::create(&pool, MediaType::Video, "Aliens", "aliens.mkv")
            .await
            .unwrap();
        let g1 = MediaGroup::assign(&pool, "Alien", m1.id).await.unwrap();
        let g2 = MediaGroup::assign(&pool, "Alien", m2.id).await.unwrap();
        assert_eq!(g1.id, g2.id);
        let (nb,): (i64,) = sqlx::query_as("SELECT nb_media FROM media_groups WHERE id = ?")
            .bind(g1.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(nb, 2);
    }
}
