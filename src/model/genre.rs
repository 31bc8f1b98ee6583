use sqlx::SqlitePool;

use crate::error::{is_unique_violation, Result};

/// Genres are lazily created; names are case-insensitively unique.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Genre {
    pub id: i64,
    pub name: String,
}

impl Genre {
    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Genre>> {
        let genre = sqlx::query_as::<_, Genre>("SELECT id, name FROM genres WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(genre)
    }

    pub async fn by_name(pool: &SqlitePool, name: &str) -> Result<Option<Genre>> {
        let genre = sqlx::query_as::<_, Genre>("SELECT id, name FROM genres WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
        Ok(genre)
    }

    pub async fn create_or_get(pool: &SqlitePool, name: &str) -> Result<Genre> {
        if let Some(genre) = Self::by_name(pool, name).await? {
            return Ok(genre);
        }
        match sqlx::query("INSERT INTO genres (name) VALUES (?)")
            .bind(name)
            .execute(pool)
            .await
        {
            Ok(done) => Ok(Genre {
                id: done.last_insert_rowid(),
                name: name.to_string(),
            }),
            Err(e) if is_unique_violation(&e) => {
                Self::by_name(pool, name)
                    .await?
                    .ok_or_else(|| crate::error::Error::NotFound {
                        target: "genre",
                        container: name.to_string(),
                    })
            }
            Err(e) => Err(e.into()),
        }
    }
}
