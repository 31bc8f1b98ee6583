use sqlx::SqlitePool;

use crate::error::Result;

/// An indexed folder. When the owning device is removable the stored mrl is
/// relative to the device mountpoint; the filesystem layer recomputes the
/// absolute form on access so a device remounted elsewhere keeps its rows.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Folder {
    pub id: i64,
    pub mrl: String,
    pub name: String,
    pub device_id: i64,
    pub parent_id: Option<i64>,
    pub last_modified: i64,
    pub is_present: bool,
    pub is_banned: bool,
    pub is_root: bool,
}

const COLUMNS: &str =
    "id, mrl, name, device_id, parent_id, last_modified, is_present, is_banned, is_root";

impl Folder {
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        pool: &SqlitePool,
        mrl: &str,
        name: &str,
        device_id: i64,
        parent_id: Option<i64>,
        last_modified: i64,
        is_root: bool,
    ) -> Result<Folder> {
        let id = sqlx::query(
            "INSERT INTO folders (mrl, name, device_id, parent_id, last_modified, is_root)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(mrl)
        .bind(name)
        .bind(device_id)
        .bind(parent_id)
        .bind(last_modified)
        .bind(is_root)
        .execute(pool)
        .await?
        .last_insert_rowid();
        Ok(Folder {
            id,
            mrl: mrl.to_string(),
            name: name.to_string(),
            device_id,
            parent_id,
            last_modified,
            is_present: true,
            is_banned: false,
            is_root,
        })
    }

    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Folder>> {
        let folder =
            sqlx::query_as::<_, Folder>(&format!("SELECT {COLUMNS} FROM folders WHERE id = ?"))
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(folder)
    }

    /// Lookup by stored mrl (relative for removable devices).
    pub async fn by_mrl(pool: &SqlitePool, device_id: i64, mrl: &str) -> Result<Option<Folder>> {
        let folder = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {COLUMNS} FROM folders WHERE device_id = ? AND mrl = ?"
        ))
        .bind(device_id)
        .bind(mrl)
        .fetch_optional(pool)
        .await?;
        Ok(folder)
    }

    /// Every non-banned root folder, regardless of presence: absent
    /// removable roots are skipped by the discoverer itself.
    pub async fn roots(pool: &SqlitePool) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {COLUMNS} FROM folders WHERE is_root = 1 AND is_banned = 0 ORDER BY id"
        ))
        .fetch_all(pool)
        .await?;
        Ok(folders)
    }

    pub async fn children(pool: &SqlitePool, parent_id: i64) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {COLUMNS} FROM folders WHERE parent_id = ? AND is_banned = 0 ORDER BY name"
        ))
        .bind(parent_id)
        .fetch_all(pool)
        .await?;
        Ok(folders)
    }

    pub async fn update_last_modified(pool: &SqlitePool, id: i64, last_modified: i64) -> Result<()> {
        sqlx::query("UPDATE folders SET last_modified = ? WHERE id = ?")
            .bind(last_modified)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Remove a folder and its whole subtree. Files cascade; media orphaned
    /// by the cascade are cleaned separately by the caller when needed.
    pub async fn remove(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Mark a folder banned. The row survives (so the ban is remembered)
    /// but its indexed content and subtree are dropped.
    pub async fn ban(pool: &SqlitePool, id: i64) -> Result<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("UPDATE folders SET is_banned = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM folders WHERE parent_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE folder_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn unban(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("UPDATE folders SET is_banned = 0 WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn banned_roots(pool: &SqlitePool) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {COLUMNS} FROM folders WHERE is_banned = 1 ORDER BY id"
        ))
        .fetch_all(pool)
        .await?;
        Ok(folders)
    }

    /// Remove media that lost their last file when a subtree went away.
    /// External media have no folder-backed file and survive.
    pub async fn cleanup_orphaned_media(pool: &SqlitePool) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM media WHERE is_external = 0 AND id NOT IN (
                SELECT media_id FROM files WHERE media_id IS NOT NULL
            )",
        )
        .execute(pool)
        .await?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect_in_memory, schema};
    use crate::model::device::Device;

    async fn setup() -> (SqlitePool, Device) {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let device = Device::create(&pool, "uuid-1", "file://", false, false)
            .await
            .unwrap();
        (pool, device)
    }

    #[tokio::test]
    async fn test_subtree_removal_cascades() {
        let (pool, device) = setup().await;
        let root = Folder::create(&pool, "file:///a/", "a", device.id, None, 0, true)
            .await
            .unwrap();
        let child = Folder::create(
            &pool,
            "file:///a/b/",
            "b",
            device.id,
            Some(root.id),
            0,
            false,
        )
        .await
        .unwrap();
        Folder::create(
            &pool,
            "file:///a/b/c/",
            "c",
            device.id,
            Some(child.id),
            0,
            false,
        )
        .await
        .unwrap();

        Folder::remove(&pool, root.id).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM folders")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_ban_keeps_row_drops_content() {
        let (pool, device) = setup().await;
        let root = Folder::create(&pool, "file:///a/", "a", device.id, None, 0, true)
            .await
            .unwrap();
        Folder::create(
            &pool,
            "file:///a/b/",
            "b",
            device.id,
            Some(root.id),
            0,
            false,
        )
        .await
        .unwrap();

        Folder::ban(&pool, root.id).await.unwrap();
        let banned = Folder::by_id(&pool, root.id).await.unwrap().unwrap();
        assert!(banned.is_banned);
        assert!(Folder::roots(&pool).await.unwrap().is_empty());
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM folders")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        Folder::unban(&pool, root.id).await.unwrap();
        assert_eq!(Folder::roots(&pool).await.unwrap().len(), 1);
    }
}
