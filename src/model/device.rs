use sqlx::SqlitePool;

use crate::error::Result;

/// A storage device sighted by a device lister. Removable devices may be
/// absent; their folders and media are retained but marked not present
/// until the device returns. Mountpoints are cached so the mrl of a
/// removable file can be recomputed after a remount.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub uuid: String,
    pub scheme: String,
    pub is_removable: bool,
    pub is_network: bool,
    pub is_present: bool,
    pub last_seen: i64,
}

impl Device {
    pub async fn create(
        pool: &SqlitePool,
        uuid: &str,
        scheme: &str,
        is_removable: bool,
        is_network: bool,
    ) -> Result<Device> {
        let now = super::timestamp();
        let id = sqlx::query(
            "INSERT INTO devices (uuid, scheme, is_removable, is_network, is_present, last_seen)
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(uuid)
        .bind(scheme)
        .bind(is_removable)
        .bind(is_network)
        .bind(now)
        .execute(pool)
        .await?
        .last_insert_rowid();
        Ok(Device {
            id,
            uuid: uuid.to_string(),
            scheme: scheme.to_string(),
            is_removable,
            is_network,
            is_present: true,
            last_seen: now,
        })
    }

    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, uuid, scheme, is_removable, is_network, is_present, last_seen
             FROM devices WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(device)
    }

    pub async fn by_uuid(pool: &SqlitePool, uuid: &str, scheme: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, uuid, scheme, is_removable, is_network, is_present, last_seen
             FROM devices WHERE uuid = ? AND scheme = ?",
        )
        .bind(uuid)
        .bind(scheme)
        .fetch_optional(pool)
        .await?;
        Ok(device)
    }

    /// Flip the presence of a device and propagate it to its folders and
    /// their media, per the invariant `Folder.present == Device.present`.
    pub async fn set_present(pool: &SqlitePool, id: i64, present: bool) -> Result<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("UPDATE devices SET is_present = ?, last_seen = ? WHERE id = ?")
            .bind(present)
            .bind(super::timestamp())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE folders SET is_present = ? WHERE device_id = ?")
            .bind(present)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE media SET is_present = ? WHERE id IN (
                SELECT f.media_id FROM files f
                INNER JOIN folders fo ON fo.id = f.folder_id
                WHERE fo.device_id = ? AND f.media_id IS NOT NULL
            )",
        )
        .bind(present)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_last_seen(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("UPDATE devices SET last_seen = ? WHERE id = ?")
            .bind(super::timestamp())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Remember a mountpoint for this device. Mountpoint rows keep their
    /// insertion order, which is the deterministic tiebreak when several
    /// cached mountpoints match an mrl with equal prefix length.
    pub async fn add_mountpoint(pool: &SqlitePool, id: i64, mountpoint: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO device_mountpoints (device_id, mrl, last_seen) VALUES (?, ?, ?)
             ON CONFLICT(device_id, mrl) DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(id)
        .bind(mountpoint)
        .bind(super::timestamp())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Cached mountpoints in insertion order.
    pub async fn cached_mountpoints(pool: &SqlitePool, id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT mrl FROM device_mountpoints WHERE device_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(mrl,)| mrl).collect())
    }

    /// Drop removable devices unseen for longer than the TTL. Their folders
    /// and files cascade away.
    pub async fn prune_outdated(pool: &SqlitePool, ttl_secs: i64) -> Result<u64> {
        let cutoff = super::timestamp() - ttl_secs;
        let res = sqlx::query(
            "DELETE FROM devices WHERE is_removable = 1 AND is_present = 0 AND last_seen < ?",
        )
        .bind(cutoff)
        .execute(pool)
        .await?;
        if res.rows_affected() > 0 {
            tracing::info!("Pruned {} outdated device(s)", res.rows_affected());
        }
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect_in_memory, schema};

    async fn setup() -> SqlitePool {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let pool = setup().await;
        let device = Device::create(&pool, "uuid-1", "file://", true, false)
            .await
            .unwrap();
        let found = Device::by_uuid(&pool, "uuid-1", "file://").await.unwrap();
        assert_eq!(found.unwrap().id, device.id);
        assert!(Device::by_uuid(&pool, "uuid-1", "smb://")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_presence_propagates_to_folders() {
        let pool = setup().await;
        let device = Device::create(&pool, "uuid-1", "file://", true, false)
            .await
            .unwrap();
        sqlx::query("INSERT INTO folders (mrl, name, device_id) VALUES ('sub/', 'sub', ?)")
            .bind(device.id)
            .execute(&pool)
            .await
            .unwrap();

        Device::set_present(&pool, device.id, false).await.unwrap();
        let (present,): (bool,) = sqlx::query_as("SELECT is_present FROM folders")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(!present);

        Device::set_present(&pool, device.id, true).await.unwrap();
        let (present,): (bool,) = sqlx::query_as("SELECT is_present FROM folders")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(present);
    }

    #[tokio::test]
    async fn test_mountpoints_keep_insertion_order() {
        let pool = setup().await;
        let device = Device::create(&pool, "uuid-1", "file://", true, false)
            .await
            .unwrap();
        Device::add_mountpoint(&pool, device.id, "file:///mnt/a/")
            .await
            .unwrap();
        Device::add_mountpoint(&pool, device.id, "file:///mnt/b/")
            .await
            .unwrap();
        // Re-adding must not change the order.
        Device::add_mountpoint(&pool, device.id, "file:///mnt/a/")
            .await
            .unwrap();
        let mountpoints = Device::cached_mountpoints(&pool, device.id).await.unwrap();
        assert_eq!(mountpoints, vec!["file:///mnt/a/", "file:///mnt/b/"]);
    }

    #[tokio::test]
    async fn test_prune_only_absent_removable() {
        let pool = setup().await;
        let gone = Device::create(&pool, "gone", "file://", true, false)
            .await
            .unwrap();
        Device::create(&pool, "present", "file://", true, false)
            .await
            .unwrap();
        sqlx::query("UPDATE devices SET is_present = 0, last_seen = 0 WHERE id = ?")
            .bind(gone.id)
            .execute(&pool)
            .await
            .unwrap();
        let pruned = Device::prune_outdated(&pool, 60).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(Device::by_uuid(&pool, "gone", "file://")
            .await
            .unwrap()
            .is_none());
    }
}
