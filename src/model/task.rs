use sqlx::SqlitePool;

use crate::error::{is_unique_violation, Result};
use crate::model::file::FileType;

/// One bit per parser service; a bit turns on when the service completed
/// for this task and never turns back off (except through
/// [`Task::reset_parsing`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    MetadataExtraction = 1,
    MetadataAnalysis = 2,
    Linking = 4,
}

/// Every required step.
pub const STEP_ALL: i64 = Step::MetadataExtraction as i64
    | Step::MetadataAnalysis as i64
    | Step::Linking as i64;

/// How many times a task may fail with a fatal error before it is
/// permanently discarded.
pub const MAX_RETRIES: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Creation = 1,
    Refresh = 2,
    Link = 3,
    Restore = 4,
}

impl TaskType {
    pub fn from_i64(value: i64) -> TaskType {
        match value {
            2 => TaskType::Refresh,
            3 => TaskType::Link,
            4 => TaskType::Restore,
            _ => TaskType::Creation,
        }
    }
}

/// Target of a Link task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    NoLink = 0,
    /// Add a media to a playlist; `link_extra` is the 0-based index.
    Playlist = 1,
    /// Attach a file (subtitle, soundtrack) to an existing media;
    /// `link_extra` carries the file type.
    Media = 2,
    /// Add a media to a subscription.
    Subscription = 3,
}

impl LinkType {
    pub fn from_i64(value: i64) -> LinkType {
        match value {
            1 => LinkType::Playlist,
            2 => LinkType::Media,
            3 => LinkType::Subscription,
            _ => LinkType::NoLink,
        }
    }
}

/// A unit of durable ingestion work. Tasks are idempotent and survive
/// crashes: the pipeline resumes from the first unset step bit.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub task_type: i64,
    pub step: i64,
    pub retry_count: i64,
    pub mrl: Option<String>,
    pub file_type: i64,
    pub file_id: Option<i64>,
    pub parent_folder_id: Option<i64>,
    pub is_completed: bool,
    pub link_to_type: i64,
    pub link_to_id: i64,
    pub link_extra: i64,
}

const COLUMNS: &str = "id, type, step, retry_count, mrl, file_type, file_id, parent_folder_id, \
                       is_completed, link_to_type, link_to_id, link_extra";

impl Task {
    pub fn task_type(&self) -> TaskType {
        TaskType::from_i64(self.task_type)
    }

    pub fn link_type(&self) -> LinkType {
        LinkType::from_i64(self.link_to_type)
    }

    pub fn has_step(&self, step: Step) -> bool {
        self.step & step as i64 != 0
    }

    pub fn all_steps_done(&self) -> bool {
        self.is_completed || self.step & STEP_ALL == STEP_ALL
    }

    /// Schedule the ingestion of a newly discovered file. Returns `None`
    /// when an identical task is already scheduled (unique violation on
    /// `(mrl, parent_folder_id)`).
    pub async fn create(
        pool: &SqlitePool,
        mrl: &str,
        file_type: FileType,
        parent_folder_id: i64,
    ) -> Result<Option<Task>> {
        let res = sqlx::query(
            "INSERT INTO tasks (type, mrl, file_type, parent_folder_id) VALUES (?, ?, ?, ?)",
        )
        .bind(TaskType::Creation as i64)
        .bind(mrl)
        .bind(file_type as i64)
        .bind(parent_folder_id)
        .execute(pool)
        .await;
        match res {
            Ok(done) => Ok(Self::by_id(pool, done.last_insert_rowid()).await?),
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!("Task for {} already scheduled", mrl);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Schedule a re-parse of a file whose last-modified changed.
    pub async fn create_refresh(pool: &SqlitePool, file_id: i64, mrl: &str) -> Result<Option<Task>> {
        let res = sqlx::query("INSERT INTO tasks (type, mrl, file_id) VALUES (?, ?, ?)")
            .bind(TaskType::Refresh as i64)
            .bind(mrl)
            .bind(file_id)
            .execute(pool)
            .await;
        match res {
            Ok(done) => Ok(Self::by_id(pool, done.last_insert_rowid()).await?),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Schedule a deferred association, unique over
    /// `(link type, target, extra, mrl)`. The parent folder is recorded
    /// when known so the association can be resolved within it.
    pub async fn create_link(
        pool: &SqlitePool,
        link_type: LinkType,
        link_to_id: i64,
        link_extra: i64,
        mrl: &str,
        parent_folder_id: Option<i64>,
    ) -> Result<Option<Task>> {
        let res = sqlx::query(
            "INSERT INTO tasks (type, mrl, link_to_type, link_to_id, link_extra,
                                parent_folder_id)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(TaskType::Link as i64)
        .bind(mrl)
        .bind(link_type as i64)
        .bind(link_to_id)
        .bind(link_extra)
        .bind(parent_folder_id)
        .execute(pool)
        .await;
        match res {
            Ok(done) => Ok(Self::by_id(pool, done.last_insert_rowid()).await?),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Restore a playlist backup produced by a destructive migration.
    pub async fn create_restore(pool: &SqlitePool, backup_mrl: &str) -> Result<Option<Task>> {
        let done = sqlx::query("INSERT INTO tasks (type, mrl) VALUES (?, ?)")
            .bind(TaskType::Restore as i64)
            .bind(backup_mrl)
            .execute(pool)
            .await?;
        Self::by_id(pool, done.last_insert_rowid()).await
    }

    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(&format!("SELECT {COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(task)
    }

    /// Claim the next runnable tasks, skipping ids already held by another
    /// worker.
    pub async fn fetch_runnable(
        pool: &SqlitePool,
        exclude: &[i64],
        limit: i64,
    ) -> Result<Vec<Task>> {
        // The exclusion set is tiny (one id per in-flight worker).
        let placeholders = if exclude.is_empty() {
            "-1".to_string()
        } else {
            exclude
                .iter()
                .map(|_| "?")
                .collect::<Vec<_>>()
                .join(", ")
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM tasks
             WHERE is_completed = 0 AND retry_count < ? AND id NOT IN ({placeholders})
             ORDER BY id LIMIT ?"
        );
        let mut query = sqlx::query_as::<_, Task>(&sql).bind(MAX_RETRIES);
        for id in exclude {
            query = query.bind(id);
        }
        let tasks = query.bind(limit).fetch_all(pool).await?;
        Ok(tasks)
    }

    pub async fn count_incomplete(pool: &SqlitePool) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE is_completed = 0 AND retry_count < ?",
        )
        .bind(MAX_RETRIES)
        .fetch_one(pool)
        .await?;
        Ok(row.0)
    }

    /// Record a completed step; bits only turn on.
    pub async fn add_step(pool: &SqlitePool, id: i64, step: Step) -> Result<()> {
        sqlx::query("UPDATE tasks SET step = step | ? WHERE id = ?")
            .bind(step as i64)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("UPDATE tasks SET is_completed = 1 WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_file_id(pool: &SqlitePool, id: i64, file_id: i64) -> Result<()> {
        sqlx::query("UPDATE tasks SET file_id = ? WHERE id = ?")
            .bind(file_id)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Bump the retry counter, returning the new value.
    pub async fn bump_retry_count(pool: &SqlitePool, id: i64) -> Result<i64> {
        sqlx::query("UPDATE tasks SET retry_count = retry_count + 1 WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        let row: (i64,) = sqlx::query_as("SELECT retry_count FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await?;
        Ok(row.0)
    }

    pub async fn remove(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Move a task to the tail of the queue for a transient condition:
    /// same content, fresh id, persisted step bits kept.
    pub async fn requeue(pool: &SqlitePool, id: i64) -> Result<()> {
        let mut tx = pool.begin().await?;
        let task = sqlx::query_as::<_, Task>(&format!("SELECT {COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(task) = task else {
            return Ok(());
        };
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO tasks (type, step, retry_count, mrl, file_type, file_id,
                                parent_folder_id, link_to_type, link_to_id, link_extra)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.task_type)
        .bind(task.step)
        .bind(task.retry_count)
        .bind(task.mrl.as_deref())
        .bind(task.file_type)
        .bind(task.file_id)
        .bind(task.parent_folder_id)
        .bind(task.link_to_type)
        .bind(task.link_to_id)
        .bind(task.link_extra)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Clear every step bit; used when forcing a rescan.
    pub async fn reset_parsing(pool: &SqlitePool) -> Result<()> {
        sqlx::query("UPDATE tasks SET step = 0, retry_count = 0, is_completed = 0")
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Give previously failed tasks one more chance.
    pub async fn reset_retry_count(pool: &SqlitePool) -> Result<()> {
        sqlx::query("UPDATE tasks SET retry_count = 0 WHERE retry_count >= ?")
            .bind(MAX_RETRIES)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Drop the pending Link tasks of a playlist being refreshed.
    pub async fn remove_playlist_content_tasks(
        pool: &SqlitePool,
        playlist_id: i64,
    ) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM tasks WHERE type = ? AND link_to_type = ? AND link_to_id = ?",
        )
        .bind(TaskType::Link as i64)
        .bind(LinkType::Playlist as i64)
        .bind(playlist_id)
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
    use crate::model::folder::Folder;

    async fn setup() -> (SqlitePool, Folder) {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let device = Device::create(&pool, "u", "file://", false, false)
            .await
            .unwrap();
        let folder = Folder::create(&pool, "file:///root/", "root", device.id, None, 0, true)
            .await
            .unwrap();
        (pool, folder)
    }

    #[tokio::test]
    async fn test_duplicate_creation_reports_already_scheduled() {
        let (pool, folder) = setup().await;
        let task = Task::create(&pool, "file:///root/a.mkv", FileType::Main, folder.id)
            .await
            .unwrap();
        assert!(task.is_some());
        let dup = Task::create(&pool, "file:///root/a.mkv", FileType::Main, folder.id)
            .await
            .unwrap();
        assert!(dup.is_none());
        assert_eq!(Task::count_incomplete(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_link_uniqueness() {
        let (pool, _) = setup().await;
        let t = Task::create_link(&pool, LinkType::Playlist, 7, 0, "file:///root/a.mp3", None)
            .await
            .unwrap();
        assert!(t.is_some());
        let dup = Task::create_link(&pool, LinkType::Playlist, 7, 0, "file:///root/a.mp3", None)
            .await
            .unwrap();
        assert!(dup.is_none());
        // A different index is a different association.
        let other = Task::create_link(&pool, LinkType::Playlist, 7, 1, "file:///root/a.mp3", None)
            .await
            .unwrap();
        assert!(other.is_some());
    }

    #[tokio::test]
    async fn test_steps_are_monotonic() {
        let (pool, folder) = setup().await;
        let task = Task::create(&pool, "file:///root/a.mkv", FileType::Main, folder.id)
            .await
            .unwrap()
            .unwrap();
        Task::add_step(&pool, task.id, Step::MetadataExtraction)
            .await
            .unwrap();
        Task::add_step(&pool, task.id, Step::Linking).await.unwrap();
        let task = Task::by_id(&pool, task.id).await.unwrap().unwrap();
        assert!(task.has_step(Step::MetadataExtraction));
        assert!(task.has_step(Step::Linking));
        assert!(!task.has_step(Step::MetadataAnalysis));
        assert!(!task.all_steps_done());
        Task::add_step(&pool, task.id, Step::MetadataAnalysis)
            .await
            .unwrap();
        let task = Task::by_id(&pool, task.id).await.unwrap().unwrap();
        assert!(task.all_steps_done());
    }

    #[tokio::test]
    async fn test_retry_threshold_excludes_task() {
        let (pool, folder) = setup().await;
        let task = Task::create(&pool, "file:///root/a.mkv", FileType::Main, folder.id)
            .await
            .unwrap()
            .unwrap();
        for _ in 0..MAX_RETRIES {
            Task::bump_retry_count(&pool, task.id).await.unwrap();
        }
        assert!(Task::fetch_runnable(&pool, &[], 10).await.unwrap().is_empty());
        Task::reset_retry_count(&pool).await.unwrap();
        assert_eq!(Task::fetch_runnable(&pool, &[], 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_parsing_clears_bitmap() {
        let (pool, folder) = setup().await;
        let task = Task::create(&pool, "file:///root/a.mkv", FileType::Main, folder.id)
            .await
            .unwrap()
            .unwrap();
        Task::add_step(&pool, task.id, Step::MetadataExtraction)
            .await
            .unwrap();
        Task::reset_parsing(&pool).await.unwrap();
        let task = Task::by_id(&pool, task.id).await.unwrap().unwrap();
        assert_eq!(task.step, 0);
    }

    #[tokio::test]
    async fn test_remove_playlist_content_tasks() {
        let (pool, _) = setup().await;
        Task::create_link(&pool, LinkType::Playlist, 3, 0, "file:///a.mp3", None)
            .await
            .unwrap();
        Task::create_link(&pool, LinkType::Playlist, 3, 1, "file:///b.mp3", None)
            .await
            .unwrap();
        Task::create_link(&pool, LinkType::Subscription, 3, 0, "file:///c.mp3", None)
            .await
            .unwrap();
        let removed = Task::remove_playlist_content_tasks(&pool, 3).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(Task::count_incomplete(&pool).await.unwrap(), 1);
    }
}
