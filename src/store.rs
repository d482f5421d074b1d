//! Durable task and user records.
//!
//! Every operation opens its own SQLite connection on the blocking pool and
//! drops it when the operation returns, error paths included.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub subscription_expiry: DateTime<Utc>,
    /// The expiry callback already ran for the current expiry.
    pub expiry_notified: bool,
}

impl User {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.subscription_expiry > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub url: String,
    pub cadence_minutes: u32,
    /// Item ids seen at the last successful check, newest first.
    pub last_seen_cursor: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub owner_id: i64,
    pub name: String,
    pub url: String,
    pub cadence_minutes: u32,
    pub cursor: Vec<i64>,
}

#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: NewTask) -> Result<i64>;
    async fn get(&self, id: i64) -> Result<Option<Task>>;
    async fn list_by_owner(&self, owner_id: i64) -> Result<Vec<Task>>;
    async fn list_all(&self) -> Result<Vec<Task>>;
    /// Replace the cursor. `false` when the task no longer exists.
    async fn update_cursor(&self, id: i64, ids: &[i64]) -> Result<bool>;
    async fn delete(&self, id: i64) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new user. `false` when the id is already taken.
    async fn create(&self, user: &User) -> Result<bool>;
    async fn get(&self, id: i64) -> Result<Option<User>>;
    async fn list_all(&self) -> Result<Vec<User>>;
    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<User>>;
    /// Push expiry to `max(expiry, now) + days` and re-arm the expiry notice.
    async fn extend_expiry(
        &self,
        id: i64,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;
    async fn mark_expiry_notified(&self, id: i64) -> Result<bool>;
}

/// Handle on the SQLite database file shared by both stores.
#[derive(Clone)]
pub struct Db {
    path: Arc<PathBuf>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db dir: {}", parent.display()))?;
        }
        init_db(&path)?;
        Ok(Self {
            path: Arc::new(path),
        })
    }

    pub fn tasks(&self) -> SqliteTaskStore {
        SqliteTaskStore { db: self.clone() }
    }

    pub fn users(&self) -> SqliteUserStore {
        SqliteUserStore { db: self.clone() }
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = Arc::clone(&self.path);
        let out = tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = connect(&path)?;
            op(&mut conn)
        })
        .await??;
        Ok(out)
    }
}

fn connect(path: &Path) -> Result<Connection> {
    let conn =
        Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn init_db(path: &Path) -> Result<()> {
    let conn = connect(path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS users (
          id INTEGER PRIMARY KEY,
          subscription_till INTEGER NOT NULL,
          expiry_notified INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS tasks (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          owner_id INTEGER NOT NULL,
          name TEXT NOT NULL,
          url TEXT NOT NULL,
          cadence_minutes INTEGER NOT NULL CHECK (cadence_minutes > 0),
          last_items TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS tasks_owner ON tasks(owner_id);
        "#,
    )
    .context("init schema")?;
    Ok(())
}

#[derive(Clone)]
pub struct SqliteTaskStore {
    db: Db,
}

const TASK_COLUMNS: &str = "id, owner_id, name, url, cadence_minutes, last_items";

/// Task row with the cursor still serialized.
struct TaskRow {
    id: i64,
    owner_id: i64,
    name: String,
    url: String,
    cadence_minutes: u32,
    last_items: String,
}

impl TaskRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            owner_id: r.get(1)?,
            name: r.get(2)?,
            url: r.get(3)?,
            cadence_minutes: r.get(4)?,
            last_items: r.get(5)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let last_seen_cursor = serde_json::from_str(&self.last_items)
            .with_context(|| format!("parse cursor of task {}", self.id))?;
        Ok(Task {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            url: self.url,
            cadence_minutes: self.cadence_minutes,
            last_seen_cursor,
        })
    }
}

fn query_tasks(
    conn: &Connection,
    filter: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks {filter} ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map(args, TaskRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

#[async_trait::async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: NewTask) -> Result<i64> {
        let cursor = serde_json::to_string(&task.cursor).context("serialize cursor")?;
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (owner_id, name, url, cadence_minutes, last_items) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![task.owner_id, task.name, task.url, task.cadence_minutes, cursor],
                )
                .context("insert task")?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    async fn get(&self, id: i64) -> Result<Option<Task>> {
        self.db
            .run(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                        params![id],
                        TaskRow::from_row,
                    )
                    .optional()?;
                row.map(TaskRow::into_task).transpose()
            })
            .await
    }

    async fn list_by_owner(&self, owner_id: i64) -> Result<Vec<Task>> {
        self.db
            .run(move |conn| query_tasks(conn, "WHERE owner_id = ?1", params![owner_id]))
            .await
    }

    async fn list_all(&self) -> Result<Vec<Task>> {
        self.db.run(|conn| query_tasks(conn, "", [])).await
    }

    async fn update_cursor(&self, id: i64, ids: &[i64]) -> Result<bool> {
        let cursor = serde_json::to_string(ids).context("serialize cursor")?;
        self.db
            .run(move |conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET last_items = ?1 WHERE id = ?2",
                    params![cursor, id],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        self.db
            .run(move |conn| {
                let changed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
                Ok(changed > 0)
            })
            .await
    }
}

#[derive(Clone)]
pub struct SqliteUserStore {
    db: Db,
}

fn user_from_row(r: &Row<'_>) -> rusqlite::Result<(i64, i64, bool)> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?))
}

fn into_user((id, till, expiry_notified): (i64, i64, bool)) -> Result<User> {
    let subscription_expiry = DateTime::from_timestamp(till, 0)
        .with_context(|| format!("user {id} has out-of-range expiry {till}"))?;
    Ok(User {
        id,
        subscription_expiry,
        expiry_notified,
    })
}

fn query_users(
    conn: &Connection,
    filter: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, subscription_till, expiry_notified FROM users {filter} ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map(args, user_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(into_user).collect()
}

#[async_trait::async_trait]
impl UserStore for SqliteUserStore {
    async fn create(&self, user: &User) -> Result<bool> {
        let (id, till, notified) = (
            user.id,
            user.subscription_expiry.timestamp(),
            user.expiry_notified,
        );
        self.db
            .run(move |conn| {
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO users (id, subscription_till, expiry_notified) VALUES (?1, ?2, ?3)",
                    params![id, till, notified],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn get(&self, id: i64) -> Result<Option<User>> {
        self.db
            .run(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, subscription_till, expiry_notified FROM users WHERE id = ?1",
                        params![id],
                        user_from_row,
                    )
                    .optional()?;
                row.map(into_user).transpose()
            })
            .await
    }

    async fn list_all(&self) -> Result<Vec<User>> {
        self.db.run(|conn| query_users(conn, "", [])).await
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<User>> {
        let now = now.timestamp();
        self.db
            .run(move |conn| query_users(conn, "WHERE subscription_till > ?1", params![now]))
            .await
    }

    async fn extend_expiry(
        &self,
        id: i64,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<i64> = tx
                    .query_row(
                        "SELECT subscription_till FROM users WHERE id = ?1",
                        params![id],
                        |r| r.get(0),
                    )
                    .optional()?;
                let Some(current) = current else {
                    return Ok(None);
                };
                let current = DateTime::from_timestamp(current, 0)
                    .with_context(|| format!("user {id} has out-of-range expiry {current}"))?;
                let extended = TimeDelta::try_days(i64::from(days))
                    .and_then(|span| current.max(now).checked_add_signed(span))
                    .with_context(|| format!("extending user {id} by {days} days overflows"))?;
                tx.execute(
                    "UPDATE users SET subscription_till = ?1, expiry_notified = 0 WHERE id = ?2",
                    params![extended.timestamp(), id],
                )?;
                tx.commit()?;
                Ok(Some(extended))
            })
            .await
    }

    async fn mark_expiry_notified(&self, id: i64) -> Result<bool> {
        self.db
            .run(move |conn| {
                let changed = conn.execute(
                    "UPDATE users SET expiry_notified = 1 WHERE id = ?1",
                    params![id],
                )?;
                Ok(changed > 0)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn open_temp() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("nested/listwatch.sqlite")).unwrap();
        (dir, db)
    }

    fn new_task(owner_id: i64, cursor: &[i64]) -> NewTask {
        NewTask {
            owner_id,
            name: "2 rooms Yasamal".into(),
            url: "https://bina.az/baki/kiraye/menziller".into(),
            cadence_minutes: 5,
            cursor: cursor.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_task_crud() {
        let (_dir, db) = open_temp();
        let tasks = db.tasks();

        let a = tasks.create(new_task(1, &[103, 102, 101])).await.unwrap();
        let b = tasks.create(new_task(2, &[7])).await.unwrap();
        let c = tasks.create(new_task(1, &[9])).await.unwrap();
        assert!(a < b && b < c);

        let task = tasks.get(a).await.unwrap().unwrap();
        assert_eq!(task.owner_id, 1);
        assert_eq!(task.cadence_minutes, 5);
        assert_eq!(task.last_seen_cursor, vec![103, 102, 101]);

        let owned: Vec<i64> = tasks.list_by_owner(1).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(owned, vec![a, c]);
        assert_eq!(tasks.list_all().await.unwrap().len(), 3);

        assert!(tasks.update_cursor(a, &[105, 104, 103]).await.unwrap());
        assert_eq!(
            tasks.get(a).await.unwrap().unwrap().last_seen_cursor,
            vec![105, 104, 103]
        );

        assert!(tasks.delete(a).await.unwrap());
        assert!(!tasks.delete(a).await.unwrap());
        assert!(tasks.get(a).await.unwrap().is_none());
        assert!(!tasks.update_cursor(a, &[1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_task_ids_not_reused_after_delete() {
        let (_dir, db) = open_temp();
        let tasks = db.tasks();
        let a = tasks.create(new_task(1, &[1])).await.unwrap();
        tasks.delete(a).await.unwrap();
        let b = tasks.create(new_task(1, &[1])).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_zero_cadence_rejected_by_schema() {
        let (_dir, db) = open_temp();
        let mut task = new_task(1, &[1]);
        task.cadence_minutes = 0;
        assert!(db.tasks().create(task).await.is_err());
    }

    #[tokio::test]
    async fn test_user_create_is_unique() {
        let (_dir, db) = open_temp();
        let users = db.users();
        let user = User {
            id: 42,
            subscription_expiry: ts(1_000),
            expiry_notified: false,
        };
        assert!(users.create(&user).await.unwrap());
        assert!(!users.create(&User { subscription_expiry: ts(9_999), ..user.clone() }).await.unwrap());
        assert_eq!(users.get(42).await.unwrap(), Some(user));
        assert!(users.get(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_active_filters_by_expiry() {
        let (_dir, db) = open_temp();
        let users = db.users();
        for (id, till) in [(1, 500), (2, 1_500), (3, 2_500)] {
            users
                .create(&User {
                    id,
                    subscription_expiry: ts(till),
                    expiry_notified: false,
                })
                .await
                .unwrap();
        }
        let active: Vec<i64> = users.list_active(ts(1_000)).await.unwrap().iter().map(|u| u.id).collect();
        assert_eq!(active, vec![2, 3]);
        assert_eq!(users.list_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_extend_never_decreases_and_rearms() {
        let (_dir, db) = open_temp();
        let users = db.users();
        let day = 86_400;
        users
            .create(&User {
                id: 1,
                subscription_expiry: ts(10 * day),
                expiry_notified: false,
            })
            .await
            .unwrap();

        // Still active: extends from the current expiry.
        let till = users.extend_expiry(1, 7, ts(day)).await.unwrap().unwrap();
        assert_eq!(till, ts(17 * day));

        // Lapsed: extends from now.
        users.mark_expiry_notified(1).await.unwrap();
        let till = users.extend_expiry(1, 3, ts(20 * day)).await.unwrap().unwrap();
        assert_eq!(till, ts(23 * day));
        assert!(!users.get(1).await.unwrap().unwrap().expiry_notified);

        assert!(users.extend_expiry(99, 3, ts(0)).await.unwrap().is_none());
        assert!(!users.mark_expiry_notified(99).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_overflow_is_an_error() {
        let (_dir, db) = open_temp();
        let users = db.users();
        let user = User {
            id: 1,
            subscription_expiry: ts(1_000),
            expiry_notified: true,
        };
        users.create(&user).await.unwrap();

        let err = users.extend_expiry(1, u32::MAX, ts(0)).await.unwrap_err();
        assert!(err.to_string().contains("overflows"));
        assert_eq!(users.get(1).await.unwrap(), Some(user));
    }
}
