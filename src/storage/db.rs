//! SQLite metadata store
//!
//! Inbox and sent rows share one shape; users carry credential material.
//! Writes go through a bounded retry loop because SQLite allows a single
//! writer at a time; WAL mode keeps readers unblocked meanwhile.

use crate::error::{MailError, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts for a write hitting a locked database.
const WRITE_ATTEMPTS: u32 = 5;

/// First retry delay; doubles per attempt.
const RETRY_BASE_DELAY_MS: u64 = 50;

/// One metadata row, used for both the inbox and sent tables.
#[derive(Debug, Clone)]
pub struct MailRecord {
    pub message_id: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub size: i64,
    pub is_read: bool,
    pub is_deleted: bool,
    pub is_spam: bool,
    pub spam_score: f64,
    pub content_path: String,
    pub headers: String,
}

impl MailRecord {
    pub fn new(message_id: &str, from_addr: &str, to_addrs: Vec<String>) -> Self {
        Self {
            message_id: message_id.to_string(),
            from_addr: from_addr.to_string(),
            to_addrs,
            subject: String::new(),
            date: Utc::now(),
            size: 0,
            is_read: false,
            is_deleted: false,
            is_spam: false,
            spam_score: 0.0,
            content_path: String::new(),
            headers: "{}".to_string(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct MailRow {
    message_id: String,
    from_addr: String,
    to_addrs: String,
    subject: String,
    date: String,
    size: i64,
    is_read: bool,
    is_deleted: bool,
    is_spam: bool,
    spam_score: f64,
    content_path: String,
    headers: String,
}

impl From<MailRow> for MailRecord {
    fn from(row: MailRow) -> Self {
        let to_addrs: Vec<String> = serde_json::from_str(&row.to_addrs).unwrap_or_default();
        let date = DateTime::parse_from_rfc3339(&row.date)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Self {
            message_id: row.message_id,
            from_addr: row.from_addr,
            to_addrs,
            subject: row.subject,
            date,
            size: row.size,
            is_read: row.is_read,
            is_deleted: row.is_deleted,
            is_spam: row.is_spam,
            spam_score: row.spam_score,
            content_path: row.content_path,
            headers: row.headers,
        }
    }
}

/// A provisioned account.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub salt: String,
    pub is_active: bool,
    pub created_at: String,
    pub last_login: Option<String>,
}

const MAIL_TABLE_COLUMNS: &str = "message_id, from_addr, to_addrs, subject, date, size, \
     is_read, is_deleted, is_spam, spam_score, content_path, headers";

/// Handle to the SQLite store. Cheap to clone; explicitly constructed and
/// closed, never process-global.
#[derive(Clone)]
pub struct MailStore {
    pool: SqlitePool,
}

impl MailStore {
    /// Open (creating if missing) and migrate the database.
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| MailError::Config(format!("bad database url: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // Every :memory: connection is its own database, so the pool must
        // not grow past one there
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("mail store open at {}", database_url);
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for table in ["inbox", "sent"] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    message_id TEXT PRIMARY KEY,
                    from_addr TEXT NOT NULL,
                    to_addrs TEXT NOT NULL,
                    subject TEXT NOT NULL DEFAULT '',
                    date TEXT NOT NULL,
                    size INTEGER NOT NULL DEFAULT 0,
                    is_read INTEGER NOT NULL DEFAULT 0,
                    is_deleted INTEGER NOT NULL DEFAULT 0,
                    is_spam INTEGER NOT NULL DEFAULT 0,
                    spam_score REAL NOT NULL DEFAULT 0.0,
                    content_path TEXT NOT NULL DEFAULT '',
                    headers TEXT NOT NULL DEFAULT '{{}}'
                )
                "#,
                table
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_login TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn insert_inbox(&self, record: &MailRecord) -> Result<()> {
        self.insert_mail("inbox", record).await
    }

    pub async fn insert_sent(&self, record: &MailRecord) -> Result<()> {
        self.insert_mail("sent", record).await
    }

    async fn insert_mail(&self, table: &str, record: &MailRecord) -> Result<()> {
        let to_addrs = serde_json::to_string(&record.to_addrs)
            .map_err(|e| MailError::Storage(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            table, MAIL_TABLE_COLUMNS
        );

        let result = self
            .write_with_retry(|| {
                sqlx::query(&sql)
                    .bind(&record.message_id)
                    .bind(&record.from_addr)
                    .bind(&to_addrs)
                    .bind(&record.subject)
                    .bind(record.date.to_rfc3339())
                    .bind(record.size)
                    .bind(record.is_read)
                    .bind(record.is_deleted)
                    .bind(record.is_spam)
                    .bind(record.spam_score)
                    .bind(&record.content_path)
                    .bind(&record.headers)
                    .execute(&self.pool)
            })
            .await;

        match result {
            Ok(_) => {
                debug!("stored {} row for {}", table, record.message_id);
                Ok(())
            }
            Err(MailError::Database(e)) if is_unique_violation(&e) => {
                Err(MailError::AlreadyExists(record.message_id.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Non-deleted, non-spam inbox rows addressed to `email`, oldest first.
    ///
    /// The ordering is the POP3 snapshot order; the message_id tiebreak
    /// keeps it stable for same-second deliveries.
    pub async fn inbox_for_recipient(&self, email: &str) -> Result<Vec<MailRecord>> {
        let pattern = format!("%\"{}\"%", email);
        let rows = sqlx::query_as::<_, MailRow>(&format!(
            "SELECT {} FROM inbox \
             WHERE is_deleted = 0 AND is_spam = 0 AND to_addrs LIKE ? \
             ORDER BY date ASC, message_id ASC",
            MAIL_TABLE_COLUMNS
        ))
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(MailRecord::from).collect())
    }

    pub async fn get_inbox(&self, message_id: &str) -> Result<Option<MailRecord>> {
        let row = sqlx::query_as::<_, MailRow>(&format!(
            "SELECT {} FROM inbox WHERE message_id = ?",
            MAIL_TABLE_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MailRecord::from))
    }

    pub async fn get_sent(&self, message_id: &str) -> Result<Option<MailRecord>> {
        let row = sqlx::query_as::<_, MailRow>(&format!(
            "SELECT {} FROM sent WHERE message_id = ?",
            MAIL_TABLE_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MailRecord::from))
    }

    /// Apply a POP3 UPDATE: mark deletions and read flags in one
    /// transaction so a failure leaves the mailbox untouched.
    pub async fn commit_mailbox_update(
        &self,
        deleted_ids: &[String],
        read_ids: &[String],
    ) -> Result<()> {
        if deleted_ids.is_empty() && read_ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for id in deleted_ids {
            sqlx::query("UPDATE inbox SET is_deleted = 1 WHERE message_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for id in read_ids {
            sqlx::query("UPDATE inbox SET is_read = 1 WHERE message_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(
            "mailbox update committed: {} deleted, {} read",
            deleted_ids.len(),
            read_ids.len()
        );
        Ok(())
    }

    pub async fn mark_spam(&self, message_id: &str, is_spam: bool, score: f64) -> Result<()> {
        self.write_with_retry(|| {
            sqlx::query("UPDATE inbox SET is_spam = ?, spam_score = ? WHERE message_id = ?")
                .bind(is_spam)
                .bind(score)
                .bind(message_id)
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    // --- users ---

    pub async fn insert_user(&self, user: &StoredUser) -> Result<()> {
        let result = self
            .write_with_retry(|| {
                sqlx::query(
                    "INSERT INTO users \
                     (username, email, password_hash, salt, is_active, created_at, last_login) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&user.username)
                .bind(&user.email)
                .bind(&user.password_hash)
                .bind(&user.salt)
                .bind(user.is_active)
                .bind(&user.created_at)
                .bind(&user.last_login)
                .execute(&self.pool)
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(MailError::Database(e)) if is_unique_violation(&e) => {
                Err(MailError::AlreadyExists(user.username.clone()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query_as::<_, StoredUser>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn update_last_login(&self, username: &str) -> Result<()> {
        self.write_with_retry(|| {
            sqlx::query("UPDATE users SET last_login = ? WHERE username = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(username)
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    pub async fn set_user_active(&self, username: &str, active: bool) -> Result<()> {
        self.write_with_retry(|| {
            sqlx::query("UPDATE users SET is_active = ? WHERE username = ?")
                .bind(active)
                .bind(username)
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    pub async fn remove_user(&self, username: &str) -> Result<()> {
        self.write_with_retry(|| {
            sqlx::query("DELETE FROM users WHERE username = ?")
                .bind(username)
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    async fn write_with_retry<F, Fut>(&self, op: F) -> Result<sqlx::sqlite::SqliteQueryResult>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(result) => return Ok(result),
                Err(e) if is_busy(&e) && attempt + 1 < WRITE_ATTEMPTS => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY_MS << attempt;
                    warn!("database busy, retry {} in {}ms", attempt, delay);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_busy(e: &sqlx::Error) -> bool {
    match e.as_database_error() {
        Some(db) => {
            let code = db.code();
            matches!(code.as_deref(), Some("5") | Some("6") | Some("261") | Some("262"))
                || db.message().contains("database is locked")
        }
        None => false,
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> MailStore {
        MailStore::open("sqlite::memory:").await.unwrap()
    }

    fn record(id: &str, to: &str) -> MailRecord {
        let mut r = MailRecord::new(id, "sender@example.com", vec![to.to_string()]);
        r.subject = "test".to_string();
        r.size = 42;
        r
    }

    #[tokio::test]
    async fn test_insert_and_fetch_inbox() {
        let store = memory_store().await;
        store.insert_inbox(&record("<1@x>", "u@example.com")).await.unwrap();

        let rows = store.inbox_for_recipient("u@example.com").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message_id, "<1@x>");
        assert_eq!(rows[0].to_addrs, vec!["u@example.com"]);
        assert_eq!(rows[0].size, 42);

        let other = store.inbox_for_recipient("nobody@example.com").await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_message_id() {
        let store = memory_store().await;
        store.insert_inbox(&record("<1@x>", "u@example.com")).await.unwrap();

        let err = store
            .insert_inbox(&record("<1@x>", "u@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::AlreadyExists(id) if id == "<1@x>"));
    }

    #[tokio::test]
    async fn test_snapshot_order_oldest_first() {
        let store = memory_store().await;
        let mut newer = record("<2@x>", "u@example.com");
        newer.date = Utc::now();
        let mut older = record("<1@x>", "u@example.com");
        older.date = newer.date - chrono::Duration::hours(1);

        store.insert_inbox(&newer).await.unwrap();
        store.insert_inbox(&older).await.unwrap();

        let rows = store.inbox_for_recipient("u@example.com").await.unwrap();
        assert_eq!(rows[0].message_id, "<1@x>");
        assert_eq!(rows[1].message_id, "<2@x>");
    }

    #[tokio::test]
    async fn test_mailbox_update_excludes_deleted() {
        let store = memory_store().await;
        store.insert_inbox(&record("<1@x>", "u@example.com")).await.unwrap();
        store.insert_inbox(&record("<2@x>", "u@example.com")).await.unwrap();

        store
            .commit_mailbox_update(&["<1@x>".to_string()], &["<2@x>".to_string()])
            .await
            .unwrap();

        let rows = store.inbox_for_recipient("u@example.com").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message_id, "<2@x>");
        assert!(rows[0].is_read);
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let store = memory_store().await;
        let user = StoredUser {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "$argon2id$...".to_string(),
            salt: "somesalt".to_string(),
            is_active: true,
            created_at: Utc::now().to_rfc3339(),
            last_login: None,
        };
        store.insert_user(&user).await.unwrap();

        let fetched = store.get_user("alice").await.unwrap().unwrap();
        assert_eq!(fetched.email, "alice@example.com");
        assert!(fetched.last_login.is_none());

        store.update_last_login("alice").await.unwrap();
        let fetched = store.get_user("alice").await.unwrap().unwrap();
        assert!(fetched.last_login.is_some());

        assert!(matches!(
            store.insert_user(&user).await.unwrap_err(),
            MailError::AlreadyExists(_)
        ));

        store.set_user_active("alice", false).await.unwrap();
        assert!(!store.get_user("alice").await.unwrap().unwrap().is_active);

        store.remove_user("alice").await.unwrap();
        assert!(store.get_user("alice").await.unwrap().is_none());
    }
}
