use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sqlx::Executor;

const MIGRATIONS: [&str; 1] = [include_str!("../migrations/0_data.sql")];

/// Named-key storage, partitioned by `scope` (one scope per client).
///
/// Values are opaque strings. Writes replace the previous value whole;
/// there is no read-modify-write primitive.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, scope: &str, key: &str)
        -> anyhow::Result<Option<String>>;

    async fn set(&self, scope: &str, key: &str, value: &str)
        -> anyhow::Result<()>;
}

#[derive(sqlx::FromRow)]
struct KvRow {
    value: String,
}

#[derive(Clone)]
pub struct Storage {
    pool: sqlx::Pool<sqlx::Sqlite>,
}

impl Storage {
    pub async fn connect(
        file_path: &Path,
        busy_timeout: Duration,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = file_path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for database file: {file_path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(file_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);
        let pool = sqlx::SqlitePool::connect_with(options).await?;
        let selph = Self { pool };
        for migration in MIGRATIONS {
            selph.pool.execute(migration).await?;
        }
        Ok(selph)
    }
}

#[async_trait]
impl Kv for Storage {
    async fn get(
        &self,
        scope: &str,
        key: &str,
    ) -> anyhow::Result<Option<String>> {
        let row_opt: Option<KvRow> =
            sqlx::query_as("SELECT value FROM kv WHERE scope = ? AND key = ?")
                .bind(scope)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row_opt.map(|KvRow { value }| value))
    }

    async fn set(
        &self,
        scope: &str,
        key: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let now = i64::try_from(
            SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs(),
        )?;
        sqlx::query(
            "INSERT INTO kv (scope, key, value, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(scope, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
        )
        .bind(scope)
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Process-local store. Contents are lost on exit.
#[derive(Default)]
pub struct Memory {
    entries: Mutex<HashMap<(String, String), String>>,
}

#[async_trait]
impl Kv for Memory {
    async fn get(
        &self,
        scope: &str,
        key: &str,
    ) -> anyhow::Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("Memory store lock poisoned."))?;
        Ok(entries.get(&(scope.to_string(), key.to_string())).cloned())
    }

    async fn set(
        &self,
        scope: &str,
        key: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("Memory store lock poisoned."))?;
        entries.insert((scope.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}
