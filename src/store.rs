use anyhow::{Context, Result};
use log::debug;
use rusqlite::{params, Connection};
use tokio::task;

/// Sqlite-backed key-value store. Every access opens its own connection on a
/// blocking thread; rusqlite connections are not Send/Sync. Writes are
/// last-writer-wins, there are no transactions spanning keys.
#[derive(Clone)]
pub struct Store {
    db_path: String,
}

impl Store {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Create the kv table if this is a fresh database.
    pub fn init(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#,
        )?;
        Ok(())
    }

    // Run sqlite work off the async executor.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(db_path)?;
            f(conn)
        })
        .await
        .context("sqlite task join failed")?
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.call(move |conn| {
            conn.query_row("SELECT value FROM kv WHERE key=?1", params![key], |r| {
                r.get(0)
            })
            .optional()
        })
        .await
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        debug!("kv put {}", key);
        self.call(move |conn| {
            conn.execute(
                r#"
INSERT INTO kv(key, value) VALUES(?1, ?2)
ON CONFLICT(key) DO UPDATE SET value=excluded.value
"#,
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.call(move |conn| {
            conn.execute("DELETE FROM kv WHERE key=?1", params![key])?;
            Ok(())
        })
        .await
    }
}

// --- rusqlite optional helper ---
trait OptionalRow<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalRow<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) fn temp_store(dir: &tempfile::TempDir) -> Store {
    let path = dir.path().join("kv.sqlite");
    let store = Store::new(path.to_string_lossy().to_string());
    store.init().expect("init test db");
    store
}
