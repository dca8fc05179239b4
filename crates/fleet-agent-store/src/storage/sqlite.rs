//! SQLite request storage (feature-gated).

use std::path::Path;

use async_trait::async_trait;
use fleet_agent_core::{Operation, Request, RequestStore, StoreError, TransactionRecord};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS requests (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    request TEXT NOT NULL,
    operations TEXT NOT NULL,
    executed INTEGER NOT NULL
)";

type Row = (String, String, String, i64);

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Internal(e.to_string())
}

/// SQLite storage implementation.
///
/// Each record is one row written by a single statement, so a crash
/// leaves it either fully present or absent.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or initialized.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Internal(format!("{}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        // One connection: writers are serialized by the executor anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        sqlx::query(SCHEMA).execute(&pool).await.map_err(db_err)?;
        tracing::debug!(path = %path.display(), "Opened request store");

        Ok(Self { pool })
    }

    fn decode(row: Row) -> Result<TransactionRecord, StoreError> {
        let (key, request, operations, executed) = row;
        let request: Request = serde_json::from_str(&request).map_err(|source| StoreError::Decode {
            key: key.clone(),
            source,
        })?;
        let operations: Vec<Operation> =
            serde_json::from_str(&operations).map_err(|source| StoreError::Decode {
                key: key.clone(),
                source,
            })?;
        Ok(TransactionRecord {
            key,
            request,
            operations,
            executed: usize::try_from(executed).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl RequestStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let row: Option<Row> = sqlx::query_as(
            "SELECT key, request, operations, executed FROM requests WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Self::decode).transpose()
    }

    async fn put(
        &self,
        key: &str,
        request: &Request,
        operations: &[Operation],
    ) -> Result<(), StoreError> {
        let encode = |source| StoreError::Encode {
            key: key.to_string(),
            source,
        };
        let request = serde_json::to_string(request).map_err(encode)?;
        let ops = serde_json::to_string(operations).map_err(encode)?;

        sqlx::query(
            "INSERT INTO requests (key, request, operations, executed) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                request = excluded.request,
                operations = excluded.operations,
                executed = excluded.executed",
        )
        .bind(key)
        .bind(request)
        .bind(ops)
        .bind(i64::try_from(operations.len()).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM requests WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM requests ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(keys.into_iter().filter(|k| k.starts_with(prefix)).collect())
    }

    async fn list(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT key, request, operations, executed FROM requests ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(Self::decode).collect()
    }

    async fn clean(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM requests")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_agent_core::Action;
    use serde_json::json;

    fn ops() -> Vec<Operation> {
        vec![
            Operation::new(Action::exec("ip link set dev eth1 down", "shutdown eth1"))
                .with_revert(Action::exec("netplan apply", "apply netplan")),
            Operation::new(Action::exec("vppctl enable tap-inject", "enable tap-inject")),
        ]
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("requests.sqlite");
        let req = Request::new("add-interface", json!({"pci": "0000:00:08.00", "addr": "10.0.0.4/24"}));

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.put("add-interface:0000:00:08.00", &req, &ops()).await.unwrap();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let record = store.get("add-interface:0000:00:08.00").await.unwrap().unwrap();
        assert_eq!(record.request, req);
        assert_eq!(record.operations, ops());
        assert_eq!(record.executed, 2);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("requests.sqlite")).await.unwrap();
        let route = Request::new("add-route", json!({"addr": "8.8.8.8/32", "via": "10.0.0.1"}));

        store.put("add-interface:a", &Request::new("add-interface", json!({"pci": "a"})), &ops()).await.unwrap();
        store.put("add-route:8.8.8.8/32:10.0.0.1", &route, &ops()).await.unwrap();
        store.put("add-interface:b", &Request::new("add-interface", json!({"pci": "b"})), &ops()).await.unwrap();
        store.put("add-interface:a", &Request::new("add-interface", json!({"pci": "a", "mtu": 1400})), &[]).await.unwrap();

        assert_eq!(
            store.keys_matching("add-interface").await.unwrap(),
            vec!["add-interface:a", "add-interface:b"]
        );
        let record = store.get("add-interface:a").await.unwrap().unwrap();
        assert_eq!(record.request.params["mtu"], 1400);
        assert_eq!(record.executed, 0);
    }

    #[tokio::test]
    async fn test_remove_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("requests.sqlite")).await.unwrap();
        store.put("start-router", &Request::new("start-router", json!(null)), &ops()).await.unwrap();
        store.put("add-tunnel:1", &Request::new("add-tunnel", json!({"tunnel-id": 1})), &ops()).await.unwrap();

        store.remove("start-router").await.unwrap();
        assert!(store.get("start-router").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.clean().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
