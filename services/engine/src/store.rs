//! SQLite-backed container state for restart recovery.
//!
//! Container definitions and states are written through on every
//! transition, so a restarted engine can rebuild its table instead of
//! forgetting what it was hosting.

use std::path::Path;

use gantry_api::{Container, ContainerState, RunError};
use rusqlite::{params, Connection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record for container {name}: {detail}")]
    Corrupt { name: String, detail: String },
}

/// One persisted container row.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub name: String,
    pub container: Container,
    pub state: ContainerState,
    pub error: Option<RunError>,
    pub exit_code: Option<i32>,
}

/// SQLite state store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                name TEXT PRIMARY KEY,
                definition TEXT NOT NULL,
                state TEXT NOT NULL,
                error TEXT,
                exit_code INTEGER,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_containers_state ON containers(state);
            "#,
        )?;
        Ok(())
    }

    /// Insert or update a container record.
    pub fn upsert(&self, record: &ContainerRecord) -> Result<(), StateStoreError> {
        let definition =
            serde_json::to_string(&record.container).map_err(|e| StateStoreError::Corrupt {
                name: record.name.clone(),
                detail: e.to_string(),
            })?;
        let error = match &record.error {
            Some(error) => Some(serde_json::to_string(error).map_err(|e| {
                StateStoreError::Corrupt {
                    name: record.name.clone(),
                    detail: e.to_string(),
                }
            })?),
            None => None,
        };

        self.conn.execute(
            r#"
            INSERT INTO containers (name, definition, state, error, exit_code, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(name) DO UPDATE SET
                definition = excluded.definition,
                state = excluded.state,
                error = excluded.error,
                exit_code = excluded.exit_code,
                updated_at = excluded.updated_at
            "#,
            params![
                record.name,
                definition,
                record.state.as_str(),
                error,
                record.exit_code,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Remove a container record.
    pub fn remove(&self, name: &str) -> Result<(), StateStoreError> {
        self.conn
            .execute("DELETE FROM containers WHERE name = ?1", params![name])?;
        Ok(())
    }

    /// Load every persisted container.
    pub fn load_all(&self) -> Result<Vec<ContainerRecord>, StateStoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, definition, state, error, exit_code FROM containers")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i32>>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (name, definition, state, error, exit_code) = row?;
            let container =
                serde_json::from_str(&definition).map_err(|e| StateStoreError::Corrupt {
                    name: name.clone(),
                    detail: e.to_string(),
                })?;
            let state = ContainerState::parse(&state).ok_or_else(|| StateStoreError::Corrupt {
                name: name.clone(),
                detail: format!("unknown state {state:?}"),
            })?;
            let error = match error {
                Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                    StateStoreError::Corrupt {
                        name: name.clone(),
                        detail: e.to_string(),
                    }
                })?),
                None => None,
            };
            records.push(ContainerRecord {
                name,
                container,
                state,
                error,
                exit_code,
            });
        }
        Ok(records)
    }
}
