//! Previous-scan storage used for computing port diffs between scans.
//!
//! The engine keeps the last observed open-port set per `(ip, protocol)`
//! key. Only the result receiver ever writes. The default backend is an
//! in-process map; a SQLite file can be used instead so diffs survive
//! restarts.
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use log::warn;
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

use crate::input::render_ports;

/// First retry delay when the persistent backend cannot be opened. Doubles
/// on every attempt until [`OPEN_DEADLINE`] is exhausted.
const OPEN_RETRY_DELAY: Duration = Duration::from_secs(2);
const OPEN_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("cannot open store at {url:?}: {source}")]
    Open {
        url: String,
        source: rusqlite::Error,
    },
}

/// Keyed set store holding the last open-port list per `(ip, protocol)`.
///
/// `read_list` returns an empty list for unknown keys; `replace_list`
/// atomically replaces whatever was stored before.
pub trait ListStore: Send {
    fn read_list(&self, key: &str) -> Result<Vec<u16>, StoreError>;
    fn replace_list(&mut self, key: &str, ports: &[u16]) -> Result<(), StoreError>;
}

/// In-process store, the default backend. Scan history is lost on restart,
/// so the first scan after a restart reports every open port as changed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    lists: HashMap<String, Vec<u16>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ListStore for MemoryStore {
    fn read_list(&self, key: &str) -> Result<Vec<u16>, StoreError> {
        Ok(self.lists.get(key).cloned().unwrap_or_default())
    }

    fn replace_list(&mut self, key: &str, ports: &[u16]) -> Result<(), StoreError> {
        self.lists.insert(key.to_owned(), ports.to_vec());
        Ok(())
    }
}

/// SQLite-backed store selected with `--db.url`. One row per key, the port
/// list rendered to its canonical comma-separated form.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        Self::open_path(Path::new(path)).map_err(|source| StoreError::Open {
            url: url.to_owned(),
            source,
        })
    }

    fn open_path(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS previous_scans (
                key   TEXT PRIMARY KEY,
                ports TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS previous_scans (
                key   TEXT PRIMARY KEY,
                ports TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }
}

impl ListStore for SqliteStore {
    fn read_list(&self, key: &str) -> Result<Vec<u16>, StoreError> {
        let row: Option<String> = self
            .conn
            .query_row(
                "SELECT ports FROM previous_scans WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;

        let Some(rendered) = row else {
            return Ok(Vec::new());
        };

        Ok(rendered
            .split(',')
            .filter(|token| !token.is_empty())
            .filter_map(|token| token.parse().ok())
            .collect())
    }

    fn replace_list(&mut self, key: &str, ports: &[u16]) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO previous_scans (key, ports) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET ports = excluded.ports",
            (key, render_ports(ports)),
        )?;
        Ok(())
    }
}

/// Opens the persistent backend, retrying with exponential back-off (2 s,
/// 4 s, 8 s, ...) for up to two minutes before giving up.
pub async fn open_with_backoff(url: &str) -> Result<SqliteStore, StoreError> {
    let started = Instant::now();
    let mut delay = OPEN_RETRY_DELAY;

    loop {
        match SqliteStore::open(url) {
            Ok(store) => return Ok(store),
            Err(err) => {
                if started.elapsed() + delay > OPEN_DEADLINE {
                    return Err(err);
                }
                warn!("{err}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_unknown_key_is_empty() {
        let store = MemoryStore::new();
        assert_eq!(store.read_list("10.0.0.5:tcp").unwrap(), Vec::<u16>::new());
    }

    #[test]
    fn memory_store_replaces_atomically() {
        let mut store = MemoryStore::new();

        store.replace_list("10.0.0.5:tcp", &[22, 80]).unwrap();
        assert_eq!(store.read_list("10.0.0.5:tcp").unwrap(), vec![22, 80]);

        store.replace_list("10.0.0.5:tcp", &[443]).unwrap();
        assert_eq!(store.read_list("10.0.0.5:tcp").unwrap(), vec![443]);
    }

    #[test]
    fn sqlite_store_round_trips() {
        let mut store = SqliteStore::open_in_memory().unwrap();

        assert_eq!(store.read_list("10.0.0.5:tcp").unwrap(), Vec::<u16>::new());

        store.replace_list("10.0.0.5:tcp", &[22, 80, 443]).unwrap();
        assert_eq!(store.read_list("10.0.0.5:tcp").unwrap(), vec![22, 80, 443]);

        store.replace_list("10.0.0.5:tcp", &[]).unwrap();
        assert_eq!(store.read_list("10.0.0.5:tcp").unwrap(), Vec::<u16>::new());
    }

    #[test]
    fn sqlite_store_keys_are_independent() {
        let mut store = SqliteStore::open_in_memory().unwrap();

        store.replace_list("10.0.0.5:tcp", &[22]).unwrap();
        store.replace_list("10.0.0.6:tcp", &[80]).unwrap();

        assert_eq!(store.read_list("10.0.0.5:tcp").unwrap(), vec![22]);
        assert_eq!(store.read_list("10.0.0.6:tcp").unwrap(), vec![80]);
    }
}
