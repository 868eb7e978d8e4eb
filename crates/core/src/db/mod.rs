//! SQLite persistence for workspace descriptors and reconciliation history.
//!
//! A [`Database`] is the production
//! [`DescriptorStore`](crate::sync::DescriptorStore): the CLI and any
//! embedding host share one handle per data directory through an `Arc`.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::errors::DatabaseError;

/// File name of the database inside the configured data directory.
pub const DATABASE_FILE: &str = "wtsync.db";

/// Descriptor and history store. Every handle returned here is already
/// migrated to the current schema.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open `wtsync.db` under `data_dir`, creating the directory on first use.
    ///
    /// Several processes may sync workspaces of the same repository at once,
    /// so the file runs in WAL mode and waits on a busy writer instead of
    /// failing immediately.
    pub fn open_in_dir<P: AsRef<Path>>(data_dir: P) -> Result<Self, DatabaseError> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(DATABASE_FILE);

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!(path = %path.display(), "opened workspace database");
        Self::migrated(conn)
    }

    /// A throwaway store for tests and dry runs.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(Connection::open_in_memory()?)
    }

    fn migrated(conn: Connection) -> Result<Self, DatabaseError> {
        schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// The connection, recovered if a previous holder panicked mid-query.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("workspace database lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
