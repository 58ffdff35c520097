use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{Result, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Small bounded pool of SQLite connections.
///
/// At most `size` connections exist; callers wait for a permit when all are
/// in use. An in-memory database is private to its connection, so `:memory:`
/// is always pooled with a single connection.
pub struct ConnectionPool {
    path: String,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl ConnectionPool {
    pub fn open(path: &str, size: usize) -> Result<Self> {
        let size = if path == ":memory:" { 1 } else { size.max(1) };
        let first = open_connection(path)?;
        debug!(path, size, "sqlite pool opened");
        Ok(Self {
            path: path.to_string(),
            idle: Mutex::new(vec![first]),
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Check out a connection, opening a new one if none is idle.
    pub async fn get(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Config("connection pool closed".into()))?;
        let idle = self.idle.lock().expect("pool poisoned").pop();
        let conn = match idle {
            Some(conn) => conn,
            None => open_connection(&self.path)?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }
}

fn open_connection(path: &str) -> Result<Connection> {
    let conn = if path == ":memory:" {
        Connection::open_in_memory()?
    } else {
        Connection::open(path)?
    };
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// A checked-out connection; returned to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Ok(mut idle) = self.pool.idle.lock() {
                idle.push(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pool_has_one_shared_connection() {
        let pool = Arc::new(ConnectionPool::open(":memory:", 8).unwrap());
        assert_eq!(pool.size(), 1);
        {
            let conn = pool.get().await.unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        }
        let conn = pool.get().await.unwrap();
        let n: i64 = conn.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn file_pool_opens_connections_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");
        let pool = Arc::new(ConnectionPool::open(path.to_str().unwrap(), 2).unwrap());
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        a.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        let n: i64 = b.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 0);
        drop(a);
        drop(b);
        assert_eq!(pool.idle.lock().unwrap().len(), 2);
    }
}
