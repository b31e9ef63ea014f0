//! Connection guard.

use std::ops::Deref;
use std::sync::Arc;

use crate::backend::Connection;

use super::Pool;

/// A checked-out connection. Dropping the guard checks it back in;
/// detaching hands ownership to the caller, e.g. for the duration
/// of a transaction.
pub struct Guard {
    conn: Option<Arc<dyn Connection>>,
    pool: Pool,
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl Guard {
    /// Create new connection guard.
    pub(super) fn new(pool: Pool, conn: Arc<dyn Connection>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// The connection, shared.
    pub fn connection(&self) -> Arc<dyn Connection> {
        self.conn.as_ref().unwrap().clone()
    }

    /// Take the connection out of the guard. The caller is now
    /// responsible for returning it via `Pool::release`.
    pub fn detach(&mut self) -> Option<(Pool, Arc<dyn Connection>)> {
        self.conn.take().map(|conn| (self.pool.clone(), conn))
    }

    /// The pool this connection belongs to.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl Deref for Guard {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap().as_ref()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
