//! Pool internals synchronized with a mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::backend::Connection;

/// Pool internals protected by a mutex.
///
/// Every connection in `idle` is also in `all`; a connection is in
/// at most one of {idle, checked out} at a time.
#[derive(Default)]
pub(super) struct Inner {
    /// Idle connections, FIFO.
    pub(super) idle: VecDeque<Arc<dyn Connection>>,
    /// Every connection tracked by this pool, keyed by connection id.
    pub(super) all: HashMap<u64, Arc<dyn Connection>>,
    /// Number of callers waiting for an idle connection.
    pub(super) waiting: usize,
    /// Pool is accepting and serving connections.
    pub(super) online: bool,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("idle", &self.idle.len())
            .field("all", &self.all.len())
            .field("waiting", &self.waiting)
            .field("online", &self.online)
            .finish()
    }
}

impl Inner {
    /// Total number of connections tracked by the pool.
    #[inline]
    pub(super) fn total(&self) -> usize {
        self.all.len()
    }

    /// Number of idle connections.
    #[inline]
    pub(super) fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Number of connections currently checked out.
    #[inline]
    pub(super) fn checked_out(&self) -> usize {
        self.total() - self.idle()
    }

    /// The connection is already sitting in the idle queue.
    #[inline]
    pub(super) fn is_idle(&self, id: u64) -> bool {
        self.idle.iter().any(|c| c.id() == id)
    }

    /// Waiting can never succeed: every tracked connection is checked
    /// out and none of them is on its way back.
    #[inline]
    pub(super) fn deadlocked(&self) -> bool {
        !self.all.is_empty()
            && self.idle.is_empty()
            && !self.all.values().any(|c| c.is_released())
    }

    /// Remove a connection from both structures.
    #[inline]
    pub(super) fn forget(&mut self, id: u64) -> Option<Arc<dyn Connection>> {
        self.idle.retain(|c| c.id() != id);
        self.all.remove(&id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::mock::MockConnection;

    fn conn(id: u64) -> Arc<dyn Connection> {
        Arc::new(MockConnection::new(id))
    }

    #[test]
    fn test_counts() {
        let mut inner = Inner::default();
        assert_eq!(inner.total(), 0);
        assert!(!inner.deadlocked()); // nothing tracked

        let first = conn(1);
        inner.all.insert(1, first.clone());
        assert_eq!(inner.checked_out(), 1);
        assert!(inner.deadlocked());

        inner.idle.push_back(first);
        assert_eq!(inner.idle(), 1);
        assert_eq!(inner.checked_out(), 0);
        assert!(inner.is_idle(1));
        assert!(!inner.deadlocked());

        let gone = inner.forget(1);
        assert!(gone.is_some());
        assert_eq!(inner.total(), 0);
        assert!(!inner.is_idle(1));
    }

    #[test]
    fn test_released_connection_prevents_deadlock() {
        let mut inner = Inner::default();

        let busy = conn(1);
        busy.activate();
        inner.all.insert(1, busy);
        assert!(inner.deadlocked());

        let returning = conn(2);
        returning.release();
        inner.all.insert(2, returning);
        assert!(!inner.deadlocked());
    }
}
