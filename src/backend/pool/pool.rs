//! Connection pool.

use std::sync::Arc;

use parking_lot::{lock_api::MutexGuard, Mutex, RawMutex};
use tokio::select;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{CommandKind, Connection, Connector, Server, Target};
use crate::error::Error;

use super::{Guard, Inner};

/// Pool state snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    /// Number of idle connections.
    pub idle: usize,
    /// Number of connections checked out.
    pub checked_out: usize,
    /// Total number of connections tracked by the pool.
    pub total: usize,
    /// Number of callers waiting for a connection.
    pub waiting: usize,
    /// Is the pool online?
    pub online: bool,
}

/// Decrements the waiting counter when the waiter is done,
/// however it finished.
struct Waiting {
    pool: Pool,
}

impl Waiting {
    fn new(pool: Pool) -> Self {
        pool.lock().waiting += 1;
        Self { pool }
    }
}

impl Drop for Waiting {
    fn drop(&mut self) {
        self.pool.lock().waiting -= 1;
    }
}

struct Shared {
    state: Mutex<Inner>,
    ready: tokio::sync::Notify,
    server: Server,
    target: Target,
    connector: Arc<dyn Connector>,
}

/// Connection pool for one (server, database) pairing.
pub struct Pool {
    shared: Arc<Shared>,
}

impl Clone for Pool {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Pool {
    /// Create new connection pool.
    pub fn new(server: Server, target: Target, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(Inner {
                    online: true,
                    ..Default::default()
                }),
                ready: tokio::sync::Notify::new(),
                server,
                target,
                connector,
            }),
        }
    }

    /// Non-blocking idle-queue pop.
    pub fn try_acquire(&self) -> Option<Guard> {
        let conn = {
            let mut guard = self.lock();

            if !guard.online {
                return None;
            }

            guard.idle.pop_front()?
        };

        conn.activate();
        Some(Guard::new(self.clone(), conn))
    }

    /// Obtain a connection: reuse an idle one, open a new one within
    /// the server's quota, or wait for one to be returned.
    pub async fn acquire(
        &self,
        kind: CommandKind,
        cancel: &CancellationToken,
    ) -> Result<Guard, Error> {
        if !self.online() {
            return Err(Error::Offline);
        }

        // Fast path, idle connection available.
        if let Some(conn) = self.try_acquire() {
            return Ok(conn);
        }

        // Try to open a new connection, gated by the server's quota.
        let mut permitted = self.server().increase_connection_count();

        if !permitted && self.total() == 0 {
            // Nothing here at all. Free quota held by other pools
            // on this server and try the gate once more.
            self.server().urge_connections();
            permitted = self.server().increase_connection_count();
        }

        if permitted {
            match self.open(cancel).await {
                Ok(conn) => {
                    // The server's very first connection runs the
                    // max_connections introspection before anyone
                    // gets to use it.
                    if self.server().needs_init() {
                        if let Err(err) = self.server().initialize(&conn).await {
                            warn!(
                                "max_connections introspection failed: {} [{}]",
                                err,
                                self.addr()
                            );
                        }

                        if conn.is_broken() {
                            self.close_connection(&conn);
                            // Fall through to waiting.
                        } else {
                            return Ok(Guard::new(self.clone(), conn));
                        }
                    } else {
                        return Ok(Guard::new(self.clone(), conn));
                    }
                }

                // Transient: the counter was rolled back, wait for
                // an idle connection like everyone else.
                Err(Error::ServerOverloaded) => (),

                Err(err) => return Err(err),
            }
        }

        // Nothing tracked and nothing opened: waiting can't help.
        if self.total() == 0 {
            return Err(Error::Busy(self.addr()));
        }

        // Commands that can safely wait get one more idle check and
        // a deadlock refusal: if every connection is checked out and
        // none is on its way back, nothing will ever be returned.
        if kind.waitable() {
            if let Some(conn) = self.try_acquire() {
                return Ok(conn);
            }

            if self.lock().deadlocked() {
                warn!("all connections checked out, refusing to wait [{}]", self.addr());
                return Err(Error::Busy(self.addr()));
            }
        }

        self.wait_for_idle(cancel).await
    }

    /// Wait for an idle connection with a deadline, distinguishing
    /// our timeout from the caller's cancellation.
    async fn wait_for_idle(&self, cancel: &CancellationToken) -> Result<Guard, Error> {
        let _waiting = Waiting::new(self.clone());

        let deadline = sleep(self.target().settings.wait_timeout());
        tokio::pin!(deadline);

        loop {
            if !self.online() {
                return Err(Error::Offline);
            }

            if let Some(conn) = self.try_acquire() {
                return Ok(conn);
            }

            select! {
                _ = self.shared.ready.notified() => continue,
                _ = &mut deadline => return Err(Error::Timeout),
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Open a new connection. The server's counter was already
    /// incremented; roll it back on failure.
    async fn open(&self, cancel: &CancellationToken) -> Result<Arc<dyn Connection>, Error> {
        let connect_timeout = self.target().settings.connect_timeout();

        let result = timeout(
            connect_timeout,
            self.shared.connector.open(self.target(), cancel),
        )
        .await;

        match result {
            Ok(Ok(conn)) => {
                conn.activate();
                self.lock().all.insert(conn.id(), conn.clone());
                debug!("new connection {} [{}]", conn.id(), self.addr());
                Ok(conn)
            }

            Ok(Err(err)) => {
                self.server().decrease_connection_count();

                if err == Error::ServerOverloaded {
                    warn!(
                        "backend over capacity: {} open, {} allowed [{}]",
                        self.server().connection_count(),
                        self.server().backend_max(),
                        self.addr()
                    );
                }

                Err(err)
            }

            Err(_) => {
                self.server().decrease_connection_count();
                Err(Error::Connect(format!("connect timeout [{}]", self.addr())))
            }
        }
    }

    /// Check a connection back in. Broken or untracked connections
    /// are closed instead.
    pub fn release(&self, conn: Arc<dyn Connection>) {
        if conn.is_broken() {
            self.close_connection(&conn);
            return;
        }

        conn.release();

        {
            let mut guard = self.lock();

            if !guard.online || !guard.all.contains_key(&conn.id()) {
                drop(guard);
                self.close_connection(&conn);
                return;
            }

            // Double release, the connection is already idle.
            if guard.is_idle(conn.id()) {
                return;
            }

            guard.idle.push_back(conn);
        }

        self.shared.ready.notify_one();
    }

    /// Forget a connection that closed itself.
    pub fn remove(&self, id: u64) {
        let removed = self.lock().forget(id);

        if removed.is_some() {
            self.server().decrease_connection_count();
        }
    }

    /// Close a connection and drop it from the pool's bookkeeping.
    pub fn close_connection(&self, conn: &Arc<dyn Connection>) {
        conn.close();
        self.remove(conn.id());
    }

    /// Protocol-test every idle connection, closing the dead ones.
    pub async fn test_and_cleanup(&self) {
        let idle = {
            let mut guard = self.lock();
            guard.idle.drain(..).collect::<Vec<_>>()
        };

        for conn in idle {
            if conn.is_broken() || !conn.test().await {
                debug!("closing dead connection {} [{}]", conn.id(), self.addr());
                self.close_connection(&conn);
                continue;
            }

            let requeued = {
                let mut guard = self.lock();
                let ok = guard.online && guard.all.contains_key(&conn.id());

                if ok {
                    guard.idle.push_back(conn.clone());
                }

                ok
            };

            if requeued {
                self.shared.ready.notify_one();
            } else {
                conn.close();
            }
        }
    }

    /// Close up to `n` idle connections. Returns how many closed.
    pub fn prune(&self, n: usize) -> usize {
        let victims = {
            let mut guard = self.lock();
            let take = n.min(guard.idle.len());
            guard.idle.drain(..take).collect::<Vec<_>>()
        };

        for conn in &victims {
            self.close_connection(conn);
        }

        victims.len()
    }

    /// Shut the pool down, closing every tracked connection.
    pub fn dispose(&self) {
        let conns = {
            let mut guard = self.lock();

            if !guard.online {
                return;
            }

            guard.online = false;
            guard.idle.clear();
            guard.all.drain().map(|(_, conn)| conn).collect::<Vec<_>>()
        };

        for conn in conns {
            conn.close();
            self.server().decrease_connection_count();
        }

        self.shared.ready.notify_waiters();
    }

    /// Number of idle connections.
    pub fn idle(&self) -> usize {
        self.lock().idle()
    }

    /// Total number of connections tracked by the pool.
    pub fn total(&self) -> usize {
        self.lock().total()
    }

    /// The pool hasn't been disposed.
    pub fn online(&self) -> bool {
        self.lock().online
    }

    /// Pool state snapshot.
    pub fn state(&self) -> State {
        let guard = self.lock();

        State {
            idle: guard.idle(),
            checked_out: guard.checked_out(),
            total: guard.total(),
            waiting: guard.waiting,
            online: guard.online,
        }
    }

    /// The server this pool opens connections to.
    pub fn server(&self) -> &Server {
        &self.shared.server
    }

    /// Connection target.
    pub fn target(&self) -> &Target {
        &self.shared.target
    }

    fn addr(&self) -> String {
        self.shared.target.to_string()
    }

    /// Pool exclusive lock.
    #[inline]
    fn lock(&self) -> MutexGuard<'_, RawMutex, Inner> {
        self.shared.state.lock()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("target", &self.shared.target)
            .field("state", &*self.lock())
            .finish()
    }
}
