//! One physical backend and its connection budget.
//!
//! The server owns the only global count of connections opened to one
//! backend process, across every database pooled on it. The budget is
//! learned lazily: the first connection anywhere on the server runs
//! two introspection queries and derives the local quota from the
//! backend's own max_connections.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::select;
use tokio::spawn;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{clamp_heartbeat, clamp_proportion};
use crate::error::Error;

use super::database::WeakDatabase;
use super::dispatch::{prune_connections, Dispatch};
use super::{Address, Connection, Database};

/// Quota not learned yet; no cap is enforced.
const UNINITIALIZED: i64 = -1;
/// Introspection in flight; still no cap.
const INITIALIZING: i64 = 0;

const MAX_CONNECTIONS_QUERY: &str = "SHOW max_connections";
const RESERVED_QUERY: &str = "SHOW superuser_reserved_connections";

/// Server state snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    /// Connections currently open to this backend.
    pub connections: i64,
    /// Local connection quota, -1 if not learned yet.
    pub quota: i64,
    /// Backend budget after reserved slots, -1 if not learned yet.
    pub backend_max: i64,
    /// Number of databases hosted on this server.
    pub databases: usize,
}

struct Shared {
    address: Address,
    /// Fraction of the backend's budget this client may use, f64 bits.
    proportion: AtomicU64,
    /// Derived local quota. -1 uninitialized, 0 no cap established.
    quota: AtomicI64,
    /// Backend budget (max_connections minus reserved slots).
    backend_max: AtomicI64,
    /// Connections currently open, across every pool on this server.
    connections: AtomicI64,
    heartbeat_interval: AtomicU64, // seconds
    databases: Mutex<Vec<WeakDatabase>>,
    pruning: AtomicBool,
    heartbeating: AtomicBool,
    heartbeat_started: AtomicBool,
    shutdown: CancellationToken,
}

/// One backend process.
pub struct Server {
    shared: Arc<Shared>,
}

impl Clone for Server {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Server {
    /// Create new server.
    pub fn new(address: Address) -> Self {
        Self {
            shared: Arc::new(Shared {
                address,
                proportion: AtomicU64::new(1.0f64.to_bits()),
                quota: AtomicI64::new(UNINITIALIZED),
                backend_max: AtomicI64::new(UNINITIALIZED),
                connections: AtomicI64::new(0),
                heartbeat_interval: AtomicU64::new(60),
                databases: Mutex::new(Vec::new()),
                pruning: AtomicBool::new(false),
                heartbeating: AtomicBool::new(false),
                heartbeat_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Server address.
    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    /// Set the fraction of the backend's budget this client may use.
    /// Re-derives the quota if the budget is already known.
    pub fn set_proportion(&self, proportion: f64) {
        let proportion = clamp_proportion(proportion);
        self.shared
            .proportion
            .store(proportion.to_bits(), Ordering::Release);

        let backend_max = self.shared.backend_max.load(Ordering::Acquire);
        if backend_max > 0 {
            self.shared
                .quota
                .store(Self::derive_quota(backend_max, proportion), Ordering::Release);
        }
    }

    pub fn proportion(&self) -> f64 {
        f64::from_bits(self.shared.proportion.load(Ordering::Acquire))
    }

    /// Set the heartbeat interval in seconds, clamped to [1, 86400].
    pub fn set_heartbeat_interval(&self, seconds: u64) {
        self.shared
            .heartbeat_interval
            .store(clamp_heartbeat(seconds), Ordering::Release);
    }

    pub fn heartbeat_interval(&self) -> u64 {
        self.shared.heartbeat_interval.load(Ordering::Acquire)
    }

    /// Local connection quota. -1 until learned.
    pub fn max_connection_count(&self) -> i64 {
        self.shared.quota.load(Ordering::Acquire)
    }

    /// Backend budget after reserved slots. -1 until learned.
    pub fn backend_max(&self) -> i64 {
        self.shared.backend_max.load(Ordering::Acquire)
    }

    /// Connections currently open to this backend.
    pub fn connection_count(&self) -> i64 {
        self.shared.connections.load(Ordering::Acquire)
    }

    /// The one-time introspection hasn't run yet.
    pub fn needs_init(&self) -> bool {
        self.shared.quota.load(Ordering::Acquire) == UNINITIALIZED
    }

    /// Atomically take one unit of quota. Always succeeds while the
    /// quota is unknown; otherwise fails (and rolls back) when the
    /// increment would exceed it.
    pub fn increase_connection_count(&self) -> bool {
        let quota = self.shared.quota.load(Ordering::Acquire);

        let count = self.shared.connections.fetch_add(1, Ordering::AcqRel) + 1;

        if quota > 0 && count > quota {
            self.shared.connections.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        true
    }

    /// Unconditional inverse, called whenever a connection is removed
    /// from any pool on this server.
    pub fn decrease_connection_count(&self) {
        self.shared.connections.fetch_sub(1, Ordering::AcqRel);
    }

    /// Learn the backend's connection budget, exactly once per server.
    ///
    /// Failure resets the sentinel so a later caller may retry.
    pub async fn initialize(&self, conn: &Arc<dyn Connection>) -> Result<(), Error> {
        if self
            .shared
            .quota
            .compare_exchange(
                UNINITIALIZED,
                INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        match Self::introspect(conn).await {
            Ok((max, reserved)) => {
                let backend_max = (max - reserved).max(1);
                let quota = Self::derive_quota(backend_max, self.proportion());

                self.shared
                    .backend_max
                    .store(backend_max, Ordering::Release);
                self.shared.quota.store(quota, Ordering::Release);

                info!(
                    "connection quota is {} of {} [{}]",
                    quota,
                    backend_max,
                    self.address()
                );

                self.start_heartbeat();

                Ok(())
            }

            Err(err) => {
                self.shared.quota.store(UNINITIALIZED, Ordering::Release);
                Err(err)
            }
        }
    }

    async fn introspect(conn: &Arc<dyn Connection>) -> Result<(i64, i64), Error> {
        let max = conn.query_scalar(MAX_CONNECTIONS_QUERY).await?;
        let reserved = conn.query_scalar(RESERVED_QUERY).await?;

        Ok((max, reserved))
    }

    /// Quota derivation, rounding half away from zero.
    fn derive_quota(backend_max: i64, proportion: f64) -> i64 {
        ((backend_max as f64 * proportion).round() as i64).max(1)
    }

    /// A pool on this server has no idle connections and no quota
    /// left: ask every hosted database to give some back.
    pub fn urge_connections(&self) {
        if self
            .shared
            .pruning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let quota = self.max_connection_count().max(0);
        let excess = (self.connection_count() - quota).max(1) as usize;

        let databases = self.hosted_databases();
        let dispatchers = databases
            .iter()
            .map(|db| db as &dyn Dispatch)
            .collect::<Vec<_>>();

        let pruned = prune_connections(&dispatchers, excess);
        debug!("urged {} connections back [{}]", pruned, self.address());

        self.shared.pruning.store(false, Ordering::Release);
    }

    /// Databases currently hosted on this server.
    pub fn hosted_databases(&self) -> Vec<Database> {
        let mut guard = self.shared.databases.lock();
        guard.retain(|db| db.alive());
        guard.iter().filter_map(|db| db.upgrade()).collect()
    }

    /// Number of databases hosted on this server.
    pub fn database_count(&self) -> usize {
        self.hosted_databases().len()
    }

    /// Attach a database to this server.
    pub(super) fn attach(&self, database: &Database) {
        let mut guard = self.shared.databases.lock();

        let known = guard
            .iter()
            .any(|db| db.upgrade().map(|db| db.id()) == Some(database.id()));

        if !known {
            guard.push(database.downgrade());
        }
    }

    /// Detach a database from this server.
    pub(super) fn detach(&self, database: &Database) {
        self.shared
            .databases
            .lock()
            .retain(|db| db.upgrade().map(|db| db.id()) != Some(database.id()));
    }

    /// Launch the periodic heartbeat, once.
    fn start_heartbeat(&self) {
        if self
            .shared
            .heartbeat_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let server = self.clone();

        spawn(async move {
            let mut tick = interval(Duration::from_secs(server.heartbeat_interval()));
            let shutdown = server.shared.shutdown.clone();

            debug!("heartbeat running [{}]", server.address());

            loop {
                select! {
                    _ = tick.tick() => server.heartbeat().await,
                    _ = shutdown.cancelled() => break,
                }
            }

            debug!("heartbeat shut down [{}]", server.address());
        });
    }

    /// Borrow one idle connection from any hosted database and send a
    /// keep-alive. A confirmed-dead connection triggers a sweep of
    /// every hosted database's idle queues.
    pub async fn heartbeat(&self) {
        if self
            .shared
            .heartbeating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let databases = self.hosted_databases();

        let conn = databases
            .iter()
            .find_map(|db| db.borrow_idle(self.address()));

        if let Some(conn) = conn {
            if let Err(err) = conn.sync().await {
                warn!("heartbeat failed: {} [{}]", err, self.address());

                if !conn.test().await {
                    conn.mark_broken();
                    // Releasing a broken connection closes it.
                    drop(conn);

                    for db in &databases {
                        db.test_and_cleanup().await;
                    }
                }
            }
        }

        self.shared.heartbeating.store(false, Ordering::Release);
    }

    /// Stop the heartbeat. Called when the server is removed from
    /// the registry.
    pub fn dispose(&self) {
        self.shared.shutdown.cancel();
    }

    /// Server state snapshot.
    pub fn state(&self) -> State {
        State {
            connections: self.connection_count(),
            quota: self.max_connection_count(),
            backend_max: self.backend_max(),
            databases: self.database_count(),
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}
