//! One (server, database) pairing.
//!
//! Thin adapter binding a server to a database through one pool, so
//! the dispatch loop can treat a single node the same way it treats
//! a whole database.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{Overrides, Settings};
use crate::error::Error;

use super::dispatch::{CommandKind, CommandQueue, Dispatch, Intent};
use super::pool::Guard;
use super::{Connector, Pool, Server, Target};

struct Shared {
    server: Server,
    pool: Pool,
    database_name: String,
    settings: Settings,
    queue: CommandQueue,
}

/// A database pooled on one server.
pub struct Node {
    shared: Arc<Shared>,
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Node {
    /// Create new node. Timeout overrides of zero inherit the
    /// database's settings.
    pub fn new(
        server: Server,
        database_name: &str,
        user: &str,
        password: &str,
        settings: &Settings,
        overrides: Overrides,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let settings = overrides.resolve(settings);

        let target = Target {
            address: server.address().clone(),
            database_name: database_name.to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
            settings,
        };

        let pool = Pool::new(server.clone(), target, connector);

        Self {
            shared: Arc::new(Shared {
                server,
                pool,
                database_name: database_name.to_owned(),
                settings,
                queue: CommandQueue::new(database_name),
            }),
        }
    }

    /// The server this node is bound to.
    pub fn server(&self) -> &Server {
        &self.shared.server
    }

    /// The node's connection pool.
    pub fn pool(&self) -> &Pool {
        &self.shared.pool
    }

    /// Effective timeouts for this node.
    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Non-blocking idle-connection pop.
    pub fn try_acquire(&self) -> Option<Guard> {
        self.shared.pool.try_acquire()
    }

    /// Queue a command against this node only.
    pub fn dispatch(&self, intent: Box<dyn Intent>) {
        self.shared
            .queue
            .dispatch(Arc::new(self.clone()), intent);
    }

    /// Number of queued commands.
    pub fn queued(&self) -> usize {
        self.shared.queue.depth()
    }

    /// Sweep the pool's idle connections.
    pub async fn test_and_cleanup(&self) {
        self.shared.pool.test_and_cleanup().await;
    }

    /// Release the pool and stop the dispatch loop.
    pub fn dispose(&self) {
        self.shared.queue.dispose();
        self.shared.pool.dispose();
    }
}

#[async_trait]
impl Dispatch for Node {
    fn database_name(&self) -> &str {
        &self.shared.database_name
    }

    fn idle_connections(&self) -> usize {
        self.shared.pool.idle()
    }

    async fn acquire(
        &self,
        kind: CommandKind,
        cancel: &CancellationToken,
    ) -> Result<Guard, Error> {
        self.shared.pool.acquire(kind, cancel).await
    }

    fn prune(&self, n: usize) -> usize {
        self.shared.pool.prune(n)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("server", self.shared.server.address())
            .field("database", &self.shared.database_name)
            .finish()
    }
}
