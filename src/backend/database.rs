//! A logical database target, potentially multi-homed across servers.
//!
//! The database balances round-robin over its nodes. The cursor
//! advances on every attempt, so one bad node can't starve callers.

use std::hash::Hasher;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use fnv::FnvHasher;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{Overrides, Settings};
use crate::error::Error;
use crate::net::StatementCache;

use super::dispatch::{prune_connections, CommandKind, CommandQueue, Dispatch, Intent};
use super::pool::Guard;
use super::{Address, Connector, Node, Server};

/// Node list and the round-robin cursor, under one lock.
#[derive(Default)]
struct Nodes {
    nodes: Vec<Node>,
    cursor: usize,
}

struct Shared {
    id: u64,
    name: String,
    user: String,
    password: String,
    settings: Settings,
    nodes: Mutex<Nodes>,
    cache: StatementCache,
    queue: CommandQueue,
    connector: Arc<dyn Connector>,
}

/// A logical (host-set, database, user) target.
pub struct Database {
    shared: Arc<Shared>,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Weak handle a server keeps for the databases it hosts.
pub struct WeakDatabase {
    shared: Weak<Shared>,
}

impl WeakDatabase {
    pub(super) fn alive(&self) -> bool {
        self.shared.strong_count() > 0
    }

    pub(super) fn upgrade(&self) -> Option<Database> {
        self.shared.upgrade().map(|shared| Database { shared })
    }
}

impl Database {
    /// Create new database. With no id given, repeated requests for
    /// the same name/user converge on the same identity.
    pub fn new(
        id: Option<u64>,
        name: &str,
        user: &str,
        password: &str,
        settings: Settings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let settings = settings.clamped();

        Self {
            shared: Arc::new(Shared {
                id: id.unwrap_or_else(|| Self::deterministic_id(name, user)),
                name: name.to_owned(),
                user: user.to_owned(),
                password: password.to_owned(),
                settings,
                nodes: Mutex::new(Nodes::default()),
                cache: StatementCache::new(settings.max_cached_statement_len),
                queue: CommandQueue::new(name),
                connector: connector.clone(),
            }),
        }
    }

    /// Content-derived identity: the same name and user always hash
    /// to the same id.
    pub fn deterministic_id(name: &str, user: &str) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(name.as_bytes());
        hasher.write_u8(0);
        hasher.write(user.as_bytes());
        hasher.finish()
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn user(&self) -> &str {
        &self.shared.user
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// The extended-query message cache.
    pub fn cache(&self) -> &StatementCache {
        &self.shared.cache
    }

    pub(super) fn downgrade(&self) -> WeakDatabase {
        WeakDatabase {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Add nodes for any server we don't know yet.
    pub fn update_nodes(&self, servers: &[Server]) {
        for server in servers {
            self.add_node(server, Overrides::default());
        }
    }

    /// Add a node for the server unless one exists already.
    pub fn add_node(&self, server: &Server, overrides: Overrides) {
        {
            let guard = self.shared.nodes.lock();

            let known = guard
                .nodes
                .iter()
                .any(|node| node.server().address() == server.address());

            if known {
                return;
            }
        }

        let node = Node::new(
            server.clone(),
            &self.shared.name,
            &self.shared.user,
            &self.shared.password,
            &self.shared.settings,
            overrides,
            self.shared.connector.clone(),
        );

        server.attach(self);

        let mut guard = self.shared.nodes.lock();
        if !guard
            .nodes
            .iter()
            .any(|n| n.server().address() == server.address())
        {
            guard.nodes.push(node);
        }
    }

    /// Remove the node for the given server, disposing it.
    pub fn remove_node(&self, address: &Address) {
        let removed = {
            let mut guard = self.shared.nodes.lock();

            let index = guard
                .nodes
                .iter()
                .position(|node| node.server().address() == address);

            index.map(|index| guard.nodes.remove(index))
        };

        if let Some(node) = removed {
            node.dispose();
            node.server().detach(self);
        }
    }

    /// All nodes, in round-robin order starting at the cursor.
    fn snapshot(&self) -> (Vec<Node>, usize) {
        let guard = self.shared.nodes.lock();
        (guard.nodes.clone(), guard.cursor)
    }

    fn advance_cursor(&self, to: usize) {
        let mut guard = self.shared.nodes.lock();
        if !guard.nodes.is_empty() {
            guard.cursor = to % guard.nodes.len();
        }
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.shared.nodes.lock().nodes.len()
    }

    /// Immediate, non-waiting idle scan: start at the cursor, wrap
    /// around all nodes once, never block.
    pub fn try_acquire(&self) -> Option<Guard> {
        let (nodes, cursor) = self.snapshot();

        for offset in 0..nodes.len() {
            let index = (cursor + offset) % nodes.len();

            if let Some(conn) = nodes[index].try_acquire() {
                self.advance_cursor(index + 1);
                return Some(conn);
            }
        }

        None
    }

    /// Obtain a connection: idle scan first, then ask the node at the
    /// cursor to open or wait. The cursor advances whether the node
    /// delivers or not.
    pub async fn acquire(
        &self,
        kind: CommandKind,
        cancel: &CancellationToken,
    ) -> Result<Guard, Error> {
        if let Some(conn) = self.try_acquire() {
            return Ok(conn);
        }

        let node = {
            let (nodes, cursor) = self.snapshot();

            if nodes.is_empty() {
                return Err(Error::Busy(self.shared.name.clone()));
            }

            nodes[cursor % nodes.len()].clone()
        };

        let result = node.acquire(kind, cancel).await;

        let cursor = self.shared.nodes.lock().cursor;
        self.advance_cursor(cursor + 1);

        result
    }

    /// Pop an idle connection pooled on the given server, if any.
    /// Used by the server's heartbeat.
    pub fn borrow_idle(&self, address: &Address) -> Option<Guard> {
        let (nodes, _) = self.snapshot();

        nodes
            .iter()
            .filter(|node| node.server().address() == address)
            .find_map(|node| node.try_acquire())
    }

    /// Queue a command for execution on any node.
    pub fn dispatch(&self, intent: Box<dyn Intent>) {
        self.shared
            .queue
            .dispatch(Arc::new(self.clone()), intent);
    }

    /// Number of queued commands.
    pub fn queued(&self) -> usize {
        self.shared.queue.depth()
    }

    /// Sweep every node's idle connections.
    pub async fn test_and_cleanup(&self) {
        let (nodes, _) = self.snapshot();

        for node in nodes {
            node.test_and_cleanup().await;
        }
    }

    /// Stop the dispatch loop and dispose every node.
    pub fn dispose(&self) {
        self.shared.queue.dispose();

        let nodes = {
            let mut guard = self.shared.nodes.lock();
            guard.cursor = 0;
            std::mem::take(&mut guard.nodes)
        };

        for node in nodes {
            node.dispose();
            node.server().detach(self);
        }
    }
}

#[async_trait]
impl Dispatch for Database {
    fn database_name(&self) -> &str {
        &self.shared.name
    }

    fn idle_connections(&self) -> usize {
        let (nodes, _) = self.snapshot();
        nodes.iter().map(|node| node.idle_connections()).sum()
    }

    async fn acquire(
        &self,
        kind: CommandKind,
        cancel: &CancellationToken,
    ) -> Result<Guard, Error> {
        Database::acquire(self, kind, cancel).await
    }

    fn prune(&self, n: usize) -> usize {
        let (nodes, _) = self.snapshot();
        let dispatchers = nodes.iter().map(|node| node as &dyn Dispatch).collect::<Vec<_>>();

        prune_connections(&dispatchers, n)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("user", &self.shared.user)
            .field("nodes", &self.node_count())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::mock::{MockConnector, TestIntent};
    use crate::config::Settings;

    fn connector() -> Arc<MockConnector> {
        Arc::new(MockConnector::new())
    }

    fn database(connector: Arc<MockConnector>) -> Database {
        Database::new(
            None,
            "pgfleet",
            "pgfleet",
            "hunter2",
            Settings {
                wait_timeout: 1,
                ..Default::default()
            },
            connector,
        )
    }

    fn server(port: u16) -> Server {
        Server::new(Address::new("127.0.0.1", port))
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    /// Park one idle connection on every node.
    async fn fill_idle(db: &Database) {
        let (nodes, _) = db.snapshot();

        for node in nodes {
            let conn = node
                .pool()
                .acquire(CommandKind::Query, &cancel())
                .await
                .unwrap();
            drop(conn);
        }
    }

    #[test]
    fn test_deterministic_id() {
        let a = Database::deterministic_id("orders", "app");
        let b = Database::deterministic_id("orders", "app");
        let c = Database::deterministic_id("orders", "reporting");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_update_nodes_only_grows() {
        let db = database(connector());

        let first = server(5432);
        let second = server(5433);

        db.update_nodes(&[first.clone()]);
        assert_eq!(db.node_count(), 1);

        // Same host again plus one new: only the new one is added.
        db.update_nodes(&[first.clone(), second.clone()]);
        assert_eq!(db.node_count(), 2);

        assert_eq!(first.database_count(), 1);
        assert_eq!(second.database_count(), 1);

        db.dispose();
    }

    #[test]
    fn test_remove_node_detaches() {
        let db = database(connector());
        let srv = server(5432);

        db.update_nodes(&[srv.clone()]);
        assert_eq!(srv.database_count(), 1);

        db.remove_node(srv.address());
        assert_eq!(db.node_count(), 0);
        assert_eq!(srv.database_count(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        let db = database(connector());
        let first = server(5432);
        let second = server(5433);
        let third = server(5434);

        db.update_nodes(&[first, second, third]);
        fill_idle(&db).await;

        // Three consecutive acquisitions visit each node exactly once.
        let mut seen = Vec::new();
        let mut held = Vec::new();

        for _ in 0..3 {
            let conn = db.try_acquire().unwrap();
            seen.push(conn.pool().server().address().clone());
            held.push(conn);
        }

        seen.sort_by_key(|addr| addr.port);
        assert_eq!(
            seen.iter().map(|a| a.port).collect::<Vec<_>>(),
            vec![5432, 5433, 5434]
        );

        drop(held);
        db.dispose();
    }

    #[tokio::test]
    async fn test_starved_node_skipped() {
        let db = database(connector());
        let empty = server(5432); // node B, never has idle connections
        let full = server(5433); // node A, always does

        db.update_nodes(&[empty, full]);

        // Only the second node gets an idle connection.
        let (nodes, _) = db.snapshot();
        drop(
            nodes[1]
                .pool()
                .acquire(CommandKind::Query, &cancel())
                .await
                .unwrap(),
        );

        // Cursor starts at the empty node; the scan wraps around
        // without blocking and delivers within two calls.
        let conn = db.try_acquire().unwrap();
        assert_eq!(conn.pool().server().address().port, 5433);
        drop(conn);

        let conn = db.try_acquire().unwrap();
        assert_eq!(conn.pool().server().address().port, 5433);

        drop(conn);
        db.dispose();
    }

    #[tokio::test]
    async fn test_acquire_opens_on_cursor_node() {
        let db = database(connector());
        db.update_nodes(&[server(5432), server(5433)]);

        let first = db.acquire(CommandKind::Query, &cancel()).await.unwrap();
        let second = db.acquire(CommandKind::Query, &cancel()).await.unwrap();

        // The cursor advanced between attempts: two different servers.
        assert_ne!(
            first.pool().server().address(),
            second.pool().server().address()
        );

        drop(first);
        drop(second);
        db.dispose();
    }

    #[tokio::test]
    async fn test_acquire_without_nodes_is_busy() {
        let db = database(connector());

        let err = db.acquire(CommandKind::Query, &cancel()).await.unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }

    #[tokio::test]
    async fn test_borrow_idle_matches_server() {
        let db = database(connector());
        let first = server(5432);
        let second = server(5433);

        db.update_nodes(&[first.clone(), second.clone()]);
        fill_idle(&db).await;

        let conn = db.borrow_idle(first.address()).unwrap();
        assert_eq!(conn.pool().server().address(), first.address());
        drop(conn);

        db.remove_node(second.address());
        assert!(db.borrow_idle(second.address()).is_none());

        db.dispose();
    }

    #[tokio::test]
    async fn test_dispatch_executes() {
        let db = database(connector());
        db.update_nodes(&[server(5432)]);

        let (intent, rx) = TestIntent::new(CommandKind::Query);
        db.dispatch(intent);

        let conn_id = rx.await.unwrap().unwrap();
        assert!(conn_id > 0);

        // The worker released the connection back to the pool.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while db.idle_connections() == 0 {
            assert!(std::time::Instant::now() < deadline);
            tokio::task::yield_now().await;
        }

        db.dispose();
    }

    #[tokio::test]
    async fn test_dispatch_many() {
        let db = database(connector());
        db.update_nodes(&[server(5432), server(5433)]);

        let mut results = Vec::new();
        for _ in 0..16 {
            let (intent, rx) = TestIntent::new(CommandKind::Query);
            db.dispatch(intent);
            results.push(rx);
        }

        for rx in results {
            rx.await.unwrap().unwrap();
        }

        db.dispose();
    }

    #[tokio::test]
    async fn test_dispatch_failure_resolves_intent() {
        let connector = connector();
        let db = database(connector.clone());
        db.update_nodes(&[server(5432)]);

        connector.fail_next(Error::Connect("refused".into()));

        let (intent, rx) = TestIntent::new(CommandKind::Query);
        db.dispatch(intent);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Connect(_)));

        db.dispose();
    }

    #[tokio::test]
    async fn test_dispatch_survives_worker_panic() {
        let db = database(connector());
        db.update_nodes(&[server(5432)]);

        let (intent, rx) = TestIntent::new(CommandKind::Query);
        db.dispatch(intent.panicking());

        // The panicking worker never resolves its handle; the loop
        // logs the failure and keeps going.
        assert!(rx.await.is_err());

        let (intent, rx) = TestIntent::new(CommandKind::Query);
        db.dispatch(intent);
        rx.await.unwrap().unwrap();

        db.dispose();
    }

    #[tokio::test]
    async fn test_dispose_resolves_everything() {
        let db = database(connector());
        db.update_nodes(&[server(5432)]);

        // Queue a batch and dispose immediately: every intent must
        // resolve exactly once, executed or failed.
        let mut results = Vec::new();
        for _ in 0..8 {
            let (intent, rx) = TestIntent::new(CommandKind::Query);
            db.dispatch(intent);
            results.push(rx);
        }

        db.dispose();

        for rx in results {
            assert!(rx.await.is_ok());
        }

        // Post-dispose dispatch fails immediately.
        let (intent, rx) = TestIntent::new(CommandKind::Query);
        db.dispatch(intent);
        assert_eq!(rx.await.unwrap().unwrap_err(), Error::Cancelled);
    }

    #[tokio::test]
    async fn test_prune_across_nodes() {
        let db = database(connector());
        db.update_nodes(&[server(5432), server(5433)]);
        fill_idle(&db).await;

        assert_eq!(db.idle_connections(), 2);

        let pruned = db.prune(2);
        assert_eq!(pruned, 2);
        assert_eq!(db.idle_connections(), 0);

        db.dispose();
    }

    #[test]
    fn test_cache_owned_by_database() {
        let db = database(connector());

        let parse = db.cache().make("SELECT 1", &[]);
        let again = db.cache().make("SELECT 1", &[]);

        assert!(Arc::ptr_eq(&parse, &again));
    }
}
