//! Registry of servers and databases.
//!
//! Owned by the host application with process-scoped lifetime; there
//! is no global. Repeated requests for the same target converge on
//! the same server and database instances.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::Settings;

use super::{Address, Connector, Database, Server};

/// Everything needed to ensure a database target.
#[derive(Clone)]
pub struct DatabaseOptions {
    /// Database name.
    pub name: String,
    /// Username.
    pub user: String,
    /// Password.
    pub password: String,
    /// Caller-supplied identity; derived from name and user when not
    /// given.
    pub id: Option<u64>,
    /// Per-database timeouts and cache ceiling.
    pub settings: Settings,
}

struct Shared {
    servers: Mutex<HashMap<Address, Server>>,
    databases: Mutex<HashMap<u64, Database>>,
    connector: Arc<dyn Connector>,
}

/// Server and database registry.
pub struct Manager {
    shared: Arc<Shared>,
}

impl Clone for Manager {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Manager {
    /// Create new registry. All connections it ever opens go through
    /// the given connector.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                servers: Mutex::new(HashMap::new()),
                databases: Mutex::new(HashMap::new()),
                connector,
            }),
        }
    }

    /// Find an existing database by id.
    pub fn find_database(&self, id: u64) -> Option<Database> {
        self.shared.databases.lock().get(&id).cloned()
    }

    /// Return the database for the target, creating it if needed, and
    /// union in any newly-seen hosts as additional nodes.
    pub fn ensure_database(&self, hosts: &[Address], options: DatabaseOptions) -> Database {
        let id = options
            .id
            .unwrap_or_else(|| Database::deterministic_id(&options.name, &options.user));

        let database = {
            let mut guard = self.shared.databases.lock();

            guard
                .entry(id)
                .or_insert_with(|| {
                    info!("new database {}/{}", options.name, options.user);

                    Database::new(
                        Some(id),
                        &options.name,
                        &options.user,
                        &options.password,
                        options.settings,
                        self.shared.connector.clone(),
                    )
                })
                .clone()
        };

        let servers = hosts
            .iter()
            .map(|host| self.ensure_server(host))
            .collect::<Vec<_>>();

        database.update_nodes(&servers);

        database
    }

    /// Return the server for the host, creating it if needed.
    pub fn ensure_server(&self, address: &Address) -> Server {
        self.shared
            .servers
            .lock()
            .entry(address.clone())
            .or_insert_with(|| {
                info!("new server [{}]", address);
                Server::new(address.clone())
            })
            .clone()
    }

    /// Remove a server, but only once it hosts zero databases.
    pub fn remove_server(&self, server: &Server) -> bool {
        if server.database_count() > 0 {
            return false;
        }

        let removed = self
            .shared
            .servers
            .lock()
            .remove(server.address())
            .is_some();

        if removed {
            server.dispose();
        }

        removed
    }

    /// Dispose a database and drop it from the registry. Servers left
    /// hosting nothing are removed too.
    pub fn remove_database(&self, id: u64) {
        let database = self.shared.databases.lock().remove(&id);

        if let Some(database) = database {
            database.dispose();
        }

        let empty = {
            let guard = self.shared.servers.lock();
            guard
                .values()
                .filter(|server| server.database_count() == 0)
                .cloned()
                .collect::<Vec<_>>()
        };

        for server in empty {
            self.remove_server(&server);
        }
    }

    /// Number of registered servers.
    pub fn server_count(&self) -> usize {
        self.shared.servers.lock().len()
    }

    /// Number of registered databases.
    pub fn database_count(&self) -> usize {
        self.shared.databases.lock().len()
    }

    /// Dispose everything. Called on process teardown.
    pub fn shutdown(&self) {
        let databases = {
            let mut guard = self.shared.databases.lock();
            guard.drain().map(|(_, db)| db).collect::<Vec<_>>()
        };

        for database in databases {
            database.dispose();
        }

        let servers = {
            let mut guard = self.shared.servers.lock();
            guard.drain().map(|(_, server)| server).collect::<Vec<_>>()
        };

        for server in servers {
            server.dispose();
        }

        info!("registry shut down");
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("servers", &self.server_count())
            .field("databases", &self.database_count())
            .finish()
    }
}
