//! Connection balancing and dispatch across backend servers.

pub mod address;
pub mod connection;
pub mod database;
pub mod dispatch;
pub mod manager;
pub mod node;
pub mod pool;
pub mod server;

#[cfg(test)]
pub mod mock;

pub use address::Address;
pub use connection::{Connection, Connector, Target};
pub use database::Database;
pub use dispatch::{CommandKind, CommandQueue, Dispatch, Intent, ReleaseState};
pub use manager::Manager;
pub use node::Node;
pub use pool::{Guard, Pool};
pub use server::Server;
