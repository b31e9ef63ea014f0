//! Physical connection boundary.
//!
//! The pool doesn't know how to speak to a server. It manages any
//! logical connection that implements [`Connection`], opened through
//! a [`Connector`] supplied when the registry is built.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::Error;

use super::Address;

/// Everything a connector needs to open one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Server address.
    pub address: Address,
    /// Database to connect to.
    pub database_name: String,
    /// Username.
    pub user: String,
    /// Password.
    pub password: String,
    /// Effective timeouts for this node.
    pub settings: Settings,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.database_name, self.user, self.address)
    }
}

/// An established, possibly broken, link to one server.
///
/// Implementations own the socket, the handshake and the wire codec;
/// the pool only tracks membership and checkout state through this
/// surface.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Unique connection identifier within the process.
    fn id(&self) -> u64;

    /// The connection is known to be unusable.
    fn is_broken(&self) -> bool;

    /// Mark the connection unusable. It will be closed instead of
    /// returned to the idle queue.
    fn mark_broken(&self);

    /// The current owner finished with the connection and it is
    /// on its way back to the pool.
    fn is_released(&self) -> bool;

    /// Mark the connection checked out.
    fn activate(&self);

    /// Mark the connection returned.
    fn release(&self);

    /// Close the physical link. Must be idempotent and must not block.
    fn close(&self);

    /// Protocol-level liveness probe.
    async fn test(&self) -> bool;

    /// Protocol keep-alive.
    async fn sync(&self) -> Result<(), Error>;

    /// Run a text command expected to return a single integer
    /// row/column. Used only by server introspection.
    async fn query_scalar(&self, query: &str) -> Result<i64, Error>;

    /// Escape hatch for intents that need the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Opens new connections for a pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to the target, honoring the caller's
    /// cancellation signal.
    async fn open(
        &self,
        target: &Target,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Connection>, Error>;
}
