//! Connection pool for one (server, database) pairing.

pub mod guard;
pub mod inner;
pub mod pool;

pub use guard::Guard;
pub use pool::{Pool, State};

use inner::Inner;
