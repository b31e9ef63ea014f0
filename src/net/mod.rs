//! Extended-query protocol messages the client precomputes.

pub mod cache;
pub mod parse;
pub mod payload;
pub mod sync;

pub use cache::StatementCache;
pub use parse::Parse;
pub use payload::Payload;
pub use sync::Sync;
