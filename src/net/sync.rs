//! Sync (F) message, used as the heartbeat keep-alive.

use bytes::Bytes;

use super::Payload;

#[derive(Debug, Clone, Default)]
pub struct Sync;

impl Sync {
    pub fn len(&self) -> usize {
        5
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn to_bytes(&self) -> Bytes {
        Payload::named('S').freeze()
    }
}
