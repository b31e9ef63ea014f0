//! Parse (F) message.

use bytes::{BufMut, Bytes};

use super::Payload;

/// Parse (F) message for an unnamed prepared statement.
///
/// The wire bytes are assembled once at construction and
/// never change, so a cached message can be reused freely.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Parse {
    query: String,
    param_types: Vec<i32>,
    bytes: Bytes,
}

impl Parse {
    /// Build the message for the given query text and
    /// declared parameter type oids.
    pub fn new(query: &str, param_types: &[i32]) -> Self {
        let mut payload = Payload::named('P');
        payload.reserve(Self::body_len(query, param_types));

        payload.put_string(""); // unnamed statement
        payload.put_string(query);
        payload.put_i16(param_types.len() as i16);

        for oid in param_types {
            payload.put_i32(*oid);
        }

        Self {
            query: query.to_owned(),
            param_types: param_types.to_vec(),
            bytes: payload.freeze(),
        }
    }

    fn body_len(query: &str, param_types: &[i32]) -> usize {
        1 // empty statement name
        + query.len() + 1
        + 2 // number of params
        + param_types.len() * 4
    }

    /// Total message length, tag included.
    pub fn len(&self) -> usize {
        Self::body_len(&self.query, &self.param_types) + 5
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn param_types(&self) -> &[i32] {
        &self.param_types
    }

    /// The precomputed wire bytes. Cheap to clone.
    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}
