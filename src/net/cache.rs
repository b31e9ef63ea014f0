//! Extended-query message cache.
//!
//! Building a Parse message allocates and copies the query text,
//! which adds up on hot paths. The cache memoizes the finished
//! message by exact query text, byte-for-byte and case-sensitive.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::config::DEFAULT_CACHE_CEILING;

use super::Parse;

struct Inner {
    statements: FnvHashMap<String, Arc<Parse>>,
    /// Don't cache query text longer than this, in characters.
    /// 0 disables caching.
    ceiling: usize,
}

/// Cache of precomputed Parse messages, keyed by query text.
pub struct StatementCache {
    inner: Mutex<Inner>,
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CEILING)
    }
}

impl StatementCache {
    /// Create new cache with the given text-length ceiling,
    /// measured in characters.
    pub fn new(ceiling: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                statements: FnvHashMap::default(),
                ceiling,
            }),
        }
    }

    /// Get the Parse message for the query, building it on first use.
    ///
    /// Queries longer than the ceiling are rebuilt on every call;
    /// cached entries are immutable and shared.
    pub fn make(&self, query: &str, param_types: &[i32]) -> Arc<Parse> {
        {
            let mut guard = self.inner.lock();

            if guard.ceiling > 0 && query.chars().count() <= guard.ceiling {
                return match guard.statements.entry(query.to_owned()) {
                    Entry::Occupied(entry) => entry.get().clone(),
                    Entry::Vacant(entry) => {
                        let parse = Arc::new(Parse::new(query, param_types));
                        entry.insert(parse.clone());
                        parse
                    }
                };
            }
        }

        Arc::new(Parse::new(query, param_types))
    }

    /// Change the ceiling, evicting entries that no longer fit.
    pub fn set_ceiling(&self, ceiling: usize) {
        let mut guard = self.inner.lock();
        guard.ceiling = ceiling;
        guard
            .statements
            .retain(|query, _| query.chars().count() <= ceiling);
    }

    /// Number of cached statements.
    pub fn len(&self) -> usize {
        self.inner.lock().statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
