//! Single-flight flow table
//!
//! Maps a flow key to a value that is expensive to set up, such as an
//! outbound socket. The first caller for a key runs the setup; callers that
//! arrive while it is running wait for its result instead of starting their
//! own. A failed setup is not remembered, so the next caller tries again.
//!
//! ```
//! use tun_nat::flow::FlowTable;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let flows: FlowTable<u16, String> = FlowTable::new();
//! let v = flows
//!     .get_or_try_init(53, || async { Ok::<_, std::io::Error>("dns".to_string()) })
//!     .await
//!     .unwrap();
//! assert_eq!(v, "dns");
//! assert_eq!(flows.get(&53).as_deref(), Some("dns"));
//! # }
//! ```

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

/// Concurrent map with single-flight initialization
#[derive(Debug)]
pub struct FlowTable<K, V>
where
    K: Eq + Hash,
{
    flows: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K, V> Default for FlowTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            flows: DashMap::new(),
        }
    }
}

impl<K, V> FlowTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key`, running `init` if no value exists yet
    ///
    /// # Errors
    ///
    /// Returns the error of `init`. Callers that were waiting on the same
    /// attempt retry with their own `init`.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        // The shard guard must not live across the await below.
        let cell = Arc::clone(self.flows.entry(key.clone()).or_default().value());

        match cell.get_or_try_init(init).await {
            Ok(value) => Ok(value.clone()),
            Err(e) => {
                self.flows
                    .remove_if(&key, |_, c| Arc::ptr_eq(c, &cell) && !c.initialized());
                Err(e)
            }
        }
    }

    /// Initialized value for `key`
    pub fn get(&self, key: &K) -> Option<V> {
        self.flows.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Remove `key`, returning its value if it was initialized
    pub fn remove(&self, key: &K) -> Option<V> {
        self.flows
            .remove(key)
            .and_then(|(_, cell)| cell.get().cloned())
    }

    /// Remove `key` only if its current value satisfies `predicate`
    ///
    /// Lets an expiring flow remove itself without removing a newer flow
    /// that replaced it under the same key.
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> bool {
        self.flows
            .remove_if(key, |_, cell| cell.get().is_some_and(predicate))
            .is_some()
    }

    /// Number of keys, including ones still initializing
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
