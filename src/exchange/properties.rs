use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Set to `true` by the idempotent consumer when a duplicate is forwarded
/// instead of being skipped.
pub const DUPLICATE_MESSAGE: &str = "idemio.duplicate_message";
/// Number of broadcast copies that failed, recorded on the original exchange.
pub const BROADCAST_FAILURES: &str = "idemio.broadcast_failures";
/// Number of targets tried by a failover load balancer.
pub const FAILOVER_ATTEMPTS: &str = "idemio.failover_attempts";
/// Delay a throttler applied to the exchange.
pub const THROTTLED_FOR: &str = "idemio.throttled_for";
/// Set to `true` once a failed step was redelivered.
pub const REDELIVERED: &str = "idemio.redelivered";
/// Number of redeliveries of the current step, counting from 1.
pub const REDELIVERY_COUNTER: &str = "idemio.redelivery_counter";

/// Process-scoped exchange properties keyed by name.
///
/// Values are stored behind an `Arc` so copying an exchange copies the
/// properties shallowly.
#[derive(Clone, Default)]
pub struct Properties {
    values: HashMap<String, Arc<dyn Any + Send + Sync>, fnv::FnvBuildHasher>,
}

impl Properties {
    /// Creates a new empty property collection.
    pub fn new() -> Self {
        Self {
            values: HashMap::with_hasher(fnv::FnvBuildHasher::default()),
        }
    }

    /// Stores a typed value under `key`, replacing any previous value.
    ///
    /// # Examples
    /// ```rust
    /// use idemio_mediation::exchange::Properties;
    ///
    /// let mut properties = Properties::new();
    /// properties.insert("user_id", 123u32);
    /// assert_eq!(properties.get::<u32>("user_id"), Some(&123));
    /// ```
    pub fn insert<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.values.insert(key.into(), Arc::new(value));
    }

    /// Retrieves a value when it exists and has the requested type.
    pub fn get<T>(&self, key: &str) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.values
            .get(key)
            .and_then(|value| value.as_ref().downcast_ref::<T>())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Properties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}
