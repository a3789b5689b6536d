use dashmap::DashMap;

use crate::{Storage, ThrottleError, Value};

/// In-process storage backed by a [`DashMap`].
///
/// Point operations and [`incr`](Storage::incr) are atomic per key. Multi-key operations
/// use the default composition, so a coherent `mget` can still observe half of a
/// concurrent `mset`. Wrap it in [`LockedStorage`](crate::LockedStorage) or
/// [`RowLockedStorage`](crate::RowLockedStorage) when that matters.
///
/// State is process-scoped: buckets in other processes do not see it.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: DashMap<String, Value>,
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>, ThrottleError> {
        Ok(self.data.get(key).map(|value| *value).or(default))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ThrottleError> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    fn incr(&self, key: &str, amount: i64, default: i64) -> Result<i64, ThrottleError> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert(Value::Integer(default));

        let updated = entry.as_i64().saturating_add(amount);
        *entry = Value::Integer(updated);

        Ok(updated)
    }
}
