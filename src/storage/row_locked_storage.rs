use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use dashmap::DashMap;

use crate::{AtomicConsume, ConsumeRequest, Storage, ThrottleError, Value, bucket};

/// Storage wrapper with one lock per key.
///
/// # Locking
///
/// | Operation | Locks |
/// |---|---|
/// | `get` | never |
/// | `mget` | every requested key, only when `coherent` is requested |
/// | `set`, `incr` | the written key |
/// | `mset` | every written key |
///
/// Operations on disjoint keys never wait on each other; operations sharing a key are
/// totally ordered. Multi-key lock sets are de-duplicated and always acquired in
/// ascending key order, so two operations over overlapping key sets cannot deadlock
/// whatever order their callers listed the keys in.
///
/// # Memory
///
/// A key's lock only exists while some operation references it. It is created on first
/// use and dropped from the table when the last in-flight operation releases it, so the
/// table is bounded by concurrency rather than by the number of distinct keys ever
/// seen. [`lock_count`](RowLockedStorage::lock_count) reports the current size.
pub struct RowLockedStorage<S> {
    inner: S,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: Storage> RowLockedStorage<S> {
    /// Wrap `inner`.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            locks: DashMap::new(),
        }
    }

    /// The wrapped storage.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Unwrap into the inner storage.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Number of keys currently holding a lock entry.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn checkout<'a, I>(&self, keys: I) -> RowSet<'_>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut keys: Vec<&str> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();

        let rows = keys
            .into_iter()
            .map(|key| {
                let lock = self
                    .locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone();

                (key.to_string(), lock)
            })
            .collect();

        RowSet {
            locks: &self.locks,
            rows,
        }
    }

    /// Run `f` on the inner storage while holding the locks of `keys`.
    fn with_rows<'a, I, R>(&self, keys: I, f: impl FnOnce(&S) -> R) -> R
    where
        I: IntoIterator<Item = &'a str>,
    {
        let rows = self.checkout(keys);
        let _guards = rows.acquire();

        f(&self.inner)
    }
}

/// Lock entries checked out for one operation, in acquisition order.
///
/// Dropping the set evicts every entry no other operation still references.
struct RowSet<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    rows: Vec<(String, Arc<Mutex<()>>)>,
}

impl RowSet<'_> {
    fn acquire(&self) -> Vec<MutexGuard<'_, ()>> {
        self.rows
            .iter()
            .map(|(_, lock)| lock.lock().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }
}

impl Drop for RowSet<'_> {
    fn drop(&mut self) {
        for (key, lock) in self.rows.drain(..) {
            drop(lock);

            // Entries are only cloned under the shard lock, so a count of one means no
            // operation holds or is about to take this lock.
            self.locks
                .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

impl<S: Storage> Storage for RowLockedStorage<S> {
    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>, ThrottleError> {
        self.inner.get(key, default)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ThrottleError> {
        self.with_rows([key], |inner| inner.set(key, value))
    }

    fn mget(
        &self,
        keys: &[&str],
        default: Option<Value>,
        coherent: bool,
    ) -> Result<Vec<Option<Value>>, ThrottleError> {
        if !coherent {
            return self.inner.mget(keys, default, false);
        }

        self.with_rows(keys.iter().copied(), |inner| {
            inner.mget(keys, default, true)
        })
    }

    fn mset(&self, values: &[(&str, Value)]) -> Result<(), ThrottleError> {
        self.with_rows(values.iter().map(|(key, _)| *key), |inner| {
            inner.mset(values)
        })
    }

    fn incr(&self, key: &str, amount: i64, default: i64) -> Result<i64, ThrottleError> {
        self.with_rows([key], |inner| inner.incr(key, amount, default))
    }
}

impl<S: Storage> AtomicConsume for RowLockedStorage<S> {
    fn consume_atomic(&self, request: &ConsumeRequest<'_>) -> Result<bool, ThrottleError> {
        self.with_rows([request.amount_key, request.last_leak_key], |inner| {
            bucket::consume_on(inner, request)
        })
    }
}

impl<S: fmt::Debug> fmt::Debug for RowLockedStorage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RowLockedStorage").field(&self.inner).finish()
    }
}
