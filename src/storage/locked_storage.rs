use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{AtomicConsume, ConsumeRequest, Storage, ThrottleError, Value, bucket};

/// Storage wrapper serializing every write behind one lock.
///
/// # Locking
///
/// | Operation | Locks |
/// |---|---|
/// | `get` | never |
/// | `mget` | only when `coherent` is requested |
/// | `set`, `mset`, `incr` | always |
///
/// Writes (and coherent reads) are totally ordered, which makes `incr` atomic and
/// `mset` indivisible to coherent readers regardless of the inner backend. The price is
/// that unrelated buckets contend on the same lock; see
/// [`RowLockedStorage`](crate::RowLockedStorage) for the per-key variant.
///
/// The lock is process-local. Processes sharing a remote backend are not serialized
/// against each other.
pub struct LockedStorage<S> {
    inner: S,
    lock: Mutex<()>,
}

impl<S: Storage> LockedStorage<S> {
    /// Wrap `inner`.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
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

    fn acquire(&self) -> MutexGuard<'_, ()> {
        // The lock guards no data, so a panic while holding it leaves nothing torn.
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Storage> Storage for LockedStorage<S> {
    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>, ThrottleError> {
        self.inner.get(key, default)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ThrottleError> {
        let _guard = self.acquire();
        self.inner.set(key, value)
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

        let _guard = self.acquire();
        self.inner.mget(keys, default, true)
    }

    fn mset(&self, values: &[(&str, Value)]) -> Result<(), ThrottleError> {
        let _guard = self.acquire();
        self.inner.mset(values)
    }

    fn incr(&self, key: &str, amount: i64, default: i64) -> Result<i64, ThrottleError> {
        let _guard = self.acquire();
        self.inner.incr(key, amount, default)
    }
}

impl<S: Storage> AtomicConsume for LockedStorage<S> {
    fn consume_atomic(&self, request: &ConsumeRequest<'_>) -> Result<bool, ThrottleError> {
        let _guard = self.acquire();
        bucket::consume_on(&self.inner, request)
    }
}

impl<S: fmt::Debug> fmt::Debug for LockedStorage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockedStorage").field(&self.inner).finish()
    }
}
