//! Key-value storage contract shared by every bucket.
//!
//! [`Storage`] is the only thing a [`Bucket`](crate::Bucket) knows about where its state
//! lives. Backends implement it directly; decorators wrap another `Storage` and add
//! concurrency guarantees while presenting the same interface.
//!
//! # Backends
//!
//! - [`MemoryStorage`]: in-process map, shared between threads
//! - `RedisStorage` (feature `redis`): shared between processes
//!
//! # Decorators
//!
//! - [`LockedStorage`]: one global lock, serializes every write
//! - [`RowLockedStorage`]: one lock per key, serializes only conflicting writes
//!
//! # Examples
//!
//! ```
//! use throttle::{Bucket, LeakRate, MemoryStorage, RowLockedStorage};
//!
//! let storage = RowLockedStorage::new(MemoryStorage::new());
//! let bucket = Bucket::new("user_123", LeakRate::try_from(2.0).unwrap(), 10, &storage);
//!
//! assert!(bucket.consume(1).unwrap());
//! ```

use std::sync::Arc;

use crate::{LeakRate, ThrottleError, Value};

mod memory_storage;
pub use memory_storage::*;

mod locked_storage;
pub use locked_storage::*;

mod row_locked_storage;
pub use row_locked_storage::*;

#[cfg(feature = "redis")]
mod redis_storage;
#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub use redis_storage::*;

/// A key-value store holding bucket state.
///
/// Only [`get`](Storage::get) and [`set`](Storage::set) are required. The multi-key
/// operations and [`incr`](Storage::incr) default to iterating point operations, which
/// works but gives up coherence and atomicity. Backends able to do better should
/// override them; otherwise wrap the backend in [`LockedStorage`] or
/// [`RowLockedStorage`].
///
/// # Concurrency contract
///
/// Every method may be called concurrently.
///
/// - `mget(.., coherent = true)` must not observe a half-applied concurrent `mset` on
///   any of the requested keys. `coherent = false` allows torn reads.
/// - `mset` must appear atomic to coherent `mget` once wrapped by a decorator.
/// - `incr` is **not** required to be atomic by this trait. Atomicity is a property of
///   the backend or of the decorator wrapping it.
pub trait Storage: Send + Sync {
    /// Read `key`, returning `default` when it is absent.
    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>, ThrottleError>;

    /// Write `value` under `key`.
    fn set(&self, key: &str, value: Value) -> Result<(), ThrottleError>;

    /// Read several keys, in the order requested.
    fn mget(
        &self,
        keys: &[&str],
        default: Option<Value>,
        coherent: bool,
    ) -> Result<Vec<Option<Value>>, ThrottleError> {
        // Point reads cannot be made coherent here; decorators take care of it.
        let _ = coherent;

        keys.iter().map(|key| self.get(key, default)).collect()
    }

    /// Write several key/value pairs. Later duplicates of a key win.
    fn mset(&self, values: &[(&str, Value)]) -> Result<(), ThrottleError> {
        for (key, value) in values {
            self.set(key, *value)?;
        }

        Ok(())
    }

    /// Add `amount` (possibly negative) to `key`, seeding it with `default` when absent.
    ///
    /// Returns the stored result.
    fn incr(&self, key: &str, amount: i64, default: i64) -> Result<i64, ThrottleError> {
        let current = self
            .get(key, Some(Value::Integer(default)))?
            .map_or(default, |value| value.as_i64());
        let updated = current.saturating_add(amount);

        self.set(key, Value::Integer(updated))?;

        Ok(updated)
    }
}

/// A single leak-then-consume step, evaluated as one unit by [`AtomicConsume`].
#[derive(Debug, Clone, Copy)]
pub struct ConsumeRequest<'a> {
    /// Key holding the current amount.
    pub amount_key: &'a str,
    /// Key holding the last leak timestamp.
    pub last_leak_key: &'a str,
    /// Leak rate of the bucket.
    pub rate: LeakRate,
    /// Capacity of the bucket.
    pub capacity: u64,
    /// Units requested.
    pub amount: u64,
    /// Time of the request, in seconds since the Unix epoch.
    pub now: f64,
}

/// Storage able to leak, check and increment a bucket without interleaving.
///
/// [`Bucket::consume`](crate::Bucket::consume) leaks and increments under two separate
/// storage calls, so concurrent callers can overshoot the capacity. Backends and
/// decorators implementing this trait close that window; see
/// [`Bucket::consume_atomic`](crate::Bucket::consume_atomic).
pub trait AtomicConsume: Storage {
    /// Leak the bucket described by `request` and, if capacity allows, add
    /// `request.amount` to it. Returns whether the units were accepted.
    fn consume_atomic(&self, request: &ConsumeRequest<'_>) -> Result<bool, ThrottleError>;
}

macro_rules! forward_storage {
    ($($handle:ty),+ $(,)?) => {
        $(
            impl<T: Storage + ?Sized> Storage for $handle {
                fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>, ThrottleError> {
                    (**self).get(key, default)
                }

                fn set(&self, key: &str, value: Value) -> Result<(), ThrottleError> {
                    (**self).set(key, value)
                }

                fn mget(
                    &self,
                    keys: &[&str],
                    default: Option<Value>,
                    coherent: bool,
                ) -> Result<Vec<Option<Value>>, ThrottleError> {
                    (**self).mget(keys, default, coherent)
                }

                fn mset(&self, values: &[(&str, Value)]) -> Result<(), ThrottleError> {
                    (**self).mset(values)
                }

                fn incr(&self, key: &str, amount: i64, default: i64) -> Result<i64, ThrottleError> {
                    (**self).incr(key, amount, default)
                }
            }

            impl<T: AtomicConsume + ?Sized> AtomicConsume for $handle {
                fn consume_atomic(&self, request: &ConsumeRequest<'_>) -> Result<bool, ThrottleError> {
                    (**self).consume_atomic(request)
                }
            }
        )+
    };
}

forward_storage!(&T, Arc<T>, Box<T>);
