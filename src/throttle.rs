//! Top-level entrypoint for keyed buckets sharing one configuration.
//!
//! A [`Bucket`] describes a single namespace. [`Throttle`] hands out buckets for many
//! namespaces (per user, per endpoint, ...) with the same rate and capacity over the
//! same storage.

use crate::{AtomicConsume, Bucket, Clock, LeakRate, Storage, SystemClock, ThrottleError};

/// Configuration for [`Throttle`].
#[derive(Clone, Debug)]
pub struct ThrottleOptions {
    /// Units regenerated per second, per bucket.
    pub rate: LeakRate,
    /// Maximum units held, per bucket.
    pub capacity: u64,
    /// Optional namespace prepended to every bucket key as `"{prefix}:{key}"`.
    ///
    /// Use it to keep several throttles apart in one store. With `None`, bucket keys are
    /// used as given.
    pub prefix: Option<String>,
}

/// Keyed leaky buckets over shared storage.
///
/// # Examples
///
/// ```
/// use throttle::{LeakRate, ManualClock, MemoryStorage, RowLockedStorage, Throttle, ThrottleOptions};
///
/// let throttle = Throttle::with_clock(
///     ThrottleOptions {
///         rate: LeakRate::try_from(1.0).unwrap(),
///         capacity: 2,
///         prefix: Some("login".to_string()),
///     },
///     RowLockedStorage::new(MemoryStorage::new()),
///     ManualClock::new(0.0),
/// );
///
/// assert!(throttle.consume("alice", 2).unwrap());
/// assert!(!throttle.consume("alice", 1).unwrap());
///
/// // Buckets are independent.
/// assert!(throttle.consume("bob", 1).unwrap());
/// assert_eq!(throttle.bucket("bob").amount_key(), "login:bob:current-amount");
/// ```
pub struct Throttle<S, C = SystemClock> {
    options: ThrottleOptions,
    storage: S,
    clock: C,
}

impl<S: Storage> Throttle<S> {
    /// Create a throttle over `storage`, timed by the system clock.
    pub fn new(options: ThrottleOptions, storage: S) -> Self {
        Self::with_clock(options, storage, SystemClock)
    }
}

impl<S: Storage, C: Clock> Throttle<S, C> {
    /// Create a throttle over `storage`, timed by `clock`.
    pub fn with_clock(options: ThrottleOptions, storage: S, clock: C) -> Self {
        Self {
            options,
            storage,
            clock,
        }
    }

    /// Options the throttle was built with.
    pub fn options(&self) -> &ThrottleOptions {
        &self.options
    }

    /// Access the storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Bucket for `key`, borrowing this throttle's storage and clock.
    pub fn bucket(&self, key: &str) -> Bucket<&S, &C> {
        let key = match &self.options.prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        };

        Bucket::with_clock(
            key,
            self.options.rate,
            self.options.capacity,
            &self.storage,
            &self.clock,
        )
    }

    /// Shorthand for `self.bucket(key).consume(amount)`.
    pub fn consume(&self, key: &str, amount: u64) -> Result<bool, ThrottleError> {
        self.bucket(key).consume(amount)
    }

    /// Shorthand for `self.bucket(key).leak()`.
    pub fn leak(&self, key: &str) -> Result<u64, ThrottleError> {
        self.bucket(key).leak()
    }
}

impl<S: AtomicConsume, C: Clock> Throttle<S, C> {
    /// Shorthand for `self.bucket(key).consume_atomic(amount)`.
    pub fn consume_atomic(&self, key: &str, amount: u64) -> Result<bool, ThrottleError> {
        self.bucket(key).consume_atomic(amount)
    }
}
