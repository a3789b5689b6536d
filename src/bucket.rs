use crate::{
    AtomicConsume, Clock, ConsumeRequest, LeakRate, Storage, SystemClock, ThrottleError, Value,
};

const AMOUNT_SUFFIX: &str = "current-amount";
const LAST_LEAK_SUFFIX: &str = "last-leak";

/// Largest amount storage can hold, and so the largest usable capacity.
pub const MAX_CAPACITY: u64 = i64::MAX as u64;

/// A leaky bucket whose state lives in a [`Storage`].
///
/// The bucket "leaks" consumed units at `rate` per second and holds at most `capacity`
/// units. A request is admitted when adding it would not exceed the capacity.
///
/// # State
///
/// The bucket itself is stateless. Its state is two storage keys derived from the
/// namespace key:
///
/// - `"{key}:current-amount"`: units currently held (integer)
/// - `"{key}:last-leak"`: time of the last leak (float seconds since the Unix epoch)
///
/// Any process that builds a bucket with the same key over the same store shares the
/// same limit. `S` is a handle to the store (`&S`, `Arc<S>`, ...), never the only owner
/// of shared state.
///
/// # Algorithm
///
/// 1. **Leak:** coherently read `(amount, last_leak)`, subtract `elapsed × rate`
///    (floored, never below zero), write both keys back
/// 2. **Check:** reject if `leaked + requested > capacity`
/// 3. **Increment:** otherwise add `requested` to the stored amount
///
/// # Concurrency
///
/// **Leak and increment are separate storage calls.** Even under
/// [`RowLockedStorage`](crate::RowLockedStorage), another caller can run between the
/// leak's write and the increment, so concurrent [`consume`](Bucket::consume) calls may
/// all pass the check against a stale amount and jointly overshoot `capacity`. Use
/// [`consume_atomic`](Bucket::consume_atomic) with a storage implementing
/// [`AtomicConsume`] when the limit must hold under contention.
///
/// # Examples
///
/// ```
/// use throttle::{Bucket, LeakRate, LockedStorage, ManualClock, MemoryStorage};
///
/// let storage = LockedStorage::new(MemoryStorage::new());
/// let clock = ManualClock::new(0.0);
///
/// // 2 units per second, at most 10 in flight.
/// let bucket = Bucket::with_clock("api", LeakRate::try_from(2.0).unwrap(), 10, &storage, &clock);
///
/// assert!(bucket.consume(10).unwrap());
/// assert!(!bucket.consume(1).unwrap());
///
/// clock.advance(0.5);
/// assert!(bucket.consume(1).unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct Bucket<S, C = SystemClock> {
    key: String,
    amount_key: String,
    last_leak_key: String,
    rate: LeakRate,
    capacity: u64,
    storage: S,
    clock: C,
}

impl<S: Storage> Bucket<S> {
    /// Create a bucket named `key` over `storage`, timed by the system clock.
    pub fn new(key: impl Into<String>, rate: LeakRate, capacity: u64, storage: S) -> Self {
        Self::with_clock(key, rate, capacity, storage, SystemClock)
    }
}

impl<S: Storage, C: Clock> Bucket<S, C> {
    /// Create a bucket named `key` over `storage`, timed by `clock`.
    ///
    /// `capacity` is capped at [`MAX_CAPACITY`].
    pub fn with_clock(
        key: impl Into<String>,
        rate: LeakRate,
        capacity: u64,
        storage: S,
        clock: C,
    ) -> Self {
        let key = key.into();

        Self {
            amount_key: format!("{key}:{AMOUNT_SUFFIX}"),
            last_leak_key: format!("{key}:{LAST_LEAK_SUFFIX}"),
            key,
            rate,
            capacity: capacity.min(MAX_CAPACITY),
            storage,
            clock,
        }
    }

    /// Namespace key of the bucket.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Storage key holding the current amount.
    pub fn amount_key(&self) -> &str {
        &self.amount_key
    }

    /// Storage key holding the last leak timestamp.
    pub fn last_leak_key(&self) -> &str {
        &self.last_leak_key
    }

    /// Units regenerated per second.
    pub fn rate(&self) -> LeakRate {
        self.rate
    }

    /// Maximum units held, after capping at [`MAX_CAPACITY`].
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The storage handle.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Leak the units regenerated since the last leak and return what remains.
    ///
    /// A bucket never seen before starts empty. Both keys are written back every time,
    /// even when the amount did not change.
    pub fn leak(&self) -> Result<u64, ThrottleError> {
        leak_on(
            &self.storage,
            &self.amount_key,
            &self.last_leak_key,
            self.rate,
            self.clock.now(),
        )
    }

    /// Try to take `amount` units from the bucket.
    ///
    /// Returns `Ok(false)` without incrementing when the leaked amount plus `amount`
    /// would exceed the capacity.
    ///
    /// # Concurrency
    ///
    /// **Not atomic.** The leak and the increment are two storage calls; concurrent
    /// callers can overshoot the capacity. See the [type-level docs](Bucket).
    pub fn consume(&self, amount: u64) -> Result<bool, ThrottleError> {
        let current = self.leak()?;

        if current.saturating_add(amount) > self.capacity {
            tracing::debug!(
                key = %self.key,
                current,
                amount,
                capacity = self.capacity,
                "bucket.consume.rejected"
            );
            return Ok(false);
        }

        self.storage.incr(&self.amount_key, to_stored(amount), 0)?;

        Ok(true)
    }
}

impl<S: AtomicConsume, C: Clock> Bucket<S, C> {
    /// Try to take `amount` units, leaking and incrementing as one unit.
    ///
    /// Decisions match [`consume`](Bucket::consume) when callers do not overlap. Under
    /// contention, no interleaving can admit more than the capacity allows.
    pub fn consume_atomic(&self, amount: u64) -> Result<bool, ThrottleError> {
        let accepted = self.storage.consume_atomic(&ConsumeRequest {
            amount_key: &self.amount_key,
            last_leak_key: &self.last_leak_key,
            rate: self.rate,
            capacity: self.capacity,
            amount,
            now: self.clock.now(),
        })?;

        if !accepted {
            tracing::debug!(
                key = %self.key,
                amount,
                capacity = self.capacity,
                "bucket.consume_atomic.rejected"
            );
        }

        Ok(accepted)
    }
}

/// Amount left after leaking at `rate` from `last_leak` until `now`.
///
/// A clock reading earlier than `last_leak` gives a negative elapsed time, which adds
/// units back.
pub(crate) fn leaked_amount(
    amount: i64,
    last_leak: Option<f64>,
    rate: LeakRate,
    now: f64,
) -> u64 {
    let Some(last_leak) = last_leak else {
        return 0;
    };

    let elapsed = now - last_leak;
    let remaining = (amount as f64 - elapsed * *rate).floor();

    if remaining > 0f64 {
        (remaining as u64).min(MAX_CAPACITY)
    } else {
        0
    }
}

pub(crate) fn leak_on<S: Storage + ?Sized>(
    storage: &S,
    amount_key: &str,
    last_leak_key: &str,
    rate: LeakRate,
    now: f64,
) -> Result<u64, ThrottleError> {
    let mut values = storage
        .mget(&[amount_key, last_leak_key], None, true)?
        .into_iter();

    let amount = values.next().flatten().map_or(0, |value| value.as_i64());
    let last_leak = values.next().flatten().map(|value| value.as_f64());

    let leaked = leaked_amount(amount, last_leak, rate, now);

    storage.mset(&[
        (amount_key, Value::Integer(to_stored(leaked))),
        (last_leak_key, Value::Float(now)),
    ])?;

    tracing::trace!(key = amount_key, amount, leaked, "bucket.leak");

    Ok(leaked)
}

/// Leak-check-increment against `storage`, with no locking of its own.
///
/// Callers make this atomic by holding whatever lock guards both bucket keys.
pub(crate) fn consume_on<S: Storage + ?Sized>(
    storage: &S,
    request: &ConsumeRequest<'_>,
) -> Result<bool, ThrottleError> {
    let current = leak_on(
        storage,
        request.amount_key,
        request.last_leak_key,
        request.rate,
        request.now,
    )?;

    if current.saturating_add(request.amount) > request.capacity {
        return Ok(false);
    }

    storage.incr(request.amount_key, to_stored(request.amount), 0)?;

    Ok(true)
}

/// Amounts that pass the capacity check always fit, since capacity never exceeds
/// [`MAX_CAPACITY`].
fn to_stored(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}
