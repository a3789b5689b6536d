use std::sync::{
    LazyLock, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use redis::{Client, Connection, RedisResult, Script};

use crate::{AtomicConsume, ConsumeRequest, Storage, ThrottleError, Value};

static CONSUME_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local amount_key = KEYS[1]
        local last_leak_key = KEYS[2]

        local rate = tonumber(ARGV[1])
        local capacity = tonumber(ARGV[2])
        local requested = tonumber(ARGV[3])
        local now = tonumber(ARGV[4])

        local amount = tonumber(redis.call("GET", amount_key)) or 0
        local last_leak = tonumber(redis.call("GET", last_leak_key))

        local leaked = 0
        if last_leak then
            leaked = math.max(math.floor(amount - (now - last_leak) * rate), 0)
        end

        redis.call("SET", amount_key, string.format("%d", leaked))
        redis.call("SET", last_leak_key, ARGV[4])

        if leaked + requested > capacity then
            return 0
        end

        redis.call("INCRBY", amount_key, ARGV[3])

        return 1
    "#,
    )
});

/// Storage backed by a Redis server, shared by every process connected to it.
///
/// Uses blocking connections, handed out round-robin; each connection serves one
/// command at a time.
///
/// # Commands
///
/// | Operation | Redis |
/// |---|---|
/// | `get` / `set` | `GET` / `SET` |
/// | `mget` / `mset` | `MGET` / `MSET` (atomic server-side, so always coherent) |
/// | `incr` | `MULTI`, `SET key default NX`, `INCRBY`, `EXEC` |
/// | `consume_atomic` | one Lua script |
///
/// Values are stored in their textual form (see [`Value`]), so keys written by other
/// clients interoperate as long as they hold plain numbers.
///
/// The process-local decorators add nothing across processes here; prefer
/// [`Bucket::consume_atomic`](crate::Bucket::consume_atomic) for a limit that holds
/// under contention between processes.
///
/// # Examples
///
/// ```ignore
/// use throttle::{Bucket, LeakRate, RedisStorage};
///
/// let client = redis::Client::open("redis://127.0.0.1:6379/")?;
/// let storage = RedisStorage::from_client(&client, 4)?;
///
/// let bucket = Bucket::new("user_123", LeakRate::try_from(2.0)?, 10, &storage);
/// if !bucket.consume_atomic(1)? {
///     // send 429
/// }
/// ```
pub struct RedisStorage {
    connections: Vec<Mutex<Connection>>,
    track_index: AtomicUsize,
}

impl RedisStorage {
    /// Create a storage holding a single connection from `client`.
    pub fn default_from_client(client: &Client) -> Result<Self, ThrottleError> {
        Self::from_client(client, 1)
    }

    /// Create a storage holding `connection_count` connections from `client`.
    pub fn from_client(client: &Client, connection_count: usize) -> Result<Self, ThrottleError> {
        if connection_count == 0 {
            return Err(ThrottleError::InvalidRedisClientConnectionCount(
                "connection count must be > 0".to_string(),
            ));
        }

        let mut connections = Vec::with_capacity(connection_count);

        for _ in 0..connection_count {
            connections.push(Mutex::new(client.get_connection()?));
        }

        Ok(Self {
            connections,
            track_index: AtomicUsize::new(0),
        })
    }

    fn with_connection<T>(
        &self,
        command: &'static str,
        f: impl FnOnce(&mut Connection) -> RedisResult<T>,
    ) -> Result<T, ThrottleError> {
        let index = self.track_index.fetch_add(1, Ordering::Relaxed);
        let mut connection = self.connections[index % self.connections.len()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        f(&mut connection).map_err(|err| {
            tracing::error!(command, error = ?err, "redis.command.error");
            ThrottleError::from(err)
        })
    }
}

fn parse(key: &str, raw: Option<String>) -> Result<Option<Value>, ThrottleError> {
    raw.map(|raw| {
        raw.parse::<Value>()
            .map_err(|_| ThrottleError::InvalidStoredValue {
                key: key.to_string(),
                value: raw,
            })
    })
    .transpose()
}

impl Storage for RedisStorage {
    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>, ThrottleError> {
        let raw: Option<String> =
            self.with_connection("GET", |con| redis::cmd("GET").arg(key).query(con))?;

        Ok(parse(key, raw)?.or(default))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ThrottleError> {
        self.with_connection("SET", |con| {
            redis::cmd("SET").arg(key).arg(value.to_string()).query(con)
        })
    }

    fn mget(
        &self,
        keys: &[&str],
        default: Option<Value>,
        _coherent: bool,
    ) -> Result<Vec<Option<Value>>, ThrottleError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<Option<String>> =
            self.with_connection("MGET", |con| redis::cmd("MGET").arg(keys).query(con))?;

        keys.iter()
            .zip(raw)
            .map(|(key, raw)| Ok(parse(key, raw)?.or(default)))
            .collect()
    }

    fn mset(&self, values: &[(&str, Value)]) -> Result<(), ThrottleError> {
        if values.is_empty() {
            return Ok(());
        }

        let mut cmd = redis::cmd("MSET");
        for (key, value) in values {
            cmd.arg(*key).arg(value.to_string());
        }

        self.with_connection("MSET", |con| cmd.query(con))
    }

    fn incr(&self, key: &str, amount: i64, default: i64) -> Result<i64, ThrottleError> {
        let (value,): (i64,) = self.with_connection("INCRBY", |con| {
            redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(key)
                .arg(default)
                .arg("NX")
                .ignore()
                .cmd("INCRBY")
                .arg(key)
                .arg(amount)
                .query(con)
        })?;

        Ok(value)
    }
}

impl AtomicConsume for RedisStorage {
    fn consume_atomic(&self, request: &ConsumeRequest<'_>) -> Result<bool, ThrottleError> {
        let accepted: i64 = self.with_connection("EVALSHA", |con| {
            CONSUME_SCRIPT
                .key(request.amount_key)
                .key(request.last_leak_key)
                .arg(*request.rate)
                .arg(request.capacity)
                .arg(request.amount)
                .arg(Value::Float(request.now).to_string())
                .invoke(con)
        })?;

        Ok(accepted == 1)
    }
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("connections", &self.connections.len())
            .finish()
    }
}
