/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// Redis error.
    #[cfg(feature = "redis")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Invalid number of Redis connections requested.
    #[cfg(feature = "redis")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
    #[error("invalid redis client connection count: {0}")]
    InvalidRedisClientConnectionCount(String),

    /// A backend returned a stored value that is not a number.
    #[error("invalid stored value for key {key:?}: {value:?}")]
    InvalidStoredValue {
        /// Key the value was read from.
        key: String,
        /// Raw stored value.
        value: String,
    },

    /// Failure reported by a custom storage backend.
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}
