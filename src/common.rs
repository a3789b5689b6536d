use std::{fmt, ops::Deref, str::FromStr};

/// Rate at which a bucket regenerates capacity, in units per second.
///
/// Must be finite and not negative. A rate of `0` is valid and describes a bucket that
/// never drains on its own.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct LeakRate(f64);

impl LeakRate {
    /// A rate that never drains.
    pub fn zero() -> Self {
        Self(0f64)
    }
}

impl Deref for LeakRate {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<f64> for LeakRate {
    type Error = &'static str;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value < 0f64 {
            Err("Leak rate must be finite and not negative")
        } else {
            Ok(Self(value))
        }
    }
}

/// A value held by a [`Storage`](crate::Storage) backend.
///
/// Bucket amounts are stored as integers and leak timestamps as floating point seconds
/// since the Unix epoch. String-based backends use the [`Display`](fmt::Display) and
/// [`FromStr`] forms: integers render without a decimal point, floats in Rust's
/// shortest round-trip notation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// A whole number, e.g. a bucket amount.
    Integer(i64),
    /// A floating point number, e.g. a timestamp.
    Float(f64),
}

impl Value {
    /// Read the value as an integer, truncating floats toward zero.
    pub fn as_i64(&self) -> i64 {
        match *self {
            Value::Integer(value) => value,
            Value::Float(value) => value as i64,
        }
    }

    /// Read the value as a float.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Integer(value) => value as f64,
            Value::Float(value) => value,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value:?}"),
        }
    }
}

impl FromStr for Value {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(value) = s.parse::<i64>() {
            return Ok(Value::Integer(value));
        }

        match s.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Value::Float(value)),
            _ => Err("Stored value must be a finite number"),
        }
    }
}
