#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod bucket;
pub use bucket::{Bucket, MAX_CAPACITY};

mod throttle;
pub use throttle::*;

mod storage;
pub use storage::*;

mod clock;
pub use clock::*;

mod error;
pub use error::*;

mod common;
pub use common::{LeakRate, Value};

#[cfg(test)]
mod tests;
