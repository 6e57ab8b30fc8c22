#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod rate_limiter;
pub use rate_limiter::*;

mod local;
pub use self::local::*;

mod redis;
pub use self::redis::*;

mod clock;
pub use clock::*;

mod client_address;
pub use client_address::*;

mod error;
pub use error::*;

mod common;
pub use common::{
    AbuseThreshold, BucketParams, Capacity, RateLimitDecision, RefillRate, RejectionReason,
};

#[cfg(test)]
mod tests;
