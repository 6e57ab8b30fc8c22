//! In-process state.
//!
//! Everything here lives in the memory of the current process, in thread-safe
//! maps ([`DashMap`](dashmap::DashMap)) owned by one limiter instance.
//!
//! # Key Characteristics
//!
//! - **Thread-safe:** per-key updates run under the map's entry guard
//! - **No I/O:** admission checks never suspend
//! - **Process-scoped:** state is not shared across processes
//!
//! # Components
//!
//! - [`LocalBucketStore`]: token buckets, authoritative for local limiters and
//!   used as insurance when the shared store fails
//! - [`AbuseGuard`]: fixed-window attempt counter with temporary lockouts, in
//!   front of either store
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use tokenbucket::{AbuseGuard, AbuseGuardOptions, AbuseThreshold, SystemClock};
//!
//! let guard = AbuseGuard::new(
//!     AbuseGuardOptions::new(AbuseThreshold::try_from(2).unwrap()),
//!     Arc::new(SystemClock),
//! )
//! .unwrap();
//!
//! assert!(!guard.record_consumption("10.0.0.1"));
//! assert!(guard.record_consumption("10.0.0.1"));
//! assert!(guard.is_blocked("10.0.0.1"));
//! ```

mod abuse_guard;
pub use abuse_guard::*;

mod local_bucket_store;
pub use local_bucket_store::*;
