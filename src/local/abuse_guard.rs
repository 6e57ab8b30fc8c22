use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;

use crate::{AbuseThreshold, Clock, TokenBucketError};

const WINDOW_MS: u64 = 60_000;
const DEFAULT_LOCKOUT_SECONDS: u64 = 60;
const DEFAULT_SWEEP_HIGH_WATER_MARK: usize = 1000;

/// Configuration for [`AbuseGuard`].
#[derive(Clone, Debug)]
pub struct AbuseGuardOptions {
    /// Consumption attempts per one-minute window that trigger a lockout.
    pub threshold_per_minute: AbuseThreshold,
    /// How long a triggered lockout lasts. Must be greater than `0`.
    pub lockout_seconds: u64,
    /// Number of entries created between two lazy sweeps.
    pub sweep_high_water_mark: usize,
}

impl AbuseGuardOptions {
    /// Options with a 60 second lockout.
    pub fn new(threshold_per_minute: AbuseThreshold) -> Self {
        Self {
            threshold_per_minute,
            lockout_seconds: DEFAULT_LOCKOUT_SECONDS,
            sweep_high_water_mark: DEFAULT_SWEEP_HIGH_WATER_MARK,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GuardEntry {
    Window { consumed: u64, window_start_ms: u64 },
    Locked { until_ms: u64 },
}

impl GuardEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        match *self {
            GuardEntry::Window {
                window_start_ms, ..
            } => now_ms.saturating_sub(window_start_ms) >= WINDOW_MS,
            GuardEntry::Locked { until_ms } => now_ms >= until_ms,
        }
    }
}

/// Per-key fixed-window attempt counter with temporary lockouts.
///
/// Sits in front of the token buckets and rejects keys that keep hammering the
/// limiter, before any bucket (local or Redis) is consulted. A block key is
/// usually broader than a token key, e.g. one client address shared by many
/// per-route buckets.
///
/// Entries expire by their own timestamps. Expired entries are swept lazily once
/// [`AbuseGuardOptions::sweep_high_water_mark`] new entries have been created
/// since the previous sweep, so the cost stays off the hot path.
#[derive(Debug)]
pub struct AbuseGuard {
    threshold: u64,
    lockout_ms: u64,
    sweep_high_water_mark: usize,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, GuardEntry>,
    created_since_sweep: AtomicUsize,
}

impl AbuseGuard {
    /// Create a guard. Fails when the lockout is zero.
    pub fn new(
        options: AbuseGuardOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TokenBucketError> {
        if options.lockout_seconds == 0 {
            return Err(TokenBucketError::InvalidConfiguration(
                "abuse guard lockout must be greater than 0 seconds".to_string(),
            ));
        }

        Ok(Self {
            threshold: *options.threshold_per_minute,
            lockout_ms: options.lockout_seconds.saturating_mul(1000),
            sweep_high_water_mark: options.sweep_high_water_mark.max(1),
            clock,
            entries: DashMap::new(),
            created_since_sweep: AtomicUsize::new(0),
        })
    }

    /// Whether `key` is locked out right now.
    pub fn is_blocked(&self, key: &str) -> bool {
        let now_ms = self.clock.now_ms();

        let blocked = match self.entries.get(key).as_deref() {
            None => return false,
            Some(GuardEntry::Window { .. }) => return false,
            Some(GuardEntry::Locked { until_ms }) => now_ms < *until_ms,
        };

        if !blocked {
            self.entries.remove_if(key, |_, entry| {
                matches!(entry, GuardEntry::Locked { .. }) && entry.is_expired(now_ms)
            });
        }

        blocked
    } // end method is_blocked

    /// Count one consumption attempt for `key`.
    ///
    /// Returns `true` when `key` is locked out after this attempt, either
    /// because the attempt reached the threshold or because it already was.
    pub fn record_consumption(&self, key: &str) -> bool {
        let now_ms = self.clock.now_ms();
        let mut created = false;

        let blocked = {
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
                created = true;
                GuardEntry::Window {
                    consumed: 0,
                    window_start_ms: now_ms,
                }
            });

            if entry.is_expired(now_ms) {
                *entry = GuardEntry::Window {
                    consumed: 0,
                    window_start_ms: now_ms,
                };
            }

            match *entry {
                GuardEntry::Locked { .. } => true,
                GuardEntry::Window {
                    consumed,
                    window_start_ms,
                } => {
                    let consumed = consumed + 1;

                    if consumed >= self.threshold {
                        *entry = GuardEntry::Locked {
                            until_ms: now_ms.saturating_add(self.lockout_ms),
                        };
                        tracing::debug!(
                            key,
                            consumed,
                            lockout_ms = self.lockout_ms,
                            "Abuse lockout installed"
                        );
                        true
                    } else {
                        *entry = GuardEntry::Window {
                            consumed,
                            window_start_ms,
                        };
                        false
                    }
                }
            }
        };

        if created
            && self.created_since_sweep.fetch_add(1, Ordering::Relaxed) + 1
                >= self.sweep_high_water_mark
        {
            self.created_since_sweep.store(0, Ordering::Relaxed);
            self.sweep();
        }

        blocked
    } // end method record_consumption

    /// Remove expired lockouts and windows.
    pub fn sweep(&self) {
        let now_ms = self.clock.now_ms();
        let before = self.entries.len();

        self.entries.retain(|_, entry| !entry.is_expired(now_ms));

        tracing::trace!(before, after = self.entries.len(), "Abuse guard sweep");
    } // end method sweep

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
