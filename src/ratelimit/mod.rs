//! Per-key rate-limit scheduler: a durable, multi-window, multi-bucket
//! reservation engine plus the round-robin key scheduler that sits on
//! top of it.

pub mod scheduler;
pub mod store;

use serde::{Deserialize, Serialize};

pub use scheduler::{Allocation, KeyScheduler, LocalRateLimitExceeded};
pub use store::RateLimitStore;

pub const RPM_SECS: f64 = 60.0;
pub const RPD_SECS: f64 = 86_400.0;

/// A quota class indexed by model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Standard,
    Premium,
}

impl Bucket {
    pub fn label(self) -> &'static str {
        match self {
            Bucket::Standard => "standard",
            Bucket::Premium => "premium",
        }
    }

    pub fn as_str(self) -> &'static str {
        self.label()
    }

    pub fn all() -> [Bucket; 2] {
        [Bucket::Standard, Bucket::Premium]
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Limits for one bucket. Zero means "quota unknown / always refuse".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub rpm: u32,
    pub rpd: u32,
}

/// A single ledger entry. `tokens` is reserved for a future extension and
/// is preserved on read/write but never consulted by windowing logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub ts: f64,
    #[serde(default)]
    pub tokens: u64,
}

/// A handle identifying a live reservation, returned by `reserve` and
/// consumed exactly once by `finalize`.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub bucket: Bucket,
    pub fingerprint: String,
    pub event_id: String,
}
