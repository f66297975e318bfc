//! Round-robin key scheduler: sits above [`super::store::RateLimitStore`]
//! and owns the fairness cursor. The cursor lock is always released
//! before the store is called, so the two locks are never nested.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use super::{store::RateLimitStore, Bucket, Limits, Reservation};

/// A reservation handed back to the caller: a specific key, plus enough
/// bookkeeping to `finalize` it later. `reservation` is `None` when
/// runtime rate-limiting is not active — the scheduler still round-robins
/// but never touches the store.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub key: String,
    pub key_index: usize,
    pub key_count: usize,
    pub reservation: Option<Reservation>,
}

#[derive(Debug, Error)]
#[error("no key in the pool has spare {bucket} capacity, retry after {retry_after_seconds}s")]
pub struct LocalRateLimitExceeded {
    pub bucket: Bucket,
    pub retry_after_seconds: u64,
}

pub struct KeyScheduler {
    store: Arc<RateLimitStore>,
    cursor: Mutex<usize>,
}

impl KeyScheduler {
    pub fn new(store: Arc<RateLimitStore>) -> Self {
        Self { store, cursor: Mutex::new(0) }
    }

    /// Reserve one slot in `bucket` across `keys`. Advances the cursor
    /// exactly once per call. On success the cursor lands just past the key
    /// the store actually used, not just past the scan's starting point —
    /// `reserve` may skip exhausted keys ahead of `start_index`, and the
    /// next caller should resume from there rather than re-scan them. On
    /// refusal (no key had capacity) the cursor still rotates to
    /// `start_index + 1`.
    ///
    /// When `active` is false (rate limiting disabled, wrong auth mode, or
    /// wrong key profile) the scheduler degrades to pure round-robin and
    /// never consults the store.
    pub fn reserve_for_bucket(
        &self,
        bucket: Bucket,
        keys: &[String],
        limits: Limits,
        active: bool,
    ) -> Result<Allocation, LocalRateLimitExceeded> {
        if keys.is_empty() {
            return Err(LocalRateLimitExceeded { bucket, retry_after_seconds: 1 });
        }

        if !active {
            let mut cursor = self.cursor.lock().unwrap();
            let key_index = *cursor % keys.len();
            *cursor = cursor.wrapping_add(1);
            drop(cursor);
            return Ok(Allocation {
                key: keys[key_index].clone(),
                key_index,
                key_count: keys.len(),
                reservation: None,
            });
        }

        let start_index = {
            let cursor = self.cursor.lock().unwrap();
            *cursor % keys.len()
        };
        // Cursor lock is dropped above; the store lock (if taken at all) is
        // acquired fresh inside `reserve`. The two locks are never held
        // simultaneously. The cursor isn't committed to its final value
        // until the outcome below is known.

        let (outcome, retry_after_seconds) = self.store.reserve(bucket, keys, limits, start_index);

        let mut cursor = self.cursor.lock().unwrap();
        match outcome {
            Some(o) => {
                *cursor = o.key_index.wrapping_add(1);
                drop(cursor);
                Ok(Allocation {
                    key: keys[o.key_index].clone(),
                    key_index: o.key_index,
                    key_count: o.key_count,
                    reservation: Some(Reservation { bucket, fingerprint: o.fingerprint, event_id: o.event_id }),
                })
            }
            None => {
                *cursor = start_index.wrapping_add(1);
                drop(cursor);
                Err(LocalRateLimitExceeded { bucket, retry_after_seconds })
            }
        }
    }

    /// No-op when the allocation carries no reservation (inactive mode).
    pub fn finalize(&self, allocation: &Allocation) {
        if let Some(reservation) = &allocation.reservation {
            self.store.finalize(reservation.bucket, &reservation.fingerprint, &reservation.event_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("AIzaKey{i}")).collect()
    }

    #[test]
    fn rotates_start_index_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RateLimitStore::open(dir.path().join("state.json"), 30));
        let scheduler = KeyScheduler::new(store);
        let keys = keys(3);
        let limits = Limits { rpm: 100, rpd: 1000 };

        let a = scheduler.reserve_for_bucket(Bucket::Standard, &keys, limits, true).unwrap();
        let b = scheduler.reserve_for_bucket(Bucket::Standard, &keys, limits, true).unwrap();
        let c = scheduler.reserve_for_bucket(Bucket::Standard, &keys, limits, true).unwrap();

        assert_eq!(a.key_index, 0);
        assert_eq!(b.key_index, 1);
        assert_eq!(c.key_index, 2);
    }

    #[test]
    fn refusal_still_advances_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RateLimitStore::open(dir.path().join("state.json"), 30));
        let scheduler = KeyScheduler::new(store);
        let keys = keys(1);
        let limits = Limits { rpm: 1, rpd: 10 };

        let first = scheduler.reserve_for_bucket(Bucket::Standard, &keys, limits, true);
        assert!(first.is_ok());
        let second = scheduler.reserve_for_bucket(Bucket::Standard, &keys, limits, true);
        assert!(second.is_err());

        // third call should behave identically to the second (cursor wraps mod 1)
        let third = scheduler.reserve_for_bucket(Bucket::Standard, &keys, limits, true);
        assert!(third.is_err());
    }

    #[test]
    fn finalize_delegates_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RateLimitStore::open(dir.path().join("state.json"), 30));
        let scheduler = KeyScheduler::new(store);
        let keys = keys(1);
        let limits = Limits { rpm: 5, rpd: 10 };

        let allocation = scheduler.reserve_for_bucket(Bucket::Standard, &keys, limits, true).unwrap();
        scheduler.finalize(&allocation);
    }

    #[test]
    fn cursor_follows_the_key_actually_used_not_the_scan_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RateLimitStore::open(dir.path().join("state.json"), 30));
        let scheduler = KeyScheduler::new(store);
        let keys = keys(3);
        let tight = Limits { rpm: 1, rpd: 10 };
        let loose = Limits { rpm: 100, rpd: 1000 };

        // Exhaust key 0, then use two inactive (store-free) calls to walk
        // the cursor back around to 0 without touching the ledger.
        let first = scheduler.reserve_for_bucket(Bucket::Standard, &keys, tight, true).unwrap();
        assert_eq!(first.key_index, 0);
        let inactive_a = scheduler.reserve_for_bucket(Bucket::Standard, &keys, loose, false).unwrap();
        assert_eq!(inactive_a.key_index, 1);
        let inactive_b = scheduler.reserve_for_bucket(Bucket::Standard, &keys, loose, false).unwrap();
        assert_eq!(inactive_b.key_index, 2);

        // The scan now starts at index 0 again, but key 0 is still
        // exhausted, so the store must skip to key 1.
        let skipped = scheduler.reserve_for_bucket(Bucket::Standard, &keys, tight, true).unwrap();
        assert_eq!(skipped.key_index, 1);

        // If the cursor had been set to start_index + 1 (= 1) instead of
        // key_index + 1 (= 2), the next scan would start at key 1 again and
        // re-hit the key the previous call just used. It must start at 2.
        let next = scheduler.reserve_for_bucket(Bucket::Standard, &keys, loose, false).unwrap();
        assert_eq!(next.key_index, 2);
    }

    #[test]
    fn inactive_mode_never_touches_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RateLimitStore::open(dir.path().join("state.json"), 30));
        let scheduler = KeyScheduler::new(store);
        let keys = keys(2);
        let limits = Limits { rpm: 0, rpd: 0 };

        let a = scheduler.reserve_for_bucket(Bucket::Standard, &keys, limits, false).unwrap();
        assert!(a.reservation.is_none());
        let b = scheduler.reserve_for_bucket(Bucket::Standard, &keys, limits, false).unwrap();
        assert!(b.reservation.is_none());
        assert_eq!(a.key_index, 0);
        assert_eq!(b.key_index, 1);
        scheduler.finalize(&a);
    }
}
