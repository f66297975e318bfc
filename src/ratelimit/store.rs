//! The durable, concurrency-safe rate-limit ledger.
//!
//! A single [`std::sync::Mutex`] guards the whole in-memory ledger and the
//! persistence path: every public operation prunes, does its work, and
//! persists (if anything changed) before releasing the lock. The lock is
//! never held across an `.await` — the one blocking step is a small
//! atomic file rename.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::{Bucket, Event, Limits, RPD_SECS, RPM_SECS};

type FingerprintLedger = HashMap<String, Vec<Event>>;

#[derive(Debug, Default)]
struct Ledger {
    buckets: HashMap<Bucket, FingerprintLedger>,
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedLedger {
    version: u32,
    updated_at: String,
    events: HashMap<String, HashMap<String, Vec<Event>>>,
}

impl Ledger {
    fn to_persisted(&self, now: chrono::DateTime<chrono::Utc>) -> PersistedLedger {
        let mut events = HashMap::new();
        for bucket in Bucket::all() {
            if let Some(fp_map) = self.buckets.get(&bucket) {
                if !fp_map.is_empty() {
                    events.insert(bucket.label().to_string(), fp_map.clone());
                }
            }
        }
        PersistedLedger {
            version: 1,
            updated_at: self.updated_at.unwrap_or(now).to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            events,
        }
    }

    fn from_persisted(persisted: PersistedLedger) -> Self {
        let mut buckets = HashMap::new();
        for (bucket_name, fp_map) in persisted.events {
            let bucket = match bucket_name.as_str() {
                "standard" => Bucket::Standard,
                "premium" => Bucket::Premium,
                _ => continue,
            };
            buckets.insert(bucket, fp_map);
        }
        let updated_at = chrono::DateTime::parse_from_rfc3339(&persisted.updated_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .ok();
        Self { buckets, updated_at }
    }
}

/// Usage for one `(bucket, fingerprint)` pair at a point in time.
struct Usage {
    rpm_used: usize,
    rpd_used: usize,
    minute_events: Vec<f64>,
    day_events: Vec<f64>,
}

fn usage(events: &[Event], now: f64) -> Usage {
    let minute_events: Vec<f64> = events.iter().map(|e| e.ts).filter(|&ts| ts >= now - RPM_SECS).collect();
    let day_events: Vec<f64> = events.iter().map(|e| e.ts).filter(|&ts| ts >= now - RPD_SECS).collect();
    Usage {
        rpm_used: minute_events.len(),
        rpd_used: day_events.len(),
        minute_events,
        day_events,
    }
}

/// Smallest non-negative integer number of seconds until at least one
/// release would free a slot. Takes the `max` across windows within one
/// key, since both must free up; falls back to the configured default
/// when a limit is zero (unconfigured).
fn wait_seconds(usage: &Usage, limits: Limits, now: f64, default_retry: u64) -> u64 {
    if limits.rpm == 0 || limits.rpd == 0 {
        return default_retry;
    }

    let mut waits = Vec::new();

    if usage.rpm_used >= limits.rpm as usize {
        let release_index = usage.rpm_used - limits.rpm as usize;
        if let Some(&release_ts) = usage.minute_events.get(release_index) {
            let release_time = release_ts + RPM_SECS;
            waits.push((release_time - now).max(0.0));
        }
    }

    if usage.rpd_used >= limits.rpd as usize {
        let release_index = usage.rpd_used - limits.rpd as usize;
        if let Some(&release_ts) = usage.day_events.get(release_index) {
            let release_time = release_ts + RPD_SECS;
            waits.push((release_time - now).max(0.0));
        }
    }

    let binding = waits.into_iter().fold(0.0_f64, f64::max);
    (binding.ceil() as u64).max(1)
}

fn available(usage: &Usage, limits: Limits) -> bool {
    limits.rpm > 0 && limits.rpd > 0 && usage.rpm_used < limits.rpm as usize && usage.rpd_used < limits.rpd as usize
}

/// Result of a successful `reserve` call.
#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    pub key_index: usize,
    pub key_count: usize,
    pub fingerprint: String,
    pub event_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    pub used: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub label: String,
    pub rpm: WindowSnapshot,
    pub rpd: WindowSnapshot,
    pub exhausted: bool,
    pub retry_after_seconds: u64,
}

pub struct RateLimitStore {
    path: PathBuf,
    default_retry_after: u64,
    ledger: Mutex<Ledger>,
}

impl RateLimitStore {
    /// Open (or initialize) the store at `path`. A missing or corrupt file
    /// yields an empty ledger and a logged warning — never an error.
    pub fn open(path: impl Into<PathBuf>, default_retry_after: u64) -> Self {
        let path = path.into();
        let ledger = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<PersistedLedger>(&content) {
                Ok(persisted) => Ledger::from_persisted(persisted),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "rate-limit state file corrupt, starting empty");
                    Ledger::default()
                }
            },
            Err(_) => Ledger::default(),
        };

        Self { path, default_retry_after, ledger: Mutex::new(ledger) }
    }

    fn now() -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    /// Drops expired events, empty fingerprint maps and empty bucket maps.
    /// Returns whether anything changed.
    fn prune(ledger: &mut Ledger, now: f64) -> bool {
        let mut changed = false;
        let mut empty_buckets = Vec::new();

        for (bucket, fp_map) in ledger.buckets.iter_mut() {
            let mut empty_fps = Vec::new();
            for (fp, events) in fp_map.iter_mut() {
                let before = events.len();
                events.retain(|e| e.ts >= now - RPD_SECS);
                if events.len() != before {
                    changed = true;
                }
                if events.is_empty() {
                    empty_fps.push(fp.clone());
                }
            }
            for fp in empty_fps {
                fp_map.remove(&fp);
                changed = true;
            }
            if fp_map.is_empty() {
                empty_buckets.push(*bucket);
            }
        }
        for bucket in empty_buckets {
            ledger.buckets.remove(&bucket);
        }

        if changed {
            ledger.updated_at = Some(chrono::Utc::now());
        }
        changed
    }

    fn persist(&self, ledger: &Ledger) {
        let persisted = ledger.to_persisted(chrono::Utc::now());
        let Ok(content) = serde_json::to_string(&persisted) else { return };

        let tmp_path = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = fs::create_dir_all(parent);
            }
        }
        if let Err(e) = fs::write(&tmp_path, &content) {
            tracing::error!(path = %tmp_path.display(), error = %e, "failed to write rate-limit state temp file");
            return;
        }
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            tracing::error!(path = %self.path.display(), error = %e, "failed to rename rate-limit state file into place");
        }
    }

    /// Attempt to reserve a slot in `bucket` across `keys`, starting the
    /// round-robin search at `start_index`. Returns `(Some(outcome), 0)`
    /// on success, or `(None, retry_after_seconds)` when every key is
    /// exhausted — the soonest any key in the pool frees up (`min` across
    /// keys).
    pub fn reserve(
        &self,
        bucket: Bucket,
        keys: &[String],
        limits: Limits,
        start_index: usize,
    ) -> (Option<ReserveOutcome>, u64) {
        let now = Self::now();
        let mut ledger = self.ledger.lock().unwrap();
        let mut dirty = Self::prune(&mut ledger, now);

        if keys.is_empty() {
            if dirty {
                self.persist(&ledger);
            }
            return (None, self.default_retry_after);
        }

        let empty = Vec::new();
        let mut waits = Vec::new();

        for offset in 0..keys.len() {
            let key_index = (start_index + offset) % keys.len();
            let fingerprint = crate::fingerprint::fingerprint(&keys[key_index]);
            let events = ledger
                .buckets
                .get(&bucket)
                .and_then(|fp_map| fp_map.get(&fingerprint))
                .unwrap_or(&empty);
            let u = usage(events.as_slice(), now);

            if available(&u, limits) {
                let event_id = uuid::Uuid::new_v4().simple().to_string();
                let fp_map = ledger.buckets.entry(bucket).or_default();
                let events = fp_map.entry(fingerprint.clone()).or_default();
                events.push(Event { id: event_id.clone(), ts: now, tokens: 0 });
                events.sort_by(|a, b| a.ts.partial_cmp(&b.ts).unwrap());
                ledger.updated_at = Some(chrono::Utc::now());
                dirty = true;
                self.persist(&ledger);
                return (
                    Some(ReserveOutcome { key_index, key_count: keys.len(), fingerprint, event_id }),
                    0,
                );
            }

            waits.push(wait_seconds(&u, limits, now, self.default_retry_after));
        }

        if dirty {
            self.persist(&ledger);
        }

        let retry_after = waits.into_iter().min().unwrap_or(self.default_retry_after).max(1);
        (None, retry_after)
    }

    /// Advances the reservation's timestamp to the completion time.
    /// Forward-only: never decreases `ts`.
    pub fn finalize(&self, bucket: Bucket, fingerprint: &str, event_id: &str) {
        let now = Self::now();
        let mut ledger = self.ledger.lock().unwrap();
        Self::prune(&mut ledger, now);

        if let Some(fp_map) = ledger.buckets.get_mut(&bucket) {
            if let Some(events) = fp_map.get_mut(fingerprint) {
                if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
                    event.ts = event.ts.max(now);
                    events.sort_by(|a, b| a.ts.partial_cmp(&b.ts).unwrap());
                }
            }
        }
        ledger.updated_at = Some(chrono::Utc::now());
        self.persist(&ledger);
    }

    /// Read-only aggregate usage across all keys, per bucket.
    pub fn snapshot(
        &self,
        keys: &[String],
        limits_by_bucket: &HashMap<Bucket, Limits>,
        enabled: bool,
    ) -> HashMap<Bucket, BucketSnapshot> {
        let now = Self::now();
        let mut ledger = self.ledger.lock().unwrap();
        if Self::prune(&mut ledger, now) {
            self.persist(&ledger);
        }

        let mut out = HashMap::new();
        for bucket in Bucket::all() {
            let limits = *limits_by_bucket.get(&bucket).unwrap_or(&Limits { rpm: 0, rpd: 0 });
            let fp_map = ledger.buckets.get(&bucket);

            let mut rpm_used_total = 0u64;
            let mut rpd_used_total = 0u64;
            let mut any_available = false;
            let mut waits = Vec::new();

            for key in keys {
                let fingerprint = crate::fingerprint::fingerprint(key);
                let empty = Vec::new();
                let events = fp_map.and_then(|m| m.get(&fingerprint)).unwrap_or(&empty);
                let u = usage(events, now);
                rpm_used_total += u.rpm_used as u64;
                rpd_used_total += u.rpd_used as u64;

                if available(&u, limits) {
                    any_available = true;
                } else {
                    waits.push(wait_seconds(&u, limits, now, self.default_retry_after));
                }
            }

            let pool_nonempty = !keys.is_empty();
            let exhausted = enabled && pool_nonempty && !any_available;
            let retry_after = if exhausted { waits.into_iter().min().unwrap_or(0) } else { 0 };

            out.insert(
                bucket,
                BucketSnapshot {
                    label: bucket.label().to_string(),
                    rpm: WindowSnapshot { used: rpm_used_total, limit: limits.rpm as u64 * keys.len() as u64 },
                    rpd: WindowSnapshot { used: rpd_used_total, limit: limits.rpd as u64 * keys.len() as u64 },
                    exhausted,
                    retry_after_seconds: retry_after,
                },
            );
        }

        out
    }

    pub fn updated_at(&self) -> String {
        let ledger = self.ledger.lock().unwrap();
        ledger
            .updated_at
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("AIzaKey{i}")).collect()
    }

    #[test]
    fn reserve_then_finalize_adds_exactly_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = RateLimitStore::open(dir.path().join("state.json"), 30);
        let keys = keys(1);
        let limits = Limits { rpm: 5, rpd: 10 };

        let (outcome, retry) = store.reserve(Bucket::Standard, &keys, limits, 0);
        assert_eq!(retry, 0);
        let outcome = outcome.unwrap();
        store.finalize(Bucket::Standard, &outcome.fingerprint, &outcome.event_id);

        let mut limits_map = HashMap::new();
        limits_map.insert(Bucket::Standard, limits);
        let snap = store.snapshot(&keys, &limits_map, true);
        assert_eq!(snap[&Bucket::Standard].rpm.used, 1);
    }

    #[test]
    fn reserve_returning_null_adds_zero_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = RateLimitStore::open(dir.path().join("state.json"), 30);
        let keys = keys(1);
        let limits = Limits { rpm: 1, rpd: 10 };

        let (first, _) = store.reserve(Bucket::Standard, &keys, limits, 0);
        assert!(first.is_some());
        let (second, retry) = store.reserve(Bucket::Standard, &keys, limits, 0);
        assert!(second.is_none());
        assert!(retry >= 1);

        let mut limits_map = HashMap::new();
        limits_map.insert(Bucket::Standard, limits);
        let snap = store.snapshot(&keys, &limits_map, true);
        assert_eq!(snap[&Bucket::Standard].rpm.used, 1);
    }

    #[test]
    fn two_keys_round_robin_exhaustion_uses_min_wait() {
        let dir = tempfile::tempdir().unwrap();
        let store = RateLimitStore::open(dir.path().join("state.json"), 30);
        let keys = keys(2);
        let limits = Limits { rpm: 1, rpd: 10 };

        let (a, _) = store.reserve(Bucket::Standard, &keys, limits, 0);
        assert_eq!(a.unwrap().key_index, 0);
        let (b, _) = store.reserve(Bucket::Standard, &keys, limits, 1);
        assert_eq!(b.unwrap().key_index, 1);

        let (c, retry) = store.reserve(Bucket::Standard, &keys, limits, 0);
        assert!(c.is_none());
        assert!(retry >= 1);
    }

    #[test]
    fn finalize_never_decreases_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = RateLimitStore::open(dir.path().join("state.json"), 30);
        let keys = keys(1);
        let limits = Limits { rpm: 5, rpd: 10 };

        let (outcome, _) = store.reserve(Bucket::Standard, &keys, limits, 0);
        let outcome = outcome.unwrap();
        // finalize "in the past" relative to event creation should still
        // leave ts >= original (finalize always uses current wall time).
        store.finalize(Bucket::Standard, &outcome.fingerprint, &outcome.event_id);
        store.finalize(Bucket::Standard, &outcome.fingerprint, &outcome.event_id);
        // No panic / no regression — a second finalize is a no-op forward move.
    }

    #[test]
    fn empty_pool_returns_default_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = RateLimitStore::open(dir.path().join("state.json"), 42);
        let limits = Limits { rpm: 5, rpd: 10 };
        let (outcome, retry) = store.reserve(Bucket::Standard, &[], limits, 0);
        assert!(outcome.is_none());
        assert_eq!(retry, 42);
    }

    #[test]
    fn zero_limit_means_always_refuse() {
        let dir = tempfile::tempdir().unwrap();
        let store = RateLimitStore::open(dir.path().join("state.json"), 5);
        let keys = keys(1);
        let limits = Limits { rpm: 0, rpd: 10 };
        let (outcome, retry) = store.reserve(Bucket::Standard, &keys, limits, 0);
        assert!(outcome.is_none());
        assert_eq!(retry, 5);
    }

    #[test]
    fn refused_reservation_leaves_no_empty_fingerprint_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = RateLimitStore::open(&path, 30);
        let keys = keys(2);

        // A successful reservation in the standard bucket forces a write,
        // so the file exists and has something to inspect.
        let (ok, _) = store.reserve(Bucket::Standard, &keys, Limits { rpm: 5, rpd: 10 }, 0);
        assert!(ok.is_some());

        // A refused reservation in the premium bucket must not leave behind
        // an empty fingerprint map for a key that was only scanned, never
        // actually granted a slot.
        let (refused, _) = store.reserve(Bucket::Premium, &keys, Limits { rpm: 0, rpd: 10 }, 0);
        assert!(refused.is_none());

        let content = fs::read_to_string(&path).unwrap();
        let persisted: PersistedLedger = serde_json::from_str(&content).unwrap();
        assert!(
            !persisted.events.contains_key("premium"),
            "refused reservation must not create a premium bucket submap"
        );
    }

    #[test]
    fn persistence_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let keys = keys(1);
        let limits = Limits { rpm: 5, rpd: 10 };

        {
            let store = RateLimitStore::open(&path, 30);
            store.reserve(Bucket::Standard, &keys, limits, 0);
        }

        let store = RateLimitStore::open(&path, 30);
        let mut limits_map = HashMap::new();
        limits_map.insert(Bucket::Standard, limits);
        let snap = store.snapshot(&keys, &limits_map, true);
        assert_eq!(snap[&Bucket::Standard].rpm.used, 1);
    }

    #[test]
    fn corrupt_file_yields_empty_ledger_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not valid json").unwrap();
        let store = RateLimitStore::open(&path, 30);
        let keys = keys(1);
        let mut limits_map = HashMap::new();
        limits_map.insert(Bucket::Standard, Limits { rpm: 5, rpd: 10 });
        let snap = store.snapshot(&keys, &limits_map, true);
        assert_eq!(snap[&Bucket::Standard].rpm.used, 0);
    }
}
