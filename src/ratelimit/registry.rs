//! Per-key limiter state.
//!
//! The registry maps each [`RateLimitKey`] to a [`LimiterEntry`] that owns
//! the key's strategy state behind its own mutex. Lookups of existing keys
//! only take a shard read lock and clone an `Arc`, so unrelated keys never
//! serialize on each other; the per-key mutex is taken after the shard lock
//! is released. Idle entries are removed by explicit sweeps, never inline on
//! the acquire path (except when the optional key bound is reached, and then
//! at most once per [`INLINE_SWEEP_INTERVAL`]).
//!
//! An entry is retired under its own lock before it leaves the map. Callers
//! still holding an `Arc` to a retired entry get `None` from
//! [`LimiterEntry::acquire`] and must resolve the key again, so a key never
//! has two live states admitting at once.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::key::RateLimitKey;
use super::limits::LimiterConfig;
use super::strategy::{Admission, Decision, Strategy, StrategyStatus};
use crate::error::{RateLimitError, Result};

/// Minimum time between sweeps triggered by a full registry.
pub const INLINE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Limiter state for one key.
#[derive(Debug)]
pub struct LimiterEntry {
    config: LimiterConfig,
    state: Mutex<EntryState>,
}

#[derive(Debug)]
struct EntryState {
    strategy: Strategy,
    last_access: Instant,
    retired: bool,
}

impl LimiterEntry {
    fn new(config: LimiterConfig, now: Instant) -> Self {
        let strategy = Strategy::new(&config, now);
        Self {
            config,
            state: Mutex::new(EntryState {
                strategy,
                last_access: now,
                retired: false,
            }),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Run one admission attempt under this entry's lock.
    ///
    /// Returns `None` if the entry was removed from the registry; the key
    /// has to be resolved again.
    pub fn acquire(&self, cost: u64, now: Instant) -> Option<Decision> {
        let mut state = self.state.lock();
        if state.retired {
            return None;
        }
        state.last_access = state.last_access.max(now);
        Some(state.strategy.try_acquire(cost, now))
    }

    pub fn status(&self, now: Instant) -> StrategyStatus {
        self.state.lock().strategy.status(now)
    }

    /// A copy of the current strategy state.
    pub fn strategy(&self) -> Strategy {
        self.state.lock().strategy.clone()
    }

    pub fn last_access(&self) -> Instant {
        self.state.lock().last_access
    }

    /// Whether the entry has been removed from the registry.
    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    fn retire(&self) {
        self.state.lock().retired = true;
    }

    /// Retire the entry if it has been idle for `timeout`.
    /// An entry that is locked right now is in use and never idle.
    fn retire_if_idle(&self, now: Instant, timeout: Duration) -> bool {
        match self.state.try_lock() {
            Some(mut state) if now.saturating_duration_since(state.last_access) >= timeout => {
                state.retired = true;
                true
            }
            _ => false,
        }
    }
}

/// Registry settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryOptions {
    /// Idle timeout applied to every key; when unset each key uses
    /// ten times its own window
    pub idle_timeout: Option<Duration>,
    /// Soft bound on the number of live keys
    pub max_keys: Option<usize>,
}

/// Concurrent map from key to limiter state.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    entries: DashMap<RateLimitKey, Arc<LimiterEntry>>,
    options: RegistryOptions,
    last_inline_sweep: Mutex<Option<Instant>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: RegistryOptions) -> Self {
        Self {
            entries: DashMap::new(),
            options,
            last_inline_sweep: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Get the entry for `key`, creating it with `config` if it does not exist.
    ///
    /// Repeated calls with the same config return the same entry until it is
    /// evicted or reset. A different config for a live key fails with
    /// `ConfigMismatch` unless `force_reset` is set, in which case the key
    /// starts over with fresh state under the new config.
    pub fn resolve(
        &self,
        key: &RateLimitKey,
        config: &LimiterConfig,
        now: Instant,
        force_reset: bool,
    ) -> Result<Arc<LimiterEntry>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.config == *config {
                return Ok(Arc::clone(&entry));
            }
            if !force_reset {
                warn!(key = %key, "Rejecting different limiter config for existing key");
                return Err(RateLimitError::ConfigMismatch {
                    key: key.to_string(),
                });
            }
        } else {
            self.ensure_room(now)?;
        }

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().config == *config {
                    return Ok(Arc::clone(occupied.get()));
                }
                if !force_reset {
                    return Err(RateLimitError::ConfigMismatch {
                        key: key.to_string(),
                    });
                }
                debug!(
                    key = %key,
                    algorithm = %config.algorithm(),
                    capacity = config.capacity(),
                    "Resetting limiter with new config"
                );
                occupied.get().retire();
                let entry = Arc::new(LimiterEntry::new(config.clone(), now));
                occupied.insert(Arc::clone(&entry));
                Ok(entry)
            }
            Entry::Vacant(vacant) => {
                debug!(
                    key = %key,
                    algorithm = %config.algorithm(),
                    capacity = config.capacity(),
                    window = ?config.window(),
                    "Creating new limiter"
                );
                let entry = Arc::new(LimiterEntry::new(config.clone(), now));
                vacant.insert(Arc::clone(&entry));
                Ok(entry)
            }
        }
    }

    /// Make space for one more key when a bound is configured.
    fn ensure_room(&self, now: Instant) -> Result<()> {
        let Some(max_keys) = self.options.max_keys else {
            return Ok(());
        };
        if self.entries.len() < max_keys {
            return Ok(());
        }

        if self.claim_inline_sweep(now) {
            let evicted = self.sweep(now);
            if self.entries.len() < max_keys {
                return Ok(());
            }
            warn!(
                max_keys,
                evicted = evicted.len(),
                "Limiter registry is full"
            );
        } else {
            trace!(max_keys, "Limiter registry is full, sweep throttled");
        }
        Err(RateLimitError::RegistryFull { max_keys })
    }

    /// Whether a full registry may sweep now. Claims the slot if so.
    fn claim_inline_sweep(&self, now: Instant) -> bool {
        let mut last = self.last_inline_sweep.lock();
        match *last {
            Some(at) if now.saturating_duration_since(at) < INLINE_SWEEP_INTERVAL => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub fn get(&self, key: &RateLimitKey) -> Option<Arc<LimiterEntry>> {
        self.entries.get(key).map(|entry| Arc::clone(&entry))
    }

    pub fn contains(&self, key: &RateLimitKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove every key untouched for at least `idle_timeout`.
    pub fn evict_idle(&self, idle_timeout: Duration, now: Instant) -> Vec<RateLimitKey> {
        self.evict_where(now, |_| idle_timeout)
    }

    /// Remove idle keys using the configured idle timeout, or each key's default.
    pub fn sweep(&self, now: Instant) -> Vec<RateLimitKey> {
        let global = self.options.idle_timeout;
        self.evict_where(now, |entry| {
            global.unwrap_or_else(|| entry.config.default_idle_timeout())
        })
    }

    fn evict_where<F>(&self, now: Instant, timeout_for: F) -> Vec<RateLimitKey>
    where
        F: Fn(&LimiterEntry) -> Duration,
    {
        let mut evicted = Vec::new();
        self.entries.retain(|key, entry| {
            if entry.retire_if_idle(now, timeout_for(entry)) {
                evicted.push(key.clone());
                false
            } else {
                true
            }
        });

        if !evicted.is_empty() {
            info!(
                evicted = evicted.len(),
                remaining = self.entries.len(),
                "Evicted idle limiters"
            );
        }
        evicted
    }

    /// Drop a key's state. Returns whether the key existed.
    pub fn reset_key(&self, key: &RateLimitKey) -> bool {
        self.entries
            .remove_if(key, |_, entry| {
                entry.retire();
                true
            })
            .is_some()
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.entries.retain(|_, entry| {
            entry.retire();
            false
        });
    }

    pub fn keys(&self) -> Vec<RateLimitKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fixed(capacity: u64) -> LimiterConfig {
        LimiterConfig::fixed_window(capacity, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_registry_creation() {
        let registry = LimiterRegistry::new();
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_returns_same_entry() {
        let registry = LimiterRegistry::new();
        let key = RateLimitKey::new("api").with("user", "alice");
        let now = Instant::now();

        let first = registry.resolve(&key, &fixed(5), now, false).unwrap();
        first.acquire(2, now);
        let second = registry.resolve(&key, &fixed(5), now, false).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.status(now).remaining, 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_config_mismatch() {
        let registry = LimiterRegistry::new();
        let key = RateLimitKey::new("api");
        let now = Instant::now();

        registry.resolve(&key, &fixed(5), now, false).unwrap();
        let result = registry.resolve(&key, &fixed(6), now, false);
        assert!(matches!(result, Err(RateLimitError::ConfigMismatch { .. })));
    }

    #[test]
    fn test_resolve_force_reset_replaces_state() {
        let registry = LimiterRegistry::new();
        let key = RateLimitKey::new("api");
        let now = Instant::now();

        let old = registry.resolve(&key, &fixed(5), now, false).unwrap();
        old.acquire(5, now);

        let new = registry.resolve(&key, &fixed(8), now, true).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.config().capacity(), 8);
        assert_eq!(new.status(now).remaining, 8);
    }

    #[test]
    fn test_evict_idle() {
        let registry = LimiterRegistry::new();
        let start = Instant::now();
        let busy = RateLimitKey::new("busy");
        let quiet = RateLimitKey::new("quiet");

        registry.resolve(&busy, &fixed(5), start, false).unwrap();
        registry.resolve(&quiet, &fixed(5), start, false).unwrap();

        let later = start + Duration::from_secs(30);
        registry.get(&busy).unwrap().acquire(1, later);

        let evicted = registry.evict_idle(Duration::from_secs(10), later);
        assert_eq!(evicted, vec![quiet.clone()]);
        assert!(registry.get(&quiet).is_none());
        assert!(registry.get(&busy).is_some());
    }

    #[test]
    fn test_sweep_uses_default_idle_timeout() {
        let registry = LimiterRegistry::new();
        let start = Instant::now();
        let key = RateLimitKey::new("api");
        registry.resolve(&key, &fixed(5), start, false).unwrap();

        // Default is ten windows
        assert!(registry.sweep(start + Duration::from_secs(9)).is_empty());
        assert_eq!(registry.sweep(start + Duration::from_secs(10)), vec![key]);
    }

    #[test]
    fn test_sweep_uses_configured_idle_timeout() {
        let registry = LimiterRegistry::with_options(RegistryOptions {
            idle_timeout: Some(Duration::from_secs(2)),
            max_keys: None,
        });
        let start = Instant::now();
        registry.resolve(&"api".into(), &fixed(5), start, false).unwrap();

        assert_eq!(registry.sweep(start + Duration::from_secs(2)).len(), 1);
    }

    #[test]
    fn test_max_keys_evicts_idle_before_failing() {
        let registry = LimiterRegistry::with_options(RegistryOptions {
            idle_timeout: Some(Duration::from_secs(5)),
            max_keys: Some(2),
        });
        let start = Instant::now();

        registry.resolve(&"a".into(), &fixed(1), start, false).unwrap();
        registry.resolve(&"b".into(), &fixed(1), start, false).unwrap();

        let result = registry.resolve(&"c".into(), &fixed(1), start, false);
        assert!(matches!(result, Err(RateLimitError::RegistryFull { max_keys: 2 })));

        // Existing keys still resolve while full
        assert!(registry.resolve(&"a".into(), &fixed(1), start, false).is_ok());

        let later = start + Duration::from_secs(5);
        assert!(registry.resolve(&"c".into(), &fixed(1), later, false).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_full_registry_sweeps_at_most_once_per_interval() {
        let registry = LimiterRegistry::with_options(RegistryOptions {
            idle_timeout: Some(Duration::from_secs(5)),
            max_keys: Some(2),
        });
        let start = Instant::now();
        registry.resolve(&"a".into(), &fixed(1), start, false).unwrap();
        registry.resolve(&"b".into(), &fixed(1), start, false).unwrap();

        // Nothing is idle yet; this miss sweeps and claims the interval
        let miss = registry.resolve(&"c".into(), &fixed(1), start + Duration::from_millis(4_500), false);
        assert!(matches!(miss, Err(RateLimitError::RegistryFull { .. })));

        // Both keys are idle now, but the last sweep was under a second ago
        let miss = registry.resolve(&"d".into(), &fixed(1), start + Duration::from_millis(5_200), false);
        assert!(matches!(miss, Err(RateLimitError::RegistryFull { .. })));
        assert_eq!(registry.len(), 2);

        let later = start + Duration::from_millis(5_500);
        assert!(registry.resolve(&"d".into(), &fixed(1), later, false).is_ok());
        assert_eq!(registry.keys(), vec![RateLimitKey::from("d")]);
    }

    #[test]
    fn test_evicted_entry_is_retired() {
        let registry = LimiterRegistry::new();
        let key = RateLimitKey::new("api");
        let start = Instant::now();

        let stale = registry.resolve(&key, &fixed(1), start, false).unwrap();
        let later = start + Duration::from_secs(20);
        assert_eq!(registry.evict_idle(Duration::from_secs(10), later), vec![key.clone()]);

        let fresh = registry.resolve(&key, &fixed(1), later, false).unwrap();
        assert!(stale.is_retired());
        assert!(stale.acquire(1, later).is_none());
        assert!(fresh.acquire(1, later).unwrap().is_admitted());
        assert!(!fresh.acquire(1, later).unwrap().is_admitted());
    }

    #[test]
    fn test_reset_reconfigure_and_clear_retire_entries() {
        let registry = LimiterRegistry::new();
        let key = RateLimitKey::new("api");
        let now = Instant::now();

        let reset = registry.resolve(&key, &fixed(1), now, false).unwrap();
        assert!(registry.reset_key(&key));
        assert!(reset.acquire(1, now).is_none());

        let replaced = registry.resolve(&key, &fixed(1), now, false).unwrap();
        let current = registry.resolve(&key, &fixed(2), now, true).unwrap();
        assert!(replaced.acquire(1, now).is_none());
        assert!(!current.is_retired());

        registry.clear();
        assert!(current.acquire(1, now).is_none());
    }

    #[test]
    fn test_options() {
        let options = RegistryOptions {
            idle_timeout: Some(Duration::from_secs(30)),
            max_keys: Some(10),
        };
        let registry = LimiterRegistry::with_options(options.clone());
        assert_eq!(registry.options(), &options);
        assert_eq!(LimiterRegistry::new().options(), &RegistryOptions::default());
    }

    #[test]
    fn test_reset_key_and_clear() {
        let registry = LimiterRegistry::new();
        let now = Instant::now();
        registry.resolve(&"a".into(), &fixed(1), now, false).unwrap();
        registry.resolve(&"b".into(), &fixed(1), now, false).unwrap();

        assert!(registry.reset_key(&"a".into()));
        assert!(!registry.reset_key(&"a".into()));
        assert_eq!(registry.keys(), vec![RateLimitKey::from("b")]);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_resolve_shares_one_entry() {
        let registry = Arc::new(LimiterRegistry::new());
        let now = Instant::now();
        let key = RateLimitKey::new("shared");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let key = key.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        registry.resolve(&key, &fixed(10_000), now, false).unwrap().acquire(1, now);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&key).unwrap().status(now).remaining, 10_000 - 800);
    }
}
