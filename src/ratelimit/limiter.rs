//! Core rate limiter implementation.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::key::RateLimitKey;
use super::limits::{Algorithm, LimiterConfig};
use super::metrics::{Metrics, MetricsSnapshot};
use super::registry::{LimiterRegistry, RegistryOptions};
use super::strategy::Decision;
use crate::config::EngineConfig;
use crate::error::{RateLimitError, Result};

/// Observable state of one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyStatus {
    pub key: RateLimitKey,
    pub algorithm: Algorithm,
    pub capacity: u64,
    /// Budget currently consumed
    pub usage: f64,
    /// Whole permits available now
    pub remaining: u64,
    /// Time until the full capacity is available again
    pub replenished_after: Duration,
    /// Time since the key last made a request
    pub idle_for: Duration,
}

/// The rate limiting engine.
///
/// Owns the per-key registry, the metrics and the clock. It is thread-safe
/// and meant to be shared behind an `Arc`; every decision is a short,
/// non-blocking critical section on the key's own lock.
#[derive(Debug)]
pub struct RateLimiter {
    registry: LimiterRegistry,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
    /// Configured limits by key class
    limits: HashMap<String, LimiterConfig>,
}

impl RateLimiter {
    /// Create a rate limiter on the system clock with default settings and no classes.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter with default settings on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::assemble(RegistryOptions::default(), Metrics::new(), clock, HashMap::new())
    }

    /// Build a rate limiter from configuration, validating every limit first.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn from_config_with_clock(config: &EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let limits = config.limiter_configs()?;
        info!(
            classes = limits.len(),
            max_keys = ?config.registry.max_keys,
            "Rate limiter configured"
        );

        Ok(Self::assemble(
            config.registry.options(),
            Metrics::with_history(config.metrics.history_size),
            clock,
            limits,
        ))
    }

    fn assemble(
        options: RegistryOptions,
        metrics: Metrics,
        clock: Arc<dyn Clock>,
        limits: HashMap<String, LimiterConfig>,
    ) -> Self {
        Self {
            registry: LimiterRegistry::with_options(options),
            metrics,
            clock,
            limits,
        }
    }

    /// Register (or replace) the limit used by `check` for a key class.
    pub fn with_limit(mut self, class: impl Into<String>, config: LimiterConfig) -> Self {
        self.limits.insert(class.into().to_lowercase(), config);
        self
    }

    /// Decide whether `key` may spend `cost` permits under `config`.
    ///
    /// An invalid cost yields an `InvalidCost` decision without touching any
    /// limiter state. Supplying a config different from the one the key was
    /// created with fails with `ConfigMismatch`; use [`reconfigure`] to
    /// switch.
    ///
    /// [`reconfigure`]: RateLimiter::reconfigure
    pub fn acquire(
        &self,
        key: &RateLimitKey,
        cost: u64,
        config: &LimiterConfig,
    ) -> Result<Decision> {
        trace!(key = %key, cost, "Checking rate limit");

        if let Err(err) = config.validate_cost(cost) {
            debug!(key = %key, error = %err, "Rejecting request with invalid cost");
            let decision = Decision::invalid_cost();
            self.metrics.record(key, cost, &decision);
            return Ok(decision);
        }

        let now = self.clock.now();
        let decision = loop {
            let entry = self.registry.resolve(key, config, now, false)?;
            match entry.acquire(cost, now) {
                Some(decision) => break decision,
                None => trace!(key = %key, "Limiter was removed while acquiring, resolving again"),
            }
        };

        if !decision.is_admitted() {
            debug!(
                key = %key,
                cost,
                remaining = decision.remaining,
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        }

        self.metrics.record(key, cost, &decision);
        Ok(decision)
    }

    /// Like [`acquire`](RateLimiter::acquire), using the limit configured for the key's class.
    ///
    /// Class names are matched case-insensitively.
    pub fn check(&self, key: &RateLimitKey, cost: u64) -> Result<Decision> {
        let config = self
            .limits
            .get(&key.class)
            .or_else(|| self.limits.get(&key.class.to_lowercase()))
            .ok_or_else(|| RateLimitError::UnknownClass(key.class.clone()))?;
        self.acquire(key, cost, config)
    }

    /// Replace the key's state with fresh state under `config`.
    pub fn reconfigure(&self, key: &RateLimitKey, config: &LimiterConfig) -> Result<()> {
        self.registry.resolve(key, config, self.clock.now(), true)?;
        info!(
            key = %key,
            algorithm = %config.algorithm(),
            capacity = config.capacity(),
            "Limiter reconfigured"
        );
        Ok(())
    }

    /// Current state of a key, or `None` if it has no state.
    pub fn status(&self, key: &RateLimitKey) -> Option<KeyStatus> {
        let entry = self.registry.get(key)?;
        let now = self.clock.now();
        let status = entry.status(now);

        Some(KeyStatus {
            key: key.clone(),
            algorithm: entry.config().algorithm(),
            capacity: entry.config().capacity(),
            usage: status.usage,
            remaining: status.remaining,
            replenished_after: status.replenished_after,
            idle_for: now.saturating_duration_since(entry.last_access()),
        })
    }

    /// A handle to the metrics, for observers that poll on their own schedule.
    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Zero all metrics. Intended for test isolation.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Evict keys idle for at least `idle_timeout`. Returns how many were evicted.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let evicted = self.registry.evict_idle(idle_timeout, self.clock.now());
        self.forget(evicted.len());
        evicted.len()
    }

    /// Evict keys idle past the configured (or per-key default) timeout.
    pub fn sweep(&self) -> usize {
        let evicted = self.registry.sweep(self.clock.now());
        self.forget(evicted.len());
        evicted.len()
    }

    /// Drop a key's limiter state and counters. Returns whether it had state.
    pub fn reset_key(&self, key: &RateLimitKey) -> bool {
        let existed = self.registry.reset_key(key);
        self.metrics.record_evictions(usize::from(existed), |k| k != key);
        existed
    }

    /// Drop all limiter state. Metrics are kept.
    pub fn clear(&self) {
        self.registry.clear();
    }

    /// Get the number of keys with live state.
    pub fn key_count(&self) -> usize {
        self.registry.len()
    }

    /// Configured limits by class.
    pub fn limits(&self) -> &HashMap<String, LimiterConfig> {
        &self.limits
    }

    /// Per-key counters follow the registry: once a key's state is gone, so are its counters.
    fn forget(&self, evicted: usize) {
        self.metrics
            .record_evictions(evicted, |key| self.registry.contains(key));
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
