//! Limiter configuration and validation.
//!
//! A [`LimiterConfig`] is immutable once built: all of its constructors
//! validate, so any value that exists satisfies `capacity > 0`,
//! `window > 0` and `refill_rate > 0`. Configuration files describe limits
//! with the looser [`LimitSpec`], which is turned into a `LimiterConfig`
//! when the engine is built.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{RateLimitError, Result};

/// Multiplier applied to the window to get the default idle timeout of a key.
const IDLE_TIMEOUT_WINDOWS: u32 = 10;

/// The admission algorithm used for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter reset at fixed window boundaries
    FixedWindow,
    /// Exact log of admitted request times within the trailing window
    SlidingLog,
    /// Current and previous window counters with linear interpolation
    SlidingCounter,
    /// Bucket refilled continuously and drained by admissions
    TokenBucket,
    /// Bucket filled by admissions and drained continuously
    LeakyBucket,
}

impl Algorithm {
    /// Human readable algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "Fixed Window",
            Algorithm::SlidingLog => "Sliding Window Log",
            Algorithm::SlidingCounter => "Sliding Window Counter",
            Algorithm::TokenBucket => "Token Bucket",
            Algorithm::LeakyBucket => "Leaky Bucket",
        }
    }

    /// Whether the algorithm is driven by a continuous rate rather than a window.
    pub fn is_rate_based(&self) -> bool {
        matches!(self, Algorithm::TokenBucket | Algorithm::LeakyBucket)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validated configuration for a limiter.
///
/// For the window algorithms `refill_rate` is derived as the average
/// admission rate `capacity / window`; for the bucket algorithms `window` is
/// derived as the time to go from empty to full at `refill_rate`.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    algorithm: Algorithm,
    capacity: u64,
    window: Duration,
    refill_rate: f64,
}

impl LimiterConfig {
    /// Create a window-based configuration.
    pub fn windowed(algorithm: Algorithm, capacity: u64, window: Duration) -> Result<Self> {
        if algorithm.is_rate_based() {
            return Err(RateLimitError::InvalidConfig(format!(
                "{} is configured with a refill rate, not a window",
                algorithm
            )));
        }
        check_capacity(capacity)?;
        if window.is_zero() {
            return Err(RateLimitError::InvalidConfig(
                "window duration must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            algorithm,
            capacity,
            window,
            refill_rate: capacity as f64 / window.as_secs_f64(),
        })
    }

    /// Create a rate-based (bucket) configuration.
    pub fn rated(algorithm: Algorithm, capacity: u64, refill_rate: f64) -> Result<Self> {
        if !algorithm.is_rate_based() {
            return Err(RateLimitError::InvalidConfig(format!(
                "{} is configured with a window, not a refill rate",
                algorithm
            )));
        }
        check_capacity(capacity)?;
        if !(refill_rate.is_finite() && refill_rate > 0.0) {
            return Err(RateLimitError::InvalidConfig(format!(
                "refill rate must be a positive number, got {}",
                refill_rate
            )));
        }

        let window = Duration::try_from_secs_f64(capacity as f64 / refill_rate)
            .map_err(|e| RateLimitError::InvalidConfig(format!("refill rate too small: {}", e)))?;
        if window.is_zero() {
            return Err(RateLimitError::InvalidConfig(format!(
                "refill rate {} is too large for capacity {}",
                refill_rate, capacity
            )));
        }

        Ok(Self {
            algorithm,
            capacity,
            window,
            refill_rate,
        })
    }

    pub fn fixed_window(capacity: u64, window: Duration) -> Result<Self> {
        Self::windowed(Algorithm::FixedWindow, capacity, window)
    }

    pub fn sliding_log(capacity: u64, window: Duration) -> Result<Self> {
        Self::windowed(Algorithm::SlidingLog, capacity, window)
    }

    pub fn sliding_counter(capacity: u64, window: Duration) -> Result<Self> {
        Self::windowed(Algorithm::SlidingCounter, capacity, window)
    }

    pub fn token_bucket(capacity: u64, refill_rate: f64) -> Result<Self> {
        Self::rated(Algorithm::TokenBucket, capacity, refill_rate)
    }

    pub fn leaky_bucket(capacity: u64, leak_rate: f64) -> Result<Self> {
        Self::rated(Algorithm::LeakyBucket, capacity, leak_rate)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Maximum permits per window, or bucket size.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Refill (token bucket) or leak (leaky bucket) rate in units per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// How long a key may stay untouched before a sweep evicts it.
    pub fn default_idle_timeout(&self) -> Duration {
        self.window.saturating_mul(IDLE_TIMEOUT_WINDOWS)
    }

    /// Check that `cost` could ever be admitted under this configuration.
    pub fn validate_cost(&self, cost: u64) -> Result<()> {
        if cost == 0 || cost > self.capacity {
            return Err(RateLimitError::InvalidCost {
                cost,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

fn check_capacity(capacity: u64) -> Result<()> {
    if capacity == 0 {
        return Err(RateLimitError::InvalidConfig(
            "capacity must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// A limit as written in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitSpec {
    /// The admission algorithm
    pub algorithm: Algorithm,
    /// Maximum permits per window, or bucket size
    pub capacity: u64,
    /// Window length in milliseconds (window algorithms)
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// Units per second (bucket algorithms)
    #[serde(default)]
    pub refill_rate: Option<f64>,
}

impl LimitSpec {
    /// Validate this limit into a [`LimiterConfig`].
    pub fn to_config(&self) -> Result<LimiterConfig> {
        if self.algorithm.is_rate_based() {
            let rate = self.refill_rate.ok_or_else(|| {
                RateLimitError::InvalidConfig(format!("{} requires refill_rate", self.algorithm))
            })?;
            LimiterConfig::rated(self.algorithm, self.capacity, rate)
        } else {
            let window_ms = self.window_ms.ok_or_else(|| {
                RateLimitError::InvalidConfig(format!("{} requires window_ms", self.algorithm))
            })?;
            LimiterConfig::windowed(
                self.algorithm,
                self.capacity,
                Duration::from_millis(window_ms),
            )
        }
    }
}
