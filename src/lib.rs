//! Ratewarden - In-process Rate Limiting Engine
//!
//! This crate decides, per request key, whether a request may proceed under a
//! configured limit. It offers fixed window, sliding log, sliding counter,
//! token bucket and leaky bucket admission, keeps per-key state in a
//! concurrent registry with idle eviction, and records decision metrics for
//! observers.

pub mod config;
pub mod error;
pub mod ratelimit;
