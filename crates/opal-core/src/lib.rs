//! Foundational low-level utilities shared across Opal crates.
//!
//! Provides time helpers, content hashing for fallback message identities,
//! and the handled-failure counter backing the soft-reset circuit breaker.

pub mod content_hash;
pub mod failure_counter;
pub mod time_utils;

pub use content_hash::{fallback_message_identity, sha256_hex};
pub use failure_counter::{FailureCounter, FailureCounterSnapshot};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
