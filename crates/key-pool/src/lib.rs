//! Upstream API key pool
//!
//! Holds the ordered list of upstream API keys loaded at startup and a
//! per-key "rate limited until" instant. Keys are handed out round-robin;
//! a key that drew a 429 is penalized for a fixed duration and skipped
//! until that instant passes.
//!
//! Key lifecycle:
//! 1. Loaded from configuration at startup, status `available`
//! 2. Selected round-robin starting at the rotation cursor
//! 3. Upstream returns 429 → penalized until `now + penalty`
//! 4. Penalty expires → usable again, discovered lazily on the next scan
//!
//! There is no background timer and no permanently disabled state.

pub mod error;
pub mod pool;

pub use error::{Error, Result};
pub use pool::{DEFAULT_PENALTY, KeyPool, SelectedKey};
