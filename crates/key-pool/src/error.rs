//! Error types for key selection

/// Why no key could be handed out.
///
/// The two cases are reported differently to callers: `Unconfigured` is a
/// server misconfiguration, `Exhausted` is a transient retry-later state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no upstream API keys configured")]
    Unconfigured,

    #[error("all {total} upstream API keys are rate limited")]
    Exhausted { total: usize },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
