//! Shared primitives for the chat relay workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
