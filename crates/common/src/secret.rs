//! Secret wrapper for upstream API keys
//!
//! Keys are only ever read through `expose()` at the point where the bearer
//! header is built. Everything else (logs, health output, errors) sees
//! `[REDACTED]` or the masked `hint()`.

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Masked tail of the key for operator logs, e.g. `…9f2c`.
    ///
    /// Keys of 8 characters or fewer render as a bare `…` so that short
    /// test keys are not revealed in full.
    pub fn hint(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "…".to_string();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("…{tail}")
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let secret = Secret::new(String::from("sk-or-v1-abcdef123456"));
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn expose_returns_inner_value() {
        let secret = Secret::from(String::from("sk-or-v1-abcdef123456"));
        assert_eq!(secret.expose(), "sk-or-v1-abcdef123456");
    }

    #[test]
    fn hint_shows_only_last_four_chars() {
        let secret = Secret::new(String::from("sk-or-v1-abcdef123456"));
        assert_eq!(secret.hint(), "…3456");
        assert!(!secret.hint().contains("sk-or"));
    }

    #[test]
    fn hint_hides_short_keys_entirely() {
        assert_eq!(Secret::new(String::from("key-a")).hint(), "…");
        assert_eq!(Secret::new(String::from("12345678")).hint(), "…");
        assert_eq!(Secret::new(String::from("123456789")).hint(), "…6789");
    }

    #[test]
    fn clone_keeps_value() {
        let secret = Secret::new(String::from("sk-clone-me-please"));
        let cloned = secret.clone();
        drop(secret);
        assert_eq!(cloned.expose(), "sk-clone-me-please");
    }
}
