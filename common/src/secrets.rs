use std::fmt::{Debug, Display};

use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Wrapper for secret values such as credential tokens and proxy auth
/// tokens.
///
/// Both the [`Display`] and [`Debug`] implementations cover up the inner
/// value, so a wrapped secret cannot leak through logging or error
/// formatting. Use [`expose`](Secret::expose) for deliberate access. The
/// [`Drop`] implementation zeroes the underlying memory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Debug for Secret<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Display for Secret<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: Zeroize> Secret<T> {
    pub fn new(secret: T) -> Self {
        Self(secret)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Mint a fresh alphanumeric token. Used for per-run proxy auth.
    pub fn generate(len: usize) -> Self {
        Self(Alphanumeric.sample_string(&mut rand::thread_rng(), len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_redact() {
        let secret = Secret::new("ghp_supersecret".to_string());
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn expose_returns_inner() {
        let secret = Secret::new("token".to_string());
        assert_eq!(secret.expose(), "token");
    }

    #[test]
    fn generate_is_alphanumeric_and_fresh() {
        let a = Secret::generate(32);
        let b = Secret::generate(32);
        assert_eq!(a.expose().len(), 32);
        assert!(a.expose().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn serializes_transparently() {
        let secret = Secret::new("abc".to_string());
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"abc\"");
        let back: Secret<String> = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back.expose(), "abc");
    }
}
