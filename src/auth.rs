//! Credentials and auth tokens.
//!
//! Neither type prints its secret part through `Debug` or `Display`, so both can
//! be passed to `tracing` fields without leaking the password or a live token.

use std::fmt;

/// Login id and password for the ICSD service.
///
/// Supplied once when the retriever is built and never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    login_id: String,
    password: String,
}

impl Credential {
    /// Creates a credential from a login id and password.
    #[must_use]
    pub fn new(login_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login_id: login_id.into(),
            password: password.into(),
        }
    }

    /// Returns the login id.
    #[must_use]
    pub fn login_id(&self) -> &str {
        &self.login_id
    }

    /// Returns the password. Only the login request should call this.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("login_id", &self.login_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opaque, time-bounded token issued by `auth/login`.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

/// Number of leading token characters shown in logs.
const VISIBLE_PREFIX: usize = 4;

impl AuthToken {
    /// Wraps a raw token string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw token for use in the request header.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(VISIBLE_PREFIX).collect();
        write!(f, "{prefix}…")
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_redacts_password() {
        let credential = Credential::new("alice", "hunter2");
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_token_display_shows_prefix_only() {
        let token = AuthToken::new("abcdef0123456789");
        assert_eq!(token.to_string(), "abcd…");
        assert!(!format!("{token:?}").contains("0123456789"));
        assert_eq!(token.as_str(), "abcdef0123456789");
    }

    #[test]
    fn test_short_token_display() {
        let token = AuthToken::new("ab");
        assert_eq!(token.to_string(), "ab…");
    }
}
