//! Retry policy for token acquisition.
//!
//! Login failures are classified into a [`FailureType`] and the
//! [`RetryPolicy`] decides whether another attempt is made and after what
//! delay. The pause between attempts is constant; the default is five
//! attempts 100 ms apart, both adjustable through configuration.
//!
//! # Example
//!
//! ```
//! use icsd_core::session::{FailureType, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! match policy.should_retry(FailureType::Transient, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use crate::client::ClientError;

/// Default number of login attempts (including the first).
pub const DEFAULT_AUTH_ATTEMPTS: u32 = 5;

/// Default pause between login attempts (100 ms).
pub const DEFAULT_AUTH_BACKOFF: Duration = Duration::from_millis(100);

/// Classification of a failed login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// The next attempt may succeed (any rejected login, timeouts, network errors).
    Transient,
    /// Retrying cannot help (bad base URL, client construction failure).
    Permanent,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Give up.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Retry configuration: an attempt budget and a constant pause between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,
    /// Pause before every retry.
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_AUTH_ATTEMPTS, DEFAULT_AUTH_BACKOFF)
    }
}

impl RetryPolicy {
    /// Creates a policy with a constant pause.
    ///
    /// `max_attempts` counts the first attempt and is clamped to at least 1.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the pause between attempts.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Determines whether to retry after `attempt` (1-indexed) failed.
    #[instrument(level = "trace", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.delay;
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

}

/// Classifies a login error for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | HttpStatus / TokenRejected | Transient (the service sheds logins under load) |
/// | Timeout / Network | Transient |
/// | MalformedResponse (no token header) | Transient |
/// | InvalidUrl / Build | Permanent |
#[must_use]
pub fn classify_error(error: &ClientError) -> FailureType {
    match error {
        ClientError::HttpStatus { .. }
        | ClientError::TokenRejected { .. }
        | ClientError::Timeout { .. }
        | ClientError::Network { .. }
        | ClientError::MalformedResponse { .. } => FailureType::Transient,
        ClientError::InvalidUrl { .. } | ClientError::Build { .. } => FailureType::Permanent,
    }
}
