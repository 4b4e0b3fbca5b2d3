//! Token acquisition, reuse and release.
//!
//! Two lifecycles share one [`SessionGateway`]:
//!
//! - **Scoped tokens** ([`ScopedToken`], [`SessionGateway::with_scope`]): one
//!   fresh token per unit of work, released when the unit ends. Every batch
//!   worker uses this path, so no token object is shared between workers.
//! - **Long-lived session** ([`Session`]): one stored token reused across
//!   calls made outside the worker pool (searches). A rejected token is
//!   replaced exactly once per call; a second rejection is fatal.
//!
//! Release is best-effort. A failed logout is logged and swallowed because the
//! service expires tokens on its own.

mod retry;

pub use retry::{
    DEFAULT_AUTH_ATTEMPTS, DEFAULT_AUTH_BACKOFF, FailureType, RetryDecision, RetryPolicy,
    classify_error,
};

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthToken, Credential};
use crate::client::{ClientError, IcsdService};

/// A token could not be obtained within the retry budget.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Every login attempt failed.
    #[error("[AUTH] unable to log in as {login_id} after {attempts} attempt(s): {source}")]
    Exhausted {
        /// Login id that was refused (never the password).
        login_id: String,
        /// Number of attempts made.
        attempts: u32,
        /// Error from the last attempt.
        #[source]
        source: ClientError,
    },
}

/// Errors surfaced by [`Session::with_token`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// Token acquisition failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The freshly acquired replacement token was rejected as well.
    #[error("[AUTH] token rejected again after re-authentication: {source}")]
    TokenRejectedTwice {
        /// The second rejection.
        #[source]
        source: ClientError,
    },

    /// The remote call failed for a reason other than token rejection.
    #[error(transparent)]
    Remote(#[from] ClientError),
}

/// Acquires and releases tokens for one credential.
#[derive(Clone)]
pub struct SessionGateway {
    service: Arc<dyn IcsdService>,
    credential: Credential,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for SessionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGateway")
            .field("credential", &self.credential)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl SessionGateway {
    /// Creates a gateway using the default login retry policy (5 attempts, 100 ms apart).
    #[must_use]
    pub fn new(service: Arc<dyn IcsdService>, credential: Credential) -> Self {
        Self::with_retry_policy(service, credential, RetryPolicy::default())
    }

    /// Creates a gateway with a custom login retry policy.
    #[must_use]
    pub fn with_retry_policy(
        service: Arc<dyn IcsdService>,
        credential: Credential,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            credential,
            retry_policy,
        }
    }

    /// Returns the credential used for every login.
    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Returns the service this gateway authenticates against.
    #[must_use]
    pub fn service(&self) -> &Arc<dyn IcsdService> {
        &self.service
    }

    /// Logs in, retrying failed attempts according to the retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Exhausted`] once the attempt budget is spent or a
    /// permanent failure occurs.
    #[instrument(skip(self), fields(login_id = self.credential.login_id()))]
    pub async fn acquire(&self) -> Result<AuthToken, AuthError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.service.login(&self.credential).await {
                Ok(token) => {
                    debug!(attempt, %token, "token acquired");
                    return Ok(token);
                }
                Err(error) => {
                    let decision = self
                        .retry_policy
                        .should_retry(classify_error(&error), attempt);
                    match decision {
                        RetryDecision::Retry { delay, .. } => {
                            warn!(attempt, error = %error, "login attempt failed");
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            warn!(attempt, %reason, error = %error, "giving up on login");
                            return Err(AuthError::Exhausted {
                                login_id: self.credential.login_id().to_string(),
                                attempts: attempt,
                                source: error,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Logs a token out. Never fails; errors are logged.
    pub async fn release(&self, token: &AuthToken) {
        release_token(self.service.as_ref(), token).await;
    }

    /// Acquires a token wrapped in a guard that releases it on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if no token could be acquired.
    pub async fn scoped(&self) -> Result<ScopedToken, AuthError> {
        let token = self.acquire().await?;
        Ok(ScopedToken {
            token,
            service: Arc::clone(&self.service),
            released: false,
        })
    }

    /// Runs `f` with a fresh token and releases the token afterwards.
    ///
    /// The token is released even if `f` panics or the returned future is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if no token could be acquired; `f` is not run then.
    pub async fn with_scope<T, F, Fut>(&self, f: F) -> Result<T, AuthError>
    where
        F: FnOnce(AuthToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let scoped = self.scoped().await?;
        let result = f(scoped.token().clone()).await;
        scoped.release().await;
        Ok(result)
    }
}

async fn release_token(service: &dyn IcsdService, token: &AuthToken) {
    match service.logout(token).await {
        Ok(()) => debug!(%token, "token released"),
        Err(error) => warn!(
            %token,
            error = %error,
            "logout failed; token will expire on its own"
        ),
    }
}

/// A token that is logged out when the guard ends.
///
/// Call [`ScopedToken::release`] on the normal path. If the guard is dropped
/// instead (early return, panic, cancelled future), `Drop` spawns the logout on
/// the current tokio runtime.
pub struct ScopedToken {
    token: AuthToken,
    service: Arc<dyn IcsdService>,
    released: bool,
}

impl std::fmt::Debug for ScopedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedToken")
            .field("token", &self.token)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl ScopedToken {
    /// The live token.
    #[must_use]
    pub fn token(&self) -> &AuthToken {
        &self.token
    }

    /// Logs the token out and consumes the guard.
    pub async fn release(mut self) {
        // Marked first: if this future is dropped mid-logout, Drop must not send a second one.
        self.released = true;
        release_token(self.service.as_ref(), &self.token).await;
    }
}

impl Drop for ScopedToken {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let service = Arc::clone(&self.service);
        let token = self.token.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(%token, "scoped token dropped without release; releasing in background");
                handle.spawn(async move {
                    release_token(service.as_ref(), &token).await;
                });
            }
            Err(_) => warn!(%token, "no async runtime to release token; it will expire on its own"),
        }
    }
}

/// Long-lived connection reusing one token across calls.
///
/// The stored token sits behind an async mutex and is only ever handed out by
/// value to the call in progress. Batch workers do not use this type.
#[derive(Debug)]
pub struct Session {
    gateway: SessionGateway,
    token: Mutex<Option<AuthToken>>,
}

impl Session {
    /// Creates a disconnected session.
    #[must_use]
    pub fn new(gateway: SessionGateway) -> Self {
        Self {
            gateway,
            token: Mutex::new(None),
        }
    }

    /// The gateway this session acquires tokens through.
    #[must_use]
    pub fn gateway(&self) -> &SessionGateway {
        &self.gateway
    }

    /// Returns true while a long-lived token is stored.
    pub async fn is_connected(&self) -> bool {
        self.token.lock().await.is_some()
    }

    /// Acquires and stores a long-lived token, releasing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if login fails.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), AuthError> {
        let token = self.gateway.acquire().await?;
        let previous = self.token.lock().await.replace(token);
        if let Some(previous) = previous {
            self.gateway.release(&previous).await;
        }
        info!("session connected");
        Ok(())
    }

    /// Releases the stored token, if any.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let token = self.token.lock().await.take();
        if let Some(token) = token {
            self.gateway.release(&token).await;
            info!("session closed");
        }
    }

    /// Runs `call` with a valid token, re-authenticating at most once.
    ///
    /// When connected, the stored token is used; when not, a temporary scoped
    /// token is acquired and released around the call. If the service rejects
    /// the token, a fresh one is acquired (and stored, when connected) and
    /// `call` is retried once with it.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Auth`] if a token cannot be acquired
    /// - [`SessionError::TokenRejectedTwice`] if the fresh token is rejected too
    /// - [`SessionError::Remote`] for any other remote failure
    pub async fn with_token<T, F, Fut>(&self, call: F) -> Result<T, SessionError>
    where
        F: Fn(AuthToken) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let stored = self.token.lock().await.clone();
        match stored {
            Some(token) => self.call_with_stored(token, call).await,
            None => self.call_with_temporary(call).await,
        }
    }

    async fn call_with_stored<T, F, Fut>(
        &self,
        token: AuthToken,
        call: F,
    ) -> Result<T, SessionError>
    where
        F: Fn(AuthToken) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        match call(token.clone()).await {
            Err(error) if error.is_token_rejected() => {
                warn!(%token, "stored token rejected; re-authenticating once");
                let fresh = self.replace_rejected(&token).await?;
                call(fresh)
                    .await
                    .map_err(rejected_twice_or_remote)
            }
            other => other.map_err(SessionError::Remote),
        }
    }

    async fn call_with_temporary<T, F, Fut>(&self, call: F) -> Result<T, SessionError>
    where
        F: Fn(AuthToken) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let first = self.gateway.with_scope(&call).await?;
        match first {
            Err(error) if error.is_token_rejected() => {
                warn!("temporary token rejected; re-authenticating once");
                self.gateway
                    .with_scope(&call)
                    .await?
                    .map_err(rejected_twice_or_remote)
            }
            other => other.map_err(SessionError::Remote),
        }
    }

    /// Swaps out a rejected stored token and returns its replacement.
    ///
    /// If another caller already replaced it, that newer token is reused.
    /// Otherwise the rejected token is logged out once its replacement is stored.
    async fn replace_rejected(&self, rejected: &AuthToken) -> Result<AuthToken, AuthError> {
        let mut guard = self.token.lock().await;
        if let Some(current) = guard.as_ref()
            && current != rejected
        {
            debug!(token = %current, "token already refreshed by another caller");
            return Ok(current.clone());
        }

        let fresh = self.gateway.acquire().await?;
        *guard = Some(fresh.clone());
        drop(guard);

        self.gateway.release(rejected).await;
        Ok(fresh)
    }
}

fn rejected_twice_or_remote(error: ClientError) -> SessionError {
    if error.is_token_rejected() {
        SessionError::TokenRejectedTwice { source: error }
    } else {
        SessionError::Remote(error)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(token) = self.token.get_mut().take() else {
            return;
        };
        let service = Arc::clone(&self.gateway.service);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(%token, "session dropped while connected; releasing in background");
                handle.spawn(async move {
                    release_token(service.as_ref(), &token).await;
                });
            }
            Err(_) => warn!(%token, "no async runtime to release session token"),
        }
    }
}
