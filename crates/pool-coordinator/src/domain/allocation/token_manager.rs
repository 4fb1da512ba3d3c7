//! Registration token retrieval with renewal and bounded retry.

use std::time::Duration;

use chrono::TimeDelta;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::backend::SharedBackend;
use super::error::TokenError;
use super::types::RegistrationToken;

/// Renewal and retry policy for registration tokens.
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    /// A token expiring within this window is renewed before being handed out
    pub safety_window: TimeDelta,
    /// Validity requested when renewing
    pub token_lifetime: TimeDelta,
    /// Fetch-or-renew cycles before giving up
    pub max_attempts: u32,
    /// Wait after a renewal before re-fetching; the backend is eventually consistent
    pub settle_delay: Duration,
    /// Wait between failed cycles
    pub retry_delay: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            safety_window: TimeDelta::hours(24),
            token_lifetime: TimeDelta::hours(48),
            max_attempts: 3,
            settle_delay: Duration::from_secs(5),
            retry_delay: Duration::from_secs(5),
        }
    }
}

pub struct RegistrationTokenManager {
    backend: SharedBackend,
    policy: TokenPolicy,
}

impl RegistrationTokenManager {
    pub fn new(backend: SharedBackend, policy: TokenPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Returns a token for `pool_name` that stays valid beyond the safety window.
    ///
    /// Renewal mutates backend state, so a failed call may still have issued
    /// a new token.
    #[tracing::instrument(skip(self))]
    pub async fn get_valid_token(
        &self,
        pool_name: &str,
    ) -> Result<RegistrationToken, Report<TokenError>> {
        let max_attempts = self.policy.max_attempts;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.fetch_or_renew(pool_name).await {
                Ok(token) => {
                    info!(
                        pool_name,
                        attempt,
                        expires_at = %token.expires_at,
                        "obtained registration token"
                    );
                    return Ok(token);
                }
                Err(err) => {
                    warn!(
                        pool_name,
                        attempt,
                        max_attempts,
                        error = ?err,
                        "registration token attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        let exhausted = TokenError::Exhausted {
            pool_name: pool_name.to_string(),
            attempts: max_attempts,
        };
        Err(match last_error {
            Some(cause) => cause.change_context(exhausted),
            None => Report::new(exhausted),
        })
    }

    async fn fetch_or_renew(&self, pool_name: &str) -> Result<RegistrationToken, Report<TokenError>> {
        match self.backend.get_registration_token(pool_name).await {
            Ok(Some(token)) if self.is_usable(&token) => return Ok(token),
            Ok(Some(token)) => debug!(
                pool_name,
                expires_at = %token.expires_at,
                "registration token expires within safety window, renewing"
            ),
            Ok(None) => debug!(pool_name, "host pool has no registration token, renewing"),
            Err(err) => warn!(
                pool_name,
                error = ?err,
                "failed to fetch registration token, renewing"
            ),
        }

        let expires_at = Utc::now() + self.policy.token_lifetime;
        self.backend
            .renew_registration_token(pool_name, expires_at)
            .await
            .change_context_lazy(|| TokenError::Backend {
                operation: "renew registration token",
                pool_name: pool_name.to_string(),
            })?;

        tokio::time::sleep(self.policy.settle_delay).await;

        let token = self
            .backend
            .get_registration_token(pool_name)
            .await
            .change_context_lazy(|| TokenError::Backend {
                operation: "get registration token",
                pool_name: pool_name.to_string(),
            })?;

        match token {
            Some(token) if self.is_usable(&token) => Ok(token),
            Some(token) => Err(Report::new(TokenError::NotUsable {
                pool_name: pool_name.to_string(),
            })
            .attach_printable(format!("renewed token expires at {}", token.expires_at))),
            None => Err(Report::new(TokenError::NotUsable {
                pool_name: pool_name.to_string(),
            })
            .attach_printable("no token present after renewal")),
        }
    }

    fn is_usable(&self, token: &RegistrationToken) -> bool {
        !token.expires_within(Utc::now(), self.policy.safety_window)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::domain::allocation::backend::PoolBackend;
    use crate::domain::allocation::types::PoolProperties;
    use crate::infrastructure::memory_backend::InMemoryPoolBackend;
    use crate::infrastructure::memory_backend::Operation;

    const POOL: &str = "HP-Personal-ALPHA";

    fn fast_policy() -> TokenPolicy {
        TokenPolicy {
            settle_delay: Duration::from_millis(1),
            retry_delay: Duration::from_millis(1),
            ..TokenPolicy::default()
        }
    }

    async fn backend_with_pool() -> Arc<InMemoryPoolBackend> {
        let backend = Arc::new(InMemoryPoolBackend::default());
        backend
            .create_pool(POOL, &PoolProperties::default())
            .await
            .expect("create pool");
        backend
    }

    fn manager(backend: &Arc<InMemoryPoolBackend>, policy: TokenPolicy) -> RegistrationTokenManager {
        RegistrationTokenManager::new(backend.clone(), policy)
    }

    #[test(tokio::test)]
    async fn returns_existing_valid_token_without_renewal() {
        let backend = backend_with_pool().await;
        let existing = RegistrationToken {
            token: "still-good".to_string(),
            expires_at: Utc::now() + TimeDelta::days(7),
        };
        backend.set_registration_token(POOL, existing.clone());

        let token = manager(&backend, fast_policy())
            .get_valid_token(POOL)
            .await
            .expect("token");

        assert_eq!(token, existing);
        assert_eq!(backend.call_count(Operation::RenewToken), 0);
    }

    #[test(tokio::test)]
    async fn renews_token_inside_safety_window() {
        let backend = backend_with_pool().await;
        backend.set_registration_token(
            POOL,
            RegistrationToken {
                token: "about-to-expire".to_string(),
                expires_at: Utc::now() + TimeDelta::hours(2),
            },
        );

        let token = manager(&backend, fast_policy())
            .get_valid_token(POOL)
            .await
            .expect("token");

        assert!(token.token != "about-to-expire");
        assert!(token.expires_at > Utc::now() + TimeDelta::hours(24));
        assert_eq!(backend.call_count(Operation::RenewToken), 1);
    }

    #[test(tokio::test)]
    async fn renews_missing_token() {
        let backend = backend_with_pool().await;

        let token = manager(&backend, fast_policy())
            .get_valid_token(POOL)
            .await
            .expect("token");

        assert!(!token.token.is_empty());
        assert_eq!(backend.call_count(Operation::RenewToken), 1);
    }

    #[test(tokio::test)]
    async fn recovers_from_transient_fetch_failure() {
        let backend = backend_with_pool().await;
        // Initial fetch and post-renew fetch of the first attempt both fail.
        backend.fail_next(Operation::GetToken, 2);

        let token = manager(&backend, fast_policy())
            .get_valid_token(POOL)
            .await
            .expect("second attempt succeeds");

        // The first attempt's renewal landed; the second attempt finds it.
        assert!(token.expires_at > Utc::now() + TimeDelta::hours(24));
        assert_eq!(backend.call_count(Operation::RenewToken), 1);
    }

    #[test(tokio::test)]
    async fn exhausted_retries_name_the_pool() {
        let backend = backend_with_pool().await;
        backend.fail_always(Operation::RenewToken);

        let err = manager(&backend, fast_policy())
            .get_valid_token(POOL)
            .await
            .expect_err("renew never succeeds");

        match err.current_context() {
            TokenError::Exhausted {
                pool_name,
                attempts,
            } => {
                assert_eq!(pool_name, POOL);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains(POOL));
        assert_eq!(backend.call_count(Operation::RenewToken), 3);
    }

    #[test(tokio::test)]
    async fn never_returns_token_inside_window() {
        let backend = backend_with_pool().await;
        // Renewals only ever produce tokens shorter than the safety window.
        let policy = TokenPolicy {
            token_lifetime: TimeDelta::hours(1),
            ..fast_policy()
        };

        let err = manager(&backend, policy)
            .get_valid_token(POOL)
            .await
            .expect_err("short-lived tokens are never handed out");

        assert!(matches!(
            err.current_context(),
            TokenError::Exhausted { .. }
        ));
        assert_eq!(backend.call_count(Operation::RenewToken), 3);
    }
}
