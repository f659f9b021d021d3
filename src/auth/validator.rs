//! Token validation against the identity provider, fronted by the result
//! cache.
//!
//! Order of checks for a cache miss: identity, classic-PAT policy,
//! organisation membership, team roster.  Only a rejected identity lookup
//! is cached negatively; every other denial is re-evaluated on the next
//! request.

use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::cache::TokenCache;
use crate::auth::outcome::{ErrorKind, Identity, Outcome, ValidationError};
use crate::forge::{IdentityProvider, ProviderError};
use crate::metrics::Metrics;

pub struct Validator {
    provider: Arc<dyn IdentityProvider>,
    cache: Arc<dyn TokenCache>,
    org: String,
    reject_classic_pats: bool,
    metrics: Option<Arc<Metrics>>,
}

impl Validator {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        cache: Arc<dyn TokenCache>,
        org: impl Into<String>,
        reject_classic_pats: bool,
    ) -> Self {
        Self {
            provider,
            cache,
            org: org.into(),
            reject_classic_pats,
            metrics: None,
        }
    }

    /// Count every validation result in `forgeauth_validation_total`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resolve `token` to an [`Identity`] authorised for the configured
    /// organisation.
    ///
    /// Cancelling `cancel` aborts an in-flight provider call and yields
    /// [`ValidationError::Cancelled`].
    #[instrument(skip_all, fields(org = %self.org))]
    pub async fn validate(&self, token: &str, cancel: &CancellationToken) -> Result<Identity, ValidationError> {
        let result = self.resolve(token, cancel).await;

        match &result {
            Ok(identity) => info!(login = %identity.login, teams = identity.teams.len(), "token validated"),
            Err(ValidationError::Internal(e)) => error!(error = %format!("{e:#}"), "token validation failed"),
            Err(e) => warn!(reason = ?e.kind(), "token denied"),
        }
        if let Some(metrics) = &self.metrics {
            let label = match &result {
                Ok(_) => "success",
                Err(e) => e.kind().result_label(),
            };
            metrics.record_validation(label);
        }

        result
    }

    async fn resolve(&self, token: &str, cancel: &CancellationToken) -> Result<Identity, ValidationError> {
        // 1. Cache.
        match self.cache.get(token) {
            Some(Outcome::Authorized(identity)) => {
                debug!(login = %identity.login, "validation cache hit");
                return Ok(identity);
            }
            Some(Outcome::Denied(kind)) => {
                debug!(?kind, "validation cache hit (denied)");
                return Err(kind.into());
            }
            None => {}
        }

        // 2. Identity.
        let (user, is_classic_pat) = match guarded(cancel, self.provider.who_am_i(token)).await? {
            Ok(found) => found,
            Err(ProviderError::Unauthorized) => {
                self.cache.set(token, Outcome::Denied(ErrorKind::Unauthorized));
                return Err(ValidationError::Unauthorized);
            }
            Err(ProviderError::RateLimited) => return Err(ValidationError::RateLimited),
            Err(e) => return Err(internal(e, "resolving token owner")),
        };

        // 3. Token type policy.
        if self.reject_classic_pats && is_classic_pat {
            return Err(ValidationError::ClassicPat);
        }

        // 4. Membership.
        match guarded(cancel, self.provider.check_membership(token, &self.org, &user.login)).await? {
            Ok(()) => {}
            Err(ProviderError::NotMember) => return Err(ValidationError::NotMember),
            Err(ProviderError::RateLimited) => return Err(ValidationError::RateLimited),
            Err(e) => return Err(internal(e, "checking organization membership")),
        }

        // 5. Roster.
        let teams = match guarded(cancel, self.provider.list_groups(token, &self.org)).await? {
            Ok(teams) => teams,
            Err(ProviderError::RateLimited) => return Err(ValidationError::RateLimited),
            Err(e) => return Err(internal(e, "listing teams")),
        };
        let teams: Vec<String> = teams
            .into_iter()
            .filter(|team| team.org.eq_ignore_ascii_case(&self.org))
            .map(|team| team.slug)
            .collect();

        // 6. Assemble and cache.
        let identity = Identity {
            login: user.login,
            id: user.id,
            email: user.email,
            org: self.org.clone(),
            teams,
        };
        self.cache.set(token, Outcome::Authorized(identity.clone()));
        Ok(identity)
    }
}

/// Await a provider call unless `cancel` fires first.
async fn guarded<T, F>(cancel: &CancellationToken, call: F) -> Result<Result<T, ProviderError>, ValidationError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ValidationError::Cancelled),
        result = call => Ok(result),
    }
}

fn internal(err: ProviderError, step: &'static str) -> ValidationError {
    let err = match err {
        ProviderError::Other(e) => e,
        other => anyhow!(other),
    };
    ValidationError::Internal(err.context(step))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::auth::cache::ResultCache;
    use crate::forge::{Team, UserProfile};
    use crate::metrics::MetricsRegistry;

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Reply {
        Ok,
        Unauthorized,
        NotMember,
        RateLimited,
        Other,
        Hang,
    }

    impl Reply {
        async fn into_result<T>(self, value: T) -> Result<T, ProviderError> {
            match self {
                Reply::Ok => Ok(value),
                Reply::Unauthorized => Err(ProviderError::Unauthorized),
                Reply::NotMember => Err(ProviderError::NotMember),
                Reply::RateLimited => Err(ProviderError::RateLimited),
                Reply::Other => Err(ProviderError::Other(anyhow!("connection reset"))),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    struct FakeProvider {
        user: Reply,
        classic: bool,
        membership: Reply,
        teams: Reply,
        team_list: Vec<Team>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl Default for FakeProvider {
        fn default() -> Self {
            Self {
                user: Reply::Ok,
                classic: false,
                membership: Reply::Ok,
                teams: Reply::Ok,
                team_list: vec![
                    Team::new("platform", "acme"),
                    Team::new("other-team", "other-org"),
                    Team::new("security", "ACME"),
                    Team::new("sre", "acme"),
                ],
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl FakeProvider {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl IdentityProvider for FakeProvider {
        async fn who_am_i(&self, _token: &str) -> Result<(UserProfile, bool), ProviderError> {
            self.calls.lock().unwrap().push("who_am_i");
            let user = UserProfile {
                login: "alice".to_string(),
                id: 42,
                email: Some("alice@example.com".to_string()),
            };
            self.user.into_result((user, self.classic)).await
        }

        async fn check_membership(&self, _token: &str, org: &str, login: &str) -> Result<(), ProviderError> {
            assert_eq!(org, "acme");
            assert_eq!(login, "alice");
            self.calls.lock().unwrap().push("check_membership");
            self.membership.into_result(()).await
        }

        async fn list_groups(&self, _token: &str, _org: &str) -> Result<Vec<Team>, ProviderError> {
            self.calls.lock().unwrap().push("list_groups");
            self.teams.into_result(self.team_list.clone()).await
        }
    }

    /// Counts calls through to a real cache.
    #[derive(Default)]
    struct CountingCache {
        inner: Option<ResultCache>,
        sets: AtomicUsize,
    }

    impl TokenCache for CountingCache {
        fn get(&self, token: &str) -> Option<Outcome> {
            self.inner.as_ref().and_then(|c| c.get(token))
        }
        fn set(&self, token: &str, outcome: Outcome) {
            self.sets.fetch_add(1, Ordering::SeqCst);
            if let Some(c) = &self.inner {
                c.set(token, outcome);
            }
        }
        fn delete(&self, token: &str) {
            if let Some(c) = &self.inner {
                c.delete(token);
            }
        }
    }

    fn setup(provider: FakeProvider) -> (Validator, Arc<FakeProvider>, Arc<ResultCache>) {
        let provider = Arc::new(provider);
        let cache = Arc::new(ResultCache::new(Duration::from_secs(300), 100));
        let validator = Validator::new(provider.clone(), cache.clone(), "acme", true);
        (validator, provider, cache)
    }

    async fn validate(validator: &Validator, token: &str) -> Result<Identity, ValidationError> {
        validator.validate(token, &CancellationToken::new()).await
    }

    // ── success path ──────────────────────────────────────────────────

    #[tokio::test]
    async fn success_returns_identity_with_org_teams_in_order() {
        let (validator, provider, cache) = setup(FakeProvider::default());

        let identity = validate(&validator, "tok").await.unwrap();
        assert_eq!(identity.login, "alice");
        assert_eq!(identity.id, 42);
        assert_eq!(identity.email.as_deref(), Some("alice@example.com"));
        assert_eq!(identity.org, "acme");
        assert_eq!(identity.teams, ["platform", "security", "sre"]);
        assert_eq!(provider.calls(), ["who_am_i", "check_membership", "list_groups"]);
        assert_eq!(cache.get("tok"), Some(Outcome::Authorized(identity)));
    }

    #[tokio::test]
    async fn cache_hit_skips_provider() {
        let (validator, provider, _cache) = setup(FakeProvider::default());

        let first = validate(&validator, "tok").await.unwrap();
        let second = validate(&validator, "tok").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls().len(), 3);
    }

    #[tokio::test]
    async fn no_teams_in_org_is_still_authorized() {
        let (validator, _provider, _cache) = setup(FakeProvider {
            team_list: vec![Team::new("x", "elsewhere")],
            ..FakeProvider::default()
        });
        let identity = validate(&validator, "tok").await.unwrap();
        assert!(identity.teams.is_empty());
    }

    #[tokio::test]
    async fn classic_pat_allowed_when_policy_off() {
        let provider = Arc::new(FakeProvider {
            classic: true,
            ..FakeProvider::default()
        });
        let cache = Arc::new(ResultCache::new(Duration::from_secs(300), 100));
        let validator = Validator::new(provider, cache, "acme", false);
        assert!(validate(&validator, "tok").await.is_ok());
    }

    // ── identity failures ─────────────────────────────────────────────

    #[tokio::test]
    async fn unauthorized_is_cached_negatively() {
        let (validator, provider, cache) = setup(FakeProvider {
            user: Reply::Unauthorized,
            ..FakeProvider::default()
        });

        let err = validate(&validator, "bad").await.unwrap_err();
        assert!(matches!(err, ValidationError::Unauthorized));
        assert_eq!(cache.get("bad"), Some(Outcome::Denied(ErrorKind::Unauthorized)));

        let err = validate(&validator, "bad").await.unwrap_err();
        assert!(matches!(err, ValidationError::Unauthorized));
        assert_eq!(provider.calls(), ["who_am_i"]);
    }

    #[tokio::test]
    async fn identity_transport_error_is_internal_and_uncached() {
        let (validator, _provider, cache) = setup(FakeProvider {
            user: Reply::Other,
            ..FakeProvider::default()
        });

        let err = validate(&validator, "tok").await.unwrap_err();
        match &err {
            ValidationError::Internal(e) => {
                assert_eq!(format!("{e:#}"), "resolving token owner: connection reset")
            }
            other => panic!("expected Internal, got {other:?}"),
        }
        assert!(cache.is_empty());
    }

    // ── policy ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn classic_pat_rejected_before_membership() {
        let (validator, provider, cache) = setup(FakeProvider {
            classic: true,
            ..FakeProvider::default()
        });

        let err = validate(&validator, "classic").await.unwrap_err();
        assert!(matches!(err, ValidationError::ClassicPat));
        assert_eq!(provider.calls(), ["who_am_i"]);
        assert!(cache.is_empty());
    }

    // ── membership failures ───────────────────────────────────────────

    #[tokio::test]
    async fn not_member_is_not_cached() {
        let (validator, provider, cache) = setup(FakeProvider {
            membership: Reply::NotMember,
            ..FakeProvider::default()
        });

        let err = validate(&validator, "outsider").await.unwrap_err();
        assert!(matches!(err, ValidationError::NotMember));
        assert!(cache.is_empty());
        assert!(!provider.calls().contains(&"list_groups"));

        // Re-evaluated on the next request.
        validate(&validator, "outsider").await.unwrap_err();
        assert_eq!(provider.calls().iter().filter(|c| **c == "who_am_i").count(), 2);
    }

    #[tokio::test]
    async fn membership_unauthorized_is_internal() {
        let (validator, _provider, cache) = setup(FakeProvider {
            membership: Reply::Unauthorized,
            ..FakeProvider::default()
        });

        let err = validate(&validator, "tok").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(cache.is_empty());
    }

    // ── rate limiting ─────────────────────────────────────────────────

    #[tokio::test]
    async fn rate_limited_at_any_step_is_never_cached() {
        for provider in [
            FakeProvider {
                user: Reply::RateLimited,
                ..FakeProvider::default()
            },
            FakeProvider {
                membership: Reply::RateLimited,
                ..FakeProvider::default()
            },
            FakeProvider {
                teams: Reply::RateLimited,
                ..FakeProvider::default()
            },
        ] {
            let provider = Arc::new(provider);
            let cache = Arc::new(CountingCache::default());
            let validator = Validator::new(provider, cache.clone(), "acme", true);

            let err = validate(&validator, "tok").await.unwrap_err();
            assert!(matches!(err, ValidationError::RateLimited));
            assert_eq!(cache.sets.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn roster_error_is_internal_and_uncached() {
        let (validator, _provider, cache) = setup(FakeProvider {
            teams: Reply::Other,
            ..FakeProvider::default()
        });
        let err = validate(&validator, "tok").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(cache.is_empty());
    }

    // ── cancellation ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_provider_call() {
        let (validator, _provider, cache) = setup(FakeProvider {
            membership: Reply::Hang,
            ..FakeProvider::default()
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = validator.validate("tok", &cancel).await.unwrap_err();
        assert!(matches!(err, ValidationError::Cancelled));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn already_cancelled_never_reaches_provider_result() {
        let (validator, _provider, cache) = setup(FakeProvider::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = validator.validate("tok", &cancel).await.unwrap_err();
        assert!(matches!(err, ValidationError::Cancelled));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cached_result_served_even_when_cancelled() {
        let (validator, _provider, _cache) = setup(FakeProvider::default());
        validate(&validator, "tok").await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(validator.validate("tok", &cancel).await.is_ok());
    }

    // ── metrics ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn results_are_counted() {
        let registry = MetricsRegistry::new();
        let provider = Arc::new(FakeProvider {
            membership: Reply::NotMember,
            ..FakeProvider::default()
        });
        let cache = Arc::new(ResultCache::new(Duration::from_secs(300), 100));
        let validator =
            Validator::new(provider, cache, "acme", true).with_metrics(Arc::clone(&registry.metrics));

        validate(&validator, "tok").await.unwrap_err();
        validate(&validator, "tok").await.unwrap_err();

        let text = registry.encode().unwrap();
        assert!(text.contains("forgeauth_validation_total{result=\"forbidden\"} 2"));
    }
}
