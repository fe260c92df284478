//! Token -> principal cache with freshness window and single-flight refresh
//! via an external REST service (C5).
//!
//! As spec.md §4.C5. Single-flight is implemented with a
//! `Mutex<HashMap<String, Arc<tokio::sync::Notify>>>` in-flight table — the
//! teacher doesn't have an exact analogue for this, so it is grounded
//! instead in the original's `SendRecvContext` single-connection-per-tag
//! pooling pattern (`transfer/SendRecvContext.h`'s `tryGetConnection`/
//! `putConnection` discipline of "only one holder of a tagged resource at a
//! time"), generalized here to single-flight-per-token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::error::ServerError;
use crate::protocol::SecurityPrincipal;

/// Default freshness window: 10 minutes.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(10 * 60);

/// Negative-cache TTL for failed authorizations: 30 seconds.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AuthorizationCacheConfig {
    pub freshness: Duration,
    pub negative_ttl: Duration,
    /// Base URL of the external REST authorizer, e.g.
    /// `https://auth.example.com/v1/authorize`.
    pub rest_endpoint: String,
}

impl Default for AuthorizationCacheConfig {
    fn default() -> Self {
        Self {
            freshness: DEFAULT_FRESHNESS,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            rest_endpoint: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    principal: Option<SecurityPrincipal>,
    last_refresh: std::time::Instant,
}

/// Contract for the authorization cache. A trait object so the broker and
/// bridge can share one production implementation while tests substitute a
/// fake.
#[async_trait]
pub trait AuthorizationCache: Send + Sync {
    fn token_type(&self) -> &str;

    /// Returns the cached principal if present *and* not older than the
    /// freshness interval.
    async fn try_get_authorized_principal(&self, token: &str) -> Option<SecurityPrincipal>;

    /// Contacts the external REST service and installs a fresh principal,
    /// single-flighted per token. Fails with `ServerError::AuthorizationFailed`
    /// on authorization failure.
    async fn update(&self, token: &str) -> Result<SecurityPrincipal, ServerError>;

    /// Like `update`, but returns `None` instead of propagating the error.
    async fn try_update(&self, token: &str) -> Option<SecurityPrincipal> {
        self.update(token).await.ok()
    }

    /// Removes the entry immediately.
    async fn evict(&self, token: &str);
}

/// Production implementation backed by `reqwest` (already the teacher's
/// HTTP client of choice — see its device-flow polling in the original
/// `auth.rs`).
pub struct RestAuthorizationCache {
    config: AuthorizationCacheConfig,
    http: reqwest::Client,
    entries: RwLock<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl RestAuthorizationCache {
    pub fn new(config: AuthorizationCacheConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_principal(&self, token: &str) -> Result<SecurityPrincipal, ServerError> {
        let response = self
            .http
            .post(&self.config.rest_endpoint)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| ServerError::AuthorizationFailed(format!("authorizer request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ServerError::AuthorizationFailed(format!(
                "authorizer returned status {}",
                response.status()
            )));
        }

        response
            .json::<SecurityPrincipal>()
            .await
            .map_err(|e| ServerError::AuthorizationFailed(format!("authorizer response malformed: {e}")))
    }

    /// Runs (or joins) the single in-flight refresh for `token`, caching
    /// both the positive and negative outcome.
    async fn refresh(&self, token: &str) -> Result<SecurityPrincipal, ServerError> {
        loop {
            let notify = {
                let mut in_flight = self.in_flight.lock().await;
                if let Some(existing) = in_flight.get(token) {
                    Some(existing.clone())
                } else {
                    in_flight.insert(token.to_string(), Arc::new(Notify::new()));
                    None
                }
            };

            if let Some(notify) = notify {
                // Someone else is already refreshing this token; wait for
                // them, then re-check the cache instead of re-issuing the
                // REST call ourselves.
                notify.notified().await;
                if let Some(principal) = self.try_get_authorized_principal(token).await {
                    return Ok(principal);
                }
                continue;
            }

            let result = self.fetch_principal(token).await;

            {
                let mut entries = self.entries.write().await;
                entries.insert(
                    token.to_string(),
                    CacheEntry {
                        principal: result.as_ref().ok().cloned(),
                        last_refresh: std::time::Instant::now(),
                    },
                );
            }

            let notify = {
                let mut in_flight = self.in_flight.lock().await;
                in_flight.remove(token)
            };
            if let Some(notify) = notify {
                notify.notify_waiters();
            }

            return result;
        }
    }
}

#[async_trait]
impl AuthorizationCache for RestAuthorizationCache {
    fn token_type(&self) -> &str {
        "bearer"
    }

    async fn try_get_authorized_principal(&self, token: &str) -> Option<SecurityPrincipal> {
        let entries = self.entries.read().await;
        let entry = entries.get(token)?;

        let ttl = if entry.principal.is_some() {
            self.config.freshness
        } else {
            self.config.negative_ttl
        };

        if entry.last_refresh.elapsed() > ttl {
            return None;
        }

        entry.principal.clone()
    }

    async fn update(&self, token: &str) -> Result<SecurityPrincipal, ServerError> {
        if let Some(principal) = self.try_get_authorized_principal(token).await {
            return Ok(principal);
        }
        self.refresh(token).await
    }

    async fn evict(&self, token: &str) {
        self.entries.write().await.remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn principal(sid: &str) -> SecurityPrincipal {
        SecurityPrincipal {
            sid: sid.to_string(),
            given_name: None,
            family_name: None,
            email: None,
            type_id: None,
        }
    }

    #[tokio::test]
    async fn evict_twice_is_a_no_op() {
        let cache = RestAuthorizationCache::new(AuthorizationCacheConfig::default());
        cache.evict("missing-token").await;
        cache.evict("missing-token").await;
        assert!(cache.try_get_authorized_principal("missing-token").await.is_none());
    }

    #[tokio::test]
    async fn fresh_entry_is_returned_without_a_rest_call() {
        let server = MockServer::start().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        Mock::given(method("POST"))
            .respond_with(move |_: &wiremock::Request| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_json(principal("alice"))
            })
            .mount(&server)
            .await;

        let cache = RestAuthorizationCache::new(AuthorizationCacheConfig {
            rest_endpoint: format!("{}/authorize", server.uri()),
            ..Default::default()
        });

        let first = cache.update("tok").await.unwrap();
        let second = cache.update("tok").await.unwrap();

        assert_eq!(first.sid, "alice");
        assert_eq!(second.sid, "alice");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_refresh_for_same_token_is_single_flighted() {
        let server = MockServer::start().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        Mock::given(method("POST"))
            .respond_with(move |_: &wiremock::Request| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(50))
                    .set_body_json(principal("bob"))
            })
            .mount(&server)
            .await;

        let cache = Arc::new(RestAuthorizationCache::new(AuthorizationCacheConfig {
            rest_endpoint: format!("{}/authorize", server.uri()),
            ..Default::default()
        }));

        let a = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.update("shared-token").await })
        };
        let b = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.update("shared-token").await })
        };

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap().unwrap().sid, "bob");
        assert_eq!(b.unwrap().unwrap().sid, "bob");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
