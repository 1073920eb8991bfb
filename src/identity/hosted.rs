//!
//! Hosted identity provider
//! ------------------------
//! Fronts the hosted auth backend over HTTP. Token grants all go through one
//! endpoint keyed by `grant_type`; the user endpoint validates access tokens
//! server-side. The backend has no event stream we can consume from here, so
//! lifecycle events are synthesized from the outcomes of our own calls, which
//! is sufficient because every session mutation for a client context flows
//! through this process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::cache::TokenCache;
use super::provider::{AuthChange, AuthEvent, ClientChannels, IdentityProvider, ProviderError};
use super::session::AuthSession;
use crate::profile::User;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    user: WireUser,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl WireUser {
    fn into_user(self) -> User {
        User {
            id: self.id,
            email: self.email.unwrap_or_default(),
        }
    }
}

/// Pull the human-readable message out of a backend error body. The backend
/// is inconsistent about the field name across endpoints.
fn error_text(payload: &serde_json::Value) -> String {
    for key in ["error_description", "msg", "message", "error"] {
        if let Some(text) = payload.get(key).and_then(|v| v.as_str()) {
            return text.to_string();
        }
    }
    "request failed".to_string()
}

pub struct HostedIdentityProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    sessions: RwLock<HashMap<String, AuthSession>>,
    channels: ClientChannels,
    cache: Option<TokenCache>,
}

impl HostedIdentityProvider {
    pub fn new(
        base_url: &str,
        api_key: &str,
        cache: Option<TokenCache>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;
        Ok(HostedIdentityProvider {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            sessions: RwLock::new(HashMap::new()),
            channels: ClientChannels::new(),
            cache,
        })
    }

    async fn token_request(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<AuthSession, ProviderError> {
        let url = format!("{}/auth/v1/token?grant_type={grant_type}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;
        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Rejected(format!("unreadable token response: {e}")))?;
        if !status.is_success() {
            let msg = error_text(&payload);
            return Err(match (status.as_u16(), grant_type) {
                (400 | 401, "password") => ProviderError::InvalidCredentials,
                (400 | 401 | 403 | 404, _) => ProviderError::SessionInvalid(msg),
                _ => ProviderError::Rejected(format!("{status}: {msg}")),
            });
        }
        let token: TokenResponse = serde_json::from_value(payload)
            .map_err(|e| ProviderError::Rejected(format!("unexpected token payload: {e}")))?;
        Ok(AuthSession {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in.max(0)),
            user: token.user.into_user(),
        })
    }

    fn store_session(&self, client_id: &str, session: &AuthSession) {
        {
            let mut sessions = self.sessions.write();
            // entries abandoned past the refresh grace window only waste
            // memory; the backend decides whether their tokens still work
            sessions.retain(|_, s| !s.is_abandoned());
            sessions.insert(client_id.to_string(), session.clone());
        }
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save(client_id, session) {
                warn!(target: "auth", "token cache write failed: {e}");
            }
        }
    }

    fn establish(&self, client_id: &str, session: AuthSession, event: AuthEvent) -> AuthSession {
        self.store_session(client_id, &session);
        self.channels.emit(
            client_id,
            AuthChange {
                event,
                session: Some(session.clone()),
            },
        );
        session
    }
}

#[async_trait]
impl IdentityProvider for HostedIdentityProvider {
    async fn sign_in(
        &self,
        client_id: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, ProviderError> {
        let session = self
            .token_request("password", json!({ "email": email, "password": password }))
            .await?;
        info!(target: "auth", user = %session.user.id, "signed in via hosted backend");
        Ok(self.establish(client_id, session, AuthEvent::SignedIn))
    }

    async fn exchange_code(
        &self,
        client_id: &str,
        code: &str,
    ) -> Result<AuthSession, ProviderError> {
        let session = self
            .token_request("authorization_code", json!({ "auth_code": code }))
            .await?;
        info!(target: "auth", user = %session.user.id, "signed in via authorization code");
        Ok(self.establish(client_id, session, AuthEvent::SignedIn))
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<AuthSession>, ProviderError> {
        if let Some(session) = self.sessions.read().get(client_id).cloned() {
            return Ok(Some(session));
        }
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let Some(cached) = cache.load(client_id) else {
            return Ok(None);
        };
        // Cached tokens are only trusted once the backend exchanges them.
        debug!(target: "auth", "restoring session from token cache");
        let session = self
            .token_request(
                "refresh_token",
                json!({ "refresh_token": cached.refresh_token }),
            )
            .await?;
        self.store_session(client_id, &session);
        Ok(Some(session))
    }

    async fn refresh(&self, client_id: &str) -> Result<AuthSession, ProviderError> {
        let current = self.sessions.read().get(client_id).cloned();
        let refresh_token = match current {
            Some(session) => session.refresh_token,
            None => match self.cache.as_ref().and_then(|c| c.load(client_id)) {
                Some(cached) => cached.refresh_token,
                None => {
                    return Err(ProviderError::SessionInvalid(
                        "Invalid Refresh Token: Refresh Token Not Found".to_string(),
                    ))
                }
            },
        };
        let session = self
            .token_request("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        debug!(target: "auth", user = %session.user.id, "token pair rotated via hosted backend");
        Ok(self.establish(client_id, session, AuthEvent::TokenRefreshed))
    }

    async fn get_user(&self, access_token: &str) -> Result<Option<User>, ProviderError> {
        let url = format!("{}/auth/v1/user", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;
        match resp.status().as_u16() {
            200 => {
                let wire: WireUser = resp
                    .json()
                    .await
                    .map_err(|e| ProviderError::Rejected(format!("unexpected user payload: {e}")))?;
                Ok(Some(wire.into_user()))
            }
            401 | 403 => Ok(None),
            status => Err(ProviderError::Rejected(format!(
                "user lookup failed with status {status}"
            ))),
        }
    }

    async fn sign_out(&self, client_id: &str) -> Result<(), ProviderError> {
        let session = self.sessions.write().remove(client_id);
        // Local clearing never waits on the backend: revocation is attempted,
        // failures are logged and swallowed.
        if let Some(session) = &session {
            let url = format!("{}/auth/v1/logout", self.base_url);
            let outcome = self
                .client
                .post(&url)
                .header("apikey", &self.api_key)
                .bearer_auth(&session.access_token)
                .send()
                .await;
            if let Err(e) = outcome {
                warn!(target: "auth", "hosted sign-out call failed: {e}");
            }
        }
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.clear(client_id) {
                warn!(target: "auth", "token cache clear failed: {e}");
            }
        }
        self.channels.emit(
            client_id,
            AuthChange {
                event: AuthEvent::SignedOut,
                session: None,
            },
        );
        // close the client's stream; subscribers drain the event first
        self.channels.drop_client(client_id);
        Ok(())
    }

    fn subscribe(&self, client_id: &str) -> broadcast::Receiver<AuthChange> {
        self.channels.subscribe(client_id)
    }
}
