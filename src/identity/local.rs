//!
//! Local identity provider
//! -----------------------
//! In-process authentication for development and tests: argon2-hashed
//! accounts, per-client sessions with refresh-token rotation and revocation,
//! and one-time authorization codes for exercising the external-login path.
//! State lives in memory; only the token pairs are persisted through the
//! token cache, so a restart invalidates every refresh token it ever issued.
//! Bookkeeping is swept on each mint, so abandoned sessions, stale codes,
//! and retired tokens do not accumulate.

use std::collections::HashMap;

use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use password_hash::{PasswordHash, SaltString};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::cache::TokenCache;
use super::provider::{AuthChange, AuthEvent, ClientChannels, IdentityProvider, ProviderError};
use super::session::{gen_token, AuthSession, REFRESH_GRACE_SECS};
use crate::profile::User;

/// Unexchanged authorization codes older than this are dropped.
const CODE_TTL_SECS: i64 = 10 * 60;

/// Upper bound on retired-token bookkeeping.
const REVOKED_MAX: usize = 4096;

fn hash_password(password: &str) -> Result<String, ProviderError> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| ProviderError::Rejected(e.to_string()))?;
    let salt =
        SaltString::encode_b64(&salt_bytes).map_err(|e| ProviderError::Rejected(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ProviderError::Rejected(e.to_string()))?
        .to_string();
    Ok(phc)
}

fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else {
        false
    }
}

#[derive(Debug, Clone)]
struct LocalAccount {
    id: String,
    email: String,
    password_hash: String,
}

#[derive(Debug, Clone)]
struct PendingCode {
    user_id: String,
    issued_at: DateTime<Utc>,
}

pub struct LocalIdentityProvider {
    /// Accounts keyed by lowercased email.
    users: RwLock<HashMap<String, LocalAccount>>,
    /// Live session per client context.
    sessions: RwLock<HashMap<String, AuthSession>>,
    /// Access token -> owning session, for request-time validation.
    access_index: RwLock<HashMap<String, AuthSession>>,
    /// Refresh token -> client context it was issued to.
    refresh_index: RwLock<HashMap<String, String>>,
    /// Refresh tokens retired by rotation or sign-out, keyed to the time
    /// they were retired.
    revoked: RwLock<HashMap<String, DateTime<Utc>>>,
    /// One-time authorization codes awaiting exchange.
    codes: RwLock<HashMap<String, PendingCode>>,
    channels: ClientChannels,
    cache: Option<TokenCache>,
    session_ttl_secs: u64,
}

impl LocalIdentityProvider {
    pub fn new(cache: Option<TokenCache>, session_ttl_secs: u64) -> Self {
        LocalIdentityProvider {
            users: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            access_index: RwLock::new(HashMap::new()),
            refresh_index: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashMap::new()),
            codes: RwLock::new(HashMap::new()),
            channels: ClientChannels::new(),
            cache,
            session_ttl_secs,
        }
    }

    /// Create an account. Fails if the email is already registered.
    pub fn register_user(&self, email: &str, password: &str) -> Result<User, ProviderError> {
        let key = email.trim().to_lowercase();
        if key.is_empty() {
            return Err(ProviderError::Rejected("email must not be empty".to_string()));
        }
        let phc = hash_password(password)?;
        let mut users = self.users.write();
        if users.contains_key(&key) {
            return Err(ProviderError::Rejected(format!(
                "user already registered: {email}"
            )));
        }
        let account = LocalAccount {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.trim().to_string(),
            password_hash: phc,
        };
        users.insert(key, account.clone());
        info!(target: "auth", user = %account.id, "registered local account");
        Ok(User {
            id: account.id,
            email: account.email,
        })
    }

    /// Change an account's email and push `UserUpdated` to every client
    /// context currently signed in as that user.
    pub fn update_user_email(&self, user_id: &str, new_email: &str) -> Result<User, ProviderError> {
        let mut users = self.users.write();
        let Some(old_key) = users
            .iter()
            .find(|(_, a)| a.id == user_id)
            .map(|(k, _)| k.clone())
        else {
            return Err(ProviderError::Rejected(format!(
                "no account with id {user_id}"
            )));
        };
        let new_key = new_email.trim().to_lowercase();
        if new_key != old_key && users.contains_key(&new_key) {
            return Err(ProviderError::Rejected(format!(
                "user already registered: {new_email}"
            )));
        }
        let Some(mut account) = users.remove(&old_key) else {
            return Err(ProviderError::Rejected(format!(
                "no account with id {user_id}"
            )));
        };
        account.email = new_email.trim().to_string();
        users.insert(new_key, account.clone());
        drop(users);

        let user = User {
            id: account.id,
            email: account.email,
        };

        // refresh the user projection on any live sessions for this account
        let affected: Vec<(String, AuthSession)> = {
            let mut sessions = self.sessions.write();
            let mut out = Vec::new();
            for (client_id, session) in sessions.iter_mut() {
                if session.user.id == user.id {
                    session.user = user.clone();
                    out.push((client_id.clone(), session.clone()));
                }
            }
            out
        };
        for (client_id, session) in &affected {
            self.access_index
                .write()
                .insert(session.access_token.clone(), session.clone());
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.save(client_id, session) {
                    warn!(target: "auth", "token cache write failed: {e}");
                }
            }
            self.channels.emit(
                client_id,
                AuthChange {
                    event: AuthEvent::UserUpdated,
                    session: Some(session.clone()),
                },
            );
        }
        info!(target: "auth", user = %user.id, sessions = affected.len(), "account email updated");
        Ok(user)
    }

    /// Mint a one-time authorization code for `user_id`, consumed by
    /// `exchange_code`. Stands in for the redirect leg of an external login.
    pub fn issue_code(&self, user_id: &str) -> String {
        let code = gen_token();
        self.codes.write().insert(
            code.clone(),
            PendingCode {
                user_id: user_id.to_string(),
                issued_at: Utc::now(),
            },
        );
        code
    }

    /// Drop an access token without touching the refresh token, as when a
    /// token reaches its TTL. The session stays refreshable.
    pub fn revoke_access_token(&self, access_token: &str) {
        self.access_index.write().remove(access_token);
    }

    fn find_account_by_id(&self, user_id: &str) -> Option<LocalAccount> {
        self.users
            .read()
            .values()
            .find(|a| a.id == user_id)
            .cloned()
    }

    fn mint_session(&self, client_id: &str, user: User) -> AuthSession {
        self.sweep_stale();
        let session = AuthSession {
            access_token: gen_token(),
            refresh_token: gen_token(),
            expires_at: Utc::now() + chrono::Duration::seconds(self.session_ttl_secs as i64),
            user,
        };
        self.sessions
            .write()
            .insert(client_id.to_string(), session.clone());
        self.access_index
            .write()
            .insert(session.access_token.clone(), session.clone());
        self.refresh_index
            .write()
            .insert(session.refresh_token.clone(), client_id.to_string());
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save(client_id, &session) {
                warn!(target: "auth", "token cache write failed: {e}");
            }
        }
        session
    }

    /// Drop one session's entries across the maps, returning the session.
    /// The revocation list is untouched: an unknown refresh token is already
    /// terminal.
    fn evict_session(&self, client_id: &str) -> Option<AuthSession> {
        let removed = self.sessions.write().remove(client_id)?;
        self.access_index.write().remove(&removed.access_token);
        self.refresh_index.write().remove(&removed.refresh_token);
        Some(removed)
    }

    /// Remove the client's session and retire its tokens. No event.
    fn drop_client_session(&self, client_id: &str) {
        if let Some(session) = self.evict_session(client_id) {
            self.revoked
                .write()
                .insert(session.refresh_token, Utc::now());
        }
    }

    /// Guardrails run before each mint: evict sessions abandoned past the
    /// refresh grace window, drop stale codes, and keep the revocation list
    /// pruned and bounded.
    fn sweep_stale(&self) {
        let now = Utc::now();
        let abandoned: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, session)| session.is_abandoned())
            .map(|(client_id, _)| client_id.clone())
            .collect();
        for client_id in abandoned {
            self.evict_session(&client_id);
        }
        self.codes
            .write()
            .retain(|_, code| now - code.issued_at <= chrono::Duration::seconds(CODE_TTL_SECS));
        let mut revoked = self.revoked.write();
        let cutoff = now - chrono::Duration::seconds(REFRESH_GRACE_SECS);
        revoked.retain(|_, retired_at| *retired_at >= cutoff);
        if revoked.len() >= REVOKED_MAX {
            // over the cap: evict a small batch, map order is as good as any
            let batch: Vec<String> = revoked.keys().take(REVOKED_MAX / 20 + 1).cloned().collect();
            for token in batch {
                revoked.remove(&token);
            }
        }
    }

    #[cfg(test)]
    fn age_session(&self, client_id: &str, expired_for_secs: i64) {
        if let Some(session) = self.sessions.write().get_mut(client_id) {
            session.expires_at = Utc::now() - chrono::Duration::seconds(expired_for_secs);
        }
    }

    fn establish(&self, client_id: &str, user: User) -> AuthSession {
        self.drop_client_session(client_id);
        let session = self.mint_session(client_id, user);
        self.channels.emit(
            client_id,
            AuthChange {
                event: AuthEvent::SignedIn,
                session: Some(session.clone()),
            },
        );
        session
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn sign_in(
        &self,
        client_id: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, ProviderError> {
        let account = self.users.read().get(&email.trim().to_lowercase()).cloned();
        let Some(account) = account else {
            return Err(ProviderError::InvalidCredentials);
        };
        if !verify_password(&account.password_hash, password) {
            return Err(ProviderError::InvalidCredentials);
        }
        let user = User {
            id: account.id,
            email: account.email,
        };
        let session = self.establish(client_id, user);
        info!(target: "auth", user = %session.user.id, "signed in");
        Ok(session)
    }

    async fn exchange_code(
        &self,
        client_id: &str,
        code: &str,
    ) -> Result<AuthSession, ProviderError> {
        let pending = self.codes.write().remove(code);
        let Some(pending) = pending else {
            return Err(ProviderError::Rejected(
                "authorization code invalid or already used".to_string(),
            ));
        };
        if Utc::now() - pending.issued_at > chrono::Duration::seconds(CODE_TTL_SECS) {
            return Err(ProviderError::Rejected(
                "authorization code expired".to_string(),
            ));
        }
        let Some(account) = self.find_account_by_id(&pending.user_id) else {
            return Err(ProviderError::Rejected(format!(
                "no account with id {}",
                pending.user_id
            )));
        };
        let user = User {
            id: account.id,
            email: account.email,
        };
        let session = self.establish(client_id, user);
        info!(target: "auth", user = %session.user.id, "signed in via authorization code");
        Ok(session)
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<AuthSession>, ProviderError> {
        // bind first so the read guard drops before evict_session takes the
        // write lock (the if-let scrutinee would hold it through the body)
        let current = self.sessions.read().get(client_id).cloned();
        if let Some(session) = current {
            if !session.is_abandoned() {
                return Ok(Some(session));
            }
            // abandoned past the grace window: evict on access
            self.evict_session(client_id);
        }
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let Some(cached) = cache.load(client_id) else {
            return Ok(None);
        };
        // Only a refresh token this process issued and has not retired can
        // restore a session from disk.
        let known = self
            .refresh_index
            .read()
            .get(&cached.refresh_token)
            .map(|owner| owner == client_id)
            .unwrap_or(false);
        if !known || self.revoked.read().contains_key(&cached.refresh_token) {
            return Err(ProviderError::SessionInvalid(
                "Invalid Refresh Token: Refresh Token Not Found".to_string(),
            ));
        }
        self.sessions
            .write()
            .insert(client_id.to_string(), cached.clone());
        self.access_index
            .write()
            .insert(cached.access_token.clone(), cached.clone());
        Ok(Some(cached))
    }

    async fn refresh(&self, client_id: &str) -> Result<AuthSession, ProviderError> {
        let current = self.sessions.read().get(client_id).cloned();
        let Some(current) = current else {
            return Err(ProviderError::SessionInvalid(
                "Invalid Refresh Token: Refresh Token Not Found".to_string(),
            ));
        };
        if current.is_abandoned() {
            self.evict_session(client_id);
            return Err(ProviderError::SessionInvalid(
                "Invalid Refresh Token: Refresh Token Not Found".to_string(),
            ));
        }
        if self.revoked.read().contains_key(&current.refresh_token) {
            return Err(ProviderError::SessionInvalid(
                "Invalid Refresh Token: Already Used".to_string(),
            ));
        }
        // rotate: retire the old pair, mint a replacement
        self.access_index.write().remove(&current.access_token);
        self.refresh_index.write().remove(&current.refresh_token);
        self.revoked
            .write()
            .insert(current.refresh_token.clone(), Utc::now());
        let session = self.mint_session(client_id, current.user.clone());
        self.channels.emit(
            client_id,
            AuthChange {
                event: AuthEvent::TokenRefreshed,
                session: Some(session.clone()),
            },
        );
        debug!(target: "auth", user = %session.user.id, "token pair rotated");
        Ok(session)
    }

    async fn get_user(&self, access_token: &str) -> Result<Option<User>, ProviderError> {
        let entry = self.access_index.read().get(access_token).cloned();
        match entry {
            Some(session) if !session.is_expired() => Ok(Some(session.user)),
            _ => Ok(None),
        }
    }

    async fn sign_out(&self, client_id: &str) -> Result<(), ProviderError> {
        self.drop_client_session(client_id);
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
