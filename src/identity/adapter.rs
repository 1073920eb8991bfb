//!
//! Session adapter
//! ---------------
//! Binds one client context together: subscribes to the provider's event
//! stream for that client and translates each event into session-store
//! updates. Events are applied strictly in arrival order by a single spawned
//! task; profile fetches triggered by an event run as their own tasks and
//! settle through the store's generation guard.
//!
//! Event handling rules:
//!   SignedIn        session+user set, error cleared, profile fetched
//!   SignedOut       store reset to the signed-out baseline
//!   TokenRefreshed  session+user set, error cleared, no profile fetch
//!   UserUpdated     session+user set, profile fetched, error untouched
//!   InitialSession  session+user set, profile fetched when a user exists,
//!                   otherwise profile cleared and loading settled
//!   Unknown         treated like InitialSession

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cache::TokenCache;
use super::classify::is_session_expiry_error;
use super::provider::{AuthChange, AuthEvent, IdentityProvider, ProviderError};
use super::session::AuthSession;
use super::store::AuthStore;
use crate::error::AppError;
use crate::profile::ProfileStore;

pub struct SessionAdapter {
    client_id: String,
    provider: Arc<dyn IdentityProvider>,
    profiles: Arc<dyn ProfileStore>,
    store: Arc<AuthStore>,
    cache: Option<TokenCache>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionAdapter {
    pub fn new(
        client_id: &str,
        provider: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileStore>,
        store: Arc<AuthStore>,
        cache: Option<TokenCache>,
    ) -> Self {
        SessionAdapter {
            client_id: client_id.to_string(),
            provider,
            profiles,
            store,
            cache,
            event_task: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn store(&self) -> &Arc<AuthStore> {
        &self.store
    }

    /// Subscribe to the provider's event stream and start applying events.
    /// Must be called before the operation whose events should be observed.
    pub fn start(self: &Arc<Self>) {
        let mut rx = self.provider.subscribe(&self.client_id);
        let adapter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => adapter.apply_change(change),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(target: "auth", missed, "auth event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        let previous = self.event_task.lock().replace(handle);
        if let Some(old) = previous {
            old.abort();
        }
    }

    /// Resolve the persisted session for this client, if any. An error that
    /// classifies as session expiry is an expected lifecycle outcome: the
    /// local state is torn down silently and no error is surfaced.
    pub async fn initial_session(&self) {
        match self.provider.get_session(&self.client_id).await {
            Ok(session) => {
                self.apply_change(AuthChange {
                    event: AuthEvent::InitialSession,
                    session,
                });
            }
            Err(err) => {
                let msg = err.to_string();
                if is_session_expiry_error(&msg) {
                    info!(target: "auth", "stale persisted session, signing out locally: {msg}");
                    self.force_sign_out().await;
                } else {
                    error!(target: "auth", "initial session resolution failed: {msg}");
                    self.store
                        .settle_error(AppError::provider("initial_session", msg));
                }
            }
        }
    }

    /// Apply one auth-state change to the store. Serial per client: only the
    /// event task and the initial-session path call this.
    pub(crate) fn apply_change(&self, change: AuthChange) {
        let user = change.session.as_ref().map(|s| s.user.clone());
        debug!(
            target: "auth",
            event = ?change.event,
            user = user.as_ref().map(|u| u.id.as_str()).unwrap_or("-"),
            "auth state change"
        );
        match change.event {
            AuthEvent::SignedOut => {
                self.store.reset();
            }
            AuthEvent::SignedIn => {
                self.store.set_session(change.session);
                self.store.set_user(user.clone());
                self.store.clear_error();
                match user {
                    Some(u) => self.spawn_profile_fetch(u.id),
                    None => self.store.settle_no_profile(),
                }
            }
            AuthEvent::TokenRefreshed => {
                self.store.set_session(change.session);
                self.store.set_user(user);
                self.store.clear_error();
            }
            AuthEvent::UserUpdated => {
                self.store.set_session(change.session);
                self.store.set_user(user.clone());
                if let Some(u) = user {
                    self.spawn_profile_fetch(u.id);
                }
            }
            AuthEvent::InitialSession | AuthEvent::Unknown => {
                self.store.set_session(change.session);
                self.store.set_user(user.clone());
                match user {
                    Some(u) => self.spawn_profile_fetch(u.id),
                    None => self.store.settle_no_profile(),
                }
            }
        }
    }

    /// The generation is taken here, in event order, so a later reset always
    /// supersedes this fetch even if its task has not run yet.
    fn spawn_profile_fetch(&self, user_id: String) {
        let fetch_gen = self.store.begin_fetch();
        let store = Arc::clone(&self.store);
        let profiles = Arc::clone(&self.profiles);
        tokio::spawn(async move {
            store.resolve_fetch(fetch_gen, profiles.as_ref(), &user_id).await;
        });
    }

    /// Rotate this client's token pair. A rejection that classifies as
    /// expiry forces a full sign-out, provider included, before the error is
    /// returned: every copy of the dead pair is retired, and callers observe
    /// a signed-out store rather than a half-dead session.
    pub async fn refresh(&self) -> Result<AuthSession, ProviderError> {
        match self.provider.refresh(&self.client_id).await {
            Ok(session) => Ok(session),
            Err(err) => {
                if is_session_expiry_error(&err.to_string()) {
                    info!(target: "auth", "refresh rejected, signing out: {err}");
                    self.force_sign_out().await;
                }
                Err(err)
            }
        }
    }

    /// Sign out: provider first, then unconditional local teardown. Provider
    /// failures are logged and do not keep the local session alive. Safe to
    /// call repeatedly or concurrently.
    pub async fn sign_out(&self) {
        if let Err(err) = self.provider.sign_out(&self.client_id).await {
            warn!(target: "auth", "provider sign-out failed, clearing locally anyway: {err}");
        }
        self.teardown_local();
    }

    async fn force_sign_out(&self) {
        self.sign_out().await;
    }

    fn teardown_local(&self) {
        self.store.reset();
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.clear(&self.client_id) {
                warn!(target: "auth", "token cache clear failed: {err}");
            }
        }
    }

    /// Stop applying events and supersede in-flight fetches. The store keeps
    /// its last snapshot; the provider session is untouched.
    pub fn shutdown(&self) {
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        self.store.invalidate_fetches();
    }
}

impl Drop for SessionAdapter {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
    }
}
