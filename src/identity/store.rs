//!
//! Session store
//! -------------
//! The single observable snapshot of auth state for one client context:
//! user, profile, session, a loading flag for the in-flight profile fetch,
//! and the last surfaced error. Consumers subscribe through a watch channel
//! and re-render from snapshots; nothing here is request-scoped.
//!
//! Profile fetches are guarded by a generation counter. Every state
//! transition that supersedes an in-flight fetch bumps the generation, and a
//! fetch only commits if its generation is still current when it settles, so
//! a slow fetch can never overwrite the outcome of a later auth event.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::{debug, warn};

use super::session::AuthSession;
use crate::error::AppError;
use crate::profile::{Profile, ProfileStore, User};

/// One observable snapshot of a client's auth state.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub user: Option<User>,
    pub profile: Option<Profile>,
    pub session: Option<AuthSession>,
    pub loading: bool,
    pub error: Option<AppError>,
}

pub struct AuthStore {
    state: watch::Sender<AuthState>,
    generation: AtomicU64,
}

impl AuthStore {
    /// A fresh store reports `loading` until the initial session resolves,
    /// so consumers never mistake "not checked yet" for "signed out".
    pub fn new() -> Self {
        let initial = AuthState {
            loading: true,
            ..AuthState::default()
        };
        AuthStore {
            state: watch::channel(initial).0,
            generation: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn set_session(&self, session: Option<AuthSession>) {
        self.state.send_modify(|s| s.session = session);
    }

    pub fn set_user(&self, user: Option<User>) {
        self.state.send_modify(|s| s.user = user);
    }

    pub fn set_profile(&self, profile: Option<Profile>) {
        self.state.send_modify(|s| s.profile = profile);
    }

    pub fn set_error(&self, error: AppError) {
        self.state.send_modify(|s| s.error = Some(error));
    }

    /// Clear only the error channel; every other field is untouched.
    pub fn clear_error(&self) {
        self.state.send_modify(|s| s.error = None);
    }

    /// Close the loading cycle for an event that carries no user: any
    /// in-flight fetch is superseded, the profile is cleared.
    pub fn settle_no_profile(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_modify(|s| {
            s.profile = None;
            s.loading = false;
        });
    }

    /// Close the loading cycle with a surfaced error, leaving session and
    /// user untouched.
    pub fn settle_error(&self, error: AppError) {
        self.state.send_modify(|s| {
            s.loading = false;
            s.error = Some(error);
        });
    }

    /// Supersede any in-flight profile fetch without changing state. Used
    /// when a context is shut down mid-fetch.
    pub fn invalidate_fetches(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Open a fetch cycle: supersede any older fetch and raise `loading`.
    /// Returns the generation the matching [`AuthStore::resolve_fetch`] must
    /// present to commit.
    pub fn begin_fetch(&self) -> u64 {
        let fetch_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_modify(|s| s.loading = true);
        fetch_gen
    }

    /// Resolve the profile for `user_id` and commit the outcome unless a
    /// later event superseded this fetch. On failure the profile is cleared
    /// and the error surfaced. Loading never stays set after this settles.
    pub async fn fetch_profile(&self, resolver: &dyn ProfileStore, user_id: &str) {
        let fetch_gen = self.begin_fetch();
        self.resolve_fetch(fetch_gen, resolver, user_id).await;
    }

    /// Lookup half of a fetch cycle opened with [`AuthStore::begin_fetch`],
    /// split out so the generation can be taken in event order while the
    /// lookup itself runs on another task.
    pub async fn resolve_fetch(
        &self,
        fetch_gen: u64,
        resolver: &dyn ProfileStore,
        user_id: &str,
    ) {
        let outcome = resolver.fetch_profile(user_id).await;
        let mut committed = false;
        self.state.send_modify(|s| {
            // the check runs under the channel lock so a concurrent reset
            // cannot interleave between test and commit
            if self.generation.load(Ordering::SeqCst) != fetch_gen {
                return;
            }
            committed = true;
            match &outcome {
                Ok(profile) => {
                    s.profile = profile.clone();
                    s.loading = false;
                }
                Err(err) => {
                    s.profile = None;
                    s.loading = false;
                    s.error = Some(AppError::profile(
                        "profile_fetch",
                        format!("profile lookup failed: {err}"),
                    ));
                }
            }
        });
        if !committed {
            debug!(target: "auth", user = user_id, "discarded stale profile fetch");
        } else if let Err(err) = &outcome {
            warn!(target: "auth", user = user_id, "profile lookup failed: {err}");
        }
    }

    /// Return to the signed-out baseline: everything cleared, nothing
    /// loading, no error. Safe to call any number of times.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_modify(|s| {
            s.user = None;
            s.profile = None;
            s.session = None;
            s.loading = false;
            s.error = None;
        });
    }
}

impl Default for AuthStore {
    fn default() -> Self {
        Self::new()
    }
}
