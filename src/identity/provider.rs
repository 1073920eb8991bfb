//!
//! Identity provider seam
//! ----------------------
//! Everything above this trait treats authentication as an external service:
//! credentials go in, sessions and a stream of auth-state events come out.
//! Two implementations exist, the in-process `LocalIdentityProvider` for
//! development and tests, and the `HostedIdentityProvider` that fronts the
//! hosted auth backend over HTTP. Events are delivered per client context
//! over a broadcast channel so each browser session observes only its own
//! lifecycle.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::session::AuthSession;
use crate::profile::User;

/// Canonical auth-state events, mirroring the hosted provider's event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    InitialSession,
    /// Forward-compatibility arm for event names this build does not know.
    Unknown,
}

/// One auth-state change: the event plus the session that now applies
/// (None once signed out).
#[derive(Debug, Clone)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<AuthSession>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Wrong email or password. Never a session-lifecycle condition.
    #[error("invalid login credentials")]
    InvalidCredentials,
    /// The session or refresh token is no longer usable. The message is the
    /// provider's own wording so expiry classification sees it verbatim.
    #[error("{0}")]
    SessionInvalid(String),
    #[error("identity provider unreachable: {0}")]
    Unreachable(String),
    #[error("identity provider rejected the request: {0}")]
    Rejected(String),
}

/// The authentication backend as seen by the rest of the server.
///
/// `client_id` in these methods is the server-side client-context id (the
/// value of the session cookie), not a user id: one signed-in browser
/// session holds exactly one provider session at a time.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Password sign-in. Emits `SignedIn` on the client's event stream.
    async fn sign_in(
        &self,
        client_id: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, ProviderError>;

    /// Exchange a one-time authorization code from an external login flow.
    /// Emits `SignedIn` on success.
    async fn exchange_code(
        &self,
        client_id: &str,
        code: &str,
    ) -> Result<AuthSession, ProviderError>;

    /// Current session for a client context, restoring from the token cache
    /// when memory has none. `Ok(None)` means signed out; an error whose text
    /// classifies as expiry means the cached credential is dead.
    async fn get_session(&self, client_id: &str) -> Result<Option<AuthSession>, ProviderError>;

    /// Rotate the client's token pair. Emits `TokenRefreshed` on success.
    async fn refresh(&self, client_id: &str) -> Result<AuthSession, ProviderError>;

    /// Validate an access token server-side. `Ok(None)` means the token is
    /// unknown or expired; errors are transport faults only.
    async fn get_user(&self, access_token: &str) -> Result<Option<User>, ProviderError>;

    /// Invalidate the client's session. Always emits `SignedOut`, and is safe
    /// to call for a client that is already signed out.
    async fn sign_out(&self, client_id: &str) -> Result<(), ProviderError>;

    /// Subscribe to the client's auth-state events. Must be called before the
    /// operation whose event the caller wants to observe.
    fn subscribe(&self, client_id: &str) -> broadcast::Receiver<AuthChange>;
}

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Per-client broadcast channels. Senders are created lazily on first
/// subscribe or emit and dropped when the provider forgets the client.
#[derive(Default)]
pub struct ClientChannels {
    senders: RwLock<HashMap<String, broadcast::Sender<AuthChange>>>,
}

impl ClientChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, client_id: &str) -> broadcast::Receiver<AuthChange> {
        let mut senders = self.senders.write();
        senders
            .entry(client_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send to the client's channel. A send with no live receivers is a
    /// no-op, as is emitting for a client nobody ever subscribed to.
    pub fn emit(&self, client_id: &str, change: AuthChange) {
        let sender = self.senders.read().get(client_id).cloned();
        if let Some(tx) = sender {
            let _ = tx.send(change);
        }
    }

    /// Drop the client's channel; receivers drain buffered events, then see
    /// the stream close.
    pub fn drop_client(&self, client_id: &str) {
        self.senders.write().remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_then_emit_delivers() {
        let channels = ClientChannels::new();
        let mut rx = channels.subscribe("c1");
        channels.emit(
            "c1",
            AuthChange {
                event: AuthEvent::SignedIn,
                session: None,
            },
        );
        let change = rx.recv().await.unwrap();
        assert_eq!(change.event, AuthEvent::SignedIn);
    }

    #[tokio::test]
    async fn channels_are_isolated_per_client() {
        let channels = ClientChannels::new();
        let mut rx_a = channels.subscribe("a");
        let _rx_b = channels.subscribe("b");
        channels.emit(
            "b",
            AuthChange {
                event: AuthEvent::SignedOut,
                session: None,
            },
        );
        // nothing may arrive on a's stream
        assert!(matches!(
            rx_a.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_noop() {
        let channels = ClientChannels::new();
        channels.emit(
            "ghost",
            AuthChange {
                event: AuthEvent::SignedOut,
                session: None,
            },
        );
    }

    #[tokio::test]
    async fn drop_client_closes_stream_after_drain() {
        let channels = ClientChannels::new();
        let mut rx = channels.subscribe("c1");
        channels.emit(
            "c1",
            AuthChange {
                event: AuthEvent::TokenRefreshed,
                session: None,
            },
        );
        channels.drop_client("c1");
        assert_eq!(rx.recv().await.unwrap().event, AuthEvent::TokenRefreshed);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn event_names_serialize_like_the_hosted_provider() {
        assert_eq!(
            serde_json::to_string(&AuthEvent::TokenRefreshed).unwrap(),
            "\"TOKEN_REFRESHED\""
        );
        assert_eq!(
            serde_json::to_string(&AuthEvent::SignedOut).unwrap(),
            "\"SIGNED_OUT\""
        );
    }
}
