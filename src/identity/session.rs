use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::User;

/// How long past its access expiry a session is still treated as
/// refreshable. Providers evict entries abandoned past this window.
pub(crate) const REFRESH_GRACE_SECS: i64 = 24 * 60 * 60;

/// A live credential pair bound to one authenticated user.
///
/// The access token is short-lived and presented on requests; the refresh
/// token outlives it and is only ever exchanged with the identity provider
/// for a replacement pair. `expires_at` applies to the access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

impl AuthSession {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// True once the access token has been expired for longer than the
    /// refresh grace window.
    pub(crate) fn is_abandoned(&self) -> bool {
        Utc::now() - self.expires_at > chrono::Duration::seconds(REFRESH_GRACE_SECS)
    }

    /// Seconds until the access token expires, clamped at zero.
    pub fn expires_in_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// 256-bit random token, URL-safe base64 without padding.
pub fn gen_token() -> String {
    let mut buf = [0u8; 32];
    let _ = getrandom::getrandom(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_expiring_in(secs: i64) -> AuthSession {
        AuthSession {
            access_token: gen_token(),
            refresh_token: gen_token(),
            expires_at: Utc::now() + chrono::Duration::seconds(secs),
            user: User {
                id: "u-1".to_string(),
                email: "donor@example.org".to_string(),
            },
        }
    }

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let a = gen_token();
        let b = gen_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn expiry_check() {
        assert!(!session_expiring_in(60).is_expired());
        assert!(session_expiring_in(-1).is_expired());
        assert_eq!(session_expiring_in(-10).expires_in_secs(), 0);
    }

    #[test]
    fn abandonment_needs_the_full_grace_window() {
        assert!(!session_expiring_in(-60).is_abandoned());
        assert!(session_expiring_in(-(REFRESH_GRACE_SECS + 60)).is_abandoned());
    }

    #[test]
    fn session_round_trips_through_json() {
        let s = session_expiring_in(3600);
        let json = serde_json::to_string(&s).unwrap();
        let back: AuthSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
