//!
//! Render-time error recovery
//! --------------------------
//! Failures that surface while rendering a signed-in page land here instead
//! of leaking stack traces or stranding the visitor. The boundary decides
//! between exactly two outcomes: the session itself is dead (sign in
//! again, after a full local teardown) or something else broke (offer a
//! retry). Denials never reach this path; they are redirects, not errors.

use parking_lot::Mutex;
use tracing::{error, info};

use crate::error::AppError;
use crate::identity::{is_session_expiry_error, SessionAdapter};

/// What the visitor should be offered after a caught failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The session is gone; local state was torn down as a side effect.
    SignInAgain,
    /// Transient fault; state is intact and a retry may succeed.
    Retry,
}

/// Per-client boundary. Remembers the last caught failure until an explicit
/// reset, mirroring how a retry control re-arms an error screen.
#[derive(Default)]
pub struct RecoveryBoundary {
    last_error: Mutex<Option<AppError>>,
}

impl RecoveryBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a caught failure. A session-expiry failure performs the full
    /// local sign-out before returning, so the caller renders the
    /// sign-in-again screen against an already-clean store.
    pub async fn catch(&self, adapter: &SessionAdapter, err: &AppError) -> RecoveryAction {
        *self.last_error.lock() = Some(err.clone());
        if is_session_expiry_error(err.message()) {
            info!(target: "auth", "caught expired-session failure, signing out: {}", err.message());
            adapter.sign_out().await;
            RecoveryAction::SignInAgain
        } else {
            error!(target: "auth", "caught render failure: {}", err.message());
            RecoveryAction::Retry
        }
    }

    /// Re-arm the boundary; the next render starts clean.
    pub fn reset(&self) {
        *self.last_error.lock() = None;
    }

    pub fn last_error(&self) -> Option<AppError> {
        self.last_error.lock().clone()
    }
}
