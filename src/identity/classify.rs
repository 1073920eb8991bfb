//!
//! Session-expiry classification
//! -----------------------------
//! Recovery paths must distinguish "your long-lived credential is gone, sign
//! in again" from every other failure. The provider does not tag its errors,
//! so classification works off the message text. This module is the only
//! place that decision is made; callers never re-derive it.

/// Vocabulary of provider failures that mean the session or refresh token is
/// no longer usable. Matched case-insensitively as substrings. Deliberately
/// narrow: credential mistakes ("invalid login credentials") and transport
/// faults must not match.
pub const SESSION_EXPIRY_KEYWORDS: &[&str] = &[
    "refresh token",
    "refresh_token",
    "invalid token",
    "token expired",
    "token has expired",
    "token is expired",
    "jwt expired",
    "jwt is expired",
    "session expired",
    "session_expired",
    "session has expired",
    "session not found",
    "session_not_found",
    "session missing",
    "authorization expired",
];

/// True when `message` indicates the session/refresh credential itself is
/// dead. Callers treat a hit as an expected lifecycle event (silent local
/// sign-out), never as an application error.
pub fn is_session_expiry_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    SESSION_EXPIRY_KEYWORDS.iter().any(|k| lower.contains(k))
}
