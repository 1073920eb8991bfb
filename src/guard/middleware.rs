//!
//! Route-guard middleware
//! ----------------------
//! The edge tier of the guard: every request is classified against the
//! route table before any handler runs. Public paths pass straight through.
//! Protected paths must present a credential the identity provider will
//! vouch for right now: a bearer token for API routes, the session cookie
//! and its client context for page routes. Role requirements are checked
//! against a fresh profile lookup, never against cached client state.
//!
//! Denials follow the surface contract: pages redirect (to the entry page
//! with a return path when unauthenticated, bare to `/` when forbidden),
//! APIs answer 401/403 with the standard error body.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::identity::ProviderError;
use crate::policy;
use crate::profile::{Profile, User};
use crate::server::AppState;

use super::routes::{RouteClass, RouteKind};

pub const SESSION_COOKIE: &str = "almsgate_sid";

/// The authenticated identity attached to a request that passed the guard.
/// `profile` is populated only when the route demanded a role check.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub profile: Option<Profile>,
}

pub fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name {
                return Some(v[1..].to_string());
            }
        }
    }
    None
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

pub async fn route_guard(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let (kind, required) = match state.routes.classify(&path) {
        RouteClass::Public => return next.run(req).await,
        RouteClass::Protected { kind, required } => (kind, required),
    };

    let user = match resolve_request_user(&state, kind, req.headers()).await {
        Ok(user) => user,
        Err(err) => {
            error!(target: "auth", %path, "credential validation failed: {err}");
            None
        }
    };
    let Some(user) = user else {
        info!(target: "auth", %path, kind = ?kind, "denied: no valid credential");
        return deny_unauthenticated(kind, &path);
    };

    let mut profile = None;
    if !required.is_empty() {
        profile = match state.profiles.fetch_profile(&user.id).await {
            Ok(found) => found,
            Err(err) => {
                warn!(target: "auth", user = %user.id, "role lookup failed, treating as no roles: {err}");
                None
            }
        };
        if !policy::has_any_role(profile.as_ref(), &required) {
            info!(target: "auth", user = %user.id, %path, "denied: insufficient role");
            return deny_forbidden(kind);
        }
    }

    debug!(target: "auth", user = %user.id, %path, "granted");
    req.extensions_mut().insert(CurrentUser { user, profile });
    next.run(req).await
}

/// Resolve and validate the request's credential with the provider.
///
/// Page requests carry the session cookie; when their access token no
/// longer validates, the client context gets exactly one transparent
/// refresh attempt before the request is treated as unauthenticated.
async fn resolve_request_user(
    state: &AppState,
    kind: RouteKind,
    headers: &HeaderMap,
) -> Result<Option<User>, ProviderError> {
    match kind {
        RouteKind::Api => {
            let Some(token) = bearer_token(headers) else {
                return Ok(None);
            };
            state.provider.get_user(token).await
        }
        RouteKind::Page => {
            let Some(sid) = parse_cookie(headers, SESSION_COOKIE) else {
                return Ok(None);
            };
            let ctx = match state.clients.get(&sid) {
                Some(ctx) => ctx,
                // A cookie without a live context usually means the server
                // restarted; try to restore the session from the token cache.
                None => match state.restore_client_context(&sid).await {
                    Some(ctx) => ctx,
                    None => return Ok(None),
                },
            };
            let Some(session) = ctx.store.snapshot().session else {
                return Ok(None);
            };
            if let Some(user) = state.provider.get_user(&session.access_token).await? {
                return Ok(Some(user));
            }
            match ctx.adapter.refresh().await {
                Ok(refreshed) => state.provider.get_user(&refreshed.access_token).await,
                Err(err) => {
                    debug!(target: "auth", "transparent refresh failed: {err}");
                    Ok(None)
                }
            }
        }
    }
}

fn deny_unauthenticated(kind: RouteKind, path: &str) -> Response {
    match kind {
        RouteKind::Page => {
            let target = format!("/?redirect_to={}", urlencoding::encode(path));
            Redirect::to(&target).into_response()
        }
        RouteKind::Api => {
            AppError::auth("authentication_required", "authentication required").into_response()
        }
    }
}

fn deny_forbidden(kind: RouteKind) -> Response {
    match kind {
        RouteKind::Page => Redirect::to("/").into_response(),
        RouteKind::Api => {
            AppError::forbidden("insufficient_role", "insufficient permissions").into_response()
        }
    }
}
