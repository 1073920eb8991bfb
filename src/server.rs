//!
//! almsgate HTTP server
//! --------------------
//! Wires the identity stack to the web surface:
//! - per-browser client contexts (session store + adapter + recovery
//!   boundary) registered under the session cookie id
//! - the route-guard middleware layered over every route
//! - server-rendered pages that re-check access from store snapshots
//! - auth endpoints for sign-in, external-login callback, refresh and
//!   sign-out
//! - thin JSON APIs for the three protected tiers
//! - a background sweeper that retires idle client contexts
//!
//! Sessions, roles and denials are the product here; booking and donation
//! data are placeholders that only prove the protection tiers work.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Extension, Form, Json, Router};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::guard::middleware::{parse_cookie, route_guard, SESSION_COOKIE};
use crate::guard::{check_page, CurrentUser, PageAccess, RouteTable};
use crate::identity::{
    gen_token, AuthState, AuthStore, HostedIdentityProvider, IdentityProvider,
    LocalIdentityProvider, ProviderError, SessionAdapter, TokenCache,
};
use crate::profile::{MemoryProfileStore, Profile, ProfileStore, RestProfileStore};
use crate::recovery::{RecoveryAction, RecoveryBoundary};
use crate::roles::Role;

/// How long a render waits for the session store to settle before painting
/// a holding page.
const SETTLE_WAIT: Duration = Duration::from_secs(2);

/// How often the background sweeper looks for idle client contexts.
const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// One browser session's server-side residence: its observable auth state,
/// the adapter feeding it, and the render-time recovery boundary.
pub struct ClientContext {
    pub store: Arc<AuthStore>,
    pub adapter: Arc<SessionAdapter>,
    pub boundary: RecoveryBoundary,
    last_seen: Mutex<Instant>,
}

impl ClientContext {
    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    #[cfg(test)]
    pub fn age_artificially(&self, by: Duration) {
        *self.last_seen.lock() = Instant::now() - by;
    }
}

/// Client contexts keyed by session cookie id.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<ClientContext>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sid: &str) -> Option<Arc<ClientContext>> {
        let ctx = self.clients.read().get(sid).cloned();
        if let Some(ctx) = &ctx {
            ctx.touch();
        }
        ctx
    }

    pub fn insert(&self, sid: &str, ctx: Arc<ClientContext>) {
        self.clients.write().insert(sid.to_string(), ctx);
    }

    /// Insert unless a concurrent request won the race, in which case the
    /// existing context is returned and the caller discards its own.
    pub fn insert_or_existing(&self, sid: &str, ctx: Arc<ClientContext>) -> Arc<ClientContext> {
        let mut map = self.clients.write();
        match map.entry(sid.to_string()) {
            std::collections::hash_map::Entry::Occupied(e) => e.get().clone(),
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(Arc::clone(&ctx));
                ctx
            }
        }
    }

    pub fn remove(&self, sid: &str) -> Option<Arc<ClientContext>> {
        self.clients.write().remove(sid)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Remove every context idle longer than `max_idle` and return them so
    /// the caller can shut their adapters down outside the lock.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<Arc<ClientContext>> {
        let mut map = self.clients.write();
        let stale: Vec<String> = map
            .iter()
            .filter(|(_, ctx)| ctx.idle_for() > max_idle)
            .map(|(sid, _)| sid.clone())
            .collect();
        stale.into_iter().filter_map(|sid| map.remove(&sid)).collect()
    }
}

/// Shared server state injected into all handlers and the route guard.
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn IdentityProvider>,
    pub profiles: Arc<dyn ProfileStore>,
    pub routes: Arc<RouteTable>,
    pub clients: Arc<ClientRegistry>,
    pub cache: Option<TokenCache>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileStore>,
        cache: Option<TokenCache>,
        config: AppConfig,
    ) -> Self {
        AppState {
            provider,
            profiles,
            routes: Arc::new(RouteTable::default_table()),
            clients: Arc::new(ClientRegistry::new()),
            cache,
            config: Arc::new(config),
        }
    }

    /// Build an unregistered context for `sid` with its event loop running.
    pub fn build_client_context(&self, sid: &str) -> Arc<ClientContext> {
        let store = Arc::new(AuthStore::new());
        let adapter = Arc::new(SessionAdapter::new(
            sid,
            Arc::clone(&self.provider),
            Arc::clone(&self.profiles),
            Arc::clone(&store),
            self.cache.clone(),
        ));
        adapter.start();
        Arc::new(ClientContext {
            store,
            adapter,
            boundary: RecoveryBoundary::new(),
            last_seen: Mutex::new(Instant::now()),
        })
    }

    /// A request arrived with a session cookie but no live context, which is
    /// what a server restart looks like. Attempt initial-session recovery;
    /// only a context that actually recovered a session is registered.
    pub async fn restore_client_context(&self, sid: &str) -> Option<Arc<ClientContext>> {
        let ctx = self.build_client_context(sid);
        ctx.adapter.initial_session().await;
        if ctx.store.snapshot().session.is_none() {
            ctx.adapter.shutdown();
            return None;
        }
        let registered = self.clients.insert_or_existing(sid, Arc::clone(&ctx));
        if !Arc::ptr_eq(&registered, &ctx) {
            ctx.adapter.shutdown();
        }
        debug!(target: "auth", "restored client context from persisted session");
        Some(registered)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(entry_page))
        .route("/healthz", get(healthz))
        .route("/monasteries", get(monasteries_page))
        .route("/monasteries/{id}", get(monastery_page))
        .route("/profile", get(profile_page))
        .route("/bookings", get(bookings_page))
        .route("/donate", get(donate_page))
        .route("/manage", get(manage_page))
        .route("/admin", get(admin_page))
        .route("/recover", get(recover_page))
        .route("/auth/sign-in", post(sign_in))
        .route("/auth/callback", get(oauth_callback))
        .route("/auth/sign-out", post(sign_out))
        .route("/auth/refresh", post(refresh_session))
        .route("/api/bookings", get(api_bookings).post(api_create_booking))
        .route("/api/manage/slots", get(api_manage_slots))
        .route("/api/admin/overview", get(api_admin_overview))
        .layer(axum::middleware::from_fn_with_state(state.clone(), route_guard))
        .with_state(state)
}

/// Start the almsgate server with the given configuration.
///
/// Chooses the hosted identity/profile backend when one is configured, the
/// in-process provider otherwise, then mounts all routes and serves until
/// the process is stopped.
pub async fn run_with_config(cfg: AppConfig) -> anyhow::Result<()> {
    let cache = match &cfg.cache_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create token cache directory: {dir}"))?;
            Some(TokenCache::new(dir))
        }
        None => None,
    };

    let (provider, profiles): (Arc<dyn IdentityProvider>, Arc<dyn ProfileStore>) =
        match &cfg.backend_url {
            Some(url) => {
                let key = cfg.backend_key.clone().unwrap_or_default();
                if key.is_empty() {
                    warn!(target: "startup", "backend key is empty; backend calls will likely be rejected");
                }
                info!(target: "startup", backend = %url, "using hosted identity and profile backend");
                (
                    Arc::new(HostedIdentityProvider::new(url, &key, cache.clone())?),
                    Arc::new(RestProfileStore::new(url, &key)?),
                )
            }
            None => {
                info!(target: "startup", "no backend configured; using the local identity provider");
                let provider =
                    Arc::new(LocalIdentityProvider::new(cache.clone(), cfg.session_ttl_secs));
                let profiles = Arc::new(MemoryProfileStore::new());
                seed_local_accounts(&provider, &profiles, &cfg)?;
                (
                    provider as Arc<dyn IdentityProvider>,
                    profiles as Arc<dyn ProfileStore>,
                )
            }
        };

    let state = AppState::new(provider, profiles, cache, cfg.clone());
    spawn_idle_sweeper(&state);

    let app = build_router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.http_port).parse()?;
    info!("Starting almsgate on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Convenience entry point with default configuration.
pub async fn run() -> anyhow::Result<()> {
    run_with_config(AppConfig::default()).await
}

/// Background sweeper retiring client contexts idle past the configured
/// threshold. Sweeps immediately, then every `SWEEP_PERIOD`, until aborted.
fn spawn_idle_sweeper(state: &AppState) -> tokio::task::JoinHandle<()> {
    let clients = Arc::clone(&state.clients);
    let max_idle = Duration::from_secs(state.config.client_idle_secs.max(1));
    tokio::spawn(async move {
        loop {
            let removed = clients.sweep_idle(max_idle);
            for ctx in &removed {
                ctx.adapter.shutdown();
            }
            if !removed.is_empty() {
                debug!(target: "auth", retired = removed.len(), "idle client contexts swept");
            }
            tokio::time::sleep(SWEEP_PERIOD).await;
        }
    })
}

/// Local mode ships with one super-admin so the protected tiers are usable
/// out of the box.
fn seed_local_accounts(
    provider: &LocalIdentityProvider,
    profiles: &MemoryProfileStore,
    cfg: &AppConfig,
) -> anyhow::Result<()> {
    let admin = provider.register_user("admin@almsgate.local", &cfg.dev_password)?;
    let mut profile = Profile::with_roles(admin.id.as_str(), &[Role::SuperAdmin]);
    profile.full_name = Some("Almsgate Root".to_string());
    profile.email = Some(admin.email.clone());
    profiles.upsert(profile);
    info!(target: "startup", user = %admin.id, "seeded local super-admin admin@almsgate.local");
    Ok(())
}

// ---------------------------------------------------------------------------
// cookies and render helpers
// ---------------------------------------------------------------------------

fn set_session_cookie(sid: &str) -> HeaderValue {
    // Secure, HttpOnly cookie scoped to path / with SameSite=Strict
    HeaderValue::from_str(&format!(
        "{}={}; HttpOnly; Secure; SameSite=Strict; Path=/",
        SESSION_COOKIE, sid
    ))
    .unwrap()
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Strict; Path=/",
        SESSION_COOKIE
    ))
    .unwrap()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Only same-origin absolute paths may be used as a post-auth destination.
fn safe_return_path(raw: Option<&str>, fallback: &str) -> String {
    match raw {
        Some(p) if p.starts_with('/') && !p.starts_with("//") => p.to_string(),
        _ => fallback.to_string(),
    }
}

fn page_html(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{} | almsgate</title></head>\
         <body><nav><a href=\"/\">almsgate</a> <a href=\"/monasteries\">monasteries</a> \
         <a href=\"/profile\">profile</a> <a href=\"/bookings\">bookings</a> \
         <a href=\"/donate\">donate</a></nav><main>{}</main></body></html>",
        html_escape(title),
        body
    ))
}

/// Wait briefly for the store to finish its current loading cycle so pages
/// render settled state instead of a flash of "still checking".
async fn settled_snapshot(ctx: &ClientContext, wait: Duration) -> AuthState {
    let deadline = tokio::time::Instant::now() + wait;
    let mut rx = ctx.store.subscribe();
    loop {
        let snap = ctx.store.snapshot();
        if !snap.loading {
            return snap;
        }
        let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()) else {
            return snap;
        };
        match tokio::time::timeout(remaining, rx.changed()).await {
            Ok(Ok(())) => continue,
            _ => return ctx.store.snapshot(),
        }
    }
}

fn recovery_screen(action: RecoveryAction, path: &str) -> Response {
    match action {
        RecoveryAction::SignInAgain => (
            StatusCode::UNAUTHORIZED,
            page_html(
                "Session expired",
                "<h1>Your session has expired</h1>\
                 <p>You have been signed out. Sign in to continue where you left off.</p>\
                 <p><a href=\"/\">Sign in again</a></p>",
            ),
        )
            .into_response(),
        RecoveryAction::Retry => (
            StatusCode::INTERNAL_SERVER_ERROR,
            page_html(
                "Something went wrong",
                &format!(
                    "<h1>Something went wrong</h1>\
                     <p>The page could not be rendered. Your session is still active.</p>\
                     <p><a href=\"/recover?path={}\">Try again</a></p>",
                    urlencoding::encode(path)
                ),
            ),
        )
            .into_response(),
    }
}

/// Shared scaffolding for signed-in pages: resolve the client context, route
/// surfaced errors through the recovery boundary, re-check access from the
/// settled snapshot, then render.
async fn render_protected<F>(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    render: F,
) -> Response
where
    F: FnOnce(&AuthState) -> String,
{
    let ctx = parse_cookie(headers, SESSION_COOKIE).and_then(|sid| state.clients.get(&sid));
    let Some(ctx) = ctx else {
        return Redirect::to(&format!("/?redirect_to={}", urlencoding::encode(path)))
            .into_response();
    };
    let snap = settled_snapshot(&ctx, SETTLE_WAIT).await;
    if let Some(err) = snap.error.clone() {
        let action = ctx.boundary.catch(&ctx.adapter, &err).await;
        return recovery_screen(action, path);
    }
    match check_page(&snap, &state.routes, path) {
        PageAccess::Granted => {
            page_html(path.trim_start_matches('/'), &render(&snap)).into_response()
        }
        PageAccess::Pending => page_html(
            "Loading",
            "<h1>Loading your account</h1>\
             <p>Hold on a moment, then <a href=\"\">refresh</a>.</p>",
        )
        .into_response(),
        PageAccess::SignInRequired => {
            Redirect::to(&format!("/?redirect_to={}", urlencoding::encode(path))).into_response()
        }
        PageAccess::Denied => Redirect::to("/").into_response(),
    }
}

// ---------------------------------------------------------------------------
// public pages
// ---------------------------------------------------------------------------

const MONASTERIES: &[(&str, &str, &str)] = &[
    (
        "st-brigid",
        "St Brigid Priory",
        "Accepts fresh produce and dry goods on weekday mornings.",
    ),
    (
        "holy-cross",
        "Holy Cross Abbey",
        "Weekend drop-offs; refrigerated donations welcome.",
    ),
    (
        "mount-carmel",
        "Mount Carmel Hermitage",
        "Small kitchen; please book a slot before bringing goods.",
    ),
];

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "active_clients": state.clients.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct EntryQuery {
    redirect_to: Option<String>,
    error: Option<String>,
}

async fn entry_page(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<EntryQuery>,
) -> Response {
    let signed_in = parse_cookie(&headers, SESSION_COOKIE)
        .and_then(|sid| state.clients.get(&sid))
        .map(|ctx| ctx.store.snapshot().session.is_some())
        .unwrap_or(false);
    let error_note = match q.error.as_deref() {
        Some("invalid_credentials") => "<p>Email or password did not match.</p>",
        Some("provider_unavailable") => {
            "<p>The sign-in service is unavailable right now. Try again shortly.</p>"
        }
        Some(_) => "<p>Sign-in failed. Try again.</p>",
        None => "",
    };
    let redirect = html_escape(&safe_return_path(q.redirect_to.as_deref(), ""));
    let signed_in_note = if signed_in {
        "<p>You are signed in. Continue to your <a href=\"/profile\">profile</a>.</p>"
    } else {
        ""
    };
    let body = format!(
        "<h1>Welcome to almsgate</h1>\
         <p>Neighborhood food donations for monastery kitchens.</p>\
         {signed_in_note}{error_note}\
         <form method=\"post\" action=\"/auth/sign-in\">\
         <input type=\"hidden\" name=\"redirect_to\" value=\"{redirect}\">\
         <label>Email <input type=\"email\" name=\"email\" required></label>\
         <label>Password <input type=\"password\" name=\"password\" required></label>\
         <button type=\"submit\">Sign in</button>\
         </form>\
         <p><a href=\"/monasteries\">Browse monasteries</a></p>"
    );
    page_html("Welcome", &body).into_response()
}

async fn monasteries_page() -> Response {
    let mut items = String::new();
    for (id, name, blurb) in MONASTERIES {
        items.push_str(&format!(
            "<li><a href=\"/monasteries/{id}\">{name}</a> {blurb}</li>"
        ));
    }
    page_html("Monasteries", &format!("<h1>Monasteries</h1><ul>{items}</ul>")).into_response()
}

async fn monastery_page(Path(id): Path<String>) -> Response {
    match MONASTERIES.iter().find(|(mid, _, _)| *mid == id) {
        Some((id, name, blurb)) => page_html(
            name,
            &format!(
                "<h1>{name}</h1><p>{blurb}</p>\
                 <p><a href=\"/donate?monastery={id}\">Donate to this kitchen</a></p>"
            ),
        )
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            page_html(
                "Not found",
                &format!(
                    "<h1>No such monastery</h1><p>Nothing is listed under \"{}\".</p>\
                     <p><a href=\"/monasteries\">Back to the list</a></p>",
                    html_escape(&id)
                ),
            ),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// signed-in pages
// ---------------------------------------------------------------------------

async fn profile_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    render_protected(&state, &headers, "/profile", |snap| {
        let email = snap
            .user
            .as_ref()
            .map(|u| html_escape(&u.email))
            .unwrap_or_default();
        match &snap.profile {
            Some(profile) => {
                let name = profile
                    .full_name
                    .as_deref()
                    .map(html_escape)
                    .unwrap_or_else(|| "(no name on file)".to_string());
                let roles = if profile.user_types.is_empty() {
                    "none".to_string()
                } else {
                    profile
                        .user_types
                        .iter()
                        .map(|r| r.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                format!(
                    "<h1>Your profile</h1>\
                     <p>Name: {name}</p><p>Email: {email}</p><p>Roles: {roles}</p>\
                     <form method=\"post\" action=\"/auth/sign-out\">\
                     <button type=\"submit\">Sign out</button></form>"
                )
            }
            None => format!(
                "<h1>Your profile</h1>\
                 <p>Email: {email}</p>\
                 <p>No profile record yet; you can still browse and donate.</p>\
                 <form method=\"post\" action=\"/auth/sign-out\">\
                 <button type=\"submit\">Sign out</button></form>"
            ),
        }
    })
    .await
}

async fn bookings_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    render_protected(&state, &headers, "/bookings", |_snap| {
        "<h1>Your bookings</h1>\
         <p>No upcoming drop-off slots booked.</p>\
         <p><a href=\"/donate\">Book a donation slot</a></p>"
            .to_string()
    })
    .await
}

async fn donate_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    render_protected(&state, &headers, "/donate", |_snap| {
        let mut options = String::new();
        for (id, name, _) in MONASTERIES {
            options.push_str(&format!("<option value=\"{id}\">{name}</option>"));
        }
        format!(
            "<h1>Donate food</h1>\
             <p>Pick a kitchen and a drop-off slot; the bookings API confirms it.</p>\
             <form><label>Monastery <select name=\"monastery_id\">{options}</select></label>\
             <label>Date <input type=\"date\" name=\"slot_date\"></label>\
             <button type=\"submit\" formmethod=\"post\" formaction=\"/api/bookings\">Book</button>\
             </form>"
        )
    })
    .await
}

async fn manage_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    render_protected(&state, &headers, "/manage", |snap| {
        let who = snap
            .profile
            .as_ref()
            .and_then(|p| p.full_name.as_deref())
            .map(html_escape)
            .unwrap_or_else(|| "administrator".to_string());
        format!(
            "<h1>Slot administration</h1>\
             <p>Welcome, {who}. Open, close and review drop-off slots for your kitchen.</p>\
             <ul><li>Mon 09:00 open</li><li>Wed 09:00 open</li><li>Sat 10:00 full</li></ul>"
        )
    })
    .await
}

async fn admin_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let active = state.clients.len();
    render_protected(&state, &headers, "/admin", move |_snap| {
        format!(
            "<h1>Platform overview</h1>\
             <p>Active client contexts: {active}</p>\
             <p>Role assignments are managed in the profile backend.</p>"
        )
    })
    .await
}

#[derive(Debug, Deserialize)]
struct RecoverQuery {
    path: Option<String>,
}

/// The single explicit recovery action: re-arm the boundary and go back.
async fn recover_page(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<RecoverQuery>,
) -> Response {
    let target = safe_return_path(q.path.as_deref(), "/");
    if let Some(ctx) =
        parse_cookie(&headers, SESSION_COOKIE).and_then(|sid| state.clients.get(&sid))
    {
        ctx.boundary.reset();
        ctx.store.clear_error();
    }
    Redirect::to(&target).into_response()
}

// ---------------------------------------------------------------------------
// auth endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SignInForm {
    email: String,
    password: String,
    redirect_to: Option<String>,
}

async fn sign_in(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<SignInForm>,
) -> Response {
    // a fresh sign-in always gets a fresh context; retire whatever the
    // browser was holding
    if let Some(old_sid) = parse_cookie(&headers, SESSION_COOKIE) {
        if let Some(old) = state.clients.remove(&old_sid) {
            old.adapter.sign_out().await;
            old.adapter.shutdown();
        }
    }
    let sid = gen_token();
    let ctx = state.build_client_context(&sid);
    state.clients.insert(&sid, Arc::clone(&ctx));
    match state.provider.sign_in(&sid, &form.email, &form.password).await {
        Ok(session) => {
            // seed the store synchronously; the event stream repeats this
            // and starts the profile fetch
            ctx.store.set_session(Some(session.clone()));
            ctx.store.set_user(Some(session.user.clone()));
            info!(target: "auth", user = %session.user.id, "client context established");
            let target = safe_return_path(form.redirect_to.as_deref(), "/profile");
            let mut h = HeaderMap::new();
            h.insert("Set-Cookie", set_session_cookie(&sid));
            (h, Redirect::to(&target)).into_response()
        }
        Err(err) => {
            state.clients.remove(&sid);
            ctx.adapter.shutdown();
            sign_in_failure(err)
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    redirect_to: Option<String>,
}

/// Return leg of an external login: exchange the one-time code, then behave
/// exactly like a password sign-in.
async fn oauth_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<CallbackQuery>,
) -> Response {
    let Some(code) = q.code else {
        return Redirect::to("/?error=missing_code").into_response();
    };
    if let Some(old_sid) = parse_cookie(&headers, SESSION_COOKIE) {
        if let Some(old) = state.clients.remove(&old_sid) {
            old.adapter.sign_out().await;
            old.adapter.shutdown();
        }
    }
    let sid = gen_token();
    let ctx = state.build_client_context(&sid);
    state.clients.insert(&sid, Arc::clone(&ctx));
    match state.provider.exchange_code(&sid, &code).await {
        Ok(session) => {
            ctx.store.set_session(Some(session.clone()));
            ctx.store.set_user(Some(session.user.clone()));
            info!(target: "auth", user = %session.user.id, "client context established via callback");
            let target = safe_return_path(q.redirect_to.as_deref(), "/profile");
            let mut h = HeaderMap::new();
            h.insert("Set-Cookie", set_session_cookie(&sid));
            (h, Redirect::to(&target)).into_response()
        }
        Err(err) => {
            state.clients.remove(&sid);
            ctx.adapter.shutdown();
            sign_in_failure(err)
        }
    }
}

fn sign_in_failure(err: ProviderError) -> Response {
    let code = match &err {
        ProviderError::InvalidCredentials => "invalid_credentials",
        ProviderError::Unreachable(_) => "provider_unavailable",
        _ => "sign_in_failed",
    };
    warn!(target: "auth", "sign-in rejected: {err}");
    Redirect::to(&format!("/?error={code}")).into_response()
}

async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(sid) = parse_cookie(&headers, SESSION_COOKIE) {
        if let Some(ctx) = state.clients.remove(&sid) {
            ctx.adapter.sign_out().await;
            ctx.adapter.shutdown();
        } else if let Err(err) = state.provider.sign_out(&sid).await {
            // no live context, still revoke whatever the provider holds
            warn!(target: "auth", "provider sign-out failed: {err}");
        }
    }
    let mut h = HeaderMap::new();
    h.insert("Set-Cookie", clear_session_cookie());
    (h, Redirect::to("/")).into_response()
}

/// Machine endpoint for embedded clients to rotate their session.
async fn refresh_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(sid) = parse_cookie(&headers, SESSION_COOKIE) else {
        return AppError::auth("no_session", "no session cookie presented").into_response();
    };
    let Some(ctx) = state.clients.get(&sid) else {
        return AppError::auth("no_session", "no active session for this client").into_response();
    };
    match ctx.adapter.refresh().await {
        Ok(session) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "expires_at": session.expires_at.to_rfc3339(),
                "expires_in_secs": session.expires_in_secs(),
            })),
        )
            .into_response(),
        Err(ProviderError::SessionInvalid(msg)) => {
            AppError::session_expired("session_expired", msg).into_response()
        }
        Err(ProviderError::Unreachable(msg)) => {
            AppError::provider("provider_unreachable", msg).into_response()
        }
        Err(other) => AppError::provider("refresh_failed", other.to_string()).into_response(),
    }
}

// ---------------------------------------------------------------------------
// protected JSON APIs
// ---------------------------------------------------------------------------

async fn api_bookings(Extension(current): Extension<CurrentUser>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "donor_id": current.user.id,
        "bookings": [],
    }))
}

#[derive(Debug, Deserialize)]
struct CreateBooking {
    monastery_id: String,
    slot_date: Option<String>,
    note: Option<String>,
}

async fn api_create_booking(
    Extension(current): Extension<CurrentUser>,
    Json(payload): Json<CreateBooking>,
) -> Response {
    if payload.monastery_id.trim().is_empty() {
        return AppError::user("missing_monastery", "monastery_id is required").into_response();
    }
    if !MONASTERIES.iter().any(|(id, _, _)| *id == payload.monastery_id) {
        return AppError::not_found(
            "unknown_monastery",
            format!("no monastery listed as {}", payload.monastery_id),
        )
        .into_response();
    }
    let booking_id = uuid::Uuid::new_v4().to_string();
    info!(target: "auth", user = %current.user.id, monastery = %payload.monastery_id, "booking created");
    (
        StatusCode::CREATED,
        Json(json!({
            "status": "ok",
            "booking": {
                "id": booking_id,
                "donor_id": current.user.id,
                "monastery_id": payload.monastery_id,
                "slot_date": payload.slot_date,
                "note": payload.note,
            },
        })),
    )
        .into_response()
}

async fn api_manage_slots(Extension(current): Extension<CurrentUser>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "manager_id": current.user.id,
        "slots": [
            { "day": "mon", "time": "09:00", "state": "open" },
            { "day": "wed", "time": "09:00", "state": "open" },
            { "day": "sat", "time": "10:00", "state": "full" },
        ],
    }))
}

async fn api_admin_overview(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "requested_by": current.user.id,
        "active_clients": state.clients.len(),
        "monasteries": MONASTERIES.len(),
    }))
}
