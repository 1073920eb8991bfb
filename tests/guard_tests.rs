//! Route-guard integration tests: the full router with the local identity
//! provider behind it, exercising grants and denials for every protection
//! tier, transparent refresh, and the sign-in/sign-out surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use tower::ServiceExt;

use almsgate::config::AppConfig;
use almsgate::identity::{IdentityProvider, LocalIdentityProvider};
use almsgate::profile::{MemoryProfileStore, Profile, ProfileStore, ProfileStoreError, User};
use almsgate::roles::Role;
use almsgate::server::{build_router, AppState};

/// Counts lookups so tests can assert when profiles are (and are not)
/// consulted.
struct CountingProfileStore {
    inner: MemoryProfileStore,
    calls: AtomicUsize,
}

impl CountingProfileStore {
    fn new() -> Self {
        CountingProfileStore {
            inner: MemoryProfileStore::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn upsert(&self, profile: Profile) {
        self.inner.upsert(profile);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for CountingProfileStore {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, ProfileStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_profile(user_id).await
    }
}

struct TestApp {
    app: Router,
    provider: Arc<LocalIdentityProvider>,
    profiles: Arc<CountingProfileStore>,
}

fn test_app() -> TestApp {
    let provider = Arc::new(LocalIdentityProvider::new(None, 3600));
    let profiles = Arc::new(CountingProfileStore::new());
    let state = AppState::new(
        Arc::clone(&provider) as Arc<dyn IdentityProvider>,
        Arc::clone(&profiles) as Arc<dyn ProfileStore>,
        None,
        AppConfig::default(),
    );
    let app = build_router(state);
    TestApp {
        app,
        provider,
        profiles,
    }
}

fn seed_user(t: &TestApp, email: &str, password: &str, roles: &[Role]) -> User {
    let user = t.provider.register_user(email, password).unwrap();
    let mut profile = Profile::with_roles(user.id.as_str(), roles);
    profile.email = Some(email.to_string());
    t.profiles.upsert(profile);
    user
}

async fn send(t: &TestApp, req: Request<Body>) -> Response {
    t.app.clone().oneshot(req).await.unwrap()
}

async fn get(t: &TestApp, path: &str, cookie: Option<&str>, bearer: Option<&str>) -> Response {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(c) = cookie {
        builder = builder.header(header::COOKIE, c);
    }
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    send(t, builder.body(Body::empty()).unwrap()).await
}

/// Sign in through the router and return the session cookie pair
/// (`almsgate_sid=...`) plus the raw response.
async fn sign_in_via_router(
    t: &TestApp,
    email: &str,
    password: &str,
    redirect_to: Option<&str>,
) -> (String, Response) {
    let mut body = format!(
        "email={}&password={}",
        urlencoding::encode(email),
        urlencoding::encode(password)
    );
    if let Some(r) = redirect_to {
        body.push_str(&format!("&redirect_to={}", urlencoding::encode(r)));
    }
    let req = Request::builder()
        .method("POST")
        .uri("/auth/sign-in")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();
    let resp = send(t, req).await;
    let cookie = resp
        .headers()
        .get(header::SET_COOKIE)
        .expect("sign-in must set the session cookie")
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    (cookie, resp)
}

fn location(resp: &Response) -> &str {
    resp.headers()
        .get(header::LOCATION)
        .expect("redirect must carry a location")
        .to_str()
        .unwrap()
}

async fn json_body(resp: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn text_body(resp: Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn public_routes_skip_the_guard() -> Result<()> {
    let t = test_app();
    for path in ["/", "/monasteries", "/monasteries/st-brigid", "/healthz"] {
        let resp = get(&t, path, None, None).await;
        assert_eq!(resp.status(), StatusCode::OK, "{path}");
    }
    let resp = get(&t, "/monasteries/nowhere", None, None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn anonymous_page_request_redirects_with_return_path() -> Result<()> {
    let t = test_app();
    let resp = get(&t, "/admin", None, None).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/?redirect_to=%2Fadmin");
    // nobody signed in, so no profile lookup may have happened
    assert_eq!(t.profiles.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn anonymous_api_request_gets_401() -> Result<()> {
    let t = test_app();
    let resp = get(&t, "/api/admin/overview", None, None).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "unauthorized");
    assert_eq!(body["code"], "authentication_required");
    Ok(())
}

#[tokio::test]
async fn sign_in_sets_cookie_and_honors_redirect() -> Result<()> {
    let t = test_app();
    seed_user(&t, "donor@example.org", "growler1", &[Role::Donor]);
    let (cookie, resp) = sign_in_via_router(&t, "donor@example.org", "growler1", Some("/donate")).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/donate");
    assert!(cookie.starts_with("almsgate_sid="));

    // absolute URLs are never a redirect destination
    let (_, resp) = sign_in_via_router(
        &t,
        "donor@example.org",
        "growler1",
        Some("https://evil.example/phish"),
    )
    .await;
    assert_eq!(location(&resp), "/profile");
    Ok(())
}

#[tokio::test]
async fn wrong_password_redirects_with_error_code() -> Result<()> {
    let t = test_app();
    seed_user(&t, "donor@example.org", "growler1", &[Role::Donor]);
    let req = Request::builder()
        .method("POST")
        .uri("/auth/sign-in")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("email=donor%40example.org&password=wrong"))
        .unwrap();
    let resp = send(&t, req).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/?error=invalid_credentials");
    assert!(resp.headers().get(header::SET_COOKIE).is_none());
    Ok(())
}

#[tokio::test]
async fn signed_in_donor_reaches_plain_pages() -> Result<()> {
    let t = test_app();
    seed_user(&t, "donor@example.org", "growler1", &[Role::Donor]);
    let (cookie, _) = sign_in_via_router(&t, "donor@example.org", "growler1", None).await;
    let resp = get(&t, "/profile", Some(&cookie), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let html = text_body(resp).await;
    assert!(html.contains("donor@example.org"));

    let resp = get(&t, "/bookings", Some(&cookie), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn donor_is_turned_away_from_manage_page() -> Result<()> {
    let t = test_app();
    seed_user(&t, "donor@example.org", "growler1", &[Role::Donor]);
    let (cookie, _) = sign_in_via_router(&t, "donor@example.org", "growler1", None).await;
    let resp = get(&t, "/manage", Some(&cookie), None).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    // forbidden pages redirect bare, with no return path to probe for
    assert_eq!(location(&resp), "/");
    Ok(())
}

#[tokio::test]
async fn monastery_admin_reaches_manage_surfaces() -> Result<()> {
    let t = test_app();
    seed_user(
        &t,
        "kitchen@example.org",
        "growler1",
        &[Role::MonasteryAdmin, Role::Donor],
    );
    let (cookie, _) = sign_in_via_router(&t, "kitchen@example.org", "growler1", None).await;
    let resp = get(&t, "/manage", Some(&cookie), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let html = text_body(resp).await;
    assert!(html.contains("Slot administration"));

    // same account over the API tier
    let session = t
        .provider
        .sign_in("api-client", "kitchen@example.org", "growler1")
        .await?;
    let resp = get(&t, "/api/manage/slots", None, Some(&session.access_token)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "ok");
    assert!(body["slots"].is_array());

    // but not the super-admin tier
    let resp = get(&t, "/admin", Some(&cookie), None).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/");
    Ok(())
}

#[tokio::test]
async fn donor_bearer_is_forbidden_on_manage_api() -> Result<()> {
    let t = test_app();
    seed_user(&t, "donor@example.org", "growler1", &[Role::Donor]);
    let session = t
        .provider
        .sign_in("api-client", "donor@example.org", "growler1")
        .await?;

    let resp = get(&t, "/api/bookings", None, Some(&session.access_token)).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = get(&t, "/api/manage/slots", None, Some(&session.access_token)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = json_body(resp).await;
    assert_eq!(body["code"], "insufficient_role");
    // the denial names no roles
    assert_eq!(body["message"], "insufficient permissions");
    Ok(())
}

#[tokio::test]
async fn super_admin_owns_every_tier() -> Result<()> {
    let t = test_app();
    seed_user(&t, "root@example.org", "growler1", &[Role::SuperAdmin]);
    let session = t
        .provider
        .sign_in("api-client", "root@example.org", "growler1")
        .await?;

    for path in ["/api/bookings", "/api/manage/slots", "/api/admin/overview"] {
        let resp = get(&t, path, None, Some(&session.access_token)).await;
        assert_eq!(resp.status(), StatusCode::OK, "{path}");
    }
    let resp = get(&t, "/api/admin/overview", None, Some(&session.access_token)).await;
    let body = json_body(resp).await;
    assert_eq!(body["requested_by"], session.user.id);
    Ok(())
}

#[tokio::test]
async fn stale_bearer_token_is_unauthenticated() -> Result<()> {
    let t = test_app();
    seed_user(&t, "donor@example.org", "growler1", &[Role::Donor]);
    let session = t
        .provider
        .sign_in("api-client", "donor@example.org", "growler1")
        .await?;
    t.provider.revoke_access_token(&session.access_token);
    // API routes have no refresh context; the request is simply rejected
    let resp = get(&t, "/api/bookings", None, Some(&session.access_token)).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn page_request_transparently_refreshes_a_dead_access_token() -> Result<()> {
    let t = test_app();
    seed_user(&t, "donor@example.org", "growler1", &[Role::Donor]);
    let (cookie, _) = sign_in_via_router(&t, "donor@example.org", "growler1", None).await;
    let sid = cookie.strip_prefix("almsgate_sid=").unwrap().to_string();

    let before = t.provider.get_session(&sid).await?.expect("live session");
    t.provider.revoke_access_token(&before.access_token);

    // the page still renders: the guard rotates the token pair mid-request
    let resp = get(&t, "/profile", Some(&cookie), None).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let after = t.provider.get_session(&sid).await?.expect("live session");
    assert_ne!(before.access_token, after.access_token);
    assert_ne!(before.refresh_token, after.refresh_token);
    Ok(())
}

#[tokio::test]
async fn sign_out_clears_the_context_and_old_cookies_stop_working() -> Result<()> {
    let t = test_app();
    seed_user(&t, "donor@example.org", "growler1", &[Role::Donor]);
    let (cookie, _) = sign_in_via_router(&t, "donor@example.org", "growler1", None).await;

    let req = Request::builder()
        .method("POST")
        .uri("/auth/sign-out")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .unwrap();
    let resp = send(&t, req).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/");
    let cleared = resp
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cleared.contains("Expires=Thu, 01 Jan 1970"));

    // replaying the old cookie is an anonymous request again
    let resp = get(&t, "/profile", Some(&cookie), None).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/?redirect_to=%2Fprofile");
    Ok(())
}

#[tokio::test]
async fn callback_exchanges_a_one_time_code() -> Result<()> {
    let t = test_app();
    let user = seed_user(&t, "donor@example.org", "growler1", &[Role::Donor]);
    let code = t.provider.issue_code(&user.id);

    let resp = get(
        &t,
        &format!("/auth/callback?code={}&redirect_to=%2Fbookings", code),
        None,
        None,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/bookings");
    let cookie = resp
        .headers()
        .get(header::SET_COOKIE)
        .expect("callback must set the session cookie")
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let resp = get(&t, "/bookings", Some(&cookie), None).await;
    assert_eq!(resp.status(), StatusCode::OK);

    // the code was consumed on first use
    let resp = get(&t, &format!("/auth/callback?code={}", code), None, None).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/?error=sign_in_failed");
    Ok(())
}

#[tokio::test]
async fn booking_api_round_trip() -> Result<()> {
    let t = test_app();
    seed_user(&t, "donor@example.org", "growler1", &[Role::Donor]);
    let session = t
        .provider
        .sign_in("api-client", "donor@example.org", "growler1")
        .await?;

    let req = Request::builder()
        .method("POST")
        .uri("/api/bookings")
        .header(header::AUTHORIZATION, format!("Bearer {}", session.access_token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({
                "monastery_id": "st-brigid",
                "slot_date": "2026-09-01",
            })
            .to_string(),
        ))
        .unwrap();
    let resp = send(&t, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = json_body(resp).await;
    assert_eq!(body["booking"]["monastery_id"], "st-brigid");
    assert_eq!(body["booking"]["donor_id"], session.user.id);

    // unknown kitchens are rejected with the standard error body
    let req = Request::builder()
        .method("POST")
        .uri("/api/bookings")
        .header(header::AUTHORIZATION, format!("Bearer {}", session.access_token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "monastery_id": "nowhere" }).to_string(),
        ))
        .unwrap();
    let resp = send(&t, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = json_body(resp).await;
    assert_eq!(body["code"], "unknown_monastery");
    Ok(())
}
