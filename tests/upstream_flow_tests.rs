//! End-to-end tests for the federated upstream login
//!
//! Spins up a fake OIDC provider over real HTTP (discovery document, JWKS,
//! token endpoint) and drives the broker through the full
//! auth → login-oauth2 → callback → approve → token sequence.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Form, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_test::TestServer;
use cookie::Cookie;
use latchkey::envelope::{claim_str, Claims, EnvelopeCodec};
use latchkey::keys::KeyManager;
use latchkey::pkce;
use latchkey::server::AppState;
use latchkey::storage::{JsonStorage, OAuth2Provider, Storage, User};
use latchkey::{Config, Server};
use parking_lot::Mutex;
use serde_json::{json, Value};
use url::Url;

const ISSUER: &str = "https://id.example.com";

struct FakeProvider {
    codec: EnvelopeCodec,
    keys: Arc<KeyManager>,
    issuer: Mutex<String>,
}

impl FakeProvider {
    fn new() -> Arc<Self> {
        let path = std::env::temp_dir()
            .join("latchkey_upstream_tests")
            .join(format!("provider_{}.json", uuid::Uuid::new_v4()));
        let storage = JsonStorage::new(path).unwrap();
        let keys = Arc::new(KeyManager::load_or_generate(&storage).unwrap());
        Arc::new(Self {
            codec: EnvelopeCodec::new(Arc::clone(&keys)),
            keys,
            issuer: Mutex::new(String::new()),
        })
    }
}

async fn provider_discovery(State(p): State<Arc<FakeProvider>>) -> Json<Value> {
    let issuer = p.issuer.lock().clone();
    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "jwks_uri": format!("{issuer}/jwks"),
    }))
}

async fn provider_jwks(State(p): State<Arc<FakeProvider>>) -> Json<Value> {
    Json(serde_json::to_value(p.keys.public_jwks()).unwrap())
}

/// The fake token endpoint echoes the received `code` back as the ID
/// token's nonce, so tests control nonce agreement through the code they
/// present at `/callback`.
async fn provider_token(
    State(p): State<Arc<FakeProvider>>,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    assert_eq!(
        form.get("grant_type").map(String::as_str),
        Some("authorization_code")
    );
    assert!(form.contains_key("code_verifier"));
    assert!(form.contains_key("redirect_uri"));

    let nonce = form.get("code").cloned().unwrap_or_default();
    let issuer = p.issuer.lock().clone();

    let mut claims = Claims::new();
    claims.insert("iss".to_string(), Value::from(issuer));
    claims.insert("sub".to_string(), Value::from("upstream-subject-1"));
    claims.insert("email".to_string(), Value::from("alice@example.com"));
    claims.insert("name".to_string(), Value::from("Alice Example"));
    claims.insert("nonce".to_string(), Value::from(nonce));
    let id_token = p
        .codec
        .build(claims, std::time::Duration::from_secs(300))
        .unwrap();

    Json(json!({
        "access_token": "upstream-opaque-token",
        "token_type": "bearer",
        "expires_in": 3600,
        "id_token": id_token,
    }))
}

/// Start the fake provider on a real port and return its base URL.
fn start_provider() -> (TestServer, Arc<FakeProvider>, String) {
    let provider = FakeProvider::new();
    let app = Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(provider_discovery),
        )
        .route("/jwks", get(provider_jwks))
        .route("/token", post(provider_token))
        .with_state(Arc::clone(&provider));

    let server = TestServer::builder()
        .http_transport()
        .build(app)
        .unwrap();
    let base = server
        .server_address()
        .expect("provider address")
        .to_string();
    let base = base.trim_end_matches('/').to_string();
    *provider.issuer.lock() = base.clone();

    (server, provider, base)
}

async fn broker_with_provider(provider_uri: &str, public: bool) -> (TestServer, Arc<AppState>) {
    let dir = std::env::temp_dir()
        .join("latchkey_upstream_tests")
        .join(uuid::Uuid::new_v4().to_string());
    std::fs::create_dir_all(&dir).unwrap();

    let mut config = Config::default();
    config.server.storage_dir = dir.to_string_lossy().into_owned();
    config.server.root_uri = ISSUER.to_string();

    let server = Server::new(config).await.unwrap();
    let state = server.state();

    state
        .storage
        .set_oauth2_provider(OAuth2Provider {
            id: "fakeidp".to_string(),
            name: "FakeIdP".to_string(),
            uri: provider_uri.to_string(),
            client_id: "broker-client".to_string(),
            client_secret: "broker-secret".to_string(),
            openid_connect: true,
            ..Default::default()
        })
        .unwrap();
    state.storage.set_public(public).unwrap();

    (TestServer::new(server.router()).unwrap(), state)
}

fn location(response: &axum_test::TestResponse) -> String {
    response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .expect("location header")
        .to_string()
}

fn query_param(raw_url: &str, name: &str) -> Option<String> {
    let url = Url::parse(raw_url).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Drive /auth and /login-oauth2, returning everything /callback needs.
struct InFlightLogin {
    upstream_cookie: String,
    return_cookie: String,
    state_param: String,
    nonce_param: String,
}

async fn start_upstream_login(server: &TestServer, code_challenge: &str) -> InFlightLogin {
    let auth_response = server
        .get("/auth")
        .add_query_param("client_id", "https://rp.example")
        .add_query_param("redirect_uri", "https://rp.example/cb")
        .add_query_param("response_type", "code")
        .add_query_param("scope", "openid email")
        .add_query_param("state", "S1")
        .add_query_param("nonce", "N1")
        .add_query_param("code_challenge", code_challenge)
        .await;
    auth_response.assert_status_ok();
    let return_cookie = auth_response.cookie("latchkeyreturn_uri").value().to_string();

    let login_response = server
        .get("/login-oauth2")
        .add_query_param("oauth2_provider_id", "fakeidp")
        .await;
    login_response.assert_status_see_other();

    let redirect = location(&login_response);
    assert!(redirect.contains("/authorize"));
    assert_eq!(
        query_param(&redirect, "response_type").as_deref(),
        Some("code")
    );
    assert_eq!(
        query_param(&redirect, "code_challenge_method").as_deref(),
        Some("S256")
    );
    assert_eq!(query_param(&redirect, "prompt").as_deref(), Some("consent"));
    assert_eq!(
        query_param(&redirect, "client_id").as_deref(),
        Some("broker-client")
    );
    assert_eq!(
        query_param(&redirect, "redirect_uri").as_deref(),
        Some(&format!("{ISSUER}/callback")[..])
    );

    InFlightLogin {
        upstream_cookie: login_response
            .cookie("latchkeyupstream_oauth2_request")
            .value()
            .to_string(),
        return_cookie,
        state_param: query_param(&redirect, "state").unwrap(),
        nonce_param: query_param(&redirect, "nonce").unwrap(),
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn fresh_code_flow_through_an_oidc_upstream() {
    let (_provider_server, _provider, provider_uri) = start_provider();
    let (server, state) = broker_with_provider(&provider_uri, true).await;

    let (challenge, verifier) = pkce::generate_pair();
    let login = start_upstream_login(&server, &challenge).await;

    // The provider "authenticates" the user; its token endpoint will echo
    // our code as the ID token nonce, so present the expected nonce.
    let callback = server
        .get("/callback")
        .add_query_param("code", &login.nonce_param)
        .add_query_param("state", &login.state_param)
        .add_cookie(Cookie::new(
            "latchkeyupstream_oauth2_request",
            login.upstream_cookie.clone(),
        ))
        .add_cookie(Cookie::new("latchkeyreturn_uri", login.return_cookie.clone()))
        .await;

    callback.assert_status_see_other();
    assert_eq!(location(&callback), login.return_cookie);
    let session = callback.cookie("latchkeylogin_key").value().to_string();

    // One identity in the session now.
    let data = latchkey::session::parse_session_value(&state.codec, &session);
    assert_eq!(data.identities.len(), 1);
    assert_eq!(data.identities[0].id, "alice@example.com");
    assert_eq!(data.identities[0].provider_name, "FakeIdP");
    assert!(data.identities[0].email_verified);

    // Back on /auth the user approves the relying party.
    let auth_response = server
        .get("/auth")
        .add_query_param("client_id", "https://rp.example")
        .add_query_param("redirect_uri", "https://rp.example/cb")
        .add_query_param("response_type", "code")
        .add_query_param("scope", "openid email")
        .add_query_param("state", "S1")
        .add_query_param("nonce", "N1")
        .add_query_param("code_challenge", &challenge)
        .add_cookie(Cookie::new("latchkeylogin_key", session.clone()))
        .await;
    auth_response.assert_status_ok();
    let request_cookie = auth_response.cookie("latchkeyauth_request").value().to_string();

    let approve = server
        .post("/approve")
        .add_cookie(Cookie::new("latchkeylogin_key", session))
        .add_cookie(Cookie::new("latchkeyauth_request", request_cookie))
        .form(&[("identity_id", "alice@example.com")])
        .await;
    approve.assert_status_see_other();

    let redirect = location(&approve);
    assert!(redirect.starts_with("https://rp.example/cb"));
    assert_eq!(query_param(&redirect, "state").as_deref(), Some("S1"));
    let code = query_param(&redirect, "code").unwrap();

    let token = server
        .post("/token")
        .form(&[("code", code.as_str()), ("code_verifier", verifier.as_str())])
        .await;
    token.assert_status_ok();

    let body: Value = token.json();
    assert_eq!(body["token_type"], "bearer");
    assert_eq!(body["expires_in"], 3600);

    let claims = state
        .codec
        .parse(body["id_token"].as_str().unwrap())
        .unwrap();
    assert_eq!(claim_str(&claims, "sub").unwrap(), "alice@example.com");
    assert_eq!(claims["aud"], json!(["https://rp.example"]));
    assert_eq!(claim_str(&claims, "nonce").unwrap(), "N1");
    assert_eq!(claim_str(&claims, "email").unwrap(), "alice@example.com");
    assert_eq!(claims["email_verified"], json!(true));
}

#[tokio::test]
async fn callback_rejects_nonce_mismatch_and_leaves_session_alone() {
    let (_provider_server, _provider, provider_uri) = start_provider();
    let (server, _state) = broker_with_provider(&provider_uri, true).await;

    let (challenge, _) = pkce::generate_pair();
    let login = start_upstream_login(&server, &challenge).await;

    // Presenting a different code makes the provider mint an ID token
    // whose nonce does not match the one stored in the envelope.
    let callback = server
        .get("/callback")
        .add_query_param("code", "some-other-nonce")
        .add_query_param("state", &login.state_param)
        .add_cookie(Cookie::new(
            "latchkeyupstream_oauth2_request",
            login.upstream_cookie,
        ))
        .add_cookie(Cookie::new("latchkeyreturn_uri", login.return_cookie))
        .await;

    callback.assert_status_forbidden();
    assert!(callback.maybe_cookie("latchkeylogin_key").is_none());
}

#[tokio::test]
async fn callback_rejects_state_mismatch() {
    let (_provider_server, _provider, provider_uri) = start_provider();
    let (server, _state) = broker_with_provider(&provider_uri, true).await;

    let (challenge, _) = pkce::generate_pair();
    let login = start_upstream_login(&server, &challenge).await;

    let callback = server
        .get("/callback")
        .add_query_param("code", &login.nonce_param)
        .add_query_param("state", "forged-state")
        .add_cookie(Cookie::new(
            "latchkeyupstream_oauth2_request",
            login.upstream_cookie,
        ))
        .add_cookie(Cookie::new("latchkeyreturn_uri", login.return_cookie))
        .await;

    callback.assert_status_forbidden();
}

#[tokio::test]
async fn callback_without_inflight_cookie_is_unauthenticated() {
    let (_provider_server, _provider, provider_uri) = start_provider();
    let (server, _state) = broker_with_provider(&provider_uri, true).await;

    let callback = server
        .get("/callback")
        .add_query_param("code", "x")
        .add_query_param("state", "y")
        .await;
    callback.assert_status_unauthorized();
}

#[tokio::test]
async fn private_server_bounces_unknown_emails_to_no_account() {
    let (_provider_server, _provider, provider_uri) = start_provider();
    let (server, _state) = broker_with_provider(&provider_uri, false).await;

    let (challenge, _) = pkce::generate_pair();
    let login = start_upstream_login(&server, &challenge).await;

    let callback = server
        .get("/callback")
        .add_query_param("code", &login.nonce_param)
        .add_query_param("state", &login.state_param)
        .add_cookie(Cookie::new(
            "latchkeyupstream_oauth2_request",
            login.upstream_cookie,
        ))
        .add_cookie(Cookie::new("latchkeyreturn_uri", login.return_cookie))
        .await;

    callback.assert_status_see_other();
    let redirect = location(&callback);
    assert!(redirect.starts_with(&format!("{ISSUER}/no-account?")));
    assert!(callback.maybe_cookie("latchkeylogin_key").is_none());
}

#[tokio::test]
async fn private_server_admits_allow_listed_emails() {
    let (_provider_server, _provider, provider_uri) = start_provider();
    let (server, state) = broker_with_provider(&provider_uri, false).await;
    state
        .storage
        .add_user(User {
            email: "alice@example.com".to_string(),
        })
        .unwrap();

    let (challenge, _) = pkce::generate_pair();
    let login = start_upstream_login(&server, &challenge).await;

    let callback = server
        .get("/callback")
        .add_query_param("code", &login.nonce_param)
        .add_query_param("state", &login.state_param)
        .add_cookie(Cookie::new(
            "latchkeyupstream_oauth2_request",
            login.upstream_cookie,
        ))
        .add_cookie(Cookie::new("latchkeyreturn_uri", login.return_cookie))
        .await;

    callback.assert_status_see_other();
    assert!(callback.maybe_cookie("latchkeylogin_key").is_some());
}
