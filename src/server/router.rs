//! HTTP router and global response headers

use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use super::{authorize, oidc, token, AppState};
use crate::storage::Storage;
use crate::upstream::{fedcm, oauth2};

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(oidc::openid_configuration),
        )
        .route("/jwks", get(oidc::jwks))
        .route("/register", post(oidc::register))
        .route("/userinfo", get(oidc::userinfo))
        .route("/auth", get(authorize::auth))
        .route("/approve", post(authorize::approve))
        .route("/token", post(token::token))
        .route("/login-oauth2", get(oauth2::login_oauth2))
        .route("/callback", get(oauth2::callback))
        .route("/no-account", get(no_account));

    if state.storage.get_fedcm_enabled() {
        router = router
            .route("/login-fedcm", get(fedcm::login_fedcm))
            .route("/complete-login-fedcm", post(fedcm::complete_login_fedcm));
    }

    router
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Stamp the security headers every response carries.
async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("frame-ancestors 'none'"),
    );
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    response
}

#[derive(Debug, Deserialize)]
struct NoAccountQuery {
    #[serde(default)]
    return_uri: String,
}

/// `GET /no-account` — shown when a non-public server rejects an email.
async fn no_account(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NoAccountQuery>,
) -> impl IntoResponse {
    Html(state.templates.no_account(&query.return_uri))
}
