//! OIDC discovery, JWKS, registration, and userinfo endpoints

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{authority, AppState};
use crate::envelope::claim_str;
use crate::storage::Storage;
use crate::{Error, Result};

/// OIDC provider metadata served at `/.well-known/openid-configuration`.
#[derive(Debug, Serialize)]
pub struct OpenIdConfiguration {
    /// Issuer URL
    pub issuer: String,
    /// Authorization endpoint URL
    pub authorization_endpoint: String,
    /// Token endpoint URL
    pub token_endpoint: String,
    /// Userinfo endpoint URL
    pub userinfo_endpoint: String,
    /// JWKS URL
    pub jwks_uri: String,
    /// Dynamic registration endpoint URL
    pub registration_endpoint: String,
    /// Supported scopes
    pub scopes_supported: Vec<String>,
    /// Supported response types
    pub response_types_supported: Vec<String>,
    /// Supported ID token signing algorithms
    pub id_token_signing_alg_values_supported: Vec<String>,
    /// Supported PKCE challenge methods
    pub code_challenge_methods_supported: Vec<String>,
    /// Supported subject identifier types
    pub subject_types_supported: Vec<String>,
    /// Supported token endpoint auth methods
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

fn cors_json<T: Serialize>(body: &T) -> Response {
    (
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::CONTENT_TYPE, "application/json;charset=UTF-8"),
        ],
        serde_json::to_string_pretty(body).unwrap_or_default(),
    )
        .into_response()
}

/// `GET /.well-known/openid-configuration`
pub(crate) async fn openid_configuration(State(state): State<Arc<AppState>>) -> Response {
    let root = state.storage.get_root_uri();

    let doc = OpenIdConfiguration {
        issuer: root.clone(),
        authorization_endpoint: format!("{root}/auth"),
        token_endpoint: format!("{root}/token"),
        userinfo_endpoint: format!("{root}/userinfo"),
        jwks_uri: format!("{root}/jwks"),
        registration_endpoint: format!("{root}/register"),
        scopes_supported: vec![
            "openid".to_string(),
            "email".to_string(),
            "profile".to_string(),
        ],
        response_types_supported: vec!["code".to_string()],
        id_token_signing_alg_values_supported: vec!["RS256".to_string()],
        code_challenge_methods_supported: vec!["S256".to_string()],
        subject_types_supported: vec!["public".to_string()],
        token_endpoint_auth_methods_supported: vec!["none".to_string()],
    };

    cors_json(&doc)
}

/// `GET /jwks`
pub(crate) async fn jwks(State(state): State<Arc<AppState>>) -> Response {
    cors_json(state.keys.public_jwks())
}

#[derive(Debug, Deserialize)]
pub(crate) struct RegistrationRequest {
    #[serde(default)]
    redirect_uris: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RegistrationResponse {
    client_id: String,
}

/// `POST /register` — dynamic client registration.
///
/// No secret is issued; the client id is derived from the host of the
/// first redirect URI, so whoever controls that host owns the client id.
pub(crate) async fn register(
    Json(request): Json<RegistrationRequest>,
) -> Result<(StatusCode, Json<RegistrationResponse>)> {
    let first = request
        .redirect_uris
        .first()
        .ok_or_else(|| Error::RequestMalformed("Need at least one redirect_uri".to_string()))?;

    let parsed = Url::parse(first)
        .map_err(|e| Error::RequestMalformed(format!("invalid redirect_uri: {e}")))?;

    let client_id = format!("https://{}", authority(&parsed));

    Ok((StatusCode::CREATED, Json(RegistrationResponse { client_id })))
}

#[derive(Debug, Serialize)]
pub(crate) struct UserinfoResponse {
    sub: String,
    email: String,
}

/// `GET /userinfo` — subject info for a bearer access token.
pub(crate) async fn userinfo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UserinfoResponse>> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let parts: Vec<&str> = auth_header.split(' ').collect();
    if parts.len() != 2 {
        return Err(Error::RequestMalformed(
            "Invalid Authorization header".to_string(),
        ));
    }

    let claims = state.codec.parse(parts[1])?;
    let sub = claim_str(&claims, "sub")?;

    Ok(Json(UserinfoResponse {
        sub: sub.to_string(),
        email: sub.to_string(),
    }))
}
