//! Federated login via upstream OAuth2/OIDC
//!
//! `/login-oauth2` starts the code flow: a PKCE pair, `state`, and `nonce`
//! are minted and stashed in a signed cookie, then the browser is sent to
//! the provider. `/callback` finishes it: the code is exchanged with the
//! stored verifier, the returned ID token is verified against the
//! provider's key set (nonce included), and the resulting identity is
//! appended to the session cookie before bouncing back to the stored
//! return URI. Every failure aborts with no cookie mutation; the in-flight
//! cookie simply expires if never consumed.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::envelope::{claim_str, Claims};
use crate::pkce;
use crate::server::{with_cookies, AppState};
use crate::session::{
    append_identity, build_cookie, clear_cookie, cookie_name, read_cookie, Identity,
    LOGIN_KEY_SUFFIX, RETURN_URI_SUFFIX, SESSION_TTL, UPSTREAM_REQUEST_SUFFIX,
};
use crate::storage::{OAuth2Provider, Storage};
use crate::upstream::metadata::{decoding_key_for, MetadataManager};
use crate::{Error, Result};

/// Lifetime of the in-flight upstream request cookie.
pub const UPSTREAM_REQUEST_TTL: Duration = Duration::from_secs(8 * 60);

/// Scope requested upstream when the provider configures none.
const DEFAULT_UPSTREAM_SCOPE: &str = "openid email profile";

/// A fresh random value with 256 bits of entropy, base64url.
#[must_use]
pub fn random_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginQuery {
    oauth2_provider_id: String,
}

/// `GET /login-oauth2` — redirect to the provider's authorization endpoint.
pub(crate) async fn login_oauth2(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LoginQuery>,
) -> Result<Response> {
    let provider = state
        .storage
        .get_oauth2_provider(&query.oauth2_provider_id)
        .ok_or_else(|| {
            Error::RequestMalformed(format!("unknown provider {}", query.oauth2_provider_id))
        })?;

    let scope = if provider.scope.is_empty() {
        DEFAULT_UPSTREAM_SCOPE
    } else {
        provider.scope.as_str()
    };

    let authorization_endpoint = if provider.openid_connect {
        state.metadata.get_meta(&provider).await?.authorization_endpoint
    } else {
        provider.authorization_uri.clone()
    };
    if authorization_endpoint.is_empty() {
        return Err(Error::Internal(format!(
            "provider {} has no authorization endpoint",
            provider.id
        )));
    }

    let (code_challenge, code_verifier) = pkce::generate_pair();
    let login_state = random_key();
    let nonce = random_key();

    let mut claims = Claims::new();
    claims.insert("provider_id".to_string(), Value::from(provider.id.clone()));
    claims.insert("state".to_string(), Value::from(login_state.clone()));
    claims.insert("nonce".to_string(), Value::from(nonce.clone()));
    claims.insert(
        "pkce_code_verifier".to_string(),
        Value::from(code_verifier),
    );
    let envelope = state.codec.build(claims, UPSTREAM_REQUEST_TTL)?;

    let root_uri = state.storage.get_root_uri();
    let callback_uri = format!("{root_uri}/callback");
    let client_id = if provider.client_id.is_empty() {
        root_uri.clone()
    } else {
        provider.client_id.clone()
    };

    let mut url = Url::parse(&authorization_endpoint)
        .map_err(|e| Error::Internal(format!("bad authorization endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &client_id)
        .append_pair("redirect_uri", &callback_uri)
        .append_pair("state", &login_state)
        .append_pair("scope", scope)
        .append_pair("code_challenge_method", "S256")
        .append_pair("code_challenge", &code_challenge)
        .append_pair("nonce", &nonce)
        .append_pair("prompt", "consent");

    debug!(provider = %provider.id, "starting upstream login");

    let prefix = state.storage.get_prefix();
    let cookie = build_cookie(
        &cookie_name(&prefix, UPSTREAM_REQUEST_SUFFIX),
        &envelope,
        UPSTREAM_REQUEST_TTL,
    );
    Ok(with_cookies(
        Redirect::to(url.as_str()).into_response(),
        vec![cookie],
    ))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
}

/// `GET /callback` — exchange the provider's code, verify the identity,
/// append it to the session.
pub(crate) async fn callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Result<Response> {
    let prefix = state.storage.get_prefix();

    let envelope = read_cookie(&headers, &cookie_name(&prefix, UPSTREAM_REQUEST_SUFFIX))
        .ok_or_else(|| Error::Unauthenticated("no upstream login in flight".to_string()))?;
    let request = state.codec.parse(&envelope)?;

    // The provider must echo the state we generated at /login-oauth2.
    let stored_state = claim_str(&request, "state")?;
    if query.state.as_deref() != Some(stored_state) {
        return Err(Error::Forbidden("state mismatch".to_string()));
    }

    let provider_id = claim_str(&request, "provider_id")?;
    let provider = state
        .storage
        .get_oauth2_provider(provider_id)
        .ok_or_else(|| Error::Internal(format!("provider {provider_id} no longer configured")))?;

    let code = query
        .code
        .ok_or_else(|| Error::RequestMalformed("code missing".to_string()))?;

    let token_response = exchange_code(
        &state,
        &provider,
        &code,
        claim_str(&request, "pkce_code_verifier")?,
    )
    .await?;

    let (email, name) = if provider.openid_connect {
        let id_token = token_response.id_token.as_deref().ok_or_else(|| {
            Error::UpstreamTransport(format!("provider {} returned no id_token", provider.id))
        })?;

        let id_claims = verify_upstream_id_token(&state.metadata, &provider, id_token).await?;

        let nonce = match id_claims.get("nonce") {
            Some(Value::String(nonce)) => nonce.as_str(),
            Some(_) => {
                return Err(Error::RequestMalformed("invalid nonce format".to_string()));
            }
            None => return Err(Error::RequestMalformed("nonce missing".to_string())),
        };
        if nonce != claim_str(&request, "nonce")? {
            return Err(Error::Forbidden("invalid nonce".to_string()));
        }

        let email = claim_str(&id_claims, "email")
            .map_err(|_| {
                Error::UpstreamTransport(format!("provider {} returned no email", provider.id))
            })?
            .to_string();
        let name = id_claims
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        (email, name)
    } else {
        let email = fetch_profile_email(&state, &provider, &token_response.access_token).await?;
        (email, None)
    };

    let root_uri = state.storage.get_root_uri();
    let return_uri = read_cookie(&headers, &cookie_name(&prefix, RETURN_URI_SUFFIX))
        .ok_or_else(|| Error::RequestMalformed("no return URI".to_string()))?;

    // Non-public servers only admit allow-listed emails.
    if !state.storage.get_public() {
        let known = state.storage.get_users().iter().any(|u| u.email == email);
        if !known {
            let mut no_account = Url::parse(&format!("{root_uri}/no-account"))
                .map_err(|e| Error::Internal(e.to_string()))?;
            no_account
                .query_pairs_mut()
                .append_pair("return_uri", &return_uri);
            return Ok(Redirect::to(no_account.as_str()).into_response());
        }
    }

    let identity = Identity {
        id_type: "email".to_string(),
        id: email.clone(),
        provider_name: provider.name.clone(),
        name,
        email,
        email_verified: true,
    };

    let current = read_cookie(&headers, &cookie_name(&prefix, LOGIN_KEY_SUFFIX));
    let new_session = append_identity(&state.codec, current.as_deref(), identity)?;

    Ok(with_cookies(
        Redirect::to(&return_uri).into_response(),
        vec![
            build_cookie(
                &cookie_name(&prefix, LOGIN_KEY_SUFFIX),
                &new_session,
                SESSION_TTL,
            ),
            clear_cookie(&cookie_name(&prefix, UPSTREAM_REQUEST_SUFFIX)),
            clear_cookie(&cookie_name(&prefix, RETURN_URI_SUFFIX)),
        ],
    ))
}

#[derive(Debug, Deserialize)]
struct UpstreamTokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
}

/// Redeem the authorization code at the provider's token endpoint.
async fn exchange_code(
    state: &AppState,
    provider: &OAuth2Provider,
    code: &str,
    code_verifier: &str,
) -> Result<UpstreamTokenResponse> {
    // OIDC providers normally publish their token endpoint, but a static
    // token_uri overrides it for the ones whose published endpoint does
    // not work.
    let token_endpoint = if provider.openid_connect && provider.token_uri.is_empty() {
        state.metadata.get_meta(provider).await?.token_endpoint
    } else {
        provider.token_uri.clone()
    };
    if token_endpoint.is_empty() {
        return Err(Error::Internal(format!(
            "provider {} has no token endpoint",
            provider.id
        )));
    }

    let root_uri = state.storage.get_root_uri();
    let callback_uri = format!("{root_uri}/callback");
    let client_id = if provider.client_id.is_empty() {
        root_uri
    } else {
        provider.client_id.clone()
    };

    let params = [
        ("code", code),
        ("client_id", client_id.as_str()),
        ("client_secret", provider.client_secret.as_str()),
        ("redirect_uri", callback_uri.as_str()),
        ("grant_type", "authorization_code"),
        ("code_verifier", code_verifier),
    ];

    let response = state
        .http
        .post(&token_endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&params)
        .send()
        .await?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        warn!(provider = %provider.id, %status, "token exchange failed");
        return Err(Error::UpstreamTransport(format!(
            "token endpoint returned HTTP {status}"
        )));
    }

    Ok(response.json().await?)
}

/// Verify an upstream ID token against the provider's key set. On a
/// verification failure the key set is refreshed once and the check
/// retried, covering provider key rotation.
async fn verify_upstream_id_token(
    metadata: &MetadataManager,
    provider: &OAuth2Provider,
    token: &str,
) -> Result<Claims> {
    let header =
        decode_header(token).map_err(|e| Error::Verification(format!("bad id_token: {e}")))?;
    let algorithm = match header.alg {
        alg @ (Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::ES256
        | Algorithm::ES384) => alg,
        other => {
            return Err(Error::Verification(format!(
                "unsupported id_token algorithm {other:?}"
            )));
        }
    };

    let mut validation = Validation::new(algorithm);
    validation.leeway = 60;
    validation.validate_aud = false;

    let kid = header.kid.as_deref();

    let jwks = metadata.keyset(provider).await?;
    if let Some(key) = decoding_key_for(&jwks, kid) {
        if let Ok(data) = decode::<Claims>(token, &key, &validation) {
            return Ok(data.claims);
        }
    }

    // Unknown kid or bad signature: the provider may have rotated keys.
    let meta = metadata.get_meta(provider).await?;
    let jwks = metadata.refresh_keyset(&meta.jwks_uri).await?;
    let key = decoding_key_for(&jwks, kid)
        .ok_or_else(|| Error::Verification("no matching provider key".to_string()))?;
    decode::<Claims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| Error::Verification(format!("id_token verification failed: {e}")))
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    #[allow(dead_code)]
    verified: bool,
}

/// Fetch the user's email from a plain-OAuth2 provider's profile API.
async fn fetch_profile_email(
    state: &AppState,
    provider: &OAuth2Provider,
    access_token: &str,
) -> Result<String> {
    match provider.id.as_str() {
        "github" => {
            let response = state
                .http
                .get("https://api.github.com/user/emails")
                .header(reqwest::header::AUTHORIZATION, format!("Bearer {access_token}"))
                .header(reqwest::header::USER_AGENT, "latchkey")
                .send()
                .await?;

            if response.status() != reqwest::StatusCode::OK {
                return Err(Error::UpstreamTransport(format!(
                    "profile fetch returned HTTP {}",
                    response.status()
                )));
            }

            let emails: Vec<GitHubEmail> = response.json().await?;
            emails
                .into_iter()
                .find(|e| e.primary)
                .map(|e| e.email)
                .ok_or_else(|| Error::UpstreamTransport("no primary email".to_string()))
        }
        other => Err(Error::UpstreamTransport(format!(
            "no profile fetcher for provider {other}"
        ))),
    }
}
