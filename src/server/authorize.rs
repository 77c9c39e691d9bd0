//! Authorization and consent
//!
//! `/auth` validates the relying party's request, snapshots it into a
//! signed cookie, and renders the consent page from the session's
//! identities. `/approve` turns the user's choice into a signed ID token
//! wrapped in a 16-second authorization code. No request state is held on
//! the server between the two.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Form, Query, State};
use axum::http::{HeaderMap, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use super::{authority, with_cookies, AppState};
use crate::envelope::{claim_str, Claims};
use crate::session::{
    append_login, build_cookie, clear_cookie, cookie_name, hash_value, parse_session_value,
    read_cookie, AUTH_REQUEST_SUFFIX, LOGIN_KEY_SUFFIX, RETURN_URI_SUFFIX, RETURN_URI_TTL,
    SESSION_TTL,
};
use crate::storage::Storage;
use crate::templates::ConsentData;
use crate::{Error, Result};

/// Lifetime of the in-flight auth-request cookie.
pub const AUTH_REQUEST_TTL: Duration = Duration::from_secs(8 * 60);
/// Lifetime of issued ID tokens.
pub const ID_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Lifetime of authorization codes; the only bound on replay besides the
/// single-use set.
pub const CODE_TTL: Duration = Duration::from_secs(16);

#[derive(Debug, Deserialize)]
pub(crate) struct AuthQuery {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    redirect_uri: String,
    #[serde(default)]
    response_type: String,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    nonce: String,
    #[serde(default)]
    code_challenge: String,
    #[serde(default)]
    prompt: String,
}

fn error_redirect(redirect_uri: &Url, error: &str, state: &str) -> Response {
    let mut url = redirect_uri.clone();
    url.query_pairs_mut()
        .append_pair("error", error)
        .append_pair("state", state);
    Redirect::to(url.as_str()).into_response()
}

/// `GET /auth` — start an authorization.
pub(crate) async fn auth(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> Result<Response> {
    if query.client_id.is_empty() {
        return Err(Error::RequestMalformed("client_id missing".to_string()));
    }
    if query.redirect_uri.is_empty() {
        return Err(Error::RequestMalformed("redirect_uri missing".to_string()));
    }

    let client_url = Url::parse(&query.client_id)
        .map_err(|_| Error::RequestMalformed("client_id is not a valid URI".to_string()))?;
    let redirect_url = Url::parse(&query.redirect_uri)
        .map_err(|_| Error::RequestMalformed("redirect_uri is not a valid URI".to_string()))?;

    if authority(&client_url) != authority(&redirect_url) {
        return Err(Error::RequestMalformed(
            "redirect_uri must be on the same domain as client_id".to_string(),
        ));
    }

    // From here a usable redirect_uri exists, so protocol errors go back
    // to the relying party instead of surfacing as HTTP errors.
    if query.prompt == "none" {
        return Ok(error_redirect(
            &redirect_url,
            "interaction_required",
            &query.state,
        ));
    }
    if query.response_type.is_empty() {
        return Ok(error_redirect(
            &redirect_url,
            "unsupported_response_type",
            &query.state,
        ));
    }

    let prefix = state.storage.get_prefix();

    let session_value = read_cookie(&headers, &cookie_name(&prefix, LOGIN_KEY_SUFFIX));
    let login_key_hash = session_value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(hash_value)
        .unwrap_or_default();

    let session = session_value
        .as_deref()
        .map(|v| parse_session_value(&state.codec, v))
        .unwrap_or_default();

    let previous_logins = session.previous_logins(&query.client_id);
    let remaining_identities = session.remaining_identities(&previous_logins);

    let mut request_claims = Claims::new();
    request_claims.insert("login_key_hash".to_string(), Value::from(login_key_hash));
    request_claims.insert("client_id".to_string(), Value::from(query.client_id.clone()));
    request_claims.insert(
        "redirect_uri".to_string(),
        Value::from(query.redirect_uri.clone()),
    );
    request_claims.insert("state".to_string(), Value::from(query.state.clone()));
    request_claims.insert("scope".to_string(), Value::from(query.scope.clone()));
    request_claims.insert("nonce".to_string(), Value::from(query.nonce.clone()));
    request_claims.insert(
        "pkce_code_challenge".to_string(),
        Value::from(query.code_challenge.clone()),
    );
    request_claims.insert(
        "response_type".to_string(),
        Value::from(query.response_type.clone()),
    );
    let request_envelope = state.codec.build(request_claims, AUTH_REQUEST_TTL)?;

    let return_uri = match uri.query() {
        Some(q) => format!("{}?{}", uri.path(), q),
        None => uri.path().to_string(),
    };

    let consent = ConsentData {
        display_name: state.storage.get_display_name(),
        client_host: authority(&client_url),
        identities: session.identities.clone(),
        remaining_identities,
        previous_logins,
        providers: state.storage.get_oauth2_providers(),
        return_uri: return_uri.clone(),
        can_email: state.storage.get_smtp_config().is_some(),
    };
    let html = state.templates.consent(&consent);

    Ok(with_cookies(
        Html(html).into_response(),
        vec![
            build_cookie(
                &cookie_name(&prefix, AUTH_REQUEST_SUFFIX),
                &request_envelope,
                AUTH_REQUEST_TTL,
            ),
            build_cookie(
                &cookie_name(&prefix, RETURN_URI_SUFFIX),
                &return_uri,
                RETURN_URI_TTL,
            ),
        ],
    ))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApproveForm {
    identity_id: String,
}

/// `POST /approve` — user consent; mints the ID token and the code.
pub(crate) async fn approve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<ApproveForm>,
) -> Result<Response> {
    let prefix = state.storage.get_prefix();

    let session_value = read_cookie(&headers, &cookie_name(&prefix, LOGIN_KEY_SUFFIX))
        .ok_or_else(|| {
            Error::Unauthenticated("Only logged-in users can access this endpoint".to_string())
        })?;
    // Unlike /auth, an invalid session here is a hard failure.
    state.codec.parse(&session_value)?;
    let session = parse_session_value(&state.codec, &session_value);

    let request_value = read_cookie(&headers, &cookie_name(&prefix, AUTH_REQUEST_SUFFIX))
        .ok_or_else(|| Error::Unauthenticated("no authorization in flight".to_string()))?;
    let request = state.codec.parse(&request_value)?;

    // The approval must come from the same session the request began in.
    if claim_str(&request, "login_key_hash")? != hash_value(&session_value) {
        return Err(Error::Forbidden(
            "login session changed since this request began".to_string(),
        ));
    }

    let identity = session
        .find_identity(&form.identity_id)
        .ok_or_else(|| {
            Error::Forbidden("You don't have permissions for this identity".to_string())
        })?
        .clone();

    let client_id = claim_str(&request, "client_id")?.to_string();
    let new_session = append_login(
        &state.codec,
        &session_value,
        &client_id,
        &identity.id_type,
        &identity.id,
        &identity.provider_name,
    )?;

    let scope = claim_str(&request, "scope")?;
    let email_requested = scope.split(' ').any(|s| s == "email");
    let profile_requested = scope.split(' ').any(|s| s == "profile");

    let mut id_claims = Claims::new();
    id_claims.insert(
        "iss".to_string(),
        Value::from(state.storage.get_root_uri()),
    );
    id_claims.insert("sub".to_string(), Value::from(identity.id.clone()));
    id_claims.insert(
        "aud".to_string(),
        Value::Array(vec![Value::from(client_id.clone())]),
    );
    id_claims.insert(
        "nonce".to_string(),
        Value::from(claim_str(&request, "nonce")?),
    );
    if email_requested {
        id_claims.insert("email".to_string(), Value::from(identity.email.clone()));
        id_claims.insert(
            "email_verified".to_string(),
            Value::from(identity.email_verified),
        );
    }
    if profile_requested {
        if let Some(name) = identity.name.as_deref().filter(|n| !n.is_empty()) {
            id_claims.insert("name".to_string(), Value::from(name));
        }
    }
    let signed_id_token = state.codec.build(id_claims, ID_TOKEN_TTL)?;

    let mut code_claims = Claims::new();
    code_claims.insert("sub".to_string(), Value::from(identity.email.clone()));
    code_claims.insert("id_token".to_string(), Value::from(signed_id_token));
    code_claims.insert(
        "pkce_code_challenge".to_string(),
        Value::from(claim_str(&request, "pkce_code_challenge")?),
    );
    let signed_code = state.codec.build(code_claims, CODE_TTL)?;

    let redirect_uri = claim_str(&request, "redirect_uri")?;
    let response_type = claim_str(&request, "response_type")?;

    let redirect = if response_type == "none" {
        Redirect::to(redirect_uri).into_response()
    } else {
        let mut url = Url::parse(redirect_uri)
            .map_err(|_| Error::Internal("stored redirect_uri unparseable".to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("code", &signed_code)
            .append_pair("state", claim_str(&request, "state")?)
            .append_pair("scope", scope);
        Redirect::to(url.as_str()).into_response()
    };

    Ok(with_cookies(
        redirect,
        vec![
            clear_cookie(&cookie_name(&prefix, AUTH_REQUEST_SUFFIX)),
            build_cookie(
                &cookie_name(&prefix, LOGIN_KEY_SUFFIX),
                &new_session,
                SESSION_TTL,
            ),
        ],
    ))
}
