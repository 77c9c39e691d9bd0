//! FedCM assertion login
//!
//! The browser mediates the federation: `/login-fedcm` shows the chooser,
//! and `/complete-login-fedcm` receives an identity assertion token. The
//! token is parsed once without verification purely to learn the issuer,
//! then re-parsed with full signature verification against that issuer's
//! freshly fetched key set.

use std::sync::Arc;

use axum::extract::{Form, Query, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{Html, IntoResponse, Redirect, Response};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::envelope::{claim_str, Claims};
use crate::server::{with_cookies, AppState};
use crate::session::{
    append_identity, build_cookie, clear_cookie, cookie_name, read_cookie, read_session, Identity,
    LOGIN_KEY_SUFFIX, RETURN_URI_SUFFIX, RETURN_URI_TTL, SESSION_TTL,
};
use crate::storage::Storage;
use crate::templates::FedCmData;
use crate::upstream::metadata::decoding_key_for;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
pub(crate) struct ChooserQuery {
    #[serde(default)]
    return_uri: String,
}

/// `GET /login-fedcm` — render the provider chooser.
pub(crate) async fn login_fedcm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ChooserQuery>,
) -> Result<Response> {
    let prefix = state.storage.get_prefix();
    let session = read_session(&state.codec, &headers, &prefix);

    let html = state.templates.fedcm_chooser(&FedCmData {
        display_name: state.storage.get_display_name(),
        identities: session.identities,
    });

    let return_cookie = build_cookie(
        &cookie_name(&prefix, RETURN_URI_SUFFIX),
        &query.return_uri,
        RETURN_URI_TTL,
    );
    Ok(with_cookies(Html(html).into_response(), vec![return_cookie]))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompleteForm {
    #[serde(rename = "fedcm-token")]
    fedcm_token: String,
}

/// `POST /complete-login-fedcm` — verify the assertion and append the
/// identity.
pub(crate) async fn complete_login_fedcm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<CompleteForm>,
) -> Result<Response> {
    let issuer = unverified_issuer(&form.fedcm_token)?;
    debug!(%issuer, "verifying FedCM assertion");

    // The issuer is caller-supplied, so both the discovery document and
    // the key set are fetched fresh rather than trusted from cache.
    let meta = state.metadata.discover(&issuer).await?;
    if meta.jwks_uri.is_empty() {
        return Err(Error::UpstreamTransport(format!(
            "issuer {issuer} advertises no jwks_uri"
        )));
    }
    let jwks = state.metadata.refresh_keyset(&meta.jwks_uri).await?;

    let header = decode_header(&form.fedcm_token)
        .map_err(|e| Error::Verification(format!("bad assertion: {e}")))?;
    let algorithm = match header.alg {
        alg @ (Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::ES256
        | Algorithm::ES384) => alg,
        other => {
            return Err(Error::Verification(format!(
                "unsupported assertion algorithm {other:?}"
            )));
        }
    };
    let key = decoding_key_for(&jwks, header.kid.as_deref())
        .ok_or_else(|| Error::Verification("no matching issuer key".to_string()))?;

    let mut validation = Validation::new(algorithm);
    validation.leeway = 60;
    validation.validate_aud = false;
    let claims = decode::<Claims>(&form.fedcm_token, &key, &validation)
        .map_err(|e| Error::Verification(format!("assertion verification failed: {e}")))?
        .claims;

    let email = claim_str(&claims, "email")?.to_string();
    let name = claims
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    let prefix = state.storage.get_prefix();
    let return_uri = read_cookie(&headers, &cookie_name(&prefix, RETURN_URI_SUFFIX))
        .ok_or_else(|| Error::RequestMalformed("no return URI".to_string()))?;

    let identity = Identity {
        id_type: "email".to_string(),
        id: email.clone(),
        provider_name: issuer,
        name,
        email,
        email_verified: true,
    };

    let current = read_cookie(&headers, &cookie_name(&prefix, LOGIN_KEY_SUFFIX));
    let new_session = append_identity(&state.codec, current.as_deref(), identity)?;

    let mut response = with_cookies(
        Redirect::to(&return_uri).into_response(),
        vec![
            build_cookie(
                &cookie_name(&prefix, LOGIN_KEY_SUFFIX),
                &new_session,
                SESSION_TTL,
            ),
            clear_cookie(&cookie_name(&prefix, RETURN_URI_SUFFIX)),
        ],
    );
    response
        .headers_mut()
        .insert("Set-Login", HeaderValue::from_static("logged-in"));
    Ok(response)
}

/// Read the `iss` claim without verifying the signature. The result is
/// only ever used to decide which keys to verify with.
fn unverified_issuer(token: &str) -> Result<String> {
    let header =
        decode_header(token).map_err(|e| Error::Verification(format!("bad assertion: {e}")))?;

    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_aud = false;
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let claims = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| Error::Verification(format!("bad assertion: {e}")))?
        .claims;

    Ok(claim_str(&claims, "iss")?.to_string())
}
