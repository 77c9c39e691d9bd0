//! The aggregated identity cookie
//!
//! A user's session is one signed envelope under `<prefix>login_key`
//! carrying every identity they have verified plus, per relying party, the
//! history of which identity was used. The cookie is rewritten (fresh
//! signature, fresh expiry) on every append; between requests the server
//! holds nothing.

use std::collections::HashMap;
use std::time::Duration;

use axum::http::{header::COOKIE, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use cookie::{Cookie, SameSite};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::envelope::{unix_now, Claims, EnvelopeCodec};
use crate::Result;

/// Session cookie lifetime.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Lifetime of the return-URI bounce cookie.
pub const RETURN_URI_TTL: Duration = Duration::from_secs(8 * 60);

/// Cookie name suffix for the session envelope.
pub const LOGIN_KEY_SUFFIX: &str = "login_key";
/// Cookie name suffix for the in-flight authorization request.
pub const AUTH_REQUEST_SUFFIX: &str = "auth_request";
/// Cookie name suffix for the in-flight upstream login.
pub const UPSTREAM_REQUEST_SUFFIX: &str = "upstream_oauth2_request";
/// Cookie name suffix for the post-upstream bounce target.
pub const RETURN_URI_SUFFIX: &str = "return_uri";

/// A verified identity. Immutable once appended; `(id, provider_name)` is
/// the deduplication key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    /// Kind of identifier, currently always `email`
    pub id_type: String,
    /// The identifier itself
    pub id: String,
    /// Display name of the provider that verified it
    pub provider_name: String,
    /// Display name of the user, if the provider supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Email address
    pub email: String,
    /// Whether the provider vouched for the address
    pub email_verified: bool,
}

/// A record that an identity was used to authorize a relying party.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Login {
    /// Kind of identifier
    pub id_type: String,
    /// Identity id
    pub id: String,
    /// Provider that verified the identity
    pub provider_name: String,
    /// Unix seconds of the approval
    pub timestamp: u64,
}

/// Parsed session cookie contents.
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    /// Verified identities in insertion order
    pub identities: Vec<Identity>,
    /// Relying-party client id to login history
    pub logins: HashMap<String, Vec<Login>>,
}

impl SessionData {
    /// Logins for one relying party, newest first.
    #[must_use]
    pub fn previous_logins(&self, client_id: &str) -> Vec<Login> {
        let mut logins = self.logins.get(client_id).cloned().unwrap_or_default();
        logins.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logins
    }

    /// Identities not yet used with this relying party.
    #[must_use]
    pub fn remaining_identities(&self, previous: &[Login]) -> Vec<Identity> {
        self.identities
            .iter()
            .filter(|ident| {
                !previous
                    .iter()
                    .any(|l| l.id == ident.id && l.provider_name == ident.provider_name)
            })
            .cloned()
            .collect()
    }

    /// Find an identity the caller owns.
    #[must_use]
    pub fn find_identity(&self, id: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.id == id)
    }
}

/// Stable hash of a cookie value, used to bind an auth-request envelope to
/// the session that started it.
#[must_use]
pub fn hash_value(value: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(value.as_bytes()))
}

/// Full cookie name for a suffix.
#[must_use]
pub fn cookie_name(prefix: &str, suffix: &str) -> String {
    format!("{prefix}{suffix}")
}

/// Read a cookie value from request headers.
#[must_use]
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for cookie in Cookie::split_parse(raw).flatten() {
            if cookie.name() == name {
                return Some(cookie.value().to_string());
            }
        }
    }
    None
}

/// Build a hardened cookie: `HttpOnly`, `Secure`, `SameSite=Lax`, path `/`,
/// expiry aligned with the envelope's.
#[must_use]
pub fn build_cookie(name: &str, value: &str, max_age: Duration) -> Cookie<'static> {
    Cookie::build((name.to_string(), value.to_string()))
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(cookie::time::Duration::seconds(max_age.as_secs() as i64))
        .build()
}

/// Build a cookie that deletes `name`.
#[must_use]
pub fn clear_cookie(name: &str) -> Cookie<'static> {
    Cookie::build((name.to_string(), String::new()))
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(cookie::time::Duration::seconds(0))
        .build()
}

/// Parse the session cookie from a request. Missing, expired, or
/// tampered cookies all read as an empty session; callers never see an
/// error from here.
#[must_use]
pub fn read_session(codec: &EnvelopeCodec, headers: &HeaderMap, prefix: &str) -> SessionData {
    let name = cookie_name(prefix, LOGIN_KEY_SUFFIX);
    match read_cookie(headers, &name) {
        Some(value) => parse_session_value(codec, &value),
        None => SessionData::default(),
    }
}

/// Parse a raw session cookie value, tolerating failures as empty.
#[must_use]
pub fn parse_session_value(codec: &EnvelopeCodec, value: &str) -> SessionData {
    let Ok(claims) = codec.parse(value) else {
        return SessionData::default();
    };
    session_from_claims(&claims)
}

fn session_from_claims(claims: &Claims) -> SessionData {
    let identities = claims
        .get("identities")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let logins = claims
        .get("logins")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    SessionData { identities, logins }
}

fn session_to_claims(data: &SessionData) -> Result<Claims> {
    let mut claims = Claims::new();
    claims.insert("identities".to_string(), serde_json::to_value(&data.identities)?);
    claims.insert("logins".to_string(), serde_json::to_value(&data.logins)?);
    Ok(claims)
}

/// Append an identity to a session, starting a fresh envelope when the
/// current cookie is absent or invalid. Duplicate `(id, provider_name)`
/// pairs are dropped; the envelope is re-signed either way.
pub fn append_identity(
    codec: &EnvelopeCodec,
    current: Option<&str>,
    identity: Identity,
) -> Result<String> {
    let mut data = match current {
        Some(value) if !value.is_empty() => parse_session_value(codec, value),
        _ => SessionData::default(),
    };

    let duplicate = data
        .identities
        .iter()
        .any(|i| i.id == identity.id && i.provider_name == identity.provider_name);
    if !duplicate {
        data.identities.push(identity);
    }

    codec.build(session_to_claims(&data)?, SESSION_TTL)
}

/// Record that `client_id` was authorized with an identity, timestamped
/// with the server clock.
pub fn append_login(
    codec: &EnvelopeCodec,
    current: &str,
    client_id: &str,
    id_type: &str,
    id: &str,
    provider_name: &str,
) -> Result<String> {
    let mut data = parse_session_value(codec, current);

    data.logins
        .entry(client_id.to_string())
        .or_default()
        .push(Login {
            id_type: id_type.to_string(),
            id: id.to_string(),
            provider_name: provider_name.to_string(),
            timestamp: unix_now(),
        });

    codec.build(session_to_claims(&data)?, SESSION_TTL)
}
