//! Forward-auth validation
//!
//! Reverse proxies ask one question: who is this request? The answer is
//! the first identity in the session cookie. With passthrough enabled,
//! every failure reads as "nobody" instead of an error so the proxy can
//! render its own unauthenticated page.

use axum::http::HeaderMap;
use serde::Serialize;

use crate::envelope::EnvelopeCodec;
use crate::session::{cookie_name, parse_session_value, read_cookie, LOGIN_KEY_SUFFIX};
use crate::storage::Storage;
use crate::{Error, Result};

/// The primary identity of a validated request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Validation {
    /// Identity id
    pub id: String,
    /// Kind of identifier
    pub id_type: String,
}

/// Validate the session cookie on an inbound request.
///
/// Returns the first identity of the session. Without passthrough every
/// failure is an [`Error::Unauthenticated`]; with it, `Ok(None)`.
pub fn validate(
    codec: &EnvelopeCodec,
    storage: &dyn Storage,
    headers: &HeaderMap,
) -> Result<Option<Validation>> {
    let passthrough = storage.get_forward_auth_passthrough();

    let fail = |message: &str| {
        if passthrough {
            Ok(None)
        } else {
            Err(Error::Unauthenticated(message.to_string()))
        }
    };

    let name = cookie_name(&storage.get_prefix(), LOGIN_KEY_SUFFIX);
    let Some(value) = read_cookie(headers, &name) else {
        return fail("no session cookie");
    };

    if codec.parse(&value).is_err() {
        return fail("invalid session cookie");
    }

    let session = parse_session_value(codec, &value);
    let Some(identity) = session.identities.first() else {
        return fail("session has no identities");
    };

    Ok(Some(Validation {
        id: identity.id.clone(),
        id_type: identity.id_type.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyManager;
    use crate::session::{append_identity, Identity};
    use crate::storage::JsonStorage;
    use axum::http::header::COOKIE;
    use std::sync::Arc;

    fn setup() -> (EnvelopeCodec, JsonStorage) {
        let path = std::env::temp_dir()
            .join("latchkey_validate_tests")
            .join(format!("{}.json", uuid::Uuid::new_v4()));
        let storage = JsonStorage::new(path).unwrap();
        storage.set_prefix("latchkey").unwrap();
        let keys = Arc::new(KeyManager::load_or_generate(&storage).unwrap());
        (EnvelopeCodec::new(keys), storage)
    }

    fn session_headers(codec: &EnvelopeCodec) -> HeaderMap {
        let value = append_identity(
            codec,
            None,
            Identity {
                id_type: "email".to_string(),
                id: "alice@example.com".to_string(),
                provider_name: "google".to_string(),
                name: None,
                email: "alice@example.com".to_string(),
                email_verified: true,
            },
        )
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            format!("latchkeylogin_key={value}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn valid_session_returns_first_identity() {
        let (codec, storage) = setup();
        let headers = session_headers(&codec);

        let validation = validate(&codec, &storage, &headers).unwrap().unwrap();
        assert_eq!(validation.id, "alice@example.com");
        assert_eq!(validation.id_type, "email");
    }

    #[test]
    fn missing_cookie_errors_without_passthrough() {
        let (codec, storage) = setup();
        let headers = HeaderMap::new();

        match validate(&codec, &storage, &headers) {
            Err(Error::Unauthenticated(_)) => {}
            other => panic!("expected Unauthenticated, got {other:?}"),
        }
    }

    #[test]
    fn passthrough_downgrades_failures_to_none() {
        let (codec, storage) = setup();
        storage.set_forward_auth_passthrough(true).unwrap();

        let headers = HeaderMap::new();
        assert!(validate(&codec, &storage, &headers).unwrap().is_none());

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "latchkeylogin_key=garbage".parse().unwrap());
        assert!(validate(&codec, &storage, &headers).unwrap().is_none());
    }

    #[test]
    fn passthrough_still_returns_valid_identities() {
        let (codec, storage) = setup();
        storage.set_forward_auth_passthrough(true).unwrap();
        let headers = session_headers(&codec);

        assert!(validate(&codec, &storage, &headers).unwrap().is_some());
    }
}
