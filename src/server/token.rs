//! The token endpoint
//!
//! Redeems an authorization-code envelope for the embedded ID token plus a
//! short-lived access token. The code's 16-second expiry bounds replay;
//! the [`SeenCodes`] set closes the remaining window by rejecting any code
//! digest it has already redeemed.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::AppState;
use crate::envelope::{claim_str, Claims};
use crate::pkce;
use crate::server::authorize::CODE_TTL;
use crate::{Error, Result};

/// How many redeemed code digests to remember.
const SEEN_CODES_CAPACITY: usize = 4096;

/// Bounded set of redeemed authorization-code digests, FIFO-evicted.
/// Capacity far exceeds the number of codes that can be alive inside
/// their 16-second window on one instance.
pub struct SeenCodes {
    inner: Mutex<SeenInner>,
    capacity: usize,
}

struct SeenInner {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenCodes {
    /// Create a set remembering up to `capacity` digests.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(SeenInner {
                order: VecDeque::new(),
                set: HashSet::new(),
            }),
            capacity,
        }
    }

    /// Record a code; `true` if this is its first redemption.
    pub fn first_use(&self, code: &str) -> bool {
        let digest = URL_SAFE_NO_PAD.encode(Sha256::digest(code.as_bytes()));
        let mut inner = self.inner.lock();

        if inner.set.contains(&digest) {
            return false;
        }

        if inner.order.len() >= self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.set.remove(&evicted);
            }
        }
        inner.order.push_back(digest.clone());
        inner.set.insert(digest);
        true
    }
}

impl Default for SeenCodes {
    fn default() -> Self {
        Self::new(SEEN_CODES_CAPACITY)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenForm {
    #[serde(default)]
    code: String,
    #[serde(default)]
    code_verifier: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: u64,
    id_token: String,
}

/// `POST /token` — exchange an authorization code for tokens.
pub(crate) async fn token(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TokenForm>,
) -> Result<Response> {
    let claims = state.codec.parse(&form.code)?;

    let id_token = claim_str(&claims, "id_token")?.to_string();
    let challenge = claim_str(&claims, "pkce_code_challenge")?;

    if challenge.is_empty() {
        if !form.code_verifier.is_empty() {
            return Err(Error::Verification(
                "code_verifier provided for request that did not include code_challenge"
                    .to_string(),
            ));
        }
    } else if !pkce::verify(challenge, &form.code_verifier) {
        return Err(Error::Verification("Invalid code_verifier".to_string()));
    }

    if !state.seen_codes.first_use(&form.code) {
        return Err(Error::Verification("code already redeemed".to_string()));
    }

    let mut access_claims = Claims::new();
    access_claims.insert("sub".to_string(), Value::from(claim_str(&claims, "sub")?));
    let access_token = state.codec.build(access_claims, CODE_TTL)?;

    let body = TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in: 3600,
        id_token,
    };

    Ok((
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::CACHE_CONTROL, "no-store"),
            (header::CONTENT_TYPE, "application/json;charset=UTF-8"),
        ],
        serde_json::to_string_pretty(&body)?,
    )
        .into_response())
}
