//! Signed token envelopes
//!
//! Every piece of cross-request state — the session cookie, the in-flight
//! auth request, the upstream login request, authorization codes, access
//! tokens, ID tokens — travels as a short-lived RS256 JWT built and checked
//! here. Nothing else in the crate constructs or verifies tokens; keeping
//! one codec is what makes "no server-side sessions" safe to say.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, decode_header, encode, Algorithm, Header, Validation};
use serde_json::Value;

use crate::keys::KeyManager;
use crate::{Error, Result};

/// Envelope claims: a flat JSON object.
pub type Claims = serde_json::Map<String, Value>;

/// Current time as unix seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Extract a string claim. Absent or non-string claims are an error,
/// never an empty string.
pub fn claim_str<'a>(claims: &'a Claims, name: &str) -> Result<&'a str> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MissingClaim(name.to_string()))
}

/// Extract a numeric claim as u64.
pub fn claim_u64(claims: &Claims, name: &str) -> Result<u64> {
    claims
        .get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::MissingClaim(name.to_string()))
}

/// Builds and verifies the signed envelopes used as cookies, codes, and
/// tokens.
pub struct EnvelopeCodec {
    keys: Arc<KeyManager>,
}

impl EnvelopeCodec {
    /// Create a codec over the server's key set.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    /// Sign `claims` with the current key, stamping `iat` now and `exp`
    /// at now + `ttl`.
    pub fn build(&self, mut claims: Claims, ttl: Duration) -> Result<String> {
        let iat = unix_now();
        claims.insert("iat".to_string(), Value::from(iat));
        claims.insert("exp".to_string(), Value::from(iat + ttl.as_secs()));

        let (kid, key) = self.keys.signing_key();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());

        encode(&header, &claims, key).map_err(|e| Error::Internal(format!("signing failed: {e}")))
    }

    /// Verify signature and lifetime, returning the claims.
    pub fn parse(&self, token: &str) -> Result<Claims> {
        self.parse_at(token, unix_now())
    }

    /// [`parse`](Self::parse) with an explicit clock, so lifetime behavior
    /// is checkable without waiting.
    pub fn parse_at(&self, token: &str, now: u64) -> Result<Claims> {
        let header =
            decode_header(token).map_err(|e| Error::Verification(format!("bad token: {e}")))?;

        // Lifetime is enforced manually below against the caller's clock.
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = match header.kid.as_deref() {
            Some(kid) => {
                let key = self
                    .keys
                    .decoding_key(Some(kid))
                    .ok_or_else(|| Error::Verification(format!("unknown key id {kid}")))?;
                decode::<Claims>(token, key, &validation)
                    .map_err(|e| Error::Verification(format!("invalid signature: {e}")))?
                    .claims
            }
            None => {
                // Tokens from before kids were stamped: try every key.
                let mut last_err = Error::Verification("no verification keys".to_string());
                let mut found = None;
                for key in self.keys.decoding_keys() {
                    match decode::<Claims>(token, key, &validation) {
                        Ok(data) => {
                            found = Some(data.claims);
                            break;
                        }
                        Err(e) => last_err = Error::Verification(format!("invalid signature: {e}")),
                    }
                }
                found.ok_or(last_err)?
            }
        };

        let iat = claim_u64(&claims, "iat")?;
        let exp = claim_u64(&claims, "exp")?;
        if now < iat {
            return Err(Error::Verification("token not yet valid".to_string()));
        }
        if now > exp {
            return Err(Error::Verification("token expired".to_string()));
        }

        Ok(claims)
    }
}
