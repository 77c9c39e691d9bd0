//! Signing key management
//!
//! Loads the server's RSA key set from storage, generating a 2048-bit key
//! on first start. The private side backs every envelope signature; the
//! public side is derived once and served verbatim at `/jwks`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::storage::{Storage, StoredKey};
use crate::{Error, Result};

/// A public RSA key in JWK form, exactly as served at `/jwks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicJwk {
    /// Key type, always `RSA`
    pub kty: String,
    /// Intended algorithm, always `RS256`
    pub alg: String,
    /// Key use, always `sig`
    #[serde(rename = "use")]
    pub key_use: String,
    /// Key id
    pub kid: String,
    /// Modulus, base64url
    pub n: String,
    /// Exponent, base64url
    pub e: String,
}

/// The public JWKS document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicJwks {
    /// Public keys, signing key first
    pub keys: Vec<PublicJwk>,
}

struct KeyPair {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    public: PublicJwk,
}

/// Holds the server's signing keys and the cached public JWKS view.
///
/// The public view is computed once at construction and lives for the
/// process lifetime; rotation requires a restart.
pub struct KeyManager {
    keys: Vec<KeyPair>,
    public_jwks: PublicJwks,
}

impl KeyManager {
    /// Load keys from storage, generating and persisting one if empty.
    pub fn load_or_generate(storage: &dyn Storage) -> Result<Self> {
        let mut stored = storage.get_keys();

        if stored.is_empty() {
            info!("no signing key in storage, generating RSA-2048 key");
            let key = generate_stored_key()?;
            storage.add_key(key.clone())?;
            stored.push(key);
        }

        let keys = stored
            .iter()
            .map(|s| key_pair_from_stored(s))
            .collect::<Result<Vec<_>>>()?;

        let public_jwks = PublicJwks {
            keys: keys.iter().map(|k| k.public.clone()).collect(),
        };

        Ok(Self { keys, public_jwks })
    }

    /// The key used to sign new envelopes.
    #[must_use]
    pub fn signing_key(&self) -> (&str, &EncodingKey) {
        let key = &self.keys[0];
        (&key.kid, &key.encoding)
    }

    /// Look up a verification key by kid. `None` falls back to the
    /// signing key, covering tokens minted before kids were recorded.
    #[must_use]
    pub fn decoding_key(&self, kid: Option<&str>) -> Option<&DecodingKey> {
        match kid {
            Some(kid) => self
                .keys
                .iter()
                .find(|k| k.kid == kid)
                .map(|k| &k.decoding),
            None => self.keys.first().map(|k| &k.decoding),
        }
    }

    /// All verification keys, for callers that must try each in turn.
    pub fn decoding_keys(&self) -> impl Iterator<Item = &DecodingKey> {
        self.keys.iter().map(|k| &k.decoding)
    }

    /// The public JWKS document served at `/jwks`.
    #[must_use]
    pub fn public_jwks(&self) -> &PublicJwks {
        &self.public_jwks
    }
}

fn generate_stored_key() -> Result<StoredKey> {
    let private_key = RsaPrivateKey::new(&mut OsRng, 2048)
        .map_err(|e| Error::Internal(format!("RSA key generation failed: {e}")))?;

    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Internal(format!("PKCS#8 encoding failed: {e}")))?;

    Ok(StoredKey {
        kid: uuid::Uuid::new_v4().to_string(),
        private_key_pem: pem.to_string(),
    })
}

fn key_pair_from_stored(stored: &StoredKey) -> Result<KeyPair> {
    let private_key = RsaPrivateKey::from_pkcs8_pem(&stored.private_key_pem)
        .map_err(|e| Error::Internal(format!("invalid stored key {}: {e}", stored.kid)))?;

    let encoding = EncodingKey::from_rsa_pem(stored.private_key_pem.as_bytes())
        .map_err(|e| Error::Internal(format!("invalid stored key {}: {e}", stored.kid)))?;

    let public_key = private_key.to_public_key();
    let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());

    let decoding = DecodingKey::from_rsa_components(&n, &e)
        .map_err(|e| Error::Internal(format!("invalid stored key {}: {e}", stored.kid)))?;

    Ok(KeyPair {
        kid: stored.kid.clone(),
        encoding,
        decoding,
        public: PublicJwk {
            kty: "RSA".to_string(),
            alg: "RS256".to_string(),
            key_use: "sig".to_string(),
            kid: stored.kid.clone(),
            n,
            e,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::JsonStorage;

    fn temp_storage(name: &str) -> JsonStorage {
        let path = std::env::temp_dir()
            .join("latchkey_key_tests")
            .join(format!("{}_{}.json", name, uuid::Uuid::new_v4()));
        JsonStorage::new(path).unwrap()
    }

    #[test]
    fn generates_and_persists_a_key_on_first_load() {
        let storage = temp_storage("generate");
        assert!(storage.get_keys().is_empty());

        let manager = KeyManager::load_or_generate(&storage).unwrap();

        let stored = storage.get_keys();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].private_key_pem.contains("PRIVATE KEY"));

        let jwks = manager.public_jwks();
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(jwks.keys[0].kty, "RSA");
        assert_eq!(jwks.keys[0].alg, "RS256");
        assert_eq!(jwks.keys[0].key_use, "sig");
        assert_eq!(jwks.keys[0].kid, stored[0].kid);
    }

    #[test]
    fn reload_reuses_the_persisted_key() {
        let storage = temp_storage("reload");
        let first = KeyManager::load_or_generate(&storage).unwrap();
        let second = KeyManager::load_or_generate(&storage).unwrap();

        assert_eq!(
            first.public_jwks().keys[0].n,
            second.public_jwks().keys[0].n
        );
        assert_eq!(storage.get_keys().len(), 1);
    }

    #[test]
    fn public_jwks_exposes_no_private_material() {
        let storage = temp_storage("public");
        let manager = KeyManager::load_or_generate(&storage).unwrap();

        let json = serde_json::to_string(manager.public_jwks()).unwrap();
        assert!(!json.contains("\"d\""));
        assert!(!json.contains("PRIVATE"));
    }

    #[test]
    fn decoding_key_lookup_by_kid() {
        let storage = temp_storage("kid");
        let manager = KeyManager::load_or_generate(&storage).unwrap();
        let kid = manager.public_jwks().keys[0].kid.clone();

        assert!(manager.decoding_key(Some(&kid)).is_some());
        assert!(manager.decoding_key(Some("unknown")).is_none());
        assert!(manager.decoding_key(None).is_some());
    }
}
