//! Upstream OIDC discovery and key-set caching
//!
//! Discovery documents are fetched lazily per provider and kept for the
//! process lifetime. Remote JWKS are cached by `jwks_uri`; refresh is
//! explicit — on startup warm-up and when a verification fails — never
//! time-driven.

use dashmap::DashMap;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::DecodingKey;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::OAuth2Provider;
use crate::{Error, Result};

/// OIDC provider metadata (the subset the broker consumes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetadata {
    /// Issuer URL
    pub issuer: String,
    /// Authorization endpoint URL
    pub authorization_endpoint: String,
    /// Token endpoint URL (absent on some nominally-OIDC providers)
    #[serde(default)]
    pub token_endpoint: String,
    /// JWKS URL
    #[serde(default)]
    pub jwks_uri: String,
    /// Userinfo endpoint URL
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
}

/// Caches discovery documents per provider and key sets per `jwks_uri`.
pub struct MetadataManager {
    http: Client,
    metadata: DashMap<String, ServerMetadata>,
    keysets: DashMap<String, JwkSet>,
}

impl MetadataManager {
    /// Create a manager over a shared HTTP client.
    #[must_use]
    pub fn new(http: Client) -> Self {
        Self {
            http,
            metadata: DashMap::new(),
            keysets: DashMap::new(),
        }
    }

    /// Pre-fetch metadata and key sets for every OIDC provider. Failures
    /// are logged and retried lazily on first use.
    pub async fn warm_up(&self, providers: &[OAuth2Provider]) {
        for provider in providers.iter().filter(|p| p.openid_connect) {
            match self.get_meta(provider).await {
                Ok(meta) => {
                    if !meta.jwks_uri.is_empty() {
                        if let Err(e) = self.refresh_keyset(&meta.jwks_uri).await {
                            warn!(provider = %provider.id, error = %e, "JWKS warm-up failed");
                        }
                    }
                }
                Err(e) => warn!(provider = %provider.id, error = %e, "metadata warm-up failed"),
            }
        }
    }

    /// Discovery document for a provider, cached after the first fetch.
    pub async fn get_meta(&self, provider: &OAuth2Provider) -> Result<ServerMetadata> {
        if let Some(meta) = self.metadata.get(&provider.id) {
            return Ok(meta.clone());
        }

        let meta = self.discover(&provider.uri).await?;
        self.metadata.insert(provider.id.clone(), meta.clone());
        Ok(meta)
    }

    /// Fetch `<issuer>/.well-known/openid-configuration`, uncached.
    pub async fn discover(&self, issuer: &str) -> Result<ServerMetadata> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(url = %url, "fetching OIDC discovery document");

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::UpstreamTransport(format!(
                "discovery returned HTTP {} for {url}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    /// Key set for a provider, cached by the discovered `jwks_uri`.
    pub async fn keyset(&self, provider: &OAuth2Provider) -> Result<JwkSet> {
        let meta = self.get_meta(provider).await?;
        if meta.jwks_uri.is_empty() {
            return Err(Error::UpstreamTransport(format!(
                "provider {} advertises no jwks_uri",
                provider.id
            )));
        }

        if let Some(keys) = self.keysets.get(&meta.jwks_uri) {
            return Ok(keys.clone());
        }
        self.refresh_keyset(&meta.jwks_uri).await
    }

    /// Re-fetch the key set at `jwks_uri`, replacing the cached entry.
    pub async fn refresh_keyset(&self, jwks_uri: &str) -> Result<JwkSet> {
        debug!(url = %jwks_uri, "fetching JWKS");

        let response = self.http.get(jwks_uri).send().await?;
        if !response.status().is_success() {
            return Err(Error::UpstreamTransport(format!(
                "JWKS fetch returned HTTP {} for {jwks_uri}",
                response.status()
            )));
        }

        let keys: JwkSet = response.json().await?;
        self.keysets.insert(jwks_uri.to_string(), keys.clone());
        Ok(keys)
    }

    /// Key set for an arbitrary `jwks_uri`, cached. Used by the FedCM
    /// path where the issuer comes from the assertion itself.
    pub async fn keyset_for_uri(&self, jwks_uri: &str) -> Result<JwkSet> {
        if let Some(keys) = self.keysets.get(jwks_uri) {
            return Ok(keys.clone());
        }
        self.refresh_keyset(jwks_uri).await
    }
}

/// Find a decoding key in a JWKS by `kid`. With no `kid`, a single-key
/// set is unambiguous and used as-is.
#[must_use]
pub fn decoding_key_for(jwks: &JwkSet, kid: Option<&str>) -> Option<DecodingKey> {
    let jwk = match kid {
        Some(kid) => jwks
            .keys
            .iter()
            .find(|j| j.common.key_id.as_deref() == Some(kid))?,
        None if jwks.keys.len() == 1 => &jwks.keys[0],
        None => return None,
    };

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}
