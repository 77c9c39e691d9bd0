//! latchkey — a self-hosted federating identity broker
//!
//! A small, standards-faithful OpenID Connect / OAuth2 authorization
//! server that delegates the actual proving of identity to upstream
//! providers (OIDC, plain OAuth2, FedCM) and issues its own signed ID
//! tokens to relying parties.
//!
//! # Design
//!
//! There are no server-side sessions. Every piece of cross-request state
//! — the aggregated identity cookie, the in-flight authorization request,
//! the in-flight upstream login, authorization codes, access tokens — is
//! a signed, expiring JWT envelope carried by the user agent. The server
//! keeps only its signing keys, its configuration, and read-mostly caches
//! of upstream metadata.
//!
//! # Endpoints
//!
//! Downstream (we are the provider): `/.well-known/openid-configuration`,
//! `/jwks`, `/register`, `/auth`, `/approve`, `/token`, `/userinfo`.
//!
//! Upstream (we are the client): `/login-oauth2`, `/callback`,
//! `/login-fedcm`, `/complete-login-fedcm`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod pkce;
pub mod server;
pub mod session;
pub mod storage;
pub mod templates;
pub mod upstream;
pub mod validate;

pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
pub use validate::Validation;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
