//! The broker server
//!
//! Wires storage, keys, the envelope codec, upstream metadata caches, and
//! the template renderer into one [`AppState`], assembles the router, and
//! runs the listener. [`Server`] is also the embedding surface: construct
//! one, mount [`Server::router`] wherever, and call [`Server::validate`]
//! from forward-auth callers.

pub mod authorize;
pub mod oidc;
pub mod router;
pub mod token;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::http::{header::SET_COOKIE, HeaderMap, HeaderValue};
use axum::response::Response;
use axum::Router;
use cookie::Cookie;
use tokio::net::TcpListener;
use tracing::info;
use url::Url;

use crate::config::Config;
use crate::envelope::EnvelopeCodec;
use crate::keys::KeyManager;
use crate::storage::{JsonStorage, Storage};
use crate::templates::{BuiltinTemplates, Templates};
use crate::upstream::MetadataManager;
use crate::validate::{self, Validation};
use crate::{Error, Result};

use token::SeenCodes;

/// Shared application state
pub struct AppState {
    /// Static configuration
    pub config: Config,
    /// Persistent broker state
    pub storage: Arc<dyn Storage>,
    /// Server signing keys and public JWKS
    pub keys: Arc<KeyManager>,
    /// Envelope codec over those keys
    pub codec: EnvelopeCodec,
    /// Upstream discovery and key-set caches
    pub metadata: MetadataManager,
    /// Login surface renderer
    pub templates: Arc<dyn Templates>,
    /// Shared HTTP client for upstream calls
    pub http: reqwest::Client,
    /// Single-use guard for authorization codes
    pub seen_codes: SeenCodes,
}

/// Append `Set-Cookie` headers to a response.
pub(crate) fn with_cookies(mut response: Response, cookies: Vec<Cookie<'static>>) -> Response {
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

/// Host plus explicit port of a URL, the unit the
/// `redirect_uri.host == client_id.host` rule compares.
pub(crate) fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// The identity broker server.
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    /// Create a server with file-backed storage and the built-in pages.
    pub async fn new(config: Config) -> Result<Self> {
        let storage_path = Path::new(&config.server.storage_dir)
            .join(format!("{}storage.json", config.server.prefix));
        let storage = Arc::new(JsonStorage::new(storage_path)?);
        Self::with_parts(config, storage, Arc::new(BuiltinTemplates)).await
    }

    /// Create a server over caller-supplied storage and templates.
    pub async fn with_parts(
        config: Config,
        storage: Arc<dyn Storage>,
        templates: Arc<dyn Templates>,
    ) -> Result<Self> {
        seed_storage(&config, storage.as_ref())?;

        if storage.get_root_uri().is_empty() {
            return Err(Error::Config(
                "root_uri must be configured before serving".to_string(),
            ));
        }

        let keys = Arc::new(KeyManager::load_or_generate(storage.as_ref())?);
        let codec = EnvelopeCodec::new(Arc::clone(&keys));

        let http = reqwest::Client::builder()
            .timeout(config.upstream.request_timeout)
            .build()?;

        let metadata = MetadataManager::new(http.clone());
        metadata.warm_up(&storage.get_oauth2_providers()).await;

        let state = Arc::new(AppState {
            config,
            storage,
            keys,
            codec,
            metadata,
            templates,
            http,
            seen_codes: SeenCodes::default(),
        });

        Ok(Self { state })
    }

    /// The shared state, for embedders that add their own routes.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Build the HTTP router.
    #[must_use]
    pub fn router(&self) -> Router {
        router::create_router(Arc::clone(&self.state))
    }

    /// Validate the session cookie on an inbound request, returning the
    /// primary identity for forward-auth callers.
    pub fn validate(&self, headers: &HeaderMap) -> Result<Option<Validation>> {
        validate::validate(
            &self.state.codec,
            self.state.storage.as_ref(),
            headers,
        )
    }

    /// Bind and serve until the process exits.
    pub async fn run(self) -> Result<()> {
        let port = self.state.config.server.port;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let app = self.router();

        let listener = TcpListener::bind(addr).await?;
        info!(%addr, issuer = %self.state.storage.get_root_uri(), "listening");

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Internal(format!("server error: {e}")))
    }
}

/// Carry configuration into storage the way the flags intend: explicit
/// settings win, existing storage values otherwise stand.
fn seed_storage(config: &Config, storage: &dyn Storage) -> Result<()> {
    let server = &config.server;

    if storage.get_prefix().is_empty() || server.prefix != "latchkey" {
        storage.set_prefix(&server.prefix)?;
    }
    if storage.get_display_name().is_empty() || server.display_name != "latchkey" {
        storage.set_display_name(&server.display_name)?;
    }
    if !server.root_uri.is_empty() {
        storage.set_root_uri(&server.root_uri)?;
    }
    if server.fedcm_enable {
        storage.set_fedcm_enabled(true)?;
    }
    if server.forward_auth_passthrough {
        storage.set_forward_auth_passthrough(true)?;
    }

    Ok(())
}
