//! Federated upstream login
//!
//! Everything that talks to external identity providers: OIDC discovery
//! and key-set caching, the OAuth2/OIDC code flow with PKCE and nonce
//! verification, and FedCM assertion verification.

pub mod fedcm;
pub mod metadata;
pub mod oauth2;

pub use metadata::{MetadataManager, ServerMetadata};
