//! Persistent broker state
//!
//! Configuration that survives restarts — upstream providers, users,
//! signing keys, feature flags — lives behind the [`Storage`] trait so the
//! backing store can be swapped out. [`JsonStorage`] is the bundled
//! adapter: a single JSON file rewritten on every mutation, which is
//! plenty for the write rates involved (admin actions only; the request
//! path never writes).

use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// An upstream identity provider this broker can federate to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OAuth2Provider {
    /// Stable identifier, e.g. `google`
    pub id: String,
    /// Display name shown on the login surface
    pub name: String,
    /// Issuer / base URI
    pub uri: String,
    /// Client id registered with the provider; empty means use our root URI
    #[serde(default)]
    pub client_id: String,
    /// Client secret registered with the provider
    #[serde(default)]
    pub client_secret: String,
    /// Static authorization endpoint for plain-OAuth2 providers
    #[serde(default)]
    pub authorization_uri: String,
    /// Static token endpoint; for OIDC providers this overrides the
    /// discovered endpoint (some advertise OIDC but ship a broken one)
    #[serde(default)]
    pub token_uri: String,
    /// Scope override; empty means `openid email profile`
    #[serde(default)]
    pub scope: String,
    /// Whether the provider implements OIDC discovery and ID tokens
    #[serde(default)]
    pub openid_connect: bool,
}

/// SMTP settings consumed by the email login collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SmtpConfig {
    /// Mail server hostname
    pub server: String,
    /// Username
    #[serde(default)]
    pub username: String,
    /// Password
    #[serde(default)]
    pub password: String,
    /// Port
    #[serde(default)]
    pub port: u16,
    /// Sender address
    #[serde(default)]
    pub sender: String,
}

/// An allow-listed user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Email address
    pub email: String,
}

/// A domain served by this broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    /// Domain name
    pub domain: String,
    /// Identity id of the owner
    pub owner_id: String,
}

/// A persisted signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKey {
    /// Key id placed in JWT headers and the public JWKS
    pub kid: String,
    /// RSA private key, PKCS#8 PEM
    pub private_key_pem: String,
}

/// Persistent state behind the broker.
///
/// Every call is atomic from the engine's point of view; the engine never
/// composes multi-call transactions.
pub trait Storage: Send + Sync {
    /// Cookie name prefix.
    fn get_prefix(&self) -> String;
    /// Set the cookie name prefix.
    fn set_prefix(&self, prefix: &str) -> Result<()>;

    /// Display name shown on login surfaces.
    fn get_display_name(&self) -> String;
    /// Set the display name.
    fn set_display_name(&self, name: &str) -> Result<()>;

    /// Public root URI (issuer).
    fn get_root_uri(&self) -> String;
    /// Set the public root URI.
    fn set_root_uri(&self, uri: &str) -> Result<()>;

    /// All persisted signing keys, oldest first.
    fn get_keys(&self) -> Vec<StoredKey>;
    /// Append a signing key.
    fn add_key(&self, key: StoredKey) -> Result<()>;

    /// All configured upstream providers.
    fn get_oauth2_providers(&self) -> Vec<OAuth2Provider>;
    /// Look up a provider by id.
    fn get_oauth2_provider(&self, id: &str) -> Option<OAuth2Provider> {
        self.get_oauth2_providers().into_iter().find(|p| p.id == id)
    }
    /// Insert or replace a provider (matched on id).
    fn set_oauth2_provider(&self, provider: OAuth2Provider) -> Result<()>;

    /// SMTP settings, if configured.
    fn get_smtp_config(&self) -> Option<SmtpConfig>;
    /// Set SMTP settings.
    fn set_smtp_config(&self, config: SmtpConfig) -> Result<()>;

    /// Whether anyone may log in (no allow-list gate).
    fn get_public(&self) -> bool;
    /// Set the public flag.
    fn set_public(&self, public: bool) -> Result<()>;

    /// Whether the FedCM surfaces are enabled.
    fn get_fedcm_enabled(&self) -> bool;
    /// Enable or disable FedCM.
    fn set_fedcm_enabled(&self, enabled: bool) -> Result<()>;

    /// Whether forward-auth failures downgrade to "no identity".
    fn get_forward_auth_passthrough(&self) -> bool;
    /// Set forward-auth passthrough.
    fn set_forward_auth_passthrough(&self, enabled: bool) -> Result<()>;

    /// Allow-listed users.
    fn get_users(&self) -> Vec<User>;
    /// Add a user to the allow-list.
    fn add_user(&self, user: User) -> Result<()>;

    /// Registered domains.
    fn get_domains(&self) -> Vec<Domain>;
    /// Register a domain.
    fn add_domain(&self, domain: Domain) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StorageData {
    prefix: String,
    display_name: String,
    root_uri: String,
    keys: Vec<StoredKey>,
    oauth2_providers: Vec<OAuth2Provider>,
    smtp_config: Option<SmtpConfig>,
    public: bool,
    fedcm_enabled: bool,
    forward_auth_passthrough: bool,
    users: Vec<User>,
    domains: Vec<Domain>,
}

/// File-backed [`Storage`] adapter.
pub struct JsonStorage {
    path: PathBuf,
    data: Mutex<StorageData>,
}

impl JsonStorage {
    /// Open or create the storage file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let data = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| Error::Storage(e.to_string()))?
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            StorageData::default()
        };

        let storage = Self {
            path,
            data: Mutex::new(data),
        };
        storage.persist(&storage.data.lock())?;
        Ok(storage)
    }

    fn persist(&self, data: &StorageData) -> Result<()> {
        let content =
            serde_json::to_string_pretty(data).map_err(|e| Error::Storage(e.to_string()))?;
        fs::write(&self.path, content)?;

        // The file holds private key material.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            let _ = fs::set_permissions(&self.path, perms);
        }

        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut StorageData)) -> Result<()> {
        let mut data = self.data.lock();
        f(&mut data);
        self.persist(&data)
    }
}

impl Storage for JsonStorage {
    fn get_prefix(&self) -> String {
        self.data.lock().prefix.clone()
    }

    fn set_prefix(&self, prefix: &str) -> Result<()> {
        self.mutate(|d| d.prefix = prefix.to_string())
    }

    fn get_display_name(&self) -> String {
        self.data.lock().display_name.clone()
    }

    fn set_display_name(&self, name: &str) -> Result<()> {
        self.mutate(|d| d.display_name = name.to_string())
    }

    fn get_root_uri(&self) -> String {
        self.data.lock().root_uri.clone()
    }

    fn set_root_uri(&self, uri: &str) -> Result<()> {
        self.mutate(|d| d.root_uri = uri.trim_end_matches('/').to_string())
    }

    fn get_keys(&self) -> Vec<StoredKey> {
        self.data.lock().keys.clone()
    }

    fn add_key(&self, key: StoredKey) -> Result<()> {
        self.mutate(|d| d.keys.push(key))
    }

    fn get_oauth2_providers(&self) -> Vec<OAuth2Provider> {
        self.data.lock().oauth2_providers.clone()
    }

    fn set_oauth2_provider(&self, provider: OAuth2Provider) -> Result<()> {
        self.mutate(|d| {
            d.oauth2_providers.retain(|p| p.id != provider.id);
            d.oauth2_providers.push(provider);
        })
    }

    fn get_smtp_config(&self) -> Option<SmtpConfig> {
        self.data.lock().smtp_config.clone()
    }

    fn set_smtp_config(&self, config: SmtpConfig) -> Result<()> {
        self.mutate(|d| d.smtp_config = Some(config))
    }

    fn get_public(&self) -> bool {
        self.data.lock().public
    }

    fn set_public(&self, public: bool) -> Result<()> {
        self.mutate(|d| d.public = public)
    }

    fn get_fedcm_enabled(&self) -> bool {
        self.data.lock().fedcm_enabled
    }

    fn set_fedcm_enabled(&self, enabled: bool) -> Result<()> {
        self.mutate(|d| d.fedcm_enabled = enabled)
    }

    fn get_forward_auth_passthrough(&self) -> bool {
        self.data.lock().forward_auth_passthrough
    }

    fn set_forward_auth_passthrough(&self, enabled: bool) -> Result<()> {
        self.mutate(|d| d.forward_auth_passthrough = enabled)
    }

    fn get_users(&self) -> Vec<User> {
        self.data.lock().users.clone()
    }

    fn add_user(&self, user: User) -> Result<()> {
        self.mutate(|d| d.users.push(user))
    }

    fn get_domains(&self) -> Vec<Domain> {
        self.data.lock().domains.clone()
    }

    fn add_domain(&self, domain: Domain) -> Result<()> {
        self.mutate(|d| d.domains.push(domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage(name: &str) -> JsonStorage {
        let path = std::env::temp_dir()
            .join("latchkey_storage_tests")
            .join(format!("{}_{}.json", name, uuid::Uuid::new_v4()));
        JsonStorage::new(path).unwrap()
    }

    #[test]
    fn scalar_round_trips() {
        let storage = temp_storage("scalars");
        storage.set_prefix("latchkey").unwrap();
        storage.set_display_name("Example SSO").unwrap();
        storage.set_root_uri("https://id.example.com/").unwrap();

        assert_eq!(storage.get_prefix(), "latchkey");
        assert_eq!(storage.get_display_name(), "Example SSO");
        // Trailing slash is normalized away
        assert_eq!(storage.get_root_uri(), "https://id.example.com");
    }

    #[test]
    fn providers_replace_on_same_id() {
        let storage = temp_storage("providers");
        storage
            .set_oauth2_provider(OAuth2Provider {
                id: "google".to_string(),
                name: "Google".to_string(),
                uri: "https://accounts.google.com".to_string(),
                openid_connect: true,
                ..Default::default()
            })
            .unwrap();
        storage
            .set_oauth2_provider(OAuth2Provider {
                id: "google".to_string(),
                name: "Google Workspace".to_string(),
                uri: "https://accounts.google.com".to_string(),
                openid_connect: true,
                ..Default::default()
            })
            .unwrap();

        let providers = storage.get_oauth2_providers();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name, "Google Workspace");
        assert!(storage.get_oauth2_provider("google").is_some());
        assert!(storage.get_oauth2_provider("github").is_none());
    }

    #[test]
    fn state_survives_reopen() {
        let path = std::env::temp_dir()
            .join("latchkey_storage_tests")
            .join(format!("reopen_{}.json", uuid::Uuid::new_v4()));

        {
            let storage = JsonStorage::new(&path).unwrap();
            storage.set_public(true).unwrap();
            storage
                .add_user(User {
                    email: "alice@example.com".to_string(),
                })
                .unwrap();
        }

        let reopened = JsonStorage::new(&path).unwrap();
        assert!(reopened.get_public());
        assert_eq!(reopened.get_users().len(), 1);
    }

    #[test]
    fn flags_default_off() {
        let storage = temp_storage("flags");
        assert!(!storage.get_public());
        assert!(!storage.get_fedcm_enabled());
        assert!(!storage.get_forward_auth_passthrough());
        assert!(storage.get_smtp_config().is_none());
    }
}
