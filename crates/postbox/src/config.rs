//! Bus configuration: shared root, signer paths, and identity.
//!
//! The configuration record is immutable and threaded into
//! [`crate::Endpoints`] / [`crate::PubSub`] at construction — there are no
//! process-wide globals. Values layer defaults, an optional TOML file, and
//! `POSTBOX_*` environment overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default shared IPC root.
pub const DEFAULT_ROOT: &str = "/var/lib/postbox/ipc";

/// Signing identity recorded in the shared keyring.
#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    /// Display name attached to signatures.
    pub name: String,
    /// Email attached to signatures.
    pub email: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "nobody".to_string());
        Self {
            email: format!("{user}@localhost"),
            name: user,
        }
    }
}

/// Runtime configuration for one process's view of the bus.
#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    /// Shared IPC root all endpoints live under.
    pub root: PathBuf,
    /// Path to the caller's Ed25519 seed file (per-user, mode 0600).
    pub keypair: PathBuf,
    /// Signing identity registered in the shared keyring.
    pub identity: IdentityConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        let keypair = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("postbox")
            .join("key");
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            keypair,
            identity: IdentityConfig::default(),
        }
    }
}

impl BusConfig {
    /// Configuration rooted at `root`, with the seed file kept alongside.
    /// Convenient for tests and single-user deployments.
    #[must_use]
    pub fn at_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let keypair = root.join(".key");
        Self {
            root,
            keypair,
            identity: IdentityConfig::default(),
        }
    }

    /// The pub/sub namespace under the root.
    #[must_use]
    pub fn pubsub_root(&self) -> PathBuf {
        self.root.join("pubsub")
    }

    /// The shared signer keyring under the root.
    #[must_use]
    pub fn keyring(&self) -> PathBuf {
        self.root.join("keyring")
    }

    /// Directory of the named endpoint.
    #[must_use]
    pub fn endpoint_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.root.as_os_str().is_empty() {
            return Err("root must not be empty".to_string());
        }
        if !self.root.is_absolute() {
            return Err(format!(
                "root must be an absolute path, got: {}",
                self.root.display()
            ));
        }
        if self.keypair.as_os_str().is_empty() {
            return Err("keypair path must not be empty".to_string());
        }
        if self.identity.name.is_empty() {
            return Err("identity.name must not be empty".to_string());
        }
        if self.identity.email.is_empty() {
            return Err("identity.email must not be empty".to_string());
        }
        Ok(())
    }

    /// Load configuration from defaults, an optional TOML file, and the
    /// `POSTBOX_*` environment.
    ///
    /// When `path` is `None` the platform config directory is consulted
    /// (`<config_dir>/postbox/config.toml`), if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("root", defaults.root.display().to_string())?
            .set_default("keypair", defaults.keypair.display().to_string())?
            .set_default("identity.name", defaults.identity.name.as_str())?
            .set_default("identity.email", defaults.identity.email.as_str())?;

        if let Some(config_path) = path {
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        } else if let Some(config_path) = dirs::config_dir()
            .map(|d| d.join("postbox").join("config.toml"))
            .filter(|p| p.exists())
        {
            builder = builder.add_source(config::File::from(config_path));
        }

        builder = builder.add_source(config::Environment::with_prefix("POSTBOX").separator("_"));

        builder.build()?.try_deserialize()
    }
}
