//! Secrets provider: environment, file, or vault backends.
//!
//! The backend is selected by `WELLMONITOR_SECRETS_MODE`. The hub connection
//! string is mandatory — startup fails without it. Optional keys degrade
//! features (no cloud OCR, no cloud storage) and are logged exactly once at
//! load time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Categorized, ErrorKind};

/// Env var selecting the backend.
pub const SECRETS_MODE_VAR: &str = "WELLMONITOR_SECRETS_MODE";

const HUB_CONNECTION_VAR: &str = "WELLMONITOR_IOTHUB_CONNECTION_STRING";
const STORAGE_CONNECTION_VAR: &str = "WELLMONITOR_STORAGE_CONNECTION_STRING";
const OCR_API_KEY_VAR: &str = "WELLMONITOR_OCR_API_KEY";
const ENCRYPTION_KEY_VAR: &str = "WELLMONITOR_LOCAL_ENCRYPTION_KEY";

/// Default path of the 0640 environment file for the `file` backend.
const DEFAULT_ENV_FILE: &str = "/etc/wellmonitor/environment";

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("unknown secrets mode '{0}' (expected environment, file, or vault)")]
    UnknownMode(String),
    #[error("hub connection string ({HUB_CONNECTION_VAR}) is missing")]
    MissingHubConnection,
    #[error("secrets file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("vault request failed: {0}")]
    Vault(String),
    #[error("{ENCRYPTION_KEY_VAR} must be exactly 32 characters, got {0}")]
    BadEncryptionKey(usize),
}

impl Categorized for SecretsError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Vault(_) => ErrorKind::Network,
            _ => ErrorKind::Config,
        }
    }
}

/// Which backend the secrets were loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretsMode {
    Environment,
    File,
    Vault,
}

impl SecretsMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Environment => "environment",
            Self::File => "file",
            Self::Vault => "vault",
        }
    }

    fn from_env() -> Result<Self, SecretsError> {
        match std::env::var(SECRETS_MODE_VAR).as_deref() {
            Err(_) | Ok("environment") | Ok("") => Ok(Self::Environment),
            Ok("file") => Ok(Self::File),
            Ok("vault") => Ok(Self::Vault),
            Ok(other) => Err(SecretsError::UnknownMode(other.to_string())),
        }
    }
}

/// Resolved secrets. Values are never logged.
#[derive(Clone)]
pub struct Secrets {
    pub mode: SecretsMode,
    pub hub_connection_string: String,
    pub storage_connection_string: Option<String>,
    pub ocr_api_key: Option<String>,
    pub local_encryption_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("mode", &self.mode.as_str())
            .field("hub_connection_string", &"<redacted>")
            .field("storage_connection_string", &self.storage_connection_string.as_ref().map(|_| "<redacted>"))
            .field("ocr_api_key", &self.ocr_api_key.as_ref().map(|_| "<redacted>"))
            .field("local_encryption_key", &self.local_encryption_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Secrets {
    /// Load secrets from the backend selected by `WELLMONITOR_SECRETS_MODE`.
    pub async fn load() -> Result<Self, SecretsError> {
        let mode = SecretsMode::from_env()?;
        let values = match mode {
            SecretsMode::Environment => from_process_env(),
            SecretsMode::File => {
                let path = std::env::var("WELLMONITOR_SECRETS_FILE")
                    .map_or_else(|_| PathBuf::from(DEFAULT_ENV_FILE), PathBuf::from);
                from_env_file(&path)?
            }
            SecretsMode::Vault => from_vault().await?,
        };
        Self::from_map(mode, values)
    }

    fn from_map(mode: SecretsMode, values: HashMap<String, String>) -> Result<Self, SecretsError> {
        let hub_connection_string = values
            .get(HUB_CONNECTION_VAR)
            .filter(|s| !s.is_empty())
            .cloned()
            .ok_or(SecretsError::MissingHubConnection)?;

        let storage_connection_string = values.get(STORAGE_CONNECTION_VAR).cloned();
        let ocr_api_key = values.get(OCR_API_KEY_VAR).cloned();
        let local_encryption_key = values.get(ENCRYPTION_KEY_VAR).cloned();

        if let Some(ref key) = local_encryption_key {
            if key.len() != 32 {
                return Err(SecretsError::BadEncryptionKey(key.len()));
            }
        }

        // Missing optional keys degrade features; say so once, here.
        if ocr_api_key.is_none() {
            info!(component = "secrets", "no OCR API key — cloud OCR unavailable");
        }
        if storage_connection_string.is_none() {
            info!(component = "secrets", "no storage connection string — cloud image sync unavailable");
        }

        info!(component = "secrets", mode = mode.as_str(), "secrets loaded");

        Ok(Self {
            mode,
            hub_connection_string,
            storage_connection_string,
            ocr_api_key,
            local_encryption_key,
        })
    }
}

/// `environment` backend: read the named process env vars.
fn from_process_env() -> HashMap<String, String> {
    [
        HUB_CONNECTION_VAR,
        STORAGE_CONNECTION_VAR,
        OCR_API_KEY_VAR,
        ENCRYPTION_KEY_VAR,
    ]
    .iter()
    .filter_map(|name| std::env::var(name).ok().map(|v| ((*name).to_string(), v)))
    .collect()
}

/// `file` backend: parse a `KEY=value` environment file (installed 0640).
fn from_env_file(path: &Path) -> Result<HashMap<String, String>, SecretsError> {
    let iter = dotenvy::from_path_iter(path).map_err(|e| SecretsError::File {
        path: path.display().to_string(),
        source: std::io::Error::other(e.to_string()),
    })?;

    let mut values = HashMap::new();
    for item in iter {
        match item {
            Ok((key, value)) => {
                values.insert(key, value);
            }
            Err(e) => {
                warn!(
                    component = "secrets",
                    path = %path.display(),
                    error = %e,
                    "skipping malformed line in secrets file"
                );
            }
        }
    }
    Ok(values)
}

/// `vault` backend: fetch the named secrets over HTTP with a bearer token.
async fn from_vault() -> Result<HashMap<String, String>, SecretsError> {
    let addr = std::env::var("WELLMONITOR_VAULT_ADDR")
        .map_err(|_| SecretsError::Vault("WELLMONITOR_VAULT_ADDR not set".to_string()))?;
    let token = std::env::var("WELLMONITOR_VAULT_TOKEN")
        .map_err(|_| SecretsError::Vault("WELLMONITOR_VAULT_TOKEN not set".to_string()))?;

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| SecretsError::Vault(e.to_string()))?;

    let url = format!("{}/v1/secret/data/wellmonitor", addr.trim_end_matches('/'));
    let resp = client
        .get(&url)
        .header("X-Vault-Token", token)
        .send()
        .await
        .map_err(|e| SecretsError::Vault(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(SecretsError::Vault(format!(
            "vault returned status {}",
            resp.status()
        )));
    }

    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| SecretsError::Vault(e.to_string()))?;

    let data = body
        .pointer("/data/data")
        .and_then(|v| v.as_object())
        .ok_or_else(|| SecretsError::Vault("unexpected vault response shape".to_string()))?;

    Ok(data
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect())
}
