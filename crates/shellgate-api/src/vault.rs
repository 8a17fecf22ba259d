//! Vault-backed secret store
//!
//! Logs in with AppRole and reads from a KV v2 mount. Each `login` issues a
//! fresh client token; nothing is cached between resolutions.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::credentials::{SecretDocument, SecretReader, SecretStore, StoreError};

/// Header carrying the Vault client token
const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

/// Default request timeout for Vault calls
pub const DEFAULT_VAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for Vault
#[derive(Debug)]
pub struct VaultConfig {
    /// Base URL, e.g. `https://vault.internal:8200`
    pub url: String,
    /// AppRole role id
    pub role_id: String,
    /// AppRole secret id
    pub secret_id: SecretString,
    /// Mount path of the AppRole auth method
    pub approle_mount: String,
    /// Mount path of the KV v2 secrets engine
    pub kv_mount: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl VaultConfig {
    /// Config with the default `approle` and `secret` mounts
    pub fn new(url: impl Into<String>, role_id: impl Into<String>, secret_id: SecretString) -> Self {
        Self {
            url: url.into(),
            role_id: role_id.into(),
            secret_id,
            approle_mount: "approle".to_string(),
            kv_mount: "secret".to_string(),
            timeout: DEFAULT_VAULT_TIMEOUT,
        }
    }
}

/// Secret store talking to Vault over HTTP
pub struct VaultStore {
    base: Url,
    role_id: String,
    secret_id: SecretString,
    approle_mount: String,
    kv_mount: String,
    http: reqwest::Client,
}

impl VaultStore {
    /// Create a store, validating the URL and building the HTTP client
    pub fn new(config: VaultConfig) -> Result<Self, StoreError> {
        let url = Url::parse(&config.url)
            .map_err(|e| StoreError::Config(format!("invalid Vault URL {:?}: {}", config.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StoreError::Config(format!(
                "unsupported Vault URL scheme: {}",
                url.scheme()
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base: url,
            role_id: config.role_id,
            secret_id: config.secret_id,
            approle_mount: config.approle_mount.trim_matches('/').to_string(),
            kv_mount: config.kv_mount.trim_matches('/').to_string(),
            http,
        })
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: Option<LoginAuth>,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: Option<String>,
}

#[async_trait]
impl SecretStore for VaultStore {
    async fn login(&self) -> Result<Box<dyn SecretReader>, StoreError> {
        let url = api_url(&self.base, &["auth", self.approle_mount.as_str(), "login"])?;
        let body = serde_json::json!({
            "role_id": self.role_id,
            "secret_id": self.secret_id.expose_secret(),
        });

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Malformed(format!("login response: {}", e)))?;

        let token = login
            .auth
            .and_then(|a| a.client_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| StoreError::Malformed("login response has no client token".into()))?;

        debug!(mount = %self.approle_mount, "Vault AppRole login succeeded");

        Ok(Box::new(VaultSession {
            base: self.base.clone(),
            kv_mount: self.kv_mount.clone(),
            token: SecretString::from(token),
            http: self.http.clone(),
        }))
    }
}

/// Authenticated Vault session bound to one client token
pub struct VaultSession {
    base: Url,
    kv_mount: String,
    token: SecretString,
    http: reqwest::Client,
}

#[async_trait]
impl SecretReader for VaultSession {
    async fn read(&self, path: &str) -> Result<Option<SecretDocument>, StoreError> {
        let url = api_url(&self.base, &[self.kv_mount.as_str(), "data", path])?;

        let response = self
            .http
            .get(url)
            .header(VAULT_TOKEN_HEADER, self.token.expose_secret())
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| StoreError::Malformed(format!("{}: {}", path, e)))?;

        kv_document(body)
    }
}

/// Build `<base>/v1/<parts...>`, splitting each part on `/` and
/// percent-encoding every resulting segment
fn api_url(base: &Url, parts: &[&str]) -> Result<Url, StoreError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| StoreError::Config(format!("Vault URL {} cannot carry a path", base)))?
        .pop_if_empty()
        .push("v1")
        .extend(parts.iter().flat_map(|part| part.split('/')));
    Ok(url)
}

/// Extract the inner KV v2 document from a read response
fn kv_document(body: Value) -> Result<Option<SecretDocument>, StoreError> {
    let inner = body.get("data").and_then(|d| d.get("data"));
    match inner {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(other) => Err(StoreError::Malformed(format!(
            "expected object under data.data, got {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
