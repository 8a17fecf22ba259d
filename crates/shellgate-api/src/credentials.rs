//! Cluster credential resolution
//!
//! Maps an authenticated caller plus a target cluster (and namespace) onto
//! the API endpoint and bearer token used for the remote exec session.
//!
//! # Secret layout
//!
//! ```text
//! cluster/<cluster>                      clusterApiUrl, clusterToken (shared)
//! user/<subject>/<cluster>               clusterToken (CLUSTER_ADMIN)
//! user/<subject>/<cluster>/<namespace>   clusterToken (USER)
//! ```
//!
//! The endpoint always comes from the cluster path. The token path depends
//! on the caller's role, so only SUPER_ADMIN ever sees the shared token.
//!
//! Nothing is cached: every call logs in to the store and re-reads.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{Map, Value};
use tracing::debug;

use crate::auth::Role;

/// Field holding the cluster API endpoint
pub const ENDPOINT_FIELD: &str = "clusterApiUrl";
/// Field holding the bearer token
pub const TOKEN_FIELD: &str = "clusterToken";

/// Key/value document stored at a secret path
pub type SecretDocument = Map<String, Value>;

/// Errors reported by a secret store backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transport-level failure talking to the store
    #[error("secret store request failed: {0}")]
    Request(String),

    /// The store answered with an unexpected status
    #[error("secret store returned status {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// The store answered with a document of the wrong shape
    #[error("malformed secret data: {0}")]
    Malformed(String),

    /// Store configuration is unusable
    #[error("secret store configuration error: {0}")]
    Config(String),
}

/// Authenticated session against the secret store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Read the document at `path`
    ///
    /// Returns `Ok(None)` when nothing is stored there.
    async fn read(&self, path: &str) -> Result<Option<SecretDocument>, StoreError>;
}

/// Secret store that hands out authenticated reader sessions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Authenticate and return a reader bound to the new session
    async fn login(&self) -> Result<Box<dyn SecretReader>, StoreError>;
}

/// Resolved credentials for one cluster
///
/// All three fields are populated whenever a value exists.
pub struct ClusterCredential {
    /// Cluster identifier the credential was resolved for
    pub cluster_id: String,
    /// Cluster API server URL
    pub endpoint: String,
    /// Bearer token for the API server
    pub token: SecretString,
}

impl ClusterCredential {
    /// Create a credential from its parts
    pub fn new(
        cluster_id: impl Into<String>,
        endpoint: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            endpoint: endpoint.into(),
            token: SecretString::from(token.into()),
        }
    }
}

impl fmt::Debug for ClusterCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCredential")
            .field("cluster_id", &self.cluster_id)
            .field("endpoint", &self.endpoint)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Credential resolution failures
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    /// Login to the secret store failed
    #[error("secret store authentication failed: {0}")]
    StoreAuthFailed(String),

    /// No document stored at the path
    #[error("no secret found at {0}")]
    SecretNotFound(String),

    /// Document exists but lacks a usable field
    #[error("malformed secret at {path}: {reason}")]
    MalformedSecret {
        /// Secret path that was read
        path: String,
        /// What was wrong with it
        reason: String,
    },

    /// The store could not be read
    #[error("failed to read {path}: {reason}")]
    StoreRequest {
        /// Secret path that was read
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// A namespace-scoped role resolved without a namespace
    #[error("role {0} requires a namespace")]
    NamespaceRequired(Role),

    /// A path component would escape its position in the secret path
    #[error("invalid {kind}: {value:?}")]
    InvalidPathSegment {
        /// Which component was rejected
        kind: &'static str,
        /// The rejected value
        value: String,
    },
}

/// Secret path holding the cluster endpoint and shared token
pub fn cluster_secret_path(cluster_id: &str) -> Result<String, ResolutionError> {
    check_segment("cluster id", cluster_id)?;
    Ok(format!("cluster/{}", cluster_id))
}

/// Secret path holding the bearer token for this caller
pub fn token_secret_path(
    cluster_id: &str,
    subject: &str,
    role: Role,
    namespace: Option<&str>,
) -> Result<String, ResolutionError> {
    match role {
        Role::SuperAdmin => cluster_secret_path(cluster_id),
        Role::ClusterAdmin => {
            check_segment("subject", subject)?;
            check_segment("cluster id", cluster_id)?;
            Ok(format!("user/{}/{}", subject, cluster_id))
        }
        Role::User => {
            let namespace = namespace
                .filter(|ns| !ns.is_empty())
                .ok_or(ResolutionError::NamespaceRequired(role))?;
            check_segment("subject", subject)?;
            check_segment("cluster id", cluster_id)?;
            check_segment("namespace", namespace)?;
            Ok(format!("user/{}/{}/{}", subject, cluster_id, namespace))
        }
    }
}

/// Characters that would change how a path segment is interpreted once it is
/// placed in a secret store URL
fn is_reserved(c: char) -> bool {
    matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_control()
}

fn check_segment(kind: &'static str, value: &str) -> Result<(), ResolutionError> {
    if value.is_empty() || value == "." || value == ".." || value.chars().any(is_reserved) {
        return Err(ResolutionError::InvalidPathSegment {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Resolves cluster credentials from the secret store
pub struct CredentialResolver {
    store: Arc<dyn SecretStore>,
}

impl CredentialResolver {
    /// Create a resolver backed by `store`
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Resolve the endpoint and token for `cluster_id` on behalf of `subject`
    ///
    /// Fails as a whole if either the endpoint or the token cannot be read;
    /// a credential with only one of them is never returned.
    pub async fn resolve(
        &self,
        cluster_id: &str,
        subject: &str,
        role: Role,
        namespace: Option<&str>,
    ) -> Result<ClusterCredential, ResolutionError> {
        let cluster_path = cluster_secret_path(cluster_id)?;
        let token_path = token_secret_path(cluster_id, subject, role, namespace)?;

        let reader = self
            .store
            .login()
            .await
            .map_err(|e| ResolutionError::StoreAuthFailed(e.to_string()))?;

        let cluster_doc = read_document(reader.as_ref(), &cluster_path).await?;
        let endpoint = string_field(&cluster_doc, ENDPOINT_FIELD, &cluster_path)?;

        let token = if token_path == cluster_path {
            string_field(&cluster_doc, TOKEN_FIELD, &cluster_path)?
        } else {
            let token_doc = read_document(reader.as_ref(), &token_path).await?;
            string_field(&token_doc, TOKEN_FIELD, &token_path)?
        };

        debug!(
            cluster = %cluster_id,
            user = %subject,
            role = %role,
            token_path = %token_path,
            "Resolved cluster credential"
        );

        Ok(ClusterCredential::new(cluster_id, endpoint, token))
    }
}

async fn read_document(
    reader: &dyn SecretReader,
    path: &str,
) -> Result<SecretDocument, ResolutionError> {
    match reader.read(path).await {
        Ok(Some(doc)) => Ok(doc),
        Ok(None) => Err(ResolutionError::SecretNotFound(path.to_string())),
        Err(StoreError::Malformed(reason)) => Err(ResolutionError::MalformedSecret {
            path: path.to_string(),
            reason,
        }),
        Err(e) => Err(ResolutionError::StoreRequest {
            path: path.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn string_field(doc: &SecretDocument, field: &str, path: &str) -> Result<String, ResolutionError> {
    match doc.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(ResolutionError::MalformedSecret {
            path: path.to_string(),
            reason: format!("field {} is empty", field),
        }),
        Some(_) => Err(ResolutionError::MalformedSecret {
            path: path.to_string(),
            reason: format!("field {} is not a string", field),
        }),
        None => Err(ResolutionError::MalformedSecret {
            path: path.to_string(),
            reason: format!("field {} is missing", field),
        }),
    }
}
