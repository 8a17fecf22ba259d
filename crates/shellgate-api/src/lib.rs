//! Shellgate API
//!
//! An authenticated WebSocket gateway into container shells on many clusters.
//! Callers never hold cluster credentials: the gateway resolves a per-identity
//! cluster token from Vault for every request and drives the remote exec on
//! the caller's behalf.
//!
//! # Architecture
//!
//! ```text
//! browser ──► auth gate ──► credential resolver ──► exec session ──► cluster API
//!  (ws)        (HS512)         (Vault KV v2)         (kube-rs)
//! ```
//!
//! # Endpoints
//!
//! - `GET /ws/exec?clusterId&namespace&pod&container` - Interactive shell (WebSocket)
//! - `GET /shell/check?clusterId&namespace&pod` - Per-container shell availability
//! - `GET /livez`, `GET /readyz`, `GET /actuator/health[/liveness|/readiness]` - Health

#![deny(missing_docs)]

pub mod auth;
pub mod credentials;
pub mod error;
pub mod exec_proxy;
pub mod probe;
pub mod server;
pub mod vault;

pub use auth::{IdentityClaims, Role, TokenValidator};
pub use credentials::{ClusterCredential, CredentialResolver, SecretStore};
pub use error::{Error, Result};
pub use exec_proxy::{ExecSessionFactory, KubeExecFactory};
pub use server::{build_router, start_server, AppState, ServerConfig, TlsFiles};
pub use vault::{VaultConfig, VaultStore};
