//! Exec session capability
//!
//! Decouples the orchestration from any particular exec transport. The
//! gateway only needs to list a pod's containers and to run a command with
//! stdin/stdout/stderr wired to caller-supplied streams.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::credentials::ClusterCredential;

/// Command run for interactive sessions
pub const INTERACTIVE_SHELL: &str = "/bin/sh";

/// A command to run inside a container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecRequest {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Target container
    pub container: String,
    /// Command vector
    pub command: Vec<String>,
    /// Whether stdin is attached
    pub stdin: bool,
    /// Whether a TTY is allocated
    pub tty: bool,
}

impl ExecRequest {
    /// Interactive shell with stdin and a TTY
    pub fn interactive(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
            command: vec![INTERACTIVE_SHELL.to_string()],
            stdin: true,
            tty: true,
        }
    }

    /// Non-interactive command with no stdin and no TTY
    pub fn command(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
        command: &[&str],
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
            command: command.iter().map(|c| c.to_string()).collect(),
            stdin: false,
            tty: false,
        }
    }
}

/// Caller-side streams an exec session is wired to
pub struct ExecStreams<'a> {
    /// Source for the remote stdin; `None` attaches nothing
    pub stdin: Option<&'a mut (dyn AsyncRead + Unpin + Send)>,
    /// Sink for the remote stdout
    pub stdout: &'a mut (dyn AsyncWrite + Unpin + Send),
    /// Sink for the remote stderr; `None` discards it
    pub stderr: Option<&'a mut (dyn AsyncWrite + Unpin + Send)>,
}

/// Errors from exec session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Client for the target cluster could not be built
    #[error("failed to build cluster client: {0}")]
    ClientBuild(String),

    /// The target pod does not exist
    #[error("pod {0} not found")]
    PodNotFound(String),

    /// Exec could not be started
    #[error("failed to start exec: {0}")]
    Exec(String),

    /// Exec started but failed while streaming
    #[error("exec stream failed: {0}")]
    Stream(String),
}

/// A started exec, ready to be streamed
#[async_trait]
pub trait ExecSession: Send {
    /// Pump data between the remote process and `streams` until it exits
    ///
    /// Succeeds only when the remote side finished cleanly.
    async fn stream(self: Box<Self>, streams: ExecStreams<'_>) -> Result<(), SessionError>;
}

/// Creates exec sessions against a cluster using resolved credentials
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecSessionFactory: Send + Sync {
    /// Container names of a pod, in spec order
    async fn pod_containers(
        &self,
        credential: &ClusterCredential,
        namespace: &str,
        pod: &str,
    ) -> Result<Vec<String>, SessionError>;

    /// Start `request` in the target cluster
    async fn create_session(
        &self,
        credential: &ClusterCredential,
        request: ExecRequest,
    ) -> Result<Box<dyn ExecSession>, SessionError>;
}

/// Lifecycle phase of an exec-driven operation
///
/// ```text
/// Unauthenticated -> CredentialResolving -> SessionEstablishing -> Streaming -> Terminated
/// ```
///
/// Any phase may move straight to `Terminated` on failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecPhase {
    /// Request not yet authenticated
    Unauthenticated,
    /// Reading cluster credentials
    CredentialResolving,
    /// Creating the exec session
    SessionEstablishing,
    /// Bytes flowing between caller and container
    Streaming,
    /// Finished, successfully or not
    Terminated,
}

impl ExecPhase {
    /// Phase name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecPhase::Unauthenticated => "unauthenticated",
            ExecPhase::CredentialResolving => "credential_resolving",
            ExecPhase::SessionEstablishing => "session_establishing",
            ExecPhase::Streaming => "streaming",
            ExecPhase::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ExecPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
