//! Exec proxying
//!
//! Bridges an authenticated WebSocket into a shell running in a remote
//! container, through a pluggable exec backend.

pub mod bridge;
pub mod handlers;
pub mod kube_session;
pub mod session;

pub use bridge::StreamBridge;
pub use handlers::{exec_handler, ExecQuery};
pub use kube_session::KubeExecFactory;
pub use session::{
    ExecPhase, ExecRequest, ExecSession, ExecSessionFactory, ExecStreams, SessionError,
};
