//! Interactive exec endpoint
//!
//! Requests that are not WebSocket upgrades are turned away before any
//! secret store traffic. Cluster credentials are resolved before the upgrade
//! is accepted, so resolution failures are still reported as HTTP errors.
//! After the upgrade the socket
//! is wrapped in a [`StreamBridge`] and wired into the remote shell; failures
//! from that point on can only be reported as text frames.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures::{Sink, Stream};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::bridge::StreamBridge;
use super::session::{ExecPhase, ExecRequest, ExecSessionFactory, ExecStreams};
use crate::auth::{IdentityClaims, BEARER_SUBPROTOCOL};
use crate::credentials::ClusterCredential;
use crate::error::Error;
use crate::server::AppState;

/// Query parameters of the interactive endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecQuery {
    /// Target cluster
    pub cluster_id: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container to open the shell in
    pub container: String,
}

/// `GET /ws/exec`: open an interactive shell in a container
pub async fn exec_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<IdentityClaims>,
    Query(query): Query<ExecQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, Error> {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(
                user = %identity.subject(),
                error = %rejection,
                "Exec request is not a WebSocket upgrade"
            );
            return Ok(rejection.into_response());
        }
    };

    info!(
        cluster = %query.cluster_id,
        namespace = %query.namespace,
        pod = %query.pod,
        container = %query.container,
        user = %identity.subject(),
        phase = %ExecPhase::CredentialResolving,
        "Exec requested"
    );

    let credential = state
        .resolver
        .resolve(
            &query.cluster_id,
            identity.subject(),
            identity.role(),
            Some(&query.namespace),
        )
        .await
        .map_err(|e| {
            error!(
                cluster = %query.cluster_id,
                user = %identity.subject(),
                phase = %ExecPhase::Terminated,
                error = %e,
                "Credential resolution failed"
            );
            Error::from(e)
        })?;

    let request = ExecRequest::interactive(query.namespace, query.pod, query.container);
    let sessions = state.sessions.clone();
    let user = identity.subject().to_string();

    Ok(ws
        .protocols([BEARER_SUBPROTOCOL])
        .on_upgrade(move |socket| run_exec_session(socket, sessions, credential, request, user))
        .into_response())
}

/// Drive one interactive session over an upgraded connection
pub(crate) async fn run_exec_session<S, E>(
    socket: S,
    sessions: Arc<dyn ExecSessionFactory>,
    credential: ClusterCredential,
    request: ExecRequest,
    user: String,
) where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut bridge = StreamBridge::new(socket);

    info!(
        cluster = %credential.cluster_id,
        namespace = %request.namespace,
        pod = %request.pod,
        container = %request.container,
        user = %user,
        phase = %ExecPhase::SessionEstablishing,
        "Exec WebSocket connection established"
    );

    let session = match sessions.create_session(&credential, request.clone()).await {
        Ok(session) => session,
        Err(e) => {
            error!(
                cluster = %credential.cluster_id,
                pod = %request.pod,
                container = %request.container,
                phase = %ExecPhase::Terminated,
                error = %e,
                "Failed to create exec session"
            );
            report_and_close(&mut bridge, format!("Executor error: {}", e)).await;
            return;
        }
    };

    info!(
        cluster = %credential.cluster_id,
        pod = %request.pod,
        container = %request.container,
        phase = %ExecPhase::Streaming,
        "Exec session streaming"
    );

    let result = {
        let (mut reader, mut writer) = tokio::io::split(&mut bridge);
        session
            .stream(ExecStreams {
                stdin: Some(&mut reader),
                stdout: &mut writer,
                stderr: None,
            })
            .await
    };

    match result {
        Ok(()) => {
            info!(
                cluster = %credential.cluster_id,
                pod = %request.pod,
                container = %request.container,
                phase = %ExecPhase::Terminated,
                "Exec session ended"
            );
            bridge.close().await;
        }
        Err(e) => {
            warn!(
                cluster = %credential.cluster_id,
                pod = %request.pod,
                container = %request.container,
                phase = %ExecPhase::Terminated,
                error = %e,
                "Exec stream failed"
            );
            report_and_close(&mut bridge, format!("Exec stream error: {}", e)).await;
        }
    }
}

async fn report_and_close<S, E>(bridge: &mut StreamBridge<S>, message: String)
where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    // The peer may already be gone
    let _ = bridge.send_text(message).await;
    bridge.close().await;
}
