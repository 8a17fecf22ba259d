//! Shell capability probe
//!
//! Reports, per container of a pod, whether `/bin/sh` can be started there.
//! Each container is probed on its own; one failing container never hides
//! the status of the others.

use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::auth::IdentityClaims;
use crate::credentials::ClusterCredential;
use crate::error::Error;
use crate::exec_proxy::{ExecPhase, ExecRequest, ExecSessionFactory, ExecStreams, SessionError};
use crate::server::AppState;

/// Command whose success means a shell is available
pub const SHELL_CHECK_COMMAND: [&str; 3] = ["/bin/sh", "-c", "type /bin/sh"];

/// Shell availability of one container
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerShellStatus {
    /// Container name
    pub name: String,
    /// Whether the shell check command ran successfully
    pub has_shell: bool,
}

/// Probe every container of `pod`, in pod spec order
///
/// Fails only when the containers cannot be listed (for example, the pod
/// does not exist). Per-container failures become `has_shell: false`.
pub async fn probe_shells(
    sessions: &dyn ExecSessionFactory,
    credential: &ClusterCredential,
    namespace: &str,
    pod: &str,
) -> Result<Vec<ContainerShellStatus>, SessionError> {
    let containers = sessions.pod_containers(credential, namespace, pod).await?;

    let mut statuses = Vec::with_capacity(containers.len());
    for name in containers {
        let has_shell = probe_container(sessions, credential, namespace, pod, &name).await;
        statuses.push(ContainerShellStatus { name, has_shell });
    }
    Ok(statuses)
}

async fn probe_container(
    sessions: &dyn ExecSessionFactory,
    credential: &ClusterCredential,
    namespace: &str,
    pod: &str,
    container: &str,
) -> bool {
    let request = ExecRequest::command(namespace, pod, container, &SHELL_CHECK_COMMAND);

    let session = match sessions.create_session(credential, request).await {
        Ok(session) => session,
        Err(e) => {
            debug!(pod = %pod, container = %container, error = %e, "Shell probe exec failed");
            return false;
        }
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let result = session
        .stream(ExecStreams {
            stdin: None,
            stdout: &mut stdout,
            stderr: Some(&mut stderr),
        })
        .await;

    match result {
        Ok(()) => true,
        Err(e) => {
            debug!(
                pod = %pod,
                container = %container,
                error = %e,
                stderr = %String::from_utf8_lossy(&stderr),
                "Shell probe command failed"
            );
            false
        }
    }
}

/// Query parameters of the probe endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellCheckQuery {
    /// Target cluster
    pub cluster_id: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
}

/// `GET /shell/check`: report shell availability for every container of a pod
pub async fn check_shell_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<IdentityClaims>,
    Query(query): Query<ShellCheckQuery>,
) -> Result<Json<Vec<ContainerShellStatus>>, Error> {
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

    let statuses = probe_shells(
        state.sessions.as_ref(),
        &credential,
        &query.namespace,
        &query.pod,
    )
    .await
    .map_err(|e| {
        error!(
            cluster = %query.cluster_id,
            namespace = %query.namespace,
            pod = %query.pod,
            error = %e,
            "Shell probe failed"
        );
        Error::from(e)
    })?;

    info!(
        cluster = %query.cluster_id,
        namespace = %query.namespace,
        pod = %query.pod,
        containers = statuses.len(),
        with_shell = statuses.iter().filter(|s| s.has_shell).count(),
        "Shell probe finished"
    );

    Ok(Json(statuses))
}
