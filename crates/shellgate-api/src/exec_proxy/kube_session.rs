//! Exec sessions over the Kubernetes API using kube-rs
//!
//! A fresh client is built for every request from the resolved credential,
//! so no cluster connection outlives the operation that needed it.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::Uri;
use futures::future::Either;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess};
use kube::{Client, Config};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::session::{ExecRequest, ExecSession, ExecSessionFactory, ExecStreams, SessionError};
use crate::credentials::ClusterCredential;

/// Default TCP connect timeout for cluster API calls
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// kube-rs backed exec factory
#[derive(Clone, Debug)]
pub struct KubeExecFactory {
    insecure_skip_tls_verify: bool,
    connect_timeout: Duration,
}

impl KubeExecFactory {
    /// Factory that verifies cluster certificates
    pub fn new() -> Self {
        Self {
            insecure_skip_tls_verify: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Skip TLS certificate verification against cluster API servers
    pub fn with_insecure_skip_tls_verify(mut self, insecure: bool) -> Self {
        self.insecure_skip_tls_verify = insecure;
        self
    }

    /// Override the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn client_config(&self, credential: &ClusterCredential) -> Result<Config, SessionError> {
        let uri: Uri = credential.endpoint.parse().map_err(|e| {
            SessionError::ClientBuild(format!(
                "invalid cluster endpoint {:?}: {}",
                credential.endpoint, e
            ))
        })?;
        if uri.scheme().is_none() || uri.host().is_none() {
            return Err(SessionError::ClientBuild(format!(
                "cluster endpoint {:?} must be an absolute URL",
                credential.endpoint
            )));
        }

        let mut config = Config::new(uri);
        config.auth_info.token = Some(SecretString::from(
            credential.token.expose_secret().to_owned(),
        ));
        config.accept_invalid_certs = self.insecure_skip_tls_verify;
        config.connect_timeout = Some(self.connect_timeout);
        // Interactive sessions may sit idle indefinitely
        config.read_timeout = None;
        Ok(config)
    }

    fn client(&self, credential: &ClusterCredential) -> Result<Client, SessionError> {
        let config = self.client_config(credential)?;
        Client::try_from(config).map_err(|e| SessionError::ClientBuild(e.to_string()))
    }
}

impl Default for KubeExecFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert an exec request into kube attach parameters
///
/// With a TTY the remote side merges stderr into stdout, so stderr is only
/// requested for non-TTY commands.
fn attach_params(request: &ExecRequest) -> AttachParams {
    AttachParams {
        stdin: request.stdin,
        stdout: true,
        stderr: !request.tty,
        tty: request.tty,
        container: Some(request.container.clone()),
        max_stdin_buf_size: None,
        max_stdout_buf_size: None,
        max_stderr_buf_size: None,
    }
}

#[async_trait]
impl ExecSessionFactory for KubeExecFactory {
    async fn pod_containers(
        &self,
        credential: &ClusterCredential,
        namespace: &str,
        pod: &str,
    ) -> Result<Vec<String>, SessionError> {
        let pods: Api<Pod> = Api::namespaced(self.client(credential)?, namespace);

        let found = match pods.get(pod).await {
            Ok(p) => p,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(SessionError::PodNotFound(pod.to_string()));
            }
            Err(e) => {
                return Err(SessionError::Exec(format!("failed to read pod {}: {}", pod, e)));
            }
        };

        Ok(found
            .spec
            .map(|spec| spec.containers.into_iter().map(|c| c.name).collect())
            .unwrap_or_default())
    }

    async fn create_session(
        &self,
        credential: &ClusterCredential,
        request: ExecRequest,
    ) -> Result<Box<dyn ExecSession>, SessionError> {
        let pods: Api<Pod> = Api::namespaced(self.client(credential)?, &request.namespace);
        let params = attach_params(&request);

        let attached = pods
            .exec(&request.pod, request.command.clone(), &params)
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 404 => {
                    SessionError::PodNotFound(request.pod.clone())
                }
                other => SessionError::Exec(other.to_string()),
            })?;

        debug!(
            cluster = %credential.cluster_id,
            namespace = %request.namespace,
            pod = %request.pod,
            container = %request.container,
            tty = request.tty,
            "Exec session established"
        );

        Ok(Box::new(KubeExecSession { attached }))
    }
}

/// A running kube-rs exec
pub struct KubeExecSession {
    attached: AttachedProcess,
}

#[async_trait]
impl ExecSession for KubeExecSession {
    async fn stream(self: Box<Self>, streams: ExecStreams<'_>) -> Result<(), SessionError> {
        let ExecStreams {
            stdin,
            stdout,
            stderr,
        } = streams;
        let mut attached = self.attached;

        let remote_stdin = attached.stdin();
        let remote_stdout = attached.stdout();
        let remote_stderr = attached.stderr();
        let status = attached.take_status();

        let caller_attached_stdin = stdin.is_some();
        let input = async move {
            match (stdin, remote_stdin) {
                (Some(source), Some(mut sink)) => {
                    let copied = tokio::io::copy(source, &mut sink).await;
                    let _ = sink.shutdown().await;
                    copied.map(|_| ())
                }
                _ => Ok(()),
            }
        };

        let output = async move {
            let out = async {
                match remote_stdout {
                    Some(mut reader) => tokio::io::copy(&mut reader, stdout).await.map(|_| ()),
                    None => Ok(()),
                }
            };
            let err = async {
                match (remote_stderr, stderr) {
                    (Some(mut reader), Some(writer)) => {
                        tokio::io::copy(&mut reader, writer).await.map(|_| ())
                    }
                    (Some(mut reader), None) => {
                        let mut discard = tokio::io::sink();
                        tokio::io::copy(&mut reader, &mut discard).await.map(|_| ())
                    }
                    (None, _) => Ok(()),
                }
            };
            tokio::try_join!(out, err).map(|_| ())
        };
        tokio::pin!(output);

        let first = tokio::select! {
            res = &mut output => Either::Left(res),
            res = input => Either::Right(res),
        };
        let outcome = match first {
            Either::Left(res) => res,
            Either::Right(res) if caller_attached_stdin => {
                // Caller went away: nothing is left to deliver output to
                debug!(error = ?res.err(), "Caller input ended, stopping exec");
                attached.abort();
                return Ok(());
            }
            Either::Right(res) => {
                res.map_err(|e| SessionError::Stream(e.to_string()))?;
                output.await
            }
        };
        outcome.map_err(|e| SessionError::Stream(e.to_string()))?;

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    return Err(SessionError::Stream(
                        status
                            .message
                            .unwrap_or_else(|| "remote command failed".to_string()),
                    ));
                }
            }
        }

        if let Err(e) = attached.join().await {
            debug!(error = %e, "Exec background task ended with error");
        }
        Ok(())
    }
}
