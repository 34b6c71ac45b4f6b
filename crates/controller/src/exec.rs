//! Remote command execution inside pod containers.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// The command ran and exited unsuccessfully.
    #[error("command exited with code {code}: {stderr}")]
    Failed {
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// The command could not be run at all.
    #[error("exec transport error: {0}")]
    Transport(String),
}

impl ExecError {
    /// Exit code to record for this failure. Transport errors use 2.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecError::Failed { code, .. } => *code,
            ExecError::Transport(_) => 2,
        }
    }
}

impl From<kube::Error> for ExecError {
    fn from(err: kube::Error) -> Self {
        ExecError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command in a container and waits for it to finish.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodExecutor: Send + Sync {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, ExecError>;
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> Result<String, ExecError> {
    let mut out = String::new();
    if let Some(mut reader) = reader {
        reader
            .read_to_string(&mut out)
            .await
            .map_err(|e| ExecError::Transport(e.to_string()))?;
    }
    Ok(out)
}

/// [`PodExecutor`] over the pods/exec websocket subresource.
#[derive(Clone)]
pub struct KubeExecutor {
    client: Client,
}

impl KubeExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExecutor for KubeExecutor {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, ExecError> {
        debug!(pod = %pod, container = %container, command = ?command, "Executing in pod");
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = pods.exec(pod, command, &params).await?;

        let (stdout, stderr) =
            tokio::try_join!(read_all(attached.stdout()), read_all(attached.stderr()))?;

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| ExecError::Transport(e.to_string()))?;

        match status {
            Some(s) if s.status.as_deref() == Some("Failure") => {
                let code = s
                    .details
                    .and_then(|d| d.causes)
                    .unwrap_or_default()
                    .into_iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
                    .and_then(|c| c.message)
                    .and_then(|m| m.parse().ok())
                    .unwrap_or(1);
                Err(ExecError::Failed {
                    code,
                    stdout,
                    stderr: if stderr.is_empty() {
                        s.message.unwrap_or_default()
                    } else {
                        stderr
                    },
                })
            }
            _ => Ok(ExecOutput { stdout, stderr }),
        }
    }
}
