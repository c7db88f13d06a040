//! [`ContainerRuntime`] backed by the local Docker daemon.

use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::runtime::{ContainerRuntime, RunOutcome, RunSpec};
use crate::error::{Result, RuntimeError};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect with the platform defaults (`DOCKER_HOST` or the local
    /// socket) and verify the daemon answers.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        info!("connected to container runtime");
        Ok(Self { docker })
    }

    async fn collect_logs(&self, id: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => {
                    warn!(container_id = %id, error = %e, "failed to read container logs");
                    break;
                }
            }
        }
        output
    }

    /// Wait for exit. A non-zero exit surfaces from the daemon as an error
    /// carrying the code.
    async fn wait_exit(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::Container(
                "wait stream ended without an exit status".to_string(),
            )),
        }
    }

    async fn remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            warn!(container_id = %id, error = %e, "failed to remove container");
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull(&self, image: &str, timeout: Duration) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let pull = async {
            let mut stream = self.docker.create_image(Some(options), None, None);
            while let Some(progress) = stream.next().await {
                progress.map_err(|e| RuntimeError::Pull {
                    image: image.to_string(),
                    message: e.to_string(),
                })?;
            }
            Ok(())
        };
        tokio::time::timeout(timeout, pull)
            .await
            .map_err(|_| RuntimeError::Timeout(timeout))?
    }

    async fn run(&self, spec: RunSpec) -> Result<RunOutcome> {
        let host_config = HostConfig {
            binds: Some(spec.mounts.iter().map(|m| m.bind_spec()).collect()),
            memory: Some(spec.limits.memory_bytes),
            memory_swap: Some(spec.limits.memory_bytes),
            cpu_period: Some(spec.limits.cpu_period),
            cpu_quota: Some(spec.limits.cpu_quota),
            pids_limit: Some(spec.limits.pids_limit),
            network_mode: (!spec.network).then(|| "none".to_string()),
            auto_remove: Some(false),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            network_disabled: Some(!spec.network),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let created = self.docker.create_container(Some(options), config).await?;
        let id = created.id;
        debug!(container_id = %id, image = %spec.image, "container created");

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&id).await;
            return Err(e.into());
        }

        let (exit_code, timed_out) = match tokio::time::timeout(spec.timeout, self.wait_exit(&id)).await {
            Ok(Ok(code)) => (code, false),
            Ok(Err(e)) => {
                self.remove(&id).await;
                return Err(e);
            }
            Err(_) => {
                warn!(container_id = %id, timeout = ?spec.timeout, "container run timed out");
                (-1, true)
            }
        };

        let output = self.collect_logs(&id).await;
        self.remove(&id).await;
        Ok(RunOutcome {
            exit_code,
            output,
            container_id: id,
            timed_out,
        })
    }
}
