/// Docker and Docker Compose integration
///
/// Everything the orchestrators need from the container runtime goes through
/// the `ServiceRuntime` trait: container inspection, compose lifecycle, volume
/// removal and the commands that stream data in and out of Postgres.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::volume::RemoveVolumeOptions;
use bollard::Docker;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, info};

use crate::core::config::Config;
use crate::utils::ContainerState;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Inspected state of a container
    async fn container_state(&self, container: &str) -> Result<ContainerState>;

    /// Whether Postgres inside the database container accepts connections
    async fn is_db_ready(&self) -> Result<bool>;

    /// Stop and remove every service of the compose project
    async fn compose_down(&self) -> Result<()>;

    /// Start the given services, or all of them when the list is empty
    async fn compose_up(&self, services: &[String]) -> Result<()>;

    async fn remove_volume(&self, volume: &str) -> Result<()>;

    /// Application version reported by the panel container
    async fn app_version(&self) -> Option<String>;

    /// Command that writes a plain-SQL dump of every database to stdout
    fn dump_command(&self) -> Command;

    /// Command that applies SQL read from stdin
    fn replay_command(&self) -> Command;
}

/// `ServiceRuntime` backed by the local Docker daemon
pub struct DockerRuntime {
    docker: Docker,
    project_root: PathBuf,
    db_container: String,
    app_container: String,
    db_user: String,
}

impl DockerRuntime {
    pub fn new(config: &Config) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon. Is Docker running?")?;

        let project_root = config.remnawave_dir.clone();
        let compose_file = project_root.join("docker-compose.yml");
        if !compose_file.exists() {
            return Err(anyhow!(
                "docker-compose.yml not found at {}",
                compose_file.display()
            ));
        }

        Ok(Self {
            docker,
            project_root,
            db_container: config.db_container.clone(),
            app_container: config.app_container.clone(),
            db_user: config.db_user.clone(),
        })
    }

    /// Execute docker compose command in the project directory
    pub async fn compose_command(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "docker compose");

        let output = tokio::process::Command::new("docker")
            .arg("compose")
            .args(args)
            .current_dir(&self.project_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to execute docker compose command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Docker compose command failed: {}", stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ServiceRuntime for DockerRuntime {
    async fn container_state(&self, container: &str) -> Result<ContainerState> {
        let inspect = match self.docker.inspect_container(container, None).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                return Ok(ContainerState::Missing);
            }
            Err(e) => return Err(anyhow!("Failed to inspect container {}: {}", container, e)),
        };

        let state = inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|status| ContainerState::from(status.to_string().as_str()))
            .unwrap_or(ContainerState::Unknown);

        debug!(container, ?state, "inspected container");
        Ok(state)
    }

    async fn is_db_ready(&self) -> Result<bool> {
        let status = tokio::process::Command::new("docker")
            .args(["exec", self.db_container.as_str(), "pg_isready", "-U", self.db_user.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("Failed to run pg_isready")?;
        Ok(status.success())
    }

    async fn compose_down(&self) -> Result<()> {
        info!(root = %self.project_root.display(), "stopping compose project");
        self.compose_command(&["down"]).await?;
        Ok(())
    }

    async fn compose_up(&self, services: &[String]) -> Result<()> {
        let mut args = vec!["up", "-d"];
        args.extend(services.iter().map(String::as_str));
        info!(?services, "starting compose services");
        self.compose_command(&args).await?;
        Ok(())
    }

    async fn remove_volume(&self, volume: &str) -> Result<()> {
        match self
            .docker
            .remove_volume(volume, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => {
                info!(volume, "removed volume");
                Ok(())
            }
            // Already gone is the state we want
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(anyhow!("Failed to remove volume {}: {}", volume, e)),
        }
    }

    async fn app_version(&self) -> Option<String> {
        let output = tokio::process::Command::new("docker")
            .args(["exec", self.app_container.as_str(), "cat", "package.json"])
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }
        parse_package_version(&output.stdout)
    }

    fn dump_command(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.args(["exec", self.db_container.as_str(), "pg_dumpall", "-c", "-U", self.db_user.as_str()]);
        cmd
    }

    fn replay_command(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.args([
            "exec",
            "-i",
            self.db_container.as_str(),
            "psql",
            "-q",
            "-U",
            self.db_user.as_str(),
            "-d",
            "postgres",
        ]);
        cmd
    }
}

/// Extract the `version` field from a package.json document
pub fn parse_package_version(package_json: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(package_json).ok()?;
    value
        .get("version")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
