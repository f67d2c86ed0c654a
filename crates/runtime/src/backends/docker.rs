//! Docker backend built on testcontainers.

use crate::error::{RuntimeError, RuntimeResult};
use crate::traits::{ContainerRuntime, ContainerSpec, ExecOutput, RunningContainer};
use async_trait::async_trait;
use cask_core::config::BindMode;
use cask_core::names::random_name;
use testcontainers::core::{AccessMode, CmdWaitFor, ExecCommand, IntoContainerPort, Mount, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ContainerRequest, GenericImage, ImageExt};
use tracing::{debug, instrument};

/// Log line printed by PostgreSQL once it accepts connections.
const POSTGRES_READY_LINE: &str = "database system is ready to accept connections";

/// Container runtime backed by the local Docker daemon.
///
/// Networks are created lazily by the daemon when the first container joins
/// them and removed together with their last container.
#[derive(Debug, Default)]
pub struct DockerRuntime;

impl DockerRuntime {
    pub fn new() -> Self {
        Self
    }

    fn request(spec: &ContainerSpec) -> ContainerRequest<GenericImage> {
        let mut image = GenericImage::new(spec.image.clone(), spec.tag.clone())
            .with_exposed_port(spec.exposed_port.tcp());
        if spec.image.ends_with("postgres") {
            image = image.with_wait_for(WaitFor::message_on_stderr(POSTGRES_READY_LINE));
        }

        let mut request = image
            .with_container_name(spec.name.clone())
            .with_startup_timeout(spec.startup_timeout);
        if let Some(network) = &spec.network {
            request = request.with_network(network.clone());
        }
        for (key, value) in &spec.env {
            request = request.with_env_var(key.clone(), value.clone());
        }
        if !spec.cmd.is_empty() {
            request = request.with_cmd(spec.cmd.clone());
        }
        for path in &spec.tmpfs {
            request = request.with_mount(Mount::tmpfs_mount(path.clone()));
        }
        for mount in &spec.bind_mounts {
            let access = match mount.mode {
                BindMode::Rw => AccessMode::ReadWrite,
                BindMode::Ro => AccessMode::ReadOnly,
            };
            request = request.with_mount(
                Mount::bind_mount(mount.source.to_string_lossy(), mount.target.clone())
                    .with_access_mode(access),
            );
        }
        request
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_network(&self) -> RuntimeResult<String> {
        Ok(random_name("cask_net"))
    }

    #[instrument(skip(self, spec), fields(image = %spec.image, tag = %spec.tag, name = %spec.name))]
    async fn start(&self, spec: ContainerSpec) -> RuntimeResult<Box<dyn RunningContainer>> {
        let container = Self::request(&spec).start().await?;
        debug!(id = %container.id(), "container started");
        Ok(Box::new(DockerContainer {
            name: spec.name,
            container,
        }))
    }
}

/// A container started by [`DockerRuntime`]; removed when dropped.
pub struct DockerContainer {
    name: String,
    container: ContainerAsync<GenericImage>,
}

#[async_trait]
impl RunningContainer for DockerContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn host(&self) -> RuntimeResult<String> {
        Ok(self.container.get_host().await?.to_string())
    }

    async fn mapped_port(&self, port: u16) -> RuntimeResult<u16> {
        Ok(self.container.get_host_port_ipv4(port.tcp()).await?)
    }

    async fn exec(&self, command: &[String]) -> RuntimeResult<ExecOutput> {
        let mut result = self
            .container
            .exec(ExecCommand::new(command.to_vec()).with_cmd_ready_condition(CmdWaitFor::exit()))
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;

        // `ExecResult::exit_code` borrows the result across an await, and the
        // result is not `Sync`; collect it on a blocking thread instead.
        let runtime = tokio::runtime::Handle::current();
        let (stdout, stderr, exit_code) = tokio::task::spawn_blocking(move || {
            runtime.block_on(async move {
                let stdout = result.stdout_to_vec().await?;
                let stderr = result.stderr_to_vec().await?;
                let exit_code = result.exit_code().await?;
                Ok::<_, testcontainers::TestcontainersError>((stdout, stderr, exit_code))
            })
        })
        .await
        .map_err(|e| RuntimeError::Exec(e.to_string()))?
        .map_err(|e| RuntimeError::Exec(e.to_string()))?;
        let exit_code = exit_code.unwrap_or(-1);

        let mut output = String::from_utf8_lossy(&stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&stderr));
        Ok(ExecOutput { exit_code, output })
    }

    async fn stop(&self) -> RuntimeResult<()> {
        self.container.stop().await?;
        Ok(())
    }
}
