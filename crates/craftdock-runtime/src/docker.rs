//! `ContainerRuntime` backed by the Docker Engine API via bollard. One
//! stateless client handle, safe to share across tasks; serialization of
//! conflicting per-name operations is the supervisor's job, not ours.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig};
use bollard::{Docker, API_DEFAULT_VERSION};
use craftdock_common::{Error, Result, ServerStatus};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, info, instrument};

use crate::{ContainerRuntime, InstanceState, ProvisionSpec, RuntimeConfig};

/// Label distinguishing containers owned by this control plane from anything
/// else on the host.
const LABEL_MANAGED: &str = "craftdock.managed";

/// How many trailing lines a fresh tail replays before following.
const TAIL_BACKLOG: &str = "100";

const CONNECT_TIMEOUT_SECS: u64 = 30;

pub struct DockerRuntime {
    docker: Docker,
    config: RuntimeConfig,
}

impl DockerRuntime {
    pub fn new(docker: Docker, config: RuntimeConfig) -> Self {
        Self { docker, config }
    }

    /// Connect to the engine. `endpoint` overrides the platform default and
    /// accepts either a `tcp://`/`http://` address or a socket path.
    pub fn connect(config: RuntimeConfig, endpoint: Option<&str>) -> Result<Self> {
        let docker = match endpoint {
            Some(addr) if addr.starts_with("tcp://") || addr.starts_with("http://") => {
                Docker::connect_with_http(addr, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(path) => {
                Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| Error::Runtime(format!("failed to connect to container runtime: {e}")))?;
        Ok(Self { docker, config })
    }

    fn game_port_key(&self) -> String {
        format!("{}/tcp", self.config.game_port)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(name = %spec.name, memory_mb = spec.memory_mb))]
    async fn provision(&self, spec: ProvisionSpec) -> Result<()> {
        // Pull the image up front; a failed pull shows up as a create error
        // below if the image is genuinely unavailable.
        let pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: self.config.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        let _: Vec<_> = pull.collect().await;

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(self.game_port_key(), HashMap::new());

        let config = Config {
            image: Some(self.config.image.clone()),
            env: Some(vec![
                "EULA=TRUE".to_string(),
                format!("MEMORY={}M", spec.memory_mb),
                format!("RCON_PASSWORD={}", spec.rcon_secret),
            ]),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                memory: Some(i64::from(spec.memory_mb) * 1024 * 1024),
                publish_all_ports: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    // The server name doubles as the container identifier.
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 409, ..
                } => Error::DuplicateName(spec.name.clone()),
                other => map_docker_err(&spec.name, other),
            })?;

        info!(name = %spec.name, "Provisioned container");
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_docker_err(name, e))?;
        info!(%name, "Started container");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: self.config.stop_timeout_secs,
                }),
            )
            .await
            .map_err(|e| map_docker_err(name, e))?;
        info!(%name, "Stopped container");
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.docker
            .restart_container(
                name,
                Some(RestartContainerOptions {
                    t: self.config.stop_timeout_secs as isize,
                }),
            )
            .await
            .map_err(|e| map_docker_err(name, e))?;
        info!(%name, "Restarted container");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_err(name, e))?;
        info!(%name, "Removed container");
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<InstanceState> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(observe(&details, &self.game_port_key())),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(InstanceState::absent()),
            Err(e) => Err(map_docker_err(name, e)),
        }
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED}=true")],
        );
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::Runtime(format!("failed to list containers: {e}")))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|names| names.into_iter().next()))
            .map(|name| name.trim_start_matches('/').to_string())
            .collect())
    }

    fn tail_logs(&self, name: &str) -> BoxStream<'static, Result<String>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: TAIL_BACKLOG.to_string(),
            ..Default::default()
        };
        let owner = name.to_string();
        debug!(%name, "Opening log tail");
        self.docker
            .logs(name, Some(options))
            .flat_map(move |item| match item {
                Ok(chunk) => futures::stream::iter(
                    chunk_lines(chunk).into_iter().map(Ok).collect::<Vec<_>>(),
                )
                .boxed(),
                Err(e) => futures::stream::iter(vec![Err(map_docker_err(&owner, e))]).boxed(),
            })
            .boxed()
    }
}

fn map_docker_err(name: &str, err: DockerError) -> Error {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => Error::NotFound(format!("no instance named {name}")),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => Error::Runtime(format!("runtime returned {status_code} for {name}: {message}")),
        other => Error::Runtime(other.to_string()),
    }
}

/// Reduce a full inspect response to the two facts the control plane cares
/// about: is it running, and where is the game port mapped.
fn observe(details: &ContainerInspectResponse, port_key: &str) -> InstanceState {
    let running = details
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false);
    if !running {
        return InstanceState {
            status: ServerStatus::Stopped,
            port: None,
        };
    }
    InstanceState {
        status: ServerStatus::Running,
        port: host_port(details, port_key),
    }
}

fn host_port(details: &ContainerInspectResponse, port_key: &str) -> Option<u16> {
    details
        .network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(port_key)?
        .as_ref()?
        .iter()
        .find_map(|binding| binding.host_port.as_deref()?.parse().ok())
}

fn chunk_lines(chunk: LogOutput) -> Vec<String> {
    let bytes = match chunk {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message } => message,
        LogOutput::StdIn { .. } => return Vec::new(),
    };
    String::from_utf8_lossy(&bytes)
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
