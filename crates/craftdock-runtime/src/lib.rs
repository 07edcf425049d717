//! Runtime adapter: the seam between the control plane and the container
//! runtime. `ContainerRuntime` is the trait the rest of the workspace
//! programs against; `DockerRuntime` is the production implementation and
//! `test_utils::FakeRuntime` the in-memory one.

use async_trait::async_trait;
use craftdock_common::{Result, ServerStatus};
use futures::stream::BoxStream;

pub mod docker;
pub mod test_utils;

pub use docker::DockerRuntime;

/// Everything the runtime needs to create a container for a server. The
/// image and port mapping come from [`RuntimeConfig`], not from the caller.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub name: String,
    pub memory_mb: u32,
    pub rcon_secret: String,
}

/// Point-in-time observation of the instance backing a server name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceState {
    pub status: ServerStatus,
    /// Host-mapped game port, only meaningful while running.
    pub port: Option<u16>,
}

impl InstanceState {
    pub fn absent() -> Self {
        Self {
            status: ServerStatus::Absent,
            port: None,
        }
    }
}

/// Runtime-level configuration, externally supplied.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Image every server container is created from.
    pub image: String,
    /// In-container game port; the host side is published randomly.
    pub game_port: u16,
    /// Grace period handed to the runtime on stop/restart.
    pub stop_timeout_secs: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            image: "itzg/minecraft-server".to_string(),
            game_port: 25565,
            stop_timeout_secs: 30,
        }
    }
}

/// Interface to the container runtime. All operations against a name with no
/// backing instance return `Error::NotFound`; `inspect` is the exception and
/// reports absence as a status instead.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (without starting) the container backing a server. Fails with
    /// `DuplicateName` when an instance under this name already exists.
    async fn provision(&self, spec: ProvisionSpec) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn restart(&self, name: &str) -> Result<()>;

    /// Force-remove the instance, running or not.
    async fn remove(&self, name: &str) -> Result<()>;

    async fn inspect(&self, name: &str) -> Result<InstanceState>;

    /// Names of all instances this control plane manages, whatever their
    /// state. Used for orphan detection.
    async fn list_managed(&self) -> Result<Vec<String>>;

    /// Lazy tail of the instance's output. Infinite while the instance runs,
    /// ends when it stops; failures surface as in-band `Err` items.
    fn tail_logs(&self, name: &str) -> BoxStream<'static, Result<String>>;
}
