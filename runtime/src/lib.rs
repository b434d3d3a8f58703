//! Container runtime abstraction.
//!
//! The run manager drives containers through [`Runtime`]; the two
//! implementations are Docker over bollard and the Apple `container` CLI.

use std::path::PathBuf;
use std::pin::Pin;

use futures::Stream;
use tokio::io::AsyncWrite;

use moat_common::{Error, ErrorKind, LogStream};

pub mod apple;
pub mod docker;

pub use apple::AppleRuntime;
pub use docker::DockerRuntime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeType {
    Docker,
    Apple,
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Apple => write!(f, "apple"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("no such container or image: {0}")]
    NotFound(String),
    #[error("runtime api error: {0}")]
    Api(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as DockerError;
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound(message),
            other => Self::Api(other.to_string()),
        }
    }
}

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Self {
        match &err {
            RuntimeError::Unavailable(_) => Error::source(ErrorKind::RuntimeUnavailable, err),
            _ => Error::source(ErrorKind::Internal, err),
        }
    }
}

/// A host directory mounted into the container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// A container port to expose on the host. With `host_port = None` the
/// runtime picks a free port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortPublish {
    pub container_port: u16,
    pub host_port: Option<u16>,
}

/// Everything the manager knows about the container it wants.
#[derive(Clone, Debug, Default)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub published_ports: Vec<PortPublish>,
    /// `hostname:address` entries for the container's hosts file.
    pub host_aliases: Vec<String>,
    pub privileged: bool,
    pub tty: bool,
    pub stdin_open: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
}

/// A container port as reachable from the host, `"host:port"` form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_addr: String,
}

/// A chunk of container output with the stream it came from.
#[derive(Clone, Debug)]
pub struct LogChunk {
    pub stream: LogStream,
    pub bytes: Vec<u8>,
}

pub type LogChunkStream = Pin<Box<dyn Stream<Item = Result<LogChunk, RuntimeError>> + Send>>;

/// Streams for an attached (interactive) container.
pub struct AttachStreams {
    pub output: LogChunkStream,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait::async_trait]
pub trait Runtime: Send + Sync {
    fn runtime_type(&self) -> RuntimeType;

    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn close(&self) -> Result<(), RuntimeError>;

    /// Create the container and return its runtime id. The image must
    /// already be present; callers resolve images through
    /// [`ensure_image`](Runtime::ensure_image) first.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Block until the container exits; returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError>;

    async fn container_logs(&self, id: &str) -> Result<LogChunkStream, RuntimeError>;

    /// Attach to a created container's TTY. Must be called before
    /// [`start_container`](Runtime::start_container) so no output is lost.
    async fn attach_container(&self, id: &str) -> Result<AttachStreams, RuntimeError>;

    /// Host addresses for the container's published ports, resolvable once
    /// the container is created (Docker) or started (Apple).
    async fn published_ports(&self, id: &str) -> Result<Vec<PortMapping>, RuntimeError>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>, RuntimeError>;

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn remove_image(&self, name: &str) -> Result<(), RuntimeError>;

    /// Pull `image` unless a local copy exists.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// The address a process inside the container should use to reach the
    /// host: `host.docker.internal` for Docker, the gateway IP for Apple.
    fn host_address(&self) -> String;

    fn supports_host_network(&self) -> bool;
}
