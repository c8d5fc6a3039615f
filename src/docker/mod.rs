//! Container runtime collaborator boundary.
//!
//! Everything the rest of the crate needs from the runtime is the
//! seven operations on [`ContainerRuntime`]; the registry, the agent
//! orchestrator and the tests only ever see this trait. The concrete
//! [`DockerClient`] speaks the Docker Engine HTTP API over the local
//! unix socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use async_trait::async_trait;
use tokio::sync::mpsc;

mod client;

pub use client::DockerClient;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported docker uri `{0}`, expected unix://<path>")]
    UnsupportedUri(String),
    #[error("failed to connect to docker socket `{path}`: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("http handshake with docker daemon failed: {source}")]
    Handshake {
        #[source]
        source: hyper::Error,
    },
    #[error("failed to build request for `{path}`: {source}")]
    BuildRequest {
        path: String,
        #[source]
        source: hyper::http::Error,
    },
    #[error("request to `{path}` failed: {source}")]
    Request {
        path: String,
        #[source]
        source: hyper::Error,
    },
    #[error("docker returned status {status} for `{path}`")]
    UnexpectedStatus {
        status: hyper::StatusCode,
        path: String,
    },
    #[error("failed to decode response from `{path}`: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to build archive for `{path}`: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A container as reported by a list call; only the id is needed, the
/// registry re-inspects before tracking.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
}

/// The subset of a container inspection the registry and orchestrator
/// consume.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    /// Container name as reported by the runtime, usually with a
    /// leading slash.
    pub name: String,
    pub image: String,
    pub running: bool,
    /// OCI runtime name the container was launched with (e.g. `runc`).
    pub runtime: String,
    pub labels: HashMap<String, String>,
    /// Attached network name to IP address.
    pub networks: HashMap<String, String>,
}

/// State of an exec session, resolved lazily when an agent has to be
/// terminated.
#[derive(Debug, Clone)]
pub struct ExecInfo {
    pub container_id: String,
    pub pid: i64,
}

/// A lifecycle event from the runtime's event stream.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event source type, e.g. `container`.
    pub typ: String,
    /// Action string. Health transitions arrive as
    /// `health_status: healthy` and similar; use
    /// [`Event::is_health_status`] instead of exact matching.
    pub action: String,
    pub actor_id: String,
}

impl Event {
    pub fn is_container(&self) -> bool {
        self.typ == "container"
    }

    pub fn is_health_status(&self) -> bool {
        self.action.starts_with("health_status")
    }

    pub fn is_die(&self) -> bool {
        self.action == "die"
    }
}

/// Attach flags for an exec session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

/// The runtime operations this crate depends on.
///
/// Every call is individually fallible; call sites isolate failures
/// per target instead of propagating them across containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Lists containers carrying the marker label.
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;

    /// Copies a local file or directory into `remote_dir` inside the
    /// container.
    async fn copy_to_container(&self, local: &Path, id: &str, remote_dir: &str) -> Result<()>;

    /// Creates an exec session and returns its id.
    async fn exec_create(&self, id: &str, cmd: &[String], opts: ExecOptions) -> Result<String>;

    /// Starts an exec session. With `detach` the call returns
    /// immediately and the output is empty; otherwise the collected
    /// output is returned once the session closes its stream.
    async fn exec_start(&self, exec_id: &str, detach: bool) -> Result<String>;

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecInfo>;

    /// Subscribes to the runtime's event stream, filtered by label and
    /// action names. Events arrive on the returned channel for as long
    /// as the stream stays open; the channel closes when it ends.
    async fn events(&self, label: &str, actions: &[&str]) -> Result<mpsc::Receiver<Event>>;
}
