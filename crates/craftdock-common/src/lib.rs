// Shared error taxonomy and domain types used across the craftdock crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Name already in use: {0}")]
    DuplicateName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation conflicts with current state: {0}")]
    Conflict(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

// Define the primary Result type for craftdock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Observed status of a container backing a server. `Absent` means the
/// runtime has no instance under the server's name; it is a value, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
    Absent,
}

/// Lifecycle phase tracked by the control supervisor, one per server name.
/// The transitional phases reject further commands until the operation in
/// flight settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Deleting,
    /// Terminal notification phase; the supervisor drops the entry once the
    /// record and container are both gone.
    Deleted,
}

impl LifecyclePhase {
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            LifecyclePhase::Starting
                | LifecyclePhase::Stopping
                | LifecyclePhase::Restarting
                | LifecyclePhase::Deleting
        )
    }
}

/// One server as presented to clients: the registry record joined with the
/// runtime observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerView {
    pub id: i64,
    pub name: String,
    pub memory_mb: u32,
    pub status: ServerStatus,
    /// Host-mapped game port, present only while running.
    pub port: Option<u16>,
}

/// Aggregated per-owner view computed by the reconciler. Every registry
/// record lands in exactly one of `started`/`stopped`; managed containers
/// with no record are surfaced in `orphans`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciledView {
    pub started: Vec<ServerView>,
    pub stopped: Vec<ServerView>,
    pub orphans: Vec<String>,
    pub used_memory_mb: u32,
    pub free_memory_mb: u32,
    pub quota_mb: u32,
}

/// Event delivered over a server's push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// One line of container output.
    Log { line: String },

    /// Lifecycle notification. `error` carries the runtime failure detail
    /// when a transition rolled back.
    Status {
        phase: LifecyclePhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}
