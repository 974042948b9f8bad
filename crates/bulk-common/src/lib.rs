use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub mod logging;

// ============================================================================
// Run Inputs
// ============================================================================

/// The message applied to every destination of a run.
///
/// Constant for the whole run and shared by reference with every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchJob {
    pub source_address: String,
    pub message_text: String,
}

impl DispatchJob {
    pub fn new(source_address: impl Into<String>, message_text: impl Into<String>) -> Self {
        Self {
            source_address: source_address.into(),
            message_text: message_text.into(),
        }
    }

    /// Returns the name of the first missing field, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.source_address.trim().is_empty() {
            Some("source_address")
        } else if self.message_text.is_empty() {
            Some("message_text")
        } else {
            None
        }
    }
}

/// Bind credentials for an SMPP session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub system_id: String,
    pub password: String,
}

impl Credentials {
    pub fn new(system_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            system_id: system_id.into(),
            password: password.into(),
        }
    }
}

// Never print the password.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("system_id", &self.system_id)
            .field("password", &"***")
            .finish()
    }
}

/// Errors raised while loading a destination list
#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    #[error("Destination list is empty")]
    Empty,

    #[error("Failed to read destination file: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered, immutable list of destination addresses.
///
/// Cloning is cheap: the addresses are shared, never copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationList {
    addresses: Arc<[Arc<str>]>,
}

impl DestinationList {
    /// Parse one address per line, trimming whitespace and skipping blank lines.
    pub fn parse(text: &str) -> Result<Self, DestinationError> {
        let addresses: Vec<Arc<str>> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Arc::from)
            .collect();
        Self::from_vec(addresses)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DestinationError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn from_vec<S: Into<Arc<str>>>(addresses: Vec<S>) -> Result<Self, DestinationError> {
        if addresses.is_empty() {
            return Err(DestinationError::Empty);
        }
        Ok(Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// The addresses in `[start, end)`, clipped to the list length
    pub fn slice(&self, start: usize, end: usize) -> &[Arc<str>] {
        let end = end.min(self.addresses.len());
        let start = start.min(end);
        &self.addresses[start..end]
    }
}

/// Parse a newline-separated destination list.
pub fn load_destinations(text: &str) -> Result<DestinationList, DestinationError> {
    DestinationList::parse(text)
}

// ============================================================================
// Worker Message Vocabulary
// ============================================================================

/// One destination handed to a session worker
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Position of the destination in the run's destination list
    pub index: usize,
    pub destination: Arc<str>,
    pub job: Arc<DispatchJob>,
}

/// Instructions posted by the dispatcher to a session worker
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Send(SendRequest),
    Pause,
    Resume,
    Close,
}

/// Reports posted by a session worker to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Session bound, worker accepts sends
    Ready { worker: usize },
    /// Session lost, worker is reconnecting or idle
    NotReady { worker: usize },
    /// The peer accepted the submission for this destination
    Processed { worker: usize, index: usize },
    /// Session could not be established (or re-established within the bound)
    Error { worker: usize, reason: String },
}

impl WorkerEvent {
    pub fn worker(&self) -> usize {
        match self {
            WorkerEvent::Ready { worker }
            | WorkerEvent::NotReady { worker }
            | WorkerEvent::Processed { worker, .. }
            | WorkerEvent::Error { worker, .. } => *worker,
        }
    }
}

// ============================================================================
// Run State & Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    /// Workers are being closed; becomes Idle once teardown finishes
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Read-only projection of dispatcher state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub run_state: RunState,
    /// Identifier of the current (or last) run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Destinations handed to a worker (not necessarily confirmed)
    pub numbers_processed: u64,
    pub batch_counter: u64,
    /// Next unsent index into the destination list
    pub cursor: usize,
    pub ready_workers: usize,
    pub total_workers: usize,
    pub total_destinations: usize,
    /// Submissions the peer accepted, as reported by workers
    pub submitted: u64,
    /// Reason of the last run-fatal failure; cleared when a new run starts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StatusSnapshot {
    pub fn progress_percent(&self) -> f64 {
        if self.total_destinations == 0 {
            return 0.0;
        }
        self.numbers_processed as f64 / self.total_destinations as f64 * 100.0
    }
}
