use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use strum::{Display, EnumIter, EnumString};

/// Default VRAM request in bytes when a submission does not specify one
/// (also used when re-registering scripts found on disk after a restart).
pub const DEFAULT_VRAM_REQUEST: u64 = 2 * crate::core::GIB;

#[derive(Debug)]
pub enum SubmitError {
    EmptyScript,
    InvalidUser(String),
    ZeroVram,
}

impl std::error::Error for SubmitError {}
impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::EmptyScript => write!(f, "Submitted script is empty"),
            SubmitError::InvalidUser(user) => write!(f, "Invalid user identifier: {:?}", user),
            SubmitError::ZeroVram => write!(f, "VRAM request must be greater than zero"),
        }
    }
}

#[derive(
    Debug,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Display,
    EnumIter,
    EnumString,
    Hash,
    Ord,
    PartialOrd,
)]
pub enum JobStatus {
    /// Waiting in `to_run/` for a slot and a GPU.
    #[strum(to_string = "PENDING", serialize = "QUEUED", serialize = "pending")]
    #[serde(rename = "PENDING", alias = "QUEUED")]
    Pending,
    #[strum(to_string = "RUNNING", serialize = "running")]
    #[serde(rename = "RUNNING")]
    Running,
    #[strum(to_string = "COMPLETED", serialize = "completed")]
    #[serde(rename = "COMPLETED")]
    Completed,
    #[strum(to_string = "FAILED", serialize = "failed")]
    #[serde(rename = "FAILED")]
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        // Pending → Running → Completed
        //    │         │
        //    └────┐    └──> Failed
        //         ▼
        //       Failed  (restart recovery only)
        matches!(
            (self, next),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Pending, Failed)
        )
    }

    pub fn is_final(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Name of the layout directory a script in this state lives in.
    pub fn dir_name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "to_run",
            JobStatus::Running => "running",
            JobStatus::Completed => "complete",
            JobStatus::Failed => "fail",
        }
    }
}

/// Per-factor breakdown of the last priority computation, kept on the job
/// record so a queue entry can always explain its own score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorityFactors {
    pub age: f64,
    pub fair_share: f64,
    pub size: f64,
    pub partition: f64,
    pub qos: f64,
    pub physics: f64,
    /// Raw ledger reading the fair-share factor was derived from.
    pub raw_usage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: CompactString,
    pub name: Option<CompactString>,
    /// Current location of the script inside the directory layout. The
    /// containing directory, not this field, is the durable source of truth.
    pub script_path: PathBuf,
    pub user: CompactString,
    pub vram_required: u64,
    pub partition: CompactString,
    pub qos: CompactString,
    pub created_at: SystemTime,
    pub status: JobStatus,
    pub assigned_gpu: Option<u32>,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub priority_score: f64,
    pub factors: PriorityFactors,
}

impl Job {
    pub fn time_waiting(&self, now: SystemTime) -> Duration {
        now.duration_since(self.created_at).unwrap_or_default()
    }

    /// Apply a state transition, stamping `finished_at` on terminal states.
    /// Illegal transitions are logged and ignored.
    pub fn try_transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                job = %self.id,
                from = %self.status,
                to = %next,
                "ignoring invalid state transition"
            );
            return false;
        }
        self.status = next;
        if next.is_final() {
            self.finished_at = Some(SystemTime::now());
        }
        true
    }
}
