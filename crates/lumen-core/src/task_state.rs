//! Enrichment kinds and their tri-state processing flags.
//!
//! Every image carries one [`TaskState`] per [`EnrichmentKind`]. The smart
//! queue rules below are the single definition of which bulk transitions are
//! allowed; both store implementations encode exactly these rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Category of ML enrichment tracked independently per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentKind {
    Tagging,
    Captioning,
    Embedding,
    FaceDetection,
}

impl EnrichmentKind {
    /// All kinds, in a stable order.
    pub const ALL: [EnrichmentKind; 4] = [
        EnrichmentKind::Tagging,
        EnrichmentKind::Captioning,
        EnrichmentKind::Embedding,
        EnrichmentKind::FaceDetection,
    ];

    /// Database / wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentKind::Tagging => "tagging",
            EnrichmentKind::Captioning => "captioning",
            EnrichmentKind::Embedding => "embedding",
            EnrichmentKind::FaceDetection => "face_detection",
        }
    }

    /// Column on `image` holding this kind's [`TaskState`].
    pub fn state_column(&self) -> &'static str {
        match self {
            EnrichmentKind::Tagging => "tagging_state",
            EnrichmentKind::Captioning => "captioning_state",
            EnrichmentKind::Embedding => "embedding_state",
            EnrichmentKind::FaceDetection => "face_detection_state",
        }
    }

    /// Whether completed work may be reopened by a bulk queue request.
    ///
    /// Embedding and face detection are write-once: their results are
    /// deterministic per image, so only an administrative overwrite reopens them.
    pub fn supports_reprocess(&self) -> bool {
        matches!(self, EnrichmentKind::Tagging | EnrichmentKind::Captioning)
    }
}

impl fmt::Display for EnrichmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tagging" => Ok(EnrichmentKind::Tagging),
            "captioning" => Ok(EnrichmentKind::Captioning),
            "embedding" => Ok(EnrichmentKind::Embedding),
            "face_detection" | "faces" => Ok(EnrichmentKind::FaceDetection),
            other => Err(Error::InvalidInput(format!(
                "unknown enrichment kind: {other}"
            ))),
        }
    }
}

/// Tri-state processing flag.
///
/// `NeverQueued` and `Completed` are deliberately distinct: clearing a queue
/// returns flags to `NeverQueued`, it never pretends the work was done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    NeverQueued,
    Pending,
    Completed,
}

impl TaskState {
    /// Database name (`task_state` enum label).
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::NeverQueued => "never_queued",
            TaskState::Pending => "pending",
            TaskState::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never_queued" => Ok(TaskState::NeverQueued),
            "pending" => Ok(TaskState::Pending),
            "completed" => Ok(TaskState::Completed),
            other => Err(Error::InvalidInput(format!("unknown task state: {other}"))),
        }
    }
}

/// Whether a smart queue request may reopen `Completed` flags of `kind`.
///
/// Write-once kinds ignore the caller's preference.
pub fn reopens_completed(kind: EnrichmentKind, skip_already_processed: bool) -> bool {
    kind.supports_reprocess() && !skip_already_processed
}

/// Smart queue rule for a single flag: the new state, or `None` to leave it.
pub fn smart_queue_transition(
    kind: EnrichmentKind,
    current: TaskState,
    skip_already_processed: bool,
) -> Option<TaskState> {
    match current {
        TaskState::NeverQueued => Some(TaskState::Pending),
        TaskState::Completed if reopens_completed(kind, skip_already_processed) => {
            Some(TaskState::Pending)
        }
        TaskState::Completed | TaskState::Pending => None,
    }
}

/// Per-kind flags of one image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStates {
    pub tagging: TaskState,
    pub captioning: TaskState,
    pub embedding: TaskState,
    pub face_detection: TaskState,
}

impl TaskStates {
    pub fn get(&self, kind: EnrichmentKind) -> TaskState {
        match kind {
            EnrichmentKind::Tagging => self.tagging,
            EnrichmentKind::Captioning => self.captioning,
            EnrichmentKind::Embedding => self.embedding,
            EnrichmentKind::FaceDetection => self.face_detection,
        }
    }

    pub fn set(&mut self, kind: EnrichmentKind, state: TaskState) {
        match kind {
            EnrichmentKind::Tagging => self.tagging = state,
            EnrichmentKind::Captioning => self.captioning = state,
            EnrichmentKind::Embedding => self.embedding = state,
            EnrichmentKind::FaceDetection => self.face_detection = state,
        }
    }
}
