use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::action::types::Action;
use crate::errors::{AgentResult, FailureKind};
use crate::perception::screenshot::Screenshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// Record of one goal submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub goal: String,
    pub step_count: u32,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn start(goal: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            step_count: 0,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Moves to a terminal status. Returns `false` (and changes nothing) when
    /// the run already terminated.
    pub fn finish(&mut self, status: TaskStatus) -> bool {
        if self.status.is_terminal() {
            tracing::warn!(
                run_id = %self.id,
                current = ?self.status,
                requested = ?status,
                "ignoring second terminal transition"
            );
            return false;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        true
    }
}

/// Where each step's observation comes from.
#[derive(Debug, Clone)]
pub enum ObservationSource {
    LiveScreen,
    /// A user-supplied image re-sent on every step; the device is still driven.
    FixedImage(Screenshot),
}

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub goal: String,
    pub source: ObservationSource,
}

impl TaskRequest {
    pub fn live(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            source: ObservationSource::LiveScreen,
        }
    }

    pub fn image(goal: impl Into<String>, image: Screenshot) -> Self {
        Self {
            goal: goal.into(),
            source: ObservationSource::FixedImage(image),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self.source, ObservationSource::FixedImage(_))
    }
}

/// Result of `TaskOrchestrator::run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub run: TaskRun,
    pub completion: Option<String>,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        self.run.status
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    User,
    Assistant,
    Tool,
}

/// One line of the visible conversation, as shown to the user and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub role: EntryRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    pub ts: DateTime<Utc>,
}

impl ChatEntry {
    pub fn new(run_id: Uuid, role: EntryRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            role,
            content: content.into(),
            thinking: None,
            action: None,
            ts: Utc::now(),
        }
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        let thinking = thinking.into();
        if !thinking.is_empty() {
            self.thinking = Some(thinking);
        }
        self
    }

    pub fn with_action(mut self, action: Option<Action>) -> Self {
        self.action = action;
        self
    }
}

/// Everything the presentation layer renders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub messages: Vec<ChatEntry>,
    pub running: bool,
    pub run_id: Option<Uuid>,
    pub step: u32,
    pub max_steps: u32,
    pub status: Option<TaskStatus>,
    pub error: Option<String>,
    pub completion_message: Option<String>,
}

/// Commands sent from `AgentHandle` into the engine loop.
#[derive(Debug)]
pub enum AgentEvent {
    StartTask {
        request: TaskRequest,
        ack: oneshot::Sender<AgentResult<Uuid>>,
    },
    Abort,
    ClearHistory {
        ack: oneshot::Sender<AgentResult<()>>,
    },
    DismissNotices,
    Shutdown,
}
