use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::error::JobError;

/// What happens to the run when a node fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePolicy {
    /// Inherit the policy of the enclosing node; a process defaults to `Fail`
    #[default]
    Parent,
    /// Abort the whole run
    Fail,
    /// Fail the stage, continue with the next one
    SkipStage,
    /// Fail only the item
    SkipItem,
    /// As `SkipItem` unless no item of the stage has succeeded yet
    SkipItemOutlier,
}

impl FailurePolicy {
    /// Resolve `Parent` against the enclosing node's (already resolved) policy
    pub fn or_parent(self, parent: FailurePolicy) -> FailurePolicy {
        match self {
            FailurePolicy::Parent => match parent {
                FailurePolicy::Parent => FailurePolicy::Fail,
                resolved => resolved,
            },
            own => own,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Running,
    Success,
    Error,
    Cancelled,
}

/// How much of a finished subtree the reporter keeps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    /// Keep every node for inspection
    #[default]
    Full,
    /// Drop successfully completed siblings as soon as a new sibling starts
    Transient,
}

/// Why a node failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    pub cause: Option<String>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl From<&JobError> for Failure {
    fn from(error: &JobError) -> Self {
        let cause = std::error::Error::source(error).map(|source| source.to_string());
        Failure {
            message: error.to_string(),
            cause,
        }
    }
}

impl From<JobError> for Failure {
    fn from(error: JobError) -> Self {
        Failure::from(&error)
    }
}

/// Fields every level of the tree shares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub description: String,
    pub started: DateTime<Utc>,
    /// Set exactly once, when the node leaves `Running`
    pub completed: Option<DateTime<Utc>>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub on_failure: FailurePolicy,
}

impl Node {
    pub fn new(description: impl Into<String>, on_failure: FailurePolicy) -> Self {
        Self {
            description: description.into(),
            started: Utc::now(),
            completed: None,
            status: Status::Running,
            summary: None,
            error: None,
            cause: None,
            on_failure,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Close the node; later calls on an already completed node are ignored
    pub fn complete(&mut self, status: Status, summary: Option<&str>) -> bool {
        if self.is_complete() {
            return false;
        }
        self.completed = Some(Utc::now());
        self.status = status;
        if let Some(summary) = summary {
            self.summary = Some(summary.to_string());
        }
        true
    }

    pub fn fail(&mut self, failure: &Failure) -> bool {
        if self.is_complete() {
            return false;
        }
        self.error = Some(failure.message.clone());
        self.cause = failure.cause.clone();
        self.complete(Status::Error, None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Reporter-local id referenced by `ItemHandle`
    pub id: u64,
    #[serde(flatten)]
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(flatten)]
    pub node: Node,
    /// Announced number of items, 0 when unknown
    pub total_items: usize,
    pub items: Vec<Item>,
}

impl Stage {
    pub fn open_item_mut(&mut self) -> Option<&mut Item> {
        self.items.last_mut().filter(|item| !item.node.is_complete())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    #[serde(flatten)]
    pub node: Node,
    pub job_id: String,
    pub stages: Vec<Stage>,
}

impl Process {
    pub fn open_stage_mut(&mut self) -> Option<&mut Stage> {
        self.stages.last_mut().filter(|stage| !stage.node.is_complete())
    }

    pub fn open_stage(&self) -> Option<&Stage> {
        self.stages.last().filter(|stage| !stage.node.is_complete())
    }
}

/// The progress tree of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub processes: Vec<Process>,
    pub updated: DateTime<Utc>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            processes: Vec::new(),
            updated: Utc::now(),
        }
    }
}

impl Progress {
    pub fn open_process_mut(&mut self) -> Option<&mut Process> {
        self.processes
            .last_mut()
            .filter(|process| !process.node.is_complete())
    }

    pub fn open_process(&self) -> Option<&Process> {
        self.processes
            .last()
            .filter(|process| !process.node.is_complete())
    }

    /// True once every process has completed
    pub fn is_complete(&self) -> bool {
        self.processes.iter().all(|process| process.node.is_complete())
    }

    /// The first error found anywhere in the tree, deepest node first
    pub fn error_message(&self) -> Option<String> {
        self.processes.iter().rev().find_map(|process| {
            process
                .stages
                .iter()
                .rev()
                .find_map(|stage| {
                    stage
                        .items
                        .iter()
                        .rev()
                        .find_map(|item| item.node.error.clone())
                        .or_else(|| stage.node.error.clone())
                })
                .or_else(|| process.node.error.clone())
        })
    }
}

/// Refers to one work item so a parallel worker can close its own item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemHandle(pub(crate) u64);
