//! Bulk job descriptors.
//!
//! A `BulkJob` is built per administrative request and is either executed
//! inline or serialized onto the worker queue. It carries everything the
//! worker needs, so the payload is self-contained.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{NewTask, ProjectId, Selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// The kinds of bulk mutation. Each has its own routing threshold, timeout
/// and worker queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Import,
    Priority,
    Redundancy,
    Delete,
    Export,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Import,
        OperationKind::Priority,
        OperationKind::Redundancy,
        OperationKind::Delete,
        OperationKind::Export,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Import => "import",
            OperationKind::Priority => "priority",
            OperationKind::Redundancy => "redundancy",
            OperationKind::Delete => "delete",
            OperationKind::Export => "export",
        }
    }

    /// Name of the worker queue jobs of this kind are sent to.
    pub fn queue_name(self) -> &'static str {
        match self {
            OperationKind::Import => "bulk_import",
            OperationKind::Priority => "bulk_priority",
            OperationKind::Redundancy => "bulk_redundancy",
            OperationKind::Delete => "bulk_delete",
            OperationKind::Export => "bulk_export",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do to every selected task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BulkOperation {
    Import { tasks: Vec<NewTask> },
    SetPriority { priority: f64 },
    SetRedundancy { n_answers: u32 },
    Delete { force: bool },
    Export,
}

impl BulkOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            BulkOperation::Import { .. } => OperationKind::Import,
            BulkOperation::SetPriority { .. } => OperationKind::Priority,
            BulkOperation::SetRedundancy { .. } => OperationKind::Redundancy,
            BulkOperation::Delete { .. } => OperationKind::Delete,
            BulkOperation::Export => OperationKind::Export,
        }
    }
}

/// A bulk mutation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkJob {
    pub id: JobId,
    pub project_id: ProjectId,
    /// Ignored by imports, which create rather than select.
    pub selector: Selector,
    pub operation: BulkOperation,
    /// Who asked; completion and failure reports go back to them.
    pub requested_by: String,
    /// Estimated number of tasks touched. Filled in by the router.
    #[serde(default)]
    pub estimate: u64,
}

impl BulkJob {
    pub fn new(
        project_id: ProjectId,
        selector: Selector,
        operation: BulkOperation,
        requested_by: impl Into<String>,
    ) -> Self {
        Self {
            id: JobId::new(),
            project_id,
            selector,
            operation,
            requested_by: requested_by.into(),
            estimate: 0,
        }
    }

    pub fn import(
        project_id: ProjectId,
        tasks: Vec<NewTask>,
        requested_by: impl Into<String>,
    ) -> Self {
        Self::new(
            project_id,
            Selector::all(),
            BulkOperation::Import { tasks },
            requested_by,
        )
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }
}
