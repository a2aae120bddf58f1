//! Tekton Pipelines resource types (tekton.dev/v1)
//!
//! PipelineRuns are modelled closely enough to submit an embedded pipeline
//! and read back its outcome. Task bodies are static catalog payloads, so
//! their params and steps stay as raw JSON.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::duck::{self, DuckCondition};

/// Kind string Tekton uses in child references for TaskRuns
pub const TASK_RUN_KIND: &str = "TaskRun";

// =============================================================================
// Params
// =============================================================================

/// A parameter value: Tekton accepts strings and string arrays
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    /// Single string
    String(String),
    /// Array of strings
    Array(Vec<String>),
}

impl ParamValue {
    /// The string form, if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Array(_) => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// Named parameter
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct Param {
    /// Parameter name
    pub name: String,
    /// Parameter value
    pub value: ParamValue,
}

impl Param {
    /// Convenience constructor
    pub fn new(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

// =============================================================================
// PipelineRun
// =============================================================================

/// A single execution of an (embedded) pipeline
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "tekton.dev",
    version = "v1",
    kind = "PipelineRun",
    namespaced
)]
#[kube(status = "PipelineRunStatus")]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunSpec {
    /// Inline pipeline definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_spec: Option<PipelineSpec>,

    /// Run-level params
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,

    /// Workspace bindings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<WorkspaceBinding>,

    /// Defaults applied to every TaskRun
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_run_template: Option<PipelineTaskRunTemplate>,
}

/// TaskRun defaults for a PipelineRun
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTaskRunTemplate {
    /// Service account every TaskRun executes as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Pipeline definition
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Declared workspaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<PipelineWorkspaceDeclaration>,

    /// Tasks in the pipeline
    #[serde(default)]
    pub tasks: Vec<PipelineTask>,

    /// Pipeline results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<PipelineResult>,
}

/// Workspace declared by a pipeline
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct PipelineWorkspaceDeclaration {
    /// Workspace name
    pub name: String,
}

/// A task entry in a pipeline
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTask {
    /// Pipeline-local task name
    pub name: String,

    /// Referenced Task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,

    /// Ordering constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_after: Vec<String>,

    /// Workspace wiring
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<WorkspacePipelineTaskBinding>,

    /// Task params
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
}

/// Reference to a Task by name
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct TaskRef {
    /// Task name
    pub name: String,
}

/// Maps a task workspace onto a pipeline workspace
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct WorkspacePipelineTaskBinding {
    /// Workspace name as the task declares it
    pub name: String,
    /// Pipeline workspace providing it
    pub workspace: String,
}

/// Pipeline-level result
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct PipelineResult {
    /// Result name
    pub name: String,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Expression resolving the result
    pub value: ParamValue,
}

/// Volume backing a workspace for a run
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceBinding {
    /// Workspace name
    pub name: String,

    /// Claim template provisioned per run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<PersistentVolumeClaim>,
}

/// Observed state of a PipelineRun
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunStatus {
    /// Conditions (Succeeded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<DuckCondition>>,

    /// Pipeline results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<PipelineRunResult>,

    /// Runs spawned for each pipeline task
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_references: Vec<ChildStatusReference>,
}

/// A resolved pipeline result
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct PipelineRunResult {
    /// Result name
    pub name: String,
    /// Result value
    pub value: ParamValue,
}

/// Reference to a run spawned by a PipelineRun
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChildStatusReference {
    /// Child kind (TaskRun, CustomRun)
    #[serde(default)]
    pub kind: String,

    /// Child object name
    pub name: String,

    /// Pipeline task that spawned it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_task_name: Option<String>,
}

impl PipelineRun {
    /// The Succeeded condition, if reported
    pub fn succeeded_condition(&self) -> Option<&DuckCondition> {
        duck::find(
            self.status.as_ref().and_then(|s| s.conditions.as_deref()),
            duck::SUCCEEDED,
        )
    }

    /// Finished, successfully or not
    pub fn is_done(&self) -> bool {
        self.succeeded_condition()
            .map(|c| !c.is_unknown())
            .unwrap_or(false)
    }

    /// Finished unsuccessfully
    pub fn is_failed(&self) -> bool {
        self.succeeded_condition()
            .map(|c| c.is_false())
            .unwrap_or(false)
    }

    /// String value of a named pipeline result
    pub fn result(&self, name: &str) -> Option<&str> {
        self.status
            .as_ref()?
            .results
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| r.value.as_str())
    }

    /// Child references, empty when no status is reported
    pub fn child_references(&self) -> &[ChildStatusReference] {
        self.status
            .as_ref()
            .map(|s| s.child_references.as_slice())
            .unwrap_or(&[])
    }
}

// =============================================================================
// TaskRun
// =============================================================================

/// A single Task execution
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(group = "tekton.dev", version = "v1", kind = "TaskRun", namespaced)]
#[kube(status = "TaskRunStatus")]
#[serde(rename_all = "camelCase")]
pub struct TaskRunSpec {
    /// Referenced Task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,

    /// Service account executing the steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Observed state of a TaskRun
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct TaskRunStatus {
    /// Conditions (Succeeded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<DuckCondition>>,
}

impl TaskRun {
    /// The Succeeded condition, if reported
    pub fn succeeded_condition(&self) -> Option<&DuckCondition> {
        duck::find(
            self.status.as_ref().and_then(|s| s.conditions.as_deref()),
            duck::SUCCEEDED,
        )
    }

    /// Finished unsuccessfully
    pub fn is_failed(&self) -> bool {
        self.succeeded_condition()
            .map(|c| c.is_false())
            .unwrap_or(false)
    }
}

// =============================================================================
// Task
// =============================================================================

/// Reusable build step sequence
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(group = "tekton.dev", version = "v1", kind = "Task", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Human description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared workspaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<serde_json::Value>,

    /// Declared params
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<serde_json::Value>,

    /// Declared results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<serde_json::Value>,

    /// Defaults merged into every step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_template: Option<serde_json::Value>,

    /// Pod volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<serde_json::Value>,

    /// Steps
    #[serde(default)]
    pub steps: Vec<serde_json::Value>,
}
