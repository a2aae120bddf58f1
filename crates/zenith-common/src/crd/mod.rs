//! Custom Resource Definitions owned or consumed by Zenith

pub mod duck;
pub mod function;
pub mod knative;
pub mod tekton;
mod types;

pub use duck::DuckCondition;
pub use function::{
    AutoInstrumentation, BuildSpec, DaprSpec, DeploySpec, EventingSpec, Function, FunctionSpec,
    FunctionStatus, InstrumentationLanguage, ObservabilitySpec, ScaleSpec, TracingSpec,
    Visibility, DEFAULT_GIT_REVISION, READY_CONDITION,
};
pub use knative::{
    Broker, BrokerSpec, Destination, KReference, KnativeService, KnativeServiceSpec,
    KnativeServiceStatus, RevisionSpec, RevisionTemplateMetadata, RevisionTemplateSpec, Trigger,
    TriggerFilter, TriggerSpec,
};
pub use tekton::{
    ChildStatusReference, Param, ParamValue, PipelineResult, PipelineRun, PipelineRunResult,
    PipelineRunSpec, PipelineRunStatus, PipelineSpec, PipelineTask, PipelineTaskRunTemplate,
    PipelineWorkspaceDeclaration, Task, TaskRef, TaskRun, TaskRunStatus, TaskSpec,
    WorkspaceBinding, WorkspacePipelineTaskBinding,
};
pub use types::{find_condition, set_condition, Condition, ConditionStatus};
