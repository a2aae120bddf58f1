//! Build orchestration on Tekton
//!
//! Each Function gets one PipelineRun, `<function>-build`, with an embedded
//! two-task pipeline: `fetch-source` clones the repository into a shared
//! workspace and `build-and-push` runs Cloud Native Buildpacks against it.
//! The pipeline surfaces the pushed image digest as `APP_IMAGE_DIGEST`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::debug;

use crate::config::ControllerConfig;
use crate::controller::FunctionKubeClient;
use crate::crd::tekton::TASK_RUN_KIND;
use crate::crd::{
    Function, Param, PipelineResult, PipelineRun, PipelineRunSpec, PipelineSpec, PipelineTask,
    PipelineTaskRunTemplate, PipelineWorkspaceDeclaration, TaskRef, WorkspaceBinding,
    WorkspacePipelineTaskBinding,
};
use crate::service_account::service_account_name;
use crate::tasks::{BUILDPACKS_TASK, GIT_CLONE_TASK};
use crate::Error;

/// Pipeline result carrying the pushed image digest
pub const DIGEST_RESULT: &str = "APP_IMAGE_DIGEST";

/// Shared workspace between fetch and build
pub const SOURCE_WORKSPACE: &str = "source-workspace";

/// Pipeline task that clones the repository
pub const FETCH_TASK: &str = "fetch-source";

/// Pipeline task that builds and pushes the image
pub const BUILD_TASK: &str = "build-and-push";

/// Size of the per-run source volume
pub const WORKSPACE_SIZE: &str = "1Gi";

/// Reason used when the pipeline reports none
pub const DEFAULT_FAILURE_REASON: &str = "BuildFailed";

/// Message used when the pipeline reports none
pub const DEFAULT_FAILURE_MESSAGE: &str = "O build falhou";

/// Registries that are never treated as insecure
const PUBLIC_REGISTRIES: &[&str] = &["docker.io", "gcr.io", "ghcr.io", "quay.io", "registry.k8s.io"];

/// PipelineRun name for a Function
pub fn pipeline_run_name(function_name: &str) -> String {
    format!("{}-build", function_name)
}

/// Registries the builder should talk to without TLS verification.
///
/// An explicit override wins. Otherwise the registry host (text before the
/// first `/`) is insecure when it is a cluster-local service or loopback,
/// or when it carries a port and is not a well-known public registry.
/// An empty string means none.
pub fn detect_insecure_registries(image: &str, override_value: Option<&str>) -> String {
    if let Some(value) = override_value.filter(|v| !v.is_empty()) {
        return value.to_string();
    }

    let Some((host, _)) = image.split_once('/') else {
        return String::new();
    };

    if host.contains(".svc.cluster.local")
        || host.starts_with("localhost")
        || host.starts_with("127.0.0.1")
    {
        return host.to_string();
    }

    if host.contains(':') && !PUBLIC_REGISTRIES.iter().any(|r| host.contains(r)) {
        return host.to_string();
    }

    String::new()
}

/// Desired PipelineRun for `function`
pub fn desired_pipeline_run(function: &Function, config: &ControllerConfig) -> PipelineRun {
    let name = function.name_any();
    let spec = &function.spec;

    let mut build_params = vec![
        Param::new("APP_IMAGE", spec.build.image.as_str()),
        Param::new("CNB_BUILDER_IMAGE", config.builder_image.as_str()),
        Param::new("CNB_PROCESS_TYPE", ""),
    ];
    let insecure =
        detect_insecure_registries(&spec.build.image, config.insecure_registries.as_deref());
    if !insecure.is_empty() {
        build_params.push(Param::new("CNB_INSECURE_REGISTRIES", insecure));
    }

    let pipeline = PipelineSpec {
        workspaces: vec![PipelineWorkspaceDeclaration {
            name: SOURCE_WORKSPACE.to_string(),
        }],
        tasks: vec![
            PipelineTask {
                name: FETCH_TASK.to_string(),
                task_ref: Some(TaskRef {
                    name: GIT_CLONE_TASK.to_string(),
                }),
                workspaces: vec![WorkspacePipelineTaskBinding {
                    name: "output".to_string(),
                    workspace: SOURCE_WORKSPACE.to_string(),
                }],
                params: vec![
                    Param::new("url", spec.git_repo.as_str()),
                    Param::new("revision", spec.revision()),
                ],
                ..Default::default()
            },
            PipelineTask {
                name: BUILD_TASK.to_string(),
                task_ref: Some(TaskRef {
                    name: BUILDPACKS_TASK.to_string(),
                }),
                run_after: vec![FETCH_TASK.to_string()],
                workspaces: vec![WorkspacePipelineTaskBinding {
                    name: "source".to_string(),
                    workspace: SOURCE_WORKSPACE.to_string(),
                }],
                params: build_params,
            },
        ],
        results: vec![PipelineResult {
            name: DIGEST_RESULT.to_string(),
            description: Some("The digest of the built application image".to_string()),
            value: format!("$(tasks.{}.results.{})", BUILD_TASK, DIGEST_RESULT).into(),
        }],
    };

    PipelineRun {
        metadata: ObjectMeta {
            name: Some(pipeline_run_name(&name)),
            namespace: function.namespace(),
            ..Default::default()
        },
        spec: PipelineRunSpec {
            pipeline_spec: Some(pipeline),
            workspaces: vec![WorkspaceBinding {
                name: SOURCE_WORKSPACE.to_string(),
                volume_claim_template: Some(source_volume_claim()),
            }],
            task_run_template: Some(PipelineTaskRunTemplate {
                service_account_name: Some(service_account_name(&name)),
            }),
            ..Default::default()
        },
        status: None,
    }
}

fn source_volume_claim() -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(WORKSPACE_SIZE.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Digest reported by a successful run, trimmed; `None` when absent or blank
pub fn reported_digest(run: &PipelineRun) -> Option<&str> {
    run.result(DIGEST_RESULT)
        .map(str::trim)
        .filter(|d| !d.is_empty())
}

/// Fully qualified image reference pinned by digest
pub fn image_reference(image: &str, digest: &str) -> String {
    format!("{}@{}", image, digest)
}

/// Why a build failed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildFailure {
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable detail
    pub message: String,
}

/// Work out why `run` failed.
///
/// Starts from the run's own Succeeded condition and then drills into its
/// TaskRuns in order: the first failed TaskRun with a message replaces the
/// detail with a task-scoped one. TaskRuns that cannot be fetched are
/// skipped.
pub async fn extract_failure(
    kube: &dyn FunctionKubeClient,
    run: &PipelineRun,
    namespace: &str,
) -> BuildFailure {
    let mut failure = BuildFailure {
        reason: DEFAULT_FAILURE_REASON.to_string(),
        message: DEFAULT_FAILURE_MESSAGE.to_string(),
    };

    if let Some(cond) = run.succeeded_condition() {
        if let Some(reason) = cond.reason() {
            failure.reason = reason.to_string();
        }
        if let Some(message) = cond.message() {
            failure.message = message.to_string();
        }
    }

    for child in run.child_references() {
        if child.kind != TASK_RUN_KIND {
            continue;
        }

        let task_run = match kube.get_task_run(&child.name, namespace).await {
            Ok(Some(tr)) => tr,
            Ok(None) => {
                debug!(task_run = %child.name, "task run not found, skipping");
                continue;
            }
            Err(e) => {
                debug!(task_run = %child.name, error = %e, "failed to fetch task run, skipping");
                continue;
            }
        };

        if !task_run.is_failed() {
            continue;
        }
        let Some(cond) = task_run.succeeded_condition() else {
            continue;
        };
        let Some(message) = cond.message() else {
            continue;
        };

        let task_name = child
            .pipeline_task_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&child.name);
        failure.message = format!("Task '{}' falhou: {}", task_name, message);
        if let Some(reason) = cond.reason() {
            failure.reason = reason.to_string();
        }
        break;
    }

    failure
}
