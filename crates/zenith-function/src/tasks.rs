//! Tekton Task catalog
//!
//! Builds reference two namespaced Tasks by name. They ship embedded in the
//! binary and are installed into a Function's namespace the first time a
//! build is needed there. A Task that already exists is left alone, whoever
//! created it.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::controller::FunctionKubeClient;
use crate::crd::Task;
use crate::Error;
use zenith_common::{LABEL_MANAGED_BY, MANAGED_BY_VALUE};

/// Task cloning the function repository
pub const GIT_CLONE_TASK: &str = "git-clone";

/// Task running the buildpacks lifecycle
pub const BUILDPACKS_TASK: &str = "buildpacks-phases";

const GIT_CLONE_MANIFEST: &str = include_str!("../manifests/git-clone.yaml");
const BUILDPACKS_MANIFEST: &str = include_str!("../manifests/buildpacks-phases.yaml");

/// Tasks every build needs, in install order
pub const REQUIRED_TASKS: &[(&str, &str)] = &[
    (GIT_CLONE_TASK, GIT_CLONE_MANIFEST),
    (BUILDPACKS_TASK, BUILDPACKS_MANIFEST),
];

/// State of the catalog after an ensure pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogState {
    /// Every Task was already present
    Ready,
    /// At least one Task was installed on this pass
    Installed,
    /// Installing a Task failed
    SetupFailed(String),
}

/// Parse an embedded Task and bind it to `namespace`
pub fn catalog_task(manifest: &str, namespace: &str) -> Result<Task, Error> {
    let mut task: Task = serde_yaml::from_str(manifest)
        .map_err(|e| Error::serialization_for_kind("Task", e.to_string()))?;

    task.metadata.namespace = Some(namespace.to_string());
    task.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());

    Ok(task)
}

/// Make sure every required Task exists in `namespace`.
///
/// Read failures propagate. A create that loses a race (409) counts as
/// present; any other create failure stops the pass with `SetupFailed`.
pub async fn ensure_catalog(
    kube: &dyn FunctionKubeClient,
    namespace: &str,
) -> Result<CatalogState, Error> {
    let mut installed = false;

    for (name, manifest) in REQUIRED_TASKS {
        if kube.get_task(name, namespace).await?.is_some() {
            debug!(task = %name, "task already present");
            continue;
        }

        let task = catalog_task(manifest, namespace)?;
        match kube.create_task(&task).await {
            Ok(()) => {
                info!(task = %name, namespace = %namespace, "installed task");
                installed = true;
            }
            Err(e) if e.is_conflict() => {
                debug!(task = %name, "task created concurrently");
            }
            Err(e) => {
                warn!(task = %name, error = %e, "failed to install task");
                return Ok(CatalogState::SetupFailed(e.to_string()));
            }
        }
    }

    Ok(if installed {
        CatalogState::Installed
    } else {
        CatalogState::Ready
    })
}
