//! Environment variables for the function container
//!
//! Two concerns live here: checking that every Secret/ConfigMap referenced
//! from `deploy.env` / `deploy.envFrom` exists before anything is built or
//! deployed, and turning the user's env list into one Knative accepts.

use k8s_openapi::api::core::v1::EnvVar;
use kube::ResourceExt;
use tracing::debug;

use crate::controller::FunctionKubeClient;
use crate::crd::{DeploySpec, Function};
use crate::status::ReadyUpdate;
use crate::Error;

/// A Secret or ConfigMap the container needs at runtime
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvReference {
    /// Secret by name
    Secret(String),
    /// ConfigMap by name
    ConfigMap(String),
}

impl EnvReference {
    /// Condition reported when the referenced object is missing
    pub fn missing(&self, namespace: &str) -> ReadyUpdate {
        match self {
            Self::Secret(name) => ReadyUpdate::secret_not_found(name, namespace),
            Self::ConfigMap(name) => ReadyUpdate::config_map_not_found(name, namespace),
        }
    }
}

/// Non-optional references in declaration order: `env` entries first, then `envFrom`
pub fn required_references(deploy: &DeploySpec) -> Vec<EnvReference> {
    let mut refs = Vec::new();

    for var in &deploy.env {
        let Some(source) = var.value_from.as_ref() else {
            continue;
        };
        if let Some(secret) = &source.secret_key_ref {
            if !secret.optional.unwrap_or(false) {
                refs.push(EnvReference::Secret(secret.name.clone()));
            }
        }
        if let Some(cm) = &source.config_map_key_ref {
            if !cm.optional.unwrap_or(false) {
                refs.push(EnvReference::ConfigMap(cm.name.clone()));
            }
        }
    }

    for source in &deploy.env_from {
        if let Some(secret) = &source.secret_ref {
            if !secret.optional.unwrap_or(false) {
                refs.push(EnvReference::Secret(secret.name.clone()));
            }
        }
        if let Some(cm) = &source.config_map_ref {
            if !cm.optional.unwrap_or(false) {
                refs.push(EnvReference::ConfigMap(cm.name.clone()));
            }
        }
    }

    refs
}

/// Find the first required reference that does not exist in `namespace`
pub async fn find_missing_reference(
    kube: &dyn FunctionKubeClient,
    namespace: &str,
    deploy: &DeploySpec,
) -> Result<Option<EnvReference>, Error> {
    for reference in required_references(deploy) {
        let exists = match &reference {
            EnvReference::Secret(name) => kube.secret_exists(name, namespace).await?,
            EnvReference::ConfigMap(name) => kube.config_map_exists(name, namespace).await?,
        };
        if !exists {
            debug!(?reference, namespace = %namespace, "env reference missing");
            return Ok(Some(reference));
        }
    }
    Ok(None)
}

/// Container env for the Knative Service.
///
/// Tracing variables come first when tracing is enabled. Knative rejects
/// `fieldRef` and `resourceFieldRef`, so those are resolved to literals
/// here; only name, namespace and uid are known to the controller and
/// anything else becomes an empty string. Secret and ConfigMap refs pass
/// through untouched.
pub fn resolve_env(function: &Function, collector_endpoint: &str) -> Vec<EnvVar> {
    let mut env = tracing_env(function, collector_endpoint);

    for var in &function.spec.deploy.env {
        let Some(source) = var.value_from.as_ref() else {
            env.push(var.clone());
            continue;
        };

        if let Some(field) = &source.field_ref {
            env.push(literal(&var.name, resolve_field_path(function, &field.field_path)));
        } else if source.resource_field_ref.is_some() {
            env.push(literal(&var.name, String::new()));
        } else {
            env.push(var.clone());
        }
    }

    env
}

fn tracing_env(function: &Function, collector_endpoint: &str) -> Vec<EnvVar> {
    let tracing = &function.spec.observability.tracing;
    if !tracing.enabled {
        return Vec::new();
    }

    let mut env = vec![
        literal("OTEL_EXPORTER_OTLP_ENDPOINT", collector_endpoint.to_string()),
        literal("OTEL_SERVICE_NAME", function.name_any()),
        literal(
            "OTEL_RESOURCE_ATTRIBUTES",
            format!(
                "service.namespace={},service.version=latest",
                function.namespace().unwrap_or_default()
            ),
        ),
        literal("OTEL_TRACES_EXPORTER", "otlp".to_string()),
    ];

    if let Some(rate) = tracing.sampling_rate.as_deref() {
        env.push(literal("OTEL_TRACES_SAMPLER", "traceidratio".to_string()));
        env.push(literal("OTEL_TRACES_SAMPLER_ARG", rate.to_string()));
    }

    env
}

fn resolve_field_path(function: &Function, path: &str) -> String {
    match path {
        "metadata.name" => function.name_any(),
        "metadata.namespace" => function.namespace().unwrap_or_default(),
        "metadata.uid" => function.uid().unwrap_or_default(),
        _ => String::new(),
    }
}

fn literal(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    }
}
