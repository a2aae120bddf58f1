//! Knative Serving Service for a Function
//!
//! The Service is named after the Function and runs the built image pinned
//! by digest. Convergence compares only the fields this controller owns
//! (see [`ServingFields`]); Knative's own defaulting is left alone.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvFromSource, EnvVar};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::config::ControllerConfig;
use crate::crd::knative::{MAX_SCALE_ANNOTATION, MIN_SCALE_ANNOTATION, VISIBILITY_LABEL};
use crate::crd::{
    Function, KnativeService, KnativeServiceSpec, RevisionSpec, RevisionTemplateMetadata,
    RevisionTemplateSpec,
};
use crate::env::resolve_env;

/// Port the container listens on when Dapr does not say otherwise
pub const DEFAULT_CONTAINER_PORT: i32 = 8080;

/// Dapr metrics port; Knative's queue-proxy already serves 9090
pub const DAPR_METRICS_PORT: &str = "9095";

/// Dapr configuration carrying the tracing setup
pub const DAPR_TRACING_CONFIG: &str = "tracing-config";

const DAPR_ENABLED: &str = "dapr.io/enabled";
const DAPR_APP_ID: &str = "dapr.io/app-id";
const DAPR_APP_PORT: &str = "dapr.io/app-port";
const DAPR_METRICS: &str = "dapr.io/metrics-port";
const DAPR_CONFIG: &str = "dapr.io/config";
const OTEL_INJECT_PREFIX: &str = "instrumentation.opentelemetry.io/inject-";
const CLUSTER_LOCAL: &str = "cluster-local";

/// Pod-template annotations for `function`
pub fn template_annotations(function: &Function) -> BTreeMap<String, String> {
    let spec = &function.spec;
    let tracing = &spec.observability.tracing;
    let mut annotations = BTreeMap::new();

    let dapr = &spec.deploy.dapr;
    if dapr.enabled {
        annotations.insert(DAPR_ENABLED.to_string(), "true".to_string());
        annotations.insert(DAPR_APP_ID.to_string(), dapr.app_id.clone());
        annotations.insert(DAPR_APP_PORT.to_string(), dapr.app_port.to_string());
        annotations.insert(DAPR_METRICS.to_string(), DAPR_METRICS_PORT.to_string());
        if tracing.enabled {
            annotations.insert(DAPR_CONFIG.to_string(), DAPR_TRACING_CONFIG.to_string());
        }
    }

    if tracing.enabled {
        if let Some(auto) = &tracing.auto_instrumentation {
            annotations.insert(
                format!("{}{}", OTEL_INJECT_PREFIX, auto.language),
                "true".to_string(),
            );
        }
    }

    if let Some(scale) = &spec.deploy.scale {
        if let Some(min) = scale.min_scale {
            annotations.insert(MIN_SCALE_ANNOTATION.to_string(), min.to_string());
        }
        if let Some(max) = scale.max_scale {
            annotations.insert(MAX_SCALE_ANNOTATION.to_string(), max.to_string());
        }
    }

    annotations
}

fn container_port(function: &Function) -> i32 {
    let dapr = &function.spec.deploy.dapr;
    if dapr.enabled && dapr.app_port > 0 {
        dapr.app_port
    } else {
        DEFAULT_CONTAINER_PORT
    }
}

/// Desired Knative Service running `image` (an `image@digest` reference)
pub fn desired_knative_service(
    function: &Function,
    image: &str,
    config: &ControllerConfig,
) -> KnativeService {
    let image = match &config.registry_rewrite {
        Some(rewrite) => rewrite.apply(image),
        None => image.to_string(),
    };

    let labels = (!function.spec.is_external())
        .then(|| BTreeMap::from([(VISIBILITY_LABEL.to_string(), CLUSTER_LOCAL.to_string())]));

    let container = Container {
        image: Some(image),
        ports: Some(vec![ContainerPort {
            container_port: container_port(function),
            ..Default::default()
        }]),
        env: Some(resolve_env(function, &config.collector_endpoint)),
        env_from: Some(function.spec.deploy.env_from.clone()),
        ..Default::default()
    };

    KnativeService {
        metadata: ObjectMeta {
            name: Some(function.name_any()),
            namespace: function.namespace(),
            labels,
            ..Default::default()
        },
        spec: KnativeServiceSpec {
            template: RevisionTemplateSpec {
                metadata: Some(RevisionTemplateMetadata {
                    annotations: Some(template_annotations(function)),
                    labels: None,
                }),
                spec: RevisionSpec {
                    containers: vec![container],
                },
            },
        },
        status: None,
    }
}

/// The slice of a Knative Service this controller converges
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServingFields {
    /// First container image
    pub image: Option<String>,
    /// Revision template annotations
    pub annotations: BTreeMap<String, String>,
    /// First container env, in order
    pub env: Vec<EnvVar>,
    /// First container envFrom, in order
    pub env_from: Vec<EnvFromSource>,
    /// Service visibility label, absent when externally reachable
    pub visibility: Option<String>,
}

impl ServingFields {
    /// Extract the compared fields from `service`
    pub fn of(service: &KnativeService) -> Self {
        let template = &service.spec.template;
        let annotations = template
            .metadata
            .as_ref()
            .and_then(|m| m.annotations.clone())
            .unwrap_or_default();
        let visibility = service.labels().get(VISIBILITY_LABEL).cloned();

        let Some(container) = template.spec.containers.first() else {
            return Self {
                annotations,
                visibility,
                ..Default::default()
            };
        };

        Self {
            image: container.image.clone(),
            annotations,
            env: container.env.clone().unwrap_or_default(),
            env_from: container.env_from.clone().unwrap_or_default(),
            visibility,
        }
    }

    /// Names of the fields that differ from `desired`
    pub fn diff(&self, desired: &Self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.image != desired.image {
            fields.push("image");
        }
        if self.annotations != desired.annotations {
            fields.push("annotations");
        }
        if self.env != desired.env {
            fields.push("env");
        }
        if self.env_from != desired.env_from {
            fields.push("envFrom");
        }
        if self.visibility != desired.visibility {
            fields.push("visibility");
        }
        fields
    }
}

/// Replace the spec of `existing` with `desired`'s, keeping identity and
/// `resourceVersion` for the update
///
/// The visibility label follows `desired`; other labels are left alone.
pub fn with_desired_spec(existing: &KnativeService, desired: &KnativeService) -> KnativeService {
    let mut updated = existing.clone();
    updated.spec = desired.spec.clone();
    updated.status = None;

    let labels = updated.labels_mut();
    labels.remove(VISIBILITY_LABEL);
    if let Some(value) = desired.labels().get(VISIBILITY_LABEL) {
        labels.insert(VISIBILITY_LABEL.to_string(), value.clone());
    }
    updated
}
