//! Function CRD types
//!
//! A `Function` describes a serverless workload end to end: where its source
//! lives, which image the build produces, how the built image is deployed on
//! Knative Serving, and which broker events it subscribes to.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvFromSource, EnvVar};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{find_condition, Condition};

/// Condition type maintained on every Function
pub const READY_CONDITION: &str = "Ready";

/// Git revision used when `spec.gitRevision` is empty
pub const DEFAULT_GIT_REVISION: &str = "main";

// =============================================================================
// Build
// =============================================================================

/// Image build settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Target image reference without digest (e.g. `registry.io/team/app:latest`)
    pub image: String,

    /// Secret holding registry push/pull credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_secret_name: Option<String>,
}

// =============================================================================
// Deploy
// =============================================================================

/// Dapr sidecar settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaprSpec {
    /// Inject the Dapr sidecar
    #[serde(default)]
    pub enabled: bool,

    /// Dapr application id
    #[serde(default, rename = "appID")]
    pub app_id: String,

    /// Port the application listens on
    #[serde(default)]
    pub app_port: i32,
}

/// Knative autoscaling bounds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSpec {
    /// Minimum number of replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_scale: Option<i32>,

    /// Maximum number of replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_scale: Option<i32>,
}

/// Network reachability of the deployed Function
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Visibility {
    /// Reachable only from inside the cluster
    #[default]
    #[serde(rename = "cluster-local")]
    ClusterLocal,
    /// Exposed through the Knative ingress
    #[serde(rename = "external")]
    External,
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClusterLocal => write!(f, "cluster-local"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Runtime deployment settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploySpec {
    /// Dapr sidecar configuration
    #[serde(default)]
    pub dapr: DaprSpec,

    /// Environment variables for the function container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Bulk environment imports from Secrets or ConfigMaps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,

    /// Autoscaling bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<ScaleSpec>,

    /// Network visibility (defaults to cluster-local)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

// =============================================================================
// Eventing
// =============================================================================

/// Knative Eventing subscription settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventingSpec {
    /// Broker to subscribe to; empty disables eventing
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub broker: String,

    /// CloudEvent attribute filters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<BTreeMap<String, String>>,
}

// =============================================================================
// Observability
// =============================================================================

/// Languages supported by the OpenTelemetry operator's auto-instrumentation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentationLanguage {
    /// Go (eBPF based)
    Go,
    /// Node.js
    Nodejs,
    /// Python
    Python,
    /// Java
    Java,
    /// .NET
    Dotnet,
}

impl std::fmt::Display for InstrumentationLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Go => write!(f, "go"),
            Self::Nodejs => write!(f, "nodejs"),
            Self::Python => write!(f, "python"),
            Self::Java => write!(f, "java"),
            Self::Dotnet => write!(f, "dotnet"),
        }
    }
}

/// OpenTelemetry auto-instrumentation settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AutoInstrumentation {
    /// Language agent to inject
    pub language: InstrumentationLanguage,
}

/// Distributed tracing settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TracingSpec {
    /// Export traces from the function
    #[serde(default)]
    pub enabled: bool,

    /// Trace sampling ratio between 0 and 1, as a string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(regex(pattern = r"^(0(\.\d+)?|1(\.0+)?)$"))]
    pub sampling_rate: Option<String>,

    /// Inject an OpenTelemetry language agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_instrumentation: Option<AutoInstrumentation>,
}

/// Observability settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ObservabilitySpec {
    /// Tracing configuration
    #[serde(default)]
    pub tracing: TracingSpec,
}

// =============================================================================
// CRD
// =============================================================================

/// Source-to-URL serverless function
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "functions.zenith.com",
    version = "v1alpha1",
    kind = "Function",
    plural = "functions",
    shortname = "fn",
    namespaced,
    status = "FunctionStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Git repository URL holding the function source
    pub git_repo: String,

    /// Branch, tag or commit to build (defaults to `main`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_revision: Option<String>,

    /// Secret with git credentials for private repositories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_auth_secret_name: Option<String>,

    /// Build configuration
    pub build: BuildSpec,

    /// Deployment configuration
    #[serde(default)]
    pub deploy: DeploySpec,

    /// Eventing configuration
    #[serde(default)]
    pub eventing: EventingSpec,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilitySpec,
}

impl FunctionSpec {
    /// Revision to fetch, falling back to `main`
    pub fn revision(&self) -> &str {
        match self.git_revision.as_deref() {
            Some(rev) if !rev.is_empty() => rev,
            _ => DEFAULT_GIT_REVISION,
        }
    }

    /// Git credentials secret, if one is configured
    pub fn git_auth_secret(&self) -> Option<&str> {
        self.git_auth_secret_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    /// Registry credentials secret, if one is configured
    pub fn registry_secret(&self) -> Option<&str> {
        self.build
            .registry_secret_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    /// Broker name when eventing is enabled
    pub fn broker(&self) -> Option<&str> {
        Some(self.eventing.broker.as_str()).filter(|b| !b.is_empty())
    }

    /// Whether the function is exposed outside the cluster
    pub fn is_external(&self) -> bool {
        self.deploy.visibility == Some(Visibility::External)
    }
}

/// Observed state of a Function
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatus {
    /// Conditions keyed by type; only `Ready` is maintained
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Built image pinned by digest (`image@sha256:...`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,

    /// Address assigned by Knative Serving
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Last spec generation acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl FunctionStatus {
    /// The `Ready` condition, if set
    pub fn ready(&self) -> Option<&Condition> {
        find_condition(&self.conditions, READY_CONDITION)
    }

    /// Captured image digest reference, treating empty as absent
    pub fn digest(&self) -> Option<&str> {
        self.image_digest.as_deref().filter(|d| !d.is_empty())
    }
}
