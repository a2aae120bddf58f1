//! Knative Serving and Eventing resource types
//!
//! Only the fields the Function controller reads or writes are modelled;
//! everything else the Knative webhooks default is left to the server.
//! Optional fields are skipped on serialization so the objects we submit
//! stay minimal.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Container;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::duck::{self, DuckCondition};

/// apiVersion of Knative Serving Services
pub const SERVING_API_VERSION: &str = "serving.knative.dev/v1";

/// Label controlling Knative route visibility
pub const VISIBILITY_LABEL: &str = "networking.knative.dev/visibility";

/// Annotation for the autoscaler lower bound
pub const MIN_SCALE_ANNOTATION: &str = "autoscaling.knative.dev/min-scale";

/// Annotation for the autoscaler upper bound
pub const MAX_SCALE_ANNOTATION: &str = "autoscaling.knative.dev/max-scale";

// =============================================================================
// Serving
// =============================================================================

/// Knative Service manages Configuration and Route for a workload
/// API: serving.knative.dev/v1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Service",
    root = "KnativeService",
    namespaced
)]
#[kube(status = "KnativeServiceStatus")]
pub struct KnativeServiceSpec {
    /// Template for Revisions stamped out by this Service
    #[serde(default)]
    pub template: RevisionTemplateSpec,
}

/// Revision template (metadata + pod spec)
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct RevisionTemplateSpec {
    /// Revision metadata (annotations drive autoscaling and sidecars)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RevisionTemplateMetadata>,

    /// Pod spec subset supported by Knative
    #[serde(default)]
    pub spec: RevisionSpec,
}

/// Metadata carried on the revision template
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct RevisionTemplateMetadata {
    /// Revision annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Revision labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Revision pod spec
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct RevisionSpec {
    /// Containers; Knative accepts exactly one serving container
    #[serde(default)]
    pub containers: Vec<Container>,
}

/// Observed state of a Knative Service
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct KnativeServiceStatus {
    /// Conditions (Ready, ConfigurationsReady, RoutesReady)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<DuckCondition>>,

    /// URL the Service is reachable at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Latest revision that became ready
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "latestReadyRevisionName"
    )]
    pub latest_ready_revision_name: Option<String>,

    /// Observed generation
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "observedGeneration"
    )]
    pub observed_generation: Option<i64>,
}

impl KnativeService {
    /// The Service's Ready condition, if reported
    pub fn ready_condition(&self) -> Option<&DuckCondition> {
        duck::find(
            self.status.as_ref().and_then(|s| s.conditions.as_deref()),
            duck::READY,
        )
    }

    /// The assigned URL, if any
    pub fn url(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.url.as_deref())
            .filter(|u| !u.is_empty())
    }
}

// =============================================================================
// Eventing
// =============================================================================

/// Knative Broker
/// API: eventing.knative.dev/v1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "eventing.knative.dev",
    version = "v1",
    kind = "Broker",
    namespaced
)]
#[kube(status = "BrokerStatus")]
pub struct BrokerSpec {
    /// Reference to the broker class configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<KReference>,
}

/// Observed state of a Broker
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct BrokerStatus {
    /// Broker conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<DuckCondition>>,
}

/// Knative Trigger subscribing a sink to a Broker
/// API: eventing.knative.dev/v1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "eventing.knative.dev",
    version = "v1",
    kind = "Trigger",
    namespaced
)]
#[kube(status = "TriggerStatus")]
pub struct TriggerSpec {
    /// Broker to subscribe to
    pub broker: String,

    /// Attribute filter; absent means all events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<TriggerFilter>,

    /// Event destination
    pub subscriber: Destination,
}

/// Exact-match attribute filter
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct TriggerFilter {
    /// CloudEvent attributes that must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, String>>,
}

/// Addressable destination
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct Destination {
    /// Object reference
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<KReference>,

    /// Absolute or relative URI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Knative object reference
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct KReference {
    /// Referent kind
    pub kind: String,

    /// Referent namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Referent name
    pub name: String,

    /// Referent apiVersion
    #[serde(rename = "apiVersion")]
    pub api_version: String,
}

/// Observed state of a Trigger
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct TriggerStatus {
    /// Trigger conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<DuckCondition>>,

    /// Resolved subscriber URI
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "subscriberUri")]
    pub subscriber_uri: Option<String>,
}
