//! Knative Eventing subscription
//!
//! A Function with a broker gets one Trigger, `<function>-trigger`, that
//! routes matching events from the broker to the Function's Knative Service.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::knative::SERVING_API_VERSION;
use crate::crd::{Destination, Function, KReference, Trigger, TriggerFilter, TriggerSpec};

/// Broker used when a Trigger is built without one
pub const DEFAULT_BROKER: &str = "default";

/// Trigger name for a Function
pub fn trigger_name(function_name: &str) -> String {
    format!("{}-trigger", function_name)
}

/// Desired Trigger routing the Function's broker to its Knative Service
pub fn desired_trigger(function: &Function) -> Trigger {
    let name = function.name_any();
    let broker = match function.spec.eventing.broker.as_str() {
        "" => DEFAULT_BROKER,
        b => b,
    };

    Trigger {
        metadata: ObjectMeta {
            name: Some(trigger_name(&name)),
            namespace: function.namespace(),
            ..Default::default()
        },
        spec: TriggerSpec {
            broker: broker.to_string(),
            filter: Some(TriggerFilter {
                attributes: function.spec.eventing.filters.clone(),
            }),
            subscriber: Destination {
                reference: Some(KReference {
                    kind: "Service".to_string(),
                    namespace: function.namespace(),
                    name,
                    api_version: SERVING_API_VERSION.to_string(),
                }),
                uri: None,
            },
        },
        status: None,
    }
}

/// The slice of a Trigger this controller converges.
///
/// A missing attribute map compares equal to an empty one; a missing filter
/// does not compare equal to an empty filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerFields {
    /// Subscribed broker
    pub broker: String,
    /// Whether a filter block is present
    pub has_filter: bool,
    /// Filter attributes
    pub attributes: BTreeMap<String, String>,
}

impl TriggerFields {
    /// Extract the compared fields from `trigger`
    pub fn of(trigger: &Trigger) -> Self {
        let filter = trigger.spec.filter.as_ref();
        Self {
            broker: trigger.spec.broker.clone(),
            has_filter: filter.is_some(),
            attributes: filter
                .and_then(|f| f.attributes.clone())
                .unwrap_or_default(),
        }
    }

    /// Names of the fields that differ from `desired`
    pub fn diff(&self, desired: &Self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.broker != desired.broker {
            fields.push("broker");
        }
        if self.has_filter != desired.has_filter || self.attributes != desired.attributes {
            fields.push("filter");
        }
        fields
    }
}

/// `existing` with its spec replaced by `desired`'s
pub fn with_desired_spec(existing: &Trigger, desired: &Trigger) -> Trigger {
    let mut updated = existing.clone();
    updated.spec = desired.spec.clone();
    updated.status = None;
    updated
}
