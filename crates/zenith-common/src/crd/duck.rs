//! Knative duck-typed conditions
//!
//! Tekton and Knative resources report status through the same condition
//! shape (`knative.dev/pkg/apis/duck/v1`). Status is a free-form string
//! there, so it is kept as one rather than mapped onto [`ConditionStatus`].
//!
//! [`ConditionStatus`]: super::types::ConditionStatus

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type Tekton uses for run completion
pub const SUCCEEDED: &str = "Succeeded";

/// Condition type Knative uses for readiness
pub const READY: &str = "Ready";

/// A single knative-style condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DuckCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown"
    pub status: String,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Severity (empty means Error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    /// Last transition timestamp as reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl DuckCondition {
    /// Condition status is "True"
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }

    /// Condition status is "False"
    pub fn is_false(&self) -> bool {
        self.status == "False"
    }

    /// Condition status is "Unknown" (or anything unrecognised)
    pub fn is_unknown(&self) -> bool {
        !self.is_true() && !self.is_false()
    }

    /// Reason, treating empty as absent
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref().filter(|r| !r.is_empty())
    }

    /// Message, treating empty as absent
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref().filter(|m| !m.is_empty())
    }
}

/// Look up a condition by type in an optional condition list
pub fn find<'a>(conditions: Option<&'a [DuckCondition]>, type_: &str) -> Option<&'a DuckCondition> {
    conditions?.iter().find(|c| c.type_ == type_)
}
