//! Ready condition taxonomy and status computation
//!
//! Every decision the driver reports goes through [`ReadyUpdate`], so the
//! reason strings users and tooling match on live in one place.

use crate::crd::{
    set_condition, Condition, ConditionStatus, Function, FunctionStatus, READY_CONDITION,
};

/// Stable reasons reported on the `Ready` condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadyReason {
    /// Git credentials secret is missing
    GitAuthMissing,
    /// An env/envFrom Secret is missing
    SecretNotFound,
    /// An env/envFrom ConfigMap is missing
    ConfigMapNotFound,
    /// Tekton Tasks could not be created
    TaskSetupFailed,
    /// Build pipeline started
    Building,
    /// Build pipeline failed without a more specific reason
    BuildFailed,
    /// Build finished but produced no digest
    BuildImageError,
    /// Knative Service is rolling out
    Deploying,
    /// Subscribed broker is missing
    BrokerNotFound,
    /// Everything converged
    Ready,
    /// Reason copied from Tekton or Knative
    Upstream(String),
}

impl ReadyReason {
    /// Wire value
    pub fn as_str(&self) -> &str {
        match self {
            Self::GitAuthMissing => "GitAuthMissing",
            Self::SecretNotFound => "SecretNotFound",
            Self::ConfigMapNotFound => "ConfigMapNotFound",
            Self::TaskSetupFailed => "TaskSetupFailed",
            Self::Building => "Building",
            Self::BuildFailed => "BuildFailed",
            Self::BuildImageError => "BuildImageError",
            Self::Deploying => "Deploying",
            Self::BrokerNotFound => "BrokerNotFound",
            Self::Ready => "Ready",
            Self::Upstream(reason) => reason,
        }
    }
}

impl std::fmt::Display for ReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A new value for the `Ready` condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyUpdate {
    /// Condition status
    pub status: ConditionStatus,
    /// Condition reason
    pub reason: ReadyReason,
    /// Condition message
    pub message: String,
}

impl ReadyUpdate {
    fn new(status: ConditionStatus, reason: ReadyReason, message: impl Into<String>) -> Self {
        Self {
            status,
            reason,
            message: message.into(),
        }
    }

    /// Git credentials secret is absent
    pub fn git_auth_missing(secret: &str) -> Self {
        Self::new(
            ConditionStatus::False,
            ReadyReason::GitAuthMissing,
            format!("Git authentication secret não encontrado: {}", secret),
        )
    }

    /// A Secret referenced from env/envFrom is absent
    pub fn secret_not_found(secret: &str, namespace: &str) -> Self {
        Self::new(
            ConditionStatus::False,
            ReadyReason::SecretNotFound,
            format!(
                "Secret não encontrado: {}. Crie o Secret no namespace {} antes de deployar a função.",
                secret, namespace
            ),
        )
    }

    /// A ConfigMap referenced from env/envFrom is absent
    pub fn config_map_not_found(config_map: &str, namespace: &str) -> Self {
        Self::new(
            ConditionStatus::False,
            ReadyReason::ConfigMapNotFound,
            format!(
                "ConfigMap não encontrado: {}. Crie o ConfigMap no namespace {} antes de deployar a função.",
                config_map, namespace
            ),
        )
    }

    /// Creating a catalog Task failed
    pub fn task_setup_failed(error: &str) -> Self {
        Self::new(
            ConditionStatus::False,
            ReadyReason::TaskSetupFailed,
            format!("Failed to create required Tekton Tasks: {}", error),
        )
    }

    /// Build pipeline submitted
    pub fn building() -> Self {
        Self::new(
            ConditionStatus::False,
            ReadyReason::Building,
            "Pipeline de build iniciado",
        )
    }

    /// Build pipeline failed
    pub fn build_failed(reason: &str, message: impl Into<String>) -> Self {
        let reason = match reason {
            "" | "BuildFailed" => ReadyReason::BuildFailed,
            other => ReadyReason::Upstream(other.to_string()),
        };
        Self::new(ConditionStatus::False, reason, message)
    }

    /// Build succeeded without an image digest
    pub fn build_image_error() -> Self {
        Self::new(
            ConditionStatus::False,
            ReadyReason::BuildImageError,
            "Ocorreu um erro ao gerar o digest da imagem",
        )
    }

    /// Digest captured, rollout starting
    pub fn build_succeeded() -> Self {
        Self::new(
            ConditionStatus::Unknown,
            ReadyReason::Deploying,
            "Build succeeded, deploying to Knative Service",
        )
    }

    /// Subscribed broker is absent
    pub fn broker_not_found(broker: &str) -> Self {
        Self::new(
            ConditionStatus::False,
            ReadyReason::BrokerNotFound,
            format!("Knative Broker não encontrado: {}", broker),
        )
    }

    /// Knative has not reported readiness yet
    pub fn serving_pending() -> Self {
        Self::new(
            ConditionStatus::Unknown,
            ReadyReason::Deploying,
            "Waiting for Knative Service to report readiness",
        )
    }

    /// Knative reports the Service as not ready
    pub fn serving_not_ready(reason: Option<&str>, message: &str) -> Self {
        let reason = match reason {
            Some(r) => ReadyReason::Upstream(r.to_string()),
            None => ReadyReason::Deploying,
        };
        Self::new(
            ConditionStatus::False,
            reason,
            format!("Knative Service not ready: {}", message),
        )
    }

    /// Knative reports the rollout in progress
    pub fn serving_deploying(message: &str) -> Self {
        Self::new(
            ConditionStatus::Unknown,
            ReadyReason::Deploying,
            format!("Knative Service is deploying: {}", message),
        )
    }

    /// Converged without eventing
    pub fn ready() -> Self {
        Self::new(
            ConditionStatus::True,
            ReadyReason::Ready,
            "Function deployed and ready to accept requests",
        )
    }

    /// Converged with a trigger in place
    pub fn ready_with_eventing() -> Self {
        Self::new(
            ConditionStatus::True,
            ReadyReason::Ready,
            "Function deployed with eventing and ready to accept requests",
        )
    }

    /// Render as a condition stamped with the current time
    pub fn to_condition(&self) -> Condition {
        Condition::new(
            READY_CONDITION,
            self.status,
            self.reason.as_str(),
            self.message.clone(),
        )
    }
}

/// Everything a single status write may change
#[derive(Clone, Debug, Default)]
pub struct StatusWrite {
    /// New Ready condition
    pub ready: Option<ReadyUpdate>,
    /// New image digest reference
    pub image_digest: Option<String>,
    /// New Knative URL
    pub url: Option<String>,
}

impl StatusWrite {
    /// Write only the Ready condition
    pub fn ready(update: ReadyUpdate) -> Self {
        Self {
            ready: Some(update),
            ..Default::default()
        }
    }

    /// Also record the image digest
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.image_digest = Some(digest.into());
        self
    }

    /// Also record the serving URL, when known
    pub fn with_url(mut self, url: Option<&str>) -> Self {
        self.url = url.map(str::to_string);
        self
    }
}

/// Compute the status after applying `write` to the Function's current status.
///
/// Setting a condition always records the Function's generation.
pub fn next_status(function: &Function, write: &StatusWrite) -> FunctionStatus {
    let mut status = function.status.clone().unwrap_or_default();

    if let Some(update) = &write.ready {
        set_condition(&mut status.conditions, update.to_condition());
        status.observed_generation = function.metadata.generation;
    }
    if let Some(digest) = &write.image_digest {
        status.image_digest = Some(digest.clone());
    }
    if let Some(url) = &write.url {
        status.url = Some(url.clone());
    }

    status
}

/// True when `next` matches the current status in everything but timestamps
pub fn is_status_unchanged(function: &Function, next: &FunctionStatus) -> bool {
    let Some(current) = function.status.as_ref() else {
        return false;
    };

    let ready_unchanged = match (current.ready(), next.ready()) {
        (Some(a), Some(b)) => a.same_state(b),
        (None, None) => true,
        _ => false,
    };

    ready_unchanged
        && current.image_digest == next.image_digest
        && current.url == next.url
        && current.observed_generation == next.observed_generation
        && current.conditions.len() == next.conditions.len()
}
