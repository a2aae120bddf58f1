//! Runtime settings for the Function controller
//!
//! The binary builds these from flags and environment; tests use the
//! defaults.

use std::time::Duration;

/// Buildpacks builder used when none is configured
pub const DEFAULT_BUILDER_IMAGE: &str = "paketobuildpacks/builder-jammy-base:latest";

/// OTLP/HTTP collector endpoint injected into traced functions
pub const DEFAULT_COLLECTOR_ENDPOINT: &str =
    "http://otel-collector-collector.opentelemetry-operator-system.svc.cluster.local:4318";

/// Requeue intervals used by the reconciliation driver
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Re-check after the driver wrote something
    pub after_write: Duration,
    /// Poll interval while Knative reports the Service as not ready
    pub readiness_poll: Duration,
    /// Poll interval while a build is running
    pub build_poll: Duration,
    /// Backoff while a dependency (secret, config map, broker) is missing
    pub dependency_backoff: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            after_write: Duration::from_secs(1),
            readiness_poll: Duration::from_secs(10),
            build_poll: Duration::from_secs(30),
            dependency_backoff: Duration::from_secs(30),
        }
    }
}

/// Image prefix substitution applied to the deployed container image
///
/// Development clusters often push to an in-cluster registry name that the
/// node's container runtime cannot resolve, and pull through a node port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryRewrite {
    /// Prefix as written by the build
    pub from: String,
    /// Prefix the node runtime can pull from
    pub to: String,
}

impl RegistryRewrite {
    /// Parse `from=to`
    pub fn parse(s: &str) -> Option<Self> {
        let (from, to) = s.split_once('=')?;
        if from.is_empty() || to.is_empty() {
            return None;
        }
        Some(Self {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// Rewrite `image` if it starts with the configured prefix
    pub fn apply(&self, image: &str) -> String {
        match image.strip_prefix(self.from.as_str()) {
            Some(rest) => format!("{}{}", self.to, rest),
            None => image.to_string(),
        }
    }
}

/// Settings shared by every reconciliation
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Requeue intervals
    pub policy: ReconcilePolicy,
    /// Buildpacks builder image
    pub builder_image: String,
    /// Verbatim insecure registry list, bypassing detection
    pub insecure_registries: Option<String>,
    /// Collector endpoint for traced functions
    pub collector_endpoint: String,
    /// Optional image prefix rewrite for deployments
    pub registry_rewrite: Option<RegistryRewrite>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            policy: ReconcilePolicy::default(),
            builder_image: DEFAULT_BUILDER_IMAGE.to_string(),
            insecure_registries: None,
            collector_endpoint: DEFAULT_COLLECTOR_ENDPOINT.to_string(),
            registry_rewrite: None,
        }
    }
}
