//! Operator settings from flags and environment

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use zenith_function::config::{DEFAULT_BUILDER_IMAGE, DEFAULT_COLLECTOR_ENDPOINT};
use zenith_function::{ControllerConfig, ReconcilePolicy, RegistryRewrite};

/// Flags shared by every operator mode
#[derive(Args, Debug, Clone)]
pub struct OperatorConfig {
    /// Path to a kubeconfig; in-cluster or default config otherwise
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Seconds to wait before re-checking after a write
    #[arg(long, env = "ZENITH_REQUEUE_AFTER_WRITE", default_value = "1")]
    pub requeue_after_write: u64,

    /// Seconds between readiness checks of the Knative Service
    #[arg(long, env = "ZENITH_READINESS_POLL", default_value = "10")]
    pub readiness_poll: u64,

    /// Seconds between checks of a running build
    #[arg(long, env = "ZENITH_BUILD_POLL", default_value = "30")]
    pub build_poll: u64,

    /// Seconds to back off while a referenced object is missing
    #[arg(long, env = "ZENITH_DEPENDENCY_BACKOFF", default_value = "30")]
    pub dependency_backoff: u64,

    /// Buildpacks builder image used by every build
    #[arg(long, env = "ZENITH_BUILDER_IMAGE", default_value = DEFAULT_BUILDER_IMAGE)]
    pub builder_image: String,

    /// Comma-separated registries the build may push to over plain HTTP,
    /// replacing automatic detection
    #[arg(long, env = "INSECURE_REGISTRIES")]
    pub insecure_registries: Option<String>,

    /// OTLP endpoint injected into functions with tracing enabled
    #[arg(long, env = "ZENITH_COLLECTOR_ENDPOINT", default_value = DEFAULT_COLLECTOR_ENDPOINT)]
    pub collector_endpoint: String,

    /// Image prefix rewrite for deployments, as `from=to`
    #[arg(long, env = "ZENITH_REGISTRY_REWRITE", value_parser = parse_registry_rewrite)]
    pub registry_rewrite: Option<RegistryRewrite>,
}

fn parse_registry_rewrite(s: &str) -> Result<RegistryRewrite, String> {
    RegistryRewrite::parse(s).ok_or_else(|| {
        format!(
            "invalid registry rewrite '{}', expected 'from=to' with both sides set",
            s
        )
    })
}

impl OperatorConfig {
    /// Settings handed to the Function controller
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            policy: ReconcilePolicy {
                after_write: Duration::from_secs(self.requeue_after_write),
                readiness_poll: Duration::from_secs(self.readiness_poll),
                build_poll: Duration::from_secs(self.build_poll),
                dependency_backoff: Duration::from_secs(self.dependency_backoff),
            },
            builder_image: self.builder_image.clone(),
            insecure_registries: self
                .insecure_registries
                .clone()
                .filter(|r| !r.trim().is_empty()),
            collector_endpoint: self.collector_endpoint.clone(),
            registry_rewrite: self.registry_rewrite.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: OperatorConfig,
    }

    fn parse(args: &[&str]) -> OperatorConfig {
        let argv = std::iter::once("zenith-operator").chain(args.iter().copied());
        TestCli::try_parse_from(argv).expect("args should parse").config
    }

    #[test]
    fn test_defaults_match_reconcile_policy() {
        let config = parse(&[]).controller_config();

        assert_eq!(config.policy, ReconcilePolicy::default());
    }

    #[test]
    fn test_flags_override_policy() {
        let config = parse(&["--requeue-after-write", "2", "--dependency-backoff", "60"])
            .controller_config();

        assert_eq!(config.policy.after_write, Duration::from_secs(2));
        assert_eq!(config.policy.dependency_backoff, Duration::from_secs(60));
    }

    #[test]
    fn test_registry_rewrite_flag() {
        let config = parse(&["--registry-rewrite", "registry.local:5000=127.0.0.1:30500"])
            .controller_config();

        let rewrite = config.registry_rewrite.expect("rewrite configured");
        assert_eq!(rewrite.from, "registry.local:5000");
        assert_eq!(rewrite.to, "127.0.0.1:30500");
    }

    #[test]
    fn test_malformed_registry_rewrite_is_rejected() {
        let argv = ["zenith-operator", "--registry-rewrite", "nothing-to-rewrite"];
        assert!(TestCli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_blank_insecure_registries_means_detection() {
        let config = parse(&["--insecure-registries", "  "]).controller_config();
        assert!(config.insecure_registries.is_none());

        let config = parse(&["--insecure-registries", "registry.local:5000"]).controller_config();
        assert_eq!(
            config.insecure_registries.as_deref(),
            Some("registry.local:5000")
        );
    }
}
