//! Per-Function ServiceAccount
//!
//! Build pipelines run as `<function>-sa`. Tekton picks git credentials up
//! from the account's `secrets` and registry credentials from its
//! `imagePullSecrets`, so both are attached here.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LocalObjectReference, ObjectReference, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::Function;
use zenith_common::{LABEL_FUNCTION_MANAGED_BY, MANAGED_BY_VALUE};

/// ServiceAccount name for a Function
pub fn service_account_name(function_name: &str) -> String {
    format!("{}-sa", function_name)
}

/// Fresh ServiceAccount for `function`, without credentials attached
pub fn desired_service_account(function: &Function) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(service_account_name(&function.name_any())),
            namespace: function.namespace(),
            labels: Some(BTreeMap::from([(
                LABEL_FUNCTION_MANAGED_BY.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Attach the Function's credential secrets to `sa`.
///
/// Returns the updated account when anything was missing, or `None` when
/// both references are already present. Existing entries are never
/// duplicated or removed.
pub fn attach_credentials(
    sa: &ServiceAccount,
    git_secret: Option<&str>,
    registry_secret: Option<&str>,
) -> Option<ServiceAccount> {
    let mut updated = sa.clone();
    let mut changed = false;

    if let Some(name) = git_secret {
        let secrets = updated.secrets.get_or_insert_with(Vec::new);
        if !secrets.iter().any(|s| s.name.as_deref() == Some(name)) {
            secrets.push(ObjectReference {
                name: Some(name.to_string()),
                ..Default::default()
            });
            changed = true;
        }
    }

    if let Some(name) = registry_secret {
        let pull_secrets = updated.image_pull_secrets.get_or_insert_with(Vec::new);
        if !pull_secrets.iter().any(|s| s.name == name) {
            pull_secrets.push(LocalObjectReference {
                name: name.to_string(),
            });
            changed = true;
        }
    }

    changed.then_some(updated)
}
