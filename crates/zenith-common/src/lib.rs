//! Common types for Zenith: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "zenith-operator";

/// Label key marking ServiceAccounts provisioned for a Function
pub const LABEL_FUNCTION_MANAGED_BY: &str = "functions.zenith.com/managed-by";

/// Standard Kubernetes managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value written to managed-by labels
pub const MANAGED_BY_VALUE: &str = "zenith-operator";
