//! Function reconciliation engine for Zenith
//!
//! This crate turns a `Function` into the objects that build, run and
//! subscribe it:
//!
//! - **Build**: a Tekton PipelineRun that clones the source and runs buildpacks
//! - **Deployment**: a Knative Service pinned to the built image digest
//! - **Eventing**: a Knative Trigger routing broker events to the Service
//! - **Controller**: the phase-ordered reconciliation driving all of the above

pub mod build;
pub mod config;
pub mod controller;
pub mod deployment;
pub mod env;
pub mod eventing;
pub mod service_account;
pub mod status;
pub mod tasks;

// Internal modules use `crate::crd` and `crate::Error`.
pub(crate) use zenith_common::{crd, Error};

pub use config::{ControllerConfig, ReconcilePolicy, RegistryRewrite};
pub use controller::{
    error_policy, reconcile, FunctionContext, FunctionKubeClient, FunctionKubeClientImpl,
};
