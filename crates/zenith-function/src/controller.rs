//! Function controller implementation
//!
//! Each reconciliation walks a fixed list of phases, top to bottom. A phase
//! either lets the pass continue or decides how it ends: a requeue after
//! some delay, or done until the next change. At most one child object is
//! created, updated or deleted per pass, and the `Ready` condition is
//! written before the decision is returned, so every requeue observes the
//! effect of exactly one step.
//!
//! Phases, in order:
//!
//! 1. **Identity**: the `<function>-sa` ServiceAccount exists.
//! 2. **Credentials**: the git secret exists; git and registry secrets are
//!    attached to the ServiceAccount.
//! 3. **BuildRun**: `<function>-build` exists, creating it (after installing
//!    the Task catalog and checking env references) when missing.
//! 4. **BuildProgress**: the build has finished.
//! 5. **BuildOutcome**: the build did not fail.
//! 6. **ImageDigest**: the pushed digest is recorded in status.
//! 7. **RuntimeEnv**: env references still resolve.
//! 8. **Broker**: the subscribed broker exists.
//! 9. **Serving**: the Knative Service exists and matches the spec.
//! 10. **ServingReadiness**: Knative reports the Service ready.
//! 11. **Unsubscribe**: without a broker, no Trigger is left behind.
//! 12. **Subscribe**: with a broker, the Trigger exists and matches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::build::{
    desired_pipeline_run, extract_failure, image_reference, pipeline_run_name, reported_digest,
};
use crate::config::ControllerConfig;
use crate::crd::{
    Broker, Function, FunctionStatus, KnativeService, PipelineRun, Task, TaskRun, Trigger,
};
use crate::deployment::{self, desired_knative_service, ServingFields};
use crate::env::find_missing_reference;
use crate::eventing::{self, desired_trigger, trigger_name, TriggerFields};
use crate::service_account::{attach_credentials, desired_service_account, service_account_name};
use crate::status::{is_status_unchanged, next_status, ReadyUpdate, StatusWrite};
use crate::tasks::{ensure_catalog, CatalogState};
use crate::Error;
use zenith_common::kube_utils::controller_owner_ref;
use zenith_common::FIELD_MANAGER;

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Kubernetes operations the Function controller performs
///
/// Lookups return `Ok(None)` for objects that do not exist. Create methods
/// take the owning Function's controller reference so that children are
/// garbage-collected with it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FunctionKubeClient: Send + Sync {
    /// Get a Function by name and namespace
    async fn get_function(&self, name: &str, namespace: &str) -> Result<Option<Function>, Error>;

    /// Replace the status of a Function
    async fn patch_function_status(
        &self,
        name: &str,
        namespace: &str,
        status: &FunctionStatus,
    ) -> Result<(), Error>;

    /// Get a ServiceAccount
    async fn get_service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceAccount>, Error>;

    /// Create a ServiceAccount owned by `owner`
    async fn create_service_account(
        &self,
        service_account: &ServiceAccount,
        owner: &OwnerReference,
    ) -> Result<(), Error>;

    /// Replace an existing ServiceAccount
    async fn update_service_account(&self, service_account: &ServiceAccount) -> Result<(), Error>;

    /// Whether a Secret exists
    async fn secret_exists(&self, name: &str, namespace: &str) -> Result<bool, Error>;

    /// Whether a ConfigMap exists
    async fn config_map_exists(&self, name: &str, namespace: &str) -> Result<bool, Error>;

    /// Get a Tekton Task
    async fn get_task(&self, name: &str, namespace: &str) -> Result<Option<Task>, Error>;

    /// Create a Tekton Task; Tasks are shared by every Function in a namespace
    async fn create_task(&self, task: &Task) -> Result<(), Error>;

    /// Get a Tekton PipelineRun
    async fn get_pipeline_run(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PipelineRun>, Error>;

    /// Create a PipelineRun owned by `owner`
    async fn create_pipeline_run(
        &self,
        pipeline_run: &PipelineRun,
        owner: &OwnerReference,
    ) -> Result<(), Error>;

    /// Get a Tekton TaskRun
    async fn get_task_run(&self, name: &str, namespace: &str) -> Result<Option<TaskRun>, Error>;

    /// Whether a Knative Broker exists
    async fn broker_exists(&self, name: &str, namespace: &str) -> Result<bool, Error>;

    /// Get a Knative Service
    async fn get_knative_service(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<KnativeService>, Error>;

    /// Create a Knative Service owned by `owner`
    async fn create_knative_service(
        &self,
        service: &KnativeService,
        owner: &OwnerReference,
    ) -> Result<(), Error>;

    /// Replace an existing Knative Service
    async fn update_knative_service(&self, service: &KnativeService) -> Result<(), Error>;

    /// Get a Knative Trigger
    async fn get_trigger(&self, name: &str, namespace: &str) -> Result<Option<Trigger>, Error>;

    /// Create a Trigger owned by `owner`
    async fn create_trigger(&self, trigger: &Trigger, owner: &OwnerReference) -> Result<(), Error>;

    /// Replace an existing Trigger
    async fn update_trigger(&self, trigger: &Trigger) -> Result<(), Error>;

    /// Delete a Trigger; deleting a missing Trigger succeeds
    async fn delete_trigger(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct FunctionKubeClientImpl {
    client: Client,
}

impl FunctionKubeClientImpl {
    /// Create a new FunctionKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get<K>(&self, name: &str, namespace: &str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn exists<K>(&self, name: &str, namespace: &str) -> Result<bool, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let found = self.api::<K>(namespace).get_metadata_opt(name).await?;
        Ok(found.is_some())
    }

    async fn create<K>(&self, obj: &K, owner: Option<&OwnerReference>) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
    {
        let namespace = namespace_of(obj)?;
        let mut obj = obj.clone();
        if let Some(owner) = owner {
            obj.meta_mut().owner_references = Some(vec![owner.clone()]);
        }

        self.api::<K>(&namespace)
            .create(&PostParams::default(), &obj)
            .await?;
        Ok(())
    }

    async fn replace<K>(&self, obj: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
    {
        let namespace = namespace_of(obj)?;
        self.api::<K>(&namespace)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?;
        Ok(())
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String, Error> {
    obj.namespace().ok_or_else(|| {
        Error::internal_with_context(
            "function_client",
            format!("{} has no namespace", obj.name_any()),
        )
    })
}

#[async_trait]
impl FunctionKubeClient for FunctionKubeClientImpl {
    async fn get_function(&self, name: &str, namespace: &str) -> Result<Option<Function>, Error> {
        self.get(name, namespace).await
    }

    async fn patch_function_status(
        &self,
        name: &str,
        namespace: &str,
        status: &FunctionStatus,
    ) -> Result<(), Error> {
        let api: Api<Function> = self.api(namespace);
        let status_patch = serde_json::json!({ "status": status });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn get_service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        self.get(name, namespace).await
    }

    async fn create_service_account(
        &self,
        service_account: &ServiceAccount,
        owner: &OwnerReference,
    ) -> Result<(), Error> {
        self.create(service_account, Some(owner)).await
    }

    async fn update_service_account(&self, service_account: &ServiceAccount) -> Result<(), Error> {
        self.replace(service_account).await
    }

    async fn secret_exists(&self, name: &str, namespace: &str) -> Result<bool, Error> {
        self.exists::<Secret>(name, namespace).await
    }

    async fn config_map_exists(&self, name: &str, namespace: &str) -> Result<bool, Error> {
        self.exists::<ConfigMap>(name, namespace).await
    }

    async fn get_task(&self, name: &str, namespace: &str) -> Result<Option<Task>, Error> {
        self.get(name, namespace).await
    }

    async fn create_task(&self, task: &Task) -> Result<(), Error> {
        self.create(task, None).await
    }

    async fn get_pipeline_run(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PipelineRun>, Error> {
        self.get(name, namespace).await
    }

    async fn create_pipeline_run(
        &self,
        pipeline_run: &PipelineRun,
        owner: &OwnerReference,
    ) -> Result<(), Error> {
        self.create(pipeline_run, Some(owner)).await
    }

    async fn get_task_run(&self, name: &str, namespace: &str) -> Result<Option<TaskRun>, Error> {
        self.get(name, namespace).await
    }

    async fn broker_exists(&self, name: &str, namespace: &str) -> Result<bool, Error> {
        self.exists::<Broker>(name, namespace).await
    }

    async fn get_knative_service(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<KnativeService>, Error> {
        self.get(name, namespace).await
    }

    async fn create_knative_service(
        &self,
        service: &KnativeService,
        owner: &OwnerReference,
    ) -> Result<(), Error> {
        self.create(service, Some(owner)).await
    }

    async fn update_knative_service(&self, service: &KnativeService) -> Result<(), Error> {
        self.replace(service).await
    }

    async fn get_trigger(&self, name: &str, namespace: &str) -> Result<Option<Trigger>, Error> {
        self.get(name, namespace).await
    }

    async fn create_trigger(&self, trigger: &Trigger, owner: &OwnerReference) -> Result<(), Error> {
        self.create(trigger, Some(owner)).await
    }

    async fn update_trigger(&self, trigger: &Trigger) -> Result<(), Error> {
        self.replace(trigger).await
    }

    async fn delete_trigger(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<Trigger> = self.api(namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for every Function reconciliation
pub struct FunctionContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn FunctionKubeClient>,
    /// Controller settings
    pub config: ControllerConfig,
}

impl FunctionContext {
    /// Create a new FunctionContext with the given dependencies
    pub fn new(kube: Arc<dyn FunctionKubeClient>, config: ControllerConfig) -> Self {
        Self { kube, config }
    }

    /// Create a FunctionContext backed by a real Kubernetes client
    pub fn from_client(client: Client, config: ControllerConfig) -> Self {
        Self::new(Arc::new(FunctionKubeClientImpl::new(client)), config)
    }

    /// Create a context for testing with default settings
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn FunctionKubeClient>) -> Self {
        Self::new(kube, ControllerConfig::default())
    }
}

// =============================================================================
// Phases
// =============================================================================

/// A step of the reconciliation, evaluated in declaration order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// ServiceAccount exists
    Identity,
    /// Credentials are present and attached
    Credentials,
    /// Build pipeline run exists
    BuildRun,
    /// Build has finished
    BuildProgress,
    /// Build has not failed
    BuildOutcome,
    /// Digest is recorded
    ImageDigest,
    /// Env references resolve before deploying
    RuntimeEnv,
    /// Broker exists
    Broker,
    /// Knative Service exists and matches
    Serving,
    /// Knative Service reports ready
    ServingReadiness,
    /// No stale Trigger without a broker
    Unsubscribe,
    /// Trigger exists and matches
    Subscribe,
}

impl Phase {
    /// Every phase, in evaluation order
    pub const ALL: [Phase; 12] = [
        Phase::Identity,
        Phase::Credentials,
        Phase::BuildRun,
        Phase::BuildProgress,
        Phase::BuildOutcome,
        Phase::ImageDigest,
        Phase::RuntimeEnv,
        Phase::Broker,
        Phase::Serving,
        Phase::ServingReadiness,
        Phase::Unsubscribe,
        Phase::Subscribe,
    ];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Identity => "identity",
            Self::Credentials => "credentials",
            Self::BuildRun => "build-run",
            Self::BuildProgress => "build-progress",
            Self::BuildOutcome => "build-outcome",
            Self::ImageDigest => "image-digest",
            Self::RuntimeEnv => "runtime-env",
            Self::Broker => "broker",
            Self::Serving => "serving",
            Self::ServingReadiness => "serving-readiness",
            Self::Unsubscribe => "unsubscribe",
            Self::Subscribe => "subscribe",
        };
        f.write_str(name)
    }
}

/// How a pass ends
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    /// Nothing more to do until something changes
    Done,
    /// Look again after the delay
    Requeue(Duration),
}

impl From<Outcome> for Action {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => Action::await_change(),
            Outcome::Requeue(after) => Action::requeue(after),
        }
    }
}

type Step = Result<Option<Outcome>, Error>;

/// State gathered while walking the phases of one reconciliation
struct Pass<'a> {
    ctx: &'a FunctionContext,
    function: Function,
    name: String,
    namespace: String,
    owner: OwnerReference,
    service_account: Option<ServiceAccount>,
    pipeline_run: Option<PipelineRun>,
    image: Option<String>,
    service: Option<KnativeService>,
    url: Option<String>,
}

impl<'a> Pass<'a> {
    fn new(ctx: &'a FunctionContext, function: Function, namespace: String) -> Result<Self, Error> {
        let owner = controller_owner_ref(&function)?;
        Ok(Self {
            ctx,
            name: function.name_any(),
            function,
            namespace,
            owner,
            service_account: None,
            pipeline_run: None,
            image: None,
            service: None,
            url: None,
        })
    }

    fn kube(&self) -> &dyn FunctionKubeClient {
        self.ctx.kube.as_ref()
    }

    fn after_write(&self) -> Outcome {
        Outcome::Requeue(self.ctx.config.policy.after_write)
    }

    fn backoff(&self) -> Outcome {
        Outcome::Requeue(self.ctx.config.policy.dependency_backoff)
    }

    async fn run(&mut self, phase: Phase) -> Step {
        match phase {
            Phase::Identity => self.identity().await,
            Phase::Credentials => self.credentials().await,
            Phase::BuildRun => self.build_run().await,
            Phase::BuildProgress => self.build_progress(),
            Phase::BuildOutcome => self.build_outcome().await,
            Phase::ImageDigest => self.image_digest().await,
            Phase::RuntimeEnv => self.check_env_references().await,
            Phase::Broker => self.broker().await,
            Phase::Serving => self.serving().await,
            Phase::ServingReadiness => self.serving_readiness().await,
            Phase::Unsubscribe => self.unsubscribe().await,
            Phase::Subscribe => self.subscribe().await,
        }
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    /// Write `write` to the Function's status unless it changes nothing
    async fn write_status(&self, write: StatusWrite) -> Result<(), Error> {
        let next = next_status(&self.function, &write);
        if is_status_unchanged(&self.function, &next) {
            debug!("status unchanged, skipping update");
            return Ok(());
        }

        self.kube()
            .patch_function_status(&self.name, &self.namespace, &next)
            .await
    }

    async fn report(&self, update: ReadyUpdate) -> Result<(), Error> {
        self.write_status(StatusWrite::ready(update)).await
    }

    // -------------------------------------------------------------------------
    // Identity and credentials
    // -------------------------------------------------------------------------

    async fn identity(&mut self) -> Step {
        let sa_name = service_account_name(&self.name);
        if let Some(sa) = self.kube().get_service_account(&sa_name, &self.namespace).await? {
            self.service_account = Some(sa);
            return Ok(None);
        }

        let sa = desired_service_account(&self.function);
        self.kube().create_service_account(&sa, &self.owner).await?;
        info!(service_account = %sa_name, "created service account");
        Ok(Some(self.after_write()))
    }

    async fn credentials(&self) -> Step {
        let spec = &self.function.spec;

        if let Some(secret) = spec.git_auth_secret() {
            if !self.kube().secret_exists(secret, &self.namespace).await? {
                warn!(secret = %secret, "git auth secret not found");
                self.report(ReadyUpdate::git_auth_missing(secret)).await?;
                return Ok(Some(self.backoff()));
            }
        }

        let Some(sa) = self.service_account.as_ref() else {
            return Err(Error::internal_with_context(
                "reconcile",
                "service account not loaded",
            ));
        };

        match attach_credentials(sa, spec.git_auth_secret(), spec.registry_secret()) {
            Some(updated) => {
                self.kube().update_service_account(&updated).await?;
                info!(service_account = %updated.name_any(), "attached credentials to service account");
                Ok(Some(self.after_write()))
            }
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Build
    // -------------------------------------------------------------------------

    async fn build_run(&mut self) -> Step {
        let run_name = pipeline_run_name(&self.name);
        if let Some(run) = self.kube().get_pipeline_run(&run_name, &self.namespace).await? {
            self.pipeline_run = Some(run);
            return Ok(None);
        }

        match ensure_catalog(self.kube(), &self.namespace).await? {
            CatalogState::Ready | CatalogState::Installed => {}
            CatalogState::SetupFailed(err) => {
                self.report(ReadyUpdate::task_setup_failed(&err)).await?;
                return Ok(Some(self.backoff()));
            }
        }

        if let Some(outcome) = self.check_env_references().await? {
            return Ok(Some(outcome));
        }

        let run = desired_pipeline_run(&self.function, &self.ctx.config);
        self.kube().create_pipeline_run(&run, &self.owner).await?;
        info!(pipeline_run = %run_name, "created build pipeline run");

        self.report(ReadyUpdate::building()).await?;
        Ok(Some(self.after_write()))
    }

    fn build(&self) -> Result<&PipelineRun, Error> {
        self.pipeline_run
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("reconcile", "build run not loaded"))
    }

    fn build_progress(&self) -> Step {
        let run = self.build()?;
        if run.is_done() {
            return Ok(None);
        }

        debug!(pipeline_run = %run.name_any(), "build still running");
        Ok(Some(Outcome::Requeue(self.ctx.config.policy.build_poll)))
    }

    async fn build_outcome(&self) -> Step {
        let run = self.build()?;
        if !run.is_failed() {
            return Ok(None);
        }

        let failure = extract_failure(self.kube(), run, &self.namespace).await;
        warn!(
            pipeline_run = %run.name_any(),
            reason = %failure.reason,
            message = %failure.message,
            "build failed"
        );
        self.report(ReadyUpdate::build_failed(&failure.reason, failure.message))
            .await?;
        Ok(Some(Outcome::Done))
    }

    async fn image_digest(&mut self) -> Step {
        let Some(digest) = reported_digest(self.build()?).map(str::to_string) else {
            warn!("build succeeded without reporting an image digest");
            self.report(ReadyUpdate::build_image_error()).await?;
            return Ok(Some(Outcome::Done));
        };

        // The existing build is never rerun, so editing `build.image` re-pins
        // the status to `<new image>@<old digest>`.
        let image = image_reference(&self.function.spec.build.image, &digest);
        let recorded = self.function.status.as_ref().and_then(|s| s.digest());
        if recorded != Some(image.as_str()) {
            info!(image = %image, "recorded image digest");
            self.write_status(StatusWrite::ready(ReadyUpdate::build_succeeded()).with_digest(image))
                .await?;
            return Ok(Some(self.after_write()));
        }

        self.image = Some(image);
        Ok(None)
    }

    async fn check_env_references(&self) -> Step {
        let missing =
            find_missing_reference(self.kube(), &self.namespace, &self.function.spec.deploy)
                .await?;

        match missing {
            Some(reference) => {
                warn!(?reference, "referenced object not found");
                self.report(reference.missing(&self.namespace)).await?;
                Ok(Some(self.backoff()))
            }
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Serving
    // -------------------------------------------------------------------------

    async fn broker(&self) -> Step {
        let Some(broker) = self.function.spec.broker() else {
            return Ok(None);
        };

        if self.kube().broker_exists(broker, &self.namespace).await? {
            return Ok(None);
        }

        warn!(broker = %broker, "broker not found");
        self.report(ReadyUpdate::broker_not_found(broker)).await?;
        Ok(Some(self.backoff()))
    }

    async fn serving(&mut self) -> Step {
        let image = self
            .image
            .as_deref()
            .ok_or_else(|| Error::internal_with_context("reconcile", "image not resolved"))?;
        let desired = desired_knative_service(&self.function, image, &self.ctx.config);

        let Some(existing) = self
            .kube()
            .get_knative_service(&self.name, &self.namespace)
            .await?
        else {
            self.kube()
                .create_knative_service(&desired, &self.owner)
                .await?;
            info!(service = %self.name, "created knative service");
            return Ok(Some(self.after_write()));
        };

        let drift = ServingFields::of(&existing).diff(&ServingFields::of(&desired));
        if !drift.is_empty() {
            info!(?drift, "knative service drifted, updating");
            self.kube()
                .update_knative_service(&deployment::with_desired_spec(&existing, &desired))
                .await?;
            return Ok(Some(self.after_write()));
        }

        self.service = Some(existing);
        Ok(None)
    }

    async fn serving_readiness(&mut self) -> Step {
        let service = self
            .service
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("reconcile", "service not loaded"))?;
        let url = service.url().map(str::to_string);

        let update = match service.ready_condition() {
            None => Some(ReadyUpdate::serving_pending()),
            Some(c) if c.is_true() => None,
            Some(c) if c.is_false() => Some(ReadyUpdate::serving_not_ready(
                c.reason(),
                c.message().unwrap_or_default(),
            )),
            Some(c) => Some(ReadyUpdate::serving_deploying(
                c.message().unwrap_or_default(),
            )),
        };

        if let Some(update) = update {
            debug!(reason = %update.reason, "knative service not ready");
            self.write_status(StatusWrite::ready(update).with_url(url.as_deref()))
                .await?;
            return Ok(Some(Outcome::Requeue(
                self.ctx.config.policy.readiness_poll,
            )));
        }

        self.url = url;
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Eventing
    // -------------------------------------------------------------------------

    async fn unsubscribe(&self) -> Step {
        if self.function.spec.broker().is_some() {
            return Ok(None);
        }

        let trigger = trigger_name(&self.name);
        if self
            .kube()
            .get_trigger(&trigger, &self.namespace)
            .await?
            .is_some()
        {
            self.kube().delete_trigger(&trigger, &self.namespace).await?;
            info!(trigger = %trigger, "eventing removed, deleted trigger");
            return Ok(Some(self.after_write()));
        }

        self.write_status(StatusWrite::ready(ReadyUpdate::ready()).with_url(self.url.as_deref()))
            .await?;
        Ok(Some(Outcome::Done))
    }

    async fn subscribe(&self) -> Step {
        let desired = desired_trigger(&self.function);
        let ready = StatusWrite::ready(ReadyUpdate::ready_with_eventing()).with_url(self.url.as_deref());

        let Some(existing) = self
            .kube()
            .get_trigger(&desired.name_any(), &self.namespace)
            .await?
        else {
            self.kube().create_trigger(&desired, &self.owner).await?;
            info!(trigger = %desired.name_any(), "created trigger");
            self.write_status(ready).await?;
            return Ok(Some(Outcome::Done));
        };

        let drift = TriggerFields::of(&existing).diff(&TriggerFields::of(&desired));
        if !drift.is_empty() {
            info!(?drift, "trigger drifted, updating");
            self.kube()
                .update_trigger(&eventing::with_desired_spec(&existing, &desired))
                .await?;
            return Ok(Some(self.after_write()));
        }

        self.write_status(ready).await?;
        Ok(Some(Outcome::Done))
    }
}

// =============================================================================
// Function reconciliation
// =============================================================================

/// Reconcile a Function
///
/// The Function is re-read before any phase runs so decisions are made on
/// the latest spec and status rather than the watch cache's copy.
#[instrument(skip(function, ctx), fields(function = %function.name_any()))]
pub async fn reconcile(function: Arc<Function>, ctx: Arc<FunctionContext>) -> Result<Action, Error> {
    let name = function.name_any();
    let Some(namespace) = function.namespace() else {
        return Err(Error::validation_for_field(
            name,
            "metadata.namespace",
            "Function must be namespaced",
        ));
    };

    let Some(current) = ctx.kube.get_function(&name, &namespace).await? else {
        debug!("function no longer exists");
        return Ok(Action::await_change());
    };

    let mut pass = Pass::new(&ctx, current, namespace)?;
    for phase in Phase::ALL {
        if let Some(outcome) = pass.run(phase).await? {
            debug!(%phase, ?outcome, "pass decided");
            return Ok(outcome.into());
        }
    }

    Ok(Action::await_change())
}

/// Error policy for the Function controller
///
/// Retryable errors are retried after the dependency backoff; anything else
/// waits for the Function to change.
pub fn error_policy(function: Arc<Function>, error: &Error, ctx: Arc<FunctionContext>) -> Action {
    error!(
        ?error,
        function = %function.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.config.policy.dependency_backoff)
    } else {
        Action::await_change()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcilePolicy;
    use crate::crd::{
        BuildSpec, ConditionStatus, EventingSpec, FunctionSpec, KnativeServiceStatus,
        PipelineRunStatus, Visibility,
    };
    use crate::crd::knative::VISIBILITY_LABEL;
    use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, SecretKeySelector};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{Mutex, MutexGuard};

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    const NS: &str = "apps";
    const IMAGE: &str = "registry.io/test:latest";
    const DIGEST_REF: &str = "registry.io/test:latest@sha256:abc123";

    fn sample_function() -> Function {
        Function {
            metadata: ObjectMeta {
                name: Some("hello".to_string()),
                namespace: Some(NS.to_string()),
                uid: Some("0b6e2f6a-1111-2222-3333-444455556666".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: FunctionSpec {
                git_repo: "https://github.com/acme/hello".to_string(),
                build: BuildSpec {
                    image: IMAGE.to_string(),
                    registry_secret_name: None,
                },
                ..Default::default()
            },
            status: None,
        }
    }

    fn secret_env(name: &str, secret: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.to_string(),
                    key: "value".to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pipeline_status(value: serde_json::Value) -> PipelineRunStatus {
        serde_json::from_value(value).expect("valid pipeline run status")
    }

    fn knative_status(value: serde_json::Value) -> KnativeServiceStatus {
        serde_json::from_value(value).expect("valid knative service status")
    }

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "rejected".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    // =========================================================================
    // In-memory cluster
    // =========================================================================

    /// Objects the mock client reads and writes
    #[derive(Default)]
    struct Cluster {
        function: Option<Function>,
        service_accounts: BTreeMap<String, ServiceAccount>,
        secrets: BTreeSet<String>,
        config_maps: BTreeSet<String>,
        tasks: BTreeMap<String, Task>,
        pipeline_runs: BTreeMap<String, PipelineRun>,
        task_runs: BTreeMap<String, TaskRun>,
        brokers: BTreeSet<String>,
        services: BTreeMap<String, KnativeService>,
        triggers: BTreeMap<String, Trigger>,
        fail_task_create: bool,
        /// Child object mutations, e.g. "create PipelineRun hello-build"
        writes: Vec<String>,
        status_patches: usize,
    }

    fn owned<K: Resource>(obj: &K, owner: &OwnerReference) -> K
    where
        K: Clone,
    {
        let mut obj = obj.clone();
        obj.meta_mut().owner_references = Some(vec![owner.clone()]);
        obj
    }

    /// State-backed mock: every expectation reads or writes `Cluster`
    #[derive(Clone, Default)]
    struct FakeCluster(Arc<Mutex<Cluster>>);

    impl FakeCluster {
        fn with_function(function: Function) -> Self {
            let fake = Self::default();
            fake.lock().function = Some(function);
            fake
        }

        fn lock(&self) -> MutexGuard<'_, Cluster> {
            self.0.lock().expect("mutex should not be poisoned")
        }

        fn mock(&self) -> MockFunctionKubeClient {
            let mut mock = MockFunctionKubeClient::new();

            let s = self.clone();
            mock.expect_get_function()
                .returning(move |_, _| Ok(s.lock().function.clone()));
            let s = self.clone();
            mock.expect_patch_function_status()
                .returning(move |_, _, status| {
                    let mut c = s.lock();
                    c.status_patches += 1;
                    if let Some(f) = c.function.as_mut() {
                        f.status = Some(status.clone());
                    }
                    Ok(())
                });

            let s = self.clone();
            mock.expect_get_service_account()
                .returning(move |name, _| Ok(s.lock().service_accounts.get(name).cloned()));
            let s = self.clone();
            mock.expect_create_service_account()
                .returning(move |sa, owner| {
                    let mut c = s.lock();
                    c.writes.push(format!("create ServiceAccount {}", sa.name_any()));
                    c.service_accounts.insert(sa.name_any(), owned(sa, owner));
                    Ok(())
                });
            let s = self.clone();
            mock.expect_update_service_account().returning(move |sa| {
                let mut c = s.lock();
                c.writes.push(format!("update ServiceAccount {}", sa.name_any()));
                c.service_accounts.insert(sa.name_any(), sa.clone());
                Ok(())
            });

            let s = self.clone();
            mock.expect_secret_exists()
                .returning(move |name, _| Ok(s.lock().secrets.contains(name)));
            let s = self.clone();
            mock.expect_config_map_exists()
                .returning(move |name, _| Ok(s.lock().config_maps.contains(name)));

            let s = self.clone();
            mock.expect_get_task()
                .returning(move |name, _| Ok(s.lock().tasks.get(name).cloned()));
            let s = self.clone();
            mock.expect_create_task().returning(move |task| {
                let mut c = s.lock();
                if c.fail_task_create {
                    return Err(api_error(403));
                }
                c.writes.push(format!("create Task {}", task.name_any()));
                c.tasks.insert(task.name_any(), task.clone());
                Ok(())
            });

            let s = self.clone();
            mock.expect_get_pipeline_run()
                .returning(move |name, _| Ok(s.lock().pipeline_runs.get(name).cloned()));
            let s = self.clone();
            mock.expect_create_pipeline_run()
                .returning(move |run, owner| {
                    let mut c = s.lock();
                    c.writes.push(format!("create PipelineRun {}", run.name_any()));
                    c.pipeline_runs.insert(run.name_any(), owned(run, owner));
                    Ok(())
                });
            let s = self.clone();
            mock.expect_get_task_run()
                .returning(move |name, _| Ok(s.lock().task_runs.get(name).cloned()));

            let s = self.clone();
            mock.expect_broker_exists()
                .returning(move |name, _| Ok(s.lock().brokers.contains(name)));

            let s = self.clone();
            mock.expect_get_knative_service()
                .returning(move |name, _| Ok(s.lock().services.get(name).cloned()));
            let s = self.clone();
            mock.expect_create_knative_service()
                .returning(move |svc, owner| {
                    let mut c = s.lock();
                    c.writes.push(format!("create Service {}", svc.name_any()));
                    c.services.insert(svc.name_any(), owned(svc, owner));
                    Ok(())
                });
            let s = self.clone();
            mock.expect_update_knative_service().returning(move |svc| {
                let mut c = s.lock();
                c.writes.push(format!("update Service {}", svc.name_any()));
                let status = c.services.get(&svc.name_any()).and_then(|e| e.status.clone());
                let mut stored = svc.clone();
                stored.status = status;
                c.services.insert(svc.name_any(), stored);
                Ok(())
            });

            let s = self.clone();
            mock.expect_get_trigger()
                .returning(move |name, _| Ok(s.lock().triggers.get(name).cloned()));
            let s = self.clone();
            mock.expect_create_trigger()
                .returning(move |trigger, owner| {
                    let mut c = s.lock();
                    c.writes.push(format!("create Trigger {}", trigger.name_any()));
                    c.triggers.insert(trigger.name_any(), owned(trigger, owner));
                    Ok(())
                });
            let s = self.clone();
            mock.expect_update_trigger().returning(move |trigger| {
                let mut c = s.lock();
                c.writes.push(format!("update Trigger {}", trigger.name_any()));
                c.triggers.insert(trigger.name_any(), trigger.clone());
                Ok(())
            });
            let s = self.clone();
            mock.expect_delete_trigger().returning(move |name, _| {
                let mut c = s.lock();
                c.writes.push(format!("delete Trigger {}", name));
                c.triggers.remove(name);
                Ok(())
            });

            mock
        }

        fn context(&self) -> Arc<FunctionContext> {
            Arc::new(FunctionContext::for_testing(Arc::new(self.mock())))
        }

        async fn reconcile(&self) -> Action {
            let function = self.lock().function.clone().expect("function present");
            reconcile(Arc::new(function), self.context())
                .await
                .expect("reconcile should succeed")
        }

        /// Reconcile until the pass stops at something other than a 1s requeue
        async fn settle(&self) -> Action {
            for _ in 0..20 {
                let action = self.reconcile().await;
                if action != Action::requeue(Duration::from_secs(1)) {
                    return action;
                }
            }
            panic!("reconciliation did not settle");
        }

        fn edit(&self, f: impl FnOnce(&mut Function)) {
            let mut c = self.lock();
            let function = c.function.as_mut().expect("function present");
            f(function);
            function.metadata.generation = function.metadata.generation.map(|g| g + 1);
        }

        fn status(&self) -> FunctionStatus {
            self.lock()
                .function
                .as_ref()
                .and_then(|f| f.status.clone())
                .unwrap_or_default()
        }

        fn ready(&self) -> (ConditionStatus, String, String) {
            let status = self.status();
            let ready = status.ready().expect("ready condition set");
            (ready.status, ready.reason.clone(), ready.message.clone())
        }

        fn writes(&self) -> Vec<String> {
            self.lock().writes.clone()
        }

        fn mutation_count(&self) -> usize {
            let c = self.lock();
            c.writes.len() + c.status_patches
        }

        fn set_build_status(&self, status: PipelineRunStatus) {
            let mut c = self.lock();
            let run = c
                .pipeline_runs
                .get_mut("hello-build")
                .expect("build run created");
            run.status = Some(status);
        }

        fn succeed_build(&self, digest: &str) {
            self.set_build_status(pipeline_status(serde_json::json!({
                "conditions": [{"type": "Succeeded", "status": "True", "reason": "Succeeded"}],
                "results": [{"name": "APP_IMAGE_DIGEST", "value": digest}]
            })));
        }

        fn set_service_status(&self, status: KnativeServiceStatus) {
            let mut c = self.lock();
            let svc = c.services.get_mut("hello").expect("knative service created");
            svc.status = Some(status);
        }

        fn service_ready(&self) {
            self.set_service_status(knative_status(serde_json::json!({
                "conditions": [{"type": "Ready", "status": "True"}],
                "url": "http://hello.apps.svc.cluster.local"
            })));
        }

        /// Drive a fresh Function to a Knative Service that reports ready
        async fn converge_to_serving(&self) {
            self.settle().await;
            self.succeed_build("sha256:abc123");
            self.settle().await;
            self.service_ready();
        }
    }

    /// Pre-install the Task catalog so passes go straight to the build
    fn catalog(fake: &FakeCluster) {
        let mut c = fake.lock();
        for (name, manifest) in crate::tasks::REQUIRED_TASKS {
            let task = crate::tasks::catalog_task(manifest, NS).expect("embedded manifest parses");
            c.tasks.insert(name.to_string(), task);
        }
    }

    // =========================================================================
    // Build Story Tests
    // =========================================================================

    /// Story: a new Function gets its identity first, then its build
    #[tokio::test]
    async fn story_new_function_creates_identity_then_build() {
        let fake = FakeCluster::with_function(sample_function());
        catalog(&fake);

        let action = fake.reconcile().await;
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        assert_eq!(fake.writes(), vec!["create ServiceAccount hello-sa"]);

        let sa = fake.lock().service_accounts["hello-sa"].clone();
        let owner = &sa.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Function");
        assert_eq!(owner.name, "hello");
        assert_eq!(owner.controller, Some(true));

        let action = fake.reconcile().await;
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        assert_eq!(
            fake.writes(),
            vec!["create ServiceAccount hello-sa", "create PipelineRun hello-build"]
        );

        let run = fake.lock().pipeline_runs["hello-build"].clone();
        assert_eq!(
            run.spec
                .task_run_template
                .as_ref()
                .and_then(|t| t.service_account_name.as_deref()),
            Some("hello-sa")
        );
        let fetch = &run.spec.pipeline_spec.as_ref().unwrap().tasks[0];
        let revision = fetch.params.iter().find(|p| p.name == "revision").unwrap();
        assert_eq!(revision.value.as_str(), Some("main"));

        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "Building");
        assert_eq!(message, "Pipeline de build iniciado");
        assert_eq!(fake.status().observed_generation, Some(1));
    }

    /// Story: the Task catalog is installed in the same pass as the build
    #[tokio::test]
    async fn story_task_catalog_installed_before_first_build() {
        let fake = FakeCluster::with_function(sample_function());

        fake.reconcile().await;
        fake.reconcile().await;

        assert_eq!(
            fake.writes(),
            vec![
                "create ServiceAccount hello-sa",
                "create Task git-clone",
                "create Task buildpacks-phases",
                "create PipelineRun hello-build",
            ]
        );
    }

    /// Story: a Task that cannot be created blocks the build with a reason
    #[tokio::test]
    async fn story_task_setup_failure_is_reported() {
        let fake = FakeCluster::with_function(sample_function());
        fake.lock().fail_task_create = true;

        fake.reconcile().await;
        let action = fake.reconcile().await;

        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "TaskSetupFailed");
        assert!(message.starts_with("Failed to create required Tekton Tasks: "));
        assert!(fake.lock().pipeline_runs.is_empty());
    }

    /// Story: a running build is polled without writing anything
    #[tokio::test]
    async fn story_running_build_is_polled() {
        let fake = FakeCluster::with_function(sample_function());
        catalog(&fake);
        fake.settle().await;

        let before = fake.mutation_count();
        let action = fake.reconcile().await;
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert_eq!(fake.mutation_count(), before);

        fake.set_build_status(pipeline_status(serde_json::json!({
            "conditions": [{"type": "Succeeded", "status": "Unknown", "reason": "Running"}]
        })));
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(30)));
    }

    /// Story: the pushed digest is pinned into status
    #[tokio::test]
    async fn story_successful_build_records_digest() {
        let fake = FakeCluster::with_function(sample_function());
        catalog(&fake);
        fake.settle().await;
        fake.succeed_build(" sha256:abc123\n");

        let action = fake.reconcile().await;
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        assert_eq!(fake.status().image_digest.as_deref(), Some(DIGEST_REF));

        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::Unknown);
        assert_eq!(reason, "Deploying");
        assert_eq!(message, "Build succeeded, deploying to Knative Service");
        assert!(fake.lock().services.is_empty());
    }

    /// Story: a failed build names the failing task and stops
    #[tokio::test]
    async fn story_failed_build_reports_failing_task() {
        let fake = FakeCluster::with_function(sample_function());
        catalog(&fake);
        fake.settle().await;

        fake.set_build_status(pipeline_status(serde_json::json!({
            "conditions": [{"type": "Succeeded", "status": "False", "reason": "Failed", "message": "Tasks Completed: 1 (Failed: 1)"}],
            "childReferences": [
                {"kind": "TaskRun", "name": "hello-build-fetch-source", "pipelineTaskName": "fetch-source"}
            ]
        })));
        let task_run: TaskRun = serde_json::from_value(serde_json::json!({
            "apiVersion": "tekton.dev/v1",
            "kind": "TaskRun",
            "metadata": {"name": "hello-build-fetch-source", "namespace": NS},
            "spec": {},
            "status": {"conditions": [
                {"type": "Succeeded", "status": "False", "reason": "TaskRunFailed", "message": "auth required"}
            ]}
        }))
        .unwrap();
        fake.lock()
            .task_runs
            .insert("hello-build-fetch-source".to_string(), task_run);

        let action = fake.reconcile().await;
        assert_eq!(action, Action::await_change());

        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "TaskRunFailed");
        assert_eq!(message, "Task 'fetch-source' falhou: auth required");

        // Terminal: the next pass changes nothing
        let before = fake.mutation_count();
        assert_eq!(fake.reconcile().await, Action::await_change());
        assert_eq!(fake.mutation_count(), before);
    }

    /// Story: a successful build without a digest is a terminal error
    #[tokio::test]
    async fn story_missing_digest_is_terminal() {
        let fake = FakeCluster::with_function(sample_function());
        catalog(&fake);
        fake.settle().await;
        fake.succeed_build("   ");

        assert_eq!(fake.reconcile().await, Action::await_change());
        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "BuildImageError");
        assert_eq!(message, "Ocorreu um erro ao gerar o digest da imagem");
        assert!(fake.status().image_digest.is_none());
    }

    // =========================================================================
    // Credential Story Tests
    // =========================================================================

    /// Story: a missing git secret is reported and retried
    #[tokio::test]
    async fn story_missing_git_secret_blocks_build() {
        let mut function = sample_function();
        function.spec.git_auth_secret_name = Some("git-creds".to_string());
        let fake = FakeCluster::with_function(function);
        catalog(&fake);

        fake.reconcile().await;
        let action = fake.reconcile().await;
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));

        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "GitAuthMissing");
        assert_eq!(message, "Git authentication secret não encontrado: git-creds");
        assert!(fake.lock().pipeline_runs.is_empty());

        // Once the secret appears it is attached before the build starts
        fake.lock().secrets.insert("git-creds".to_string());
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(1)));
        assert_eq!(
            fake.writes().last().map(String::as_str),
            Some("update ServiceAccount hello-sa")
        );

        fake.reconcile().await;
        assert!(fake.lock().pipeline_runs.contains_key("hello-build"));
    }

    /// Story: both credential kinds land on the service account exactly once
    #[tokio::test]
    async fn story_credentials_attached_once() {
        let mut function = sample_function();
        function.spec.git_auth_secret_name = Some("git-creds".to_string());
        function.spec.build.registry_secret_name = Some("registry-creds".to_string());
        let fake = FakeCluster::with_function(function);
        fake.lock().secrets.insert("git-creds".to_string());
        catalog(&fake);

        fake.settle().await;

        let sa = fake.lock().service_accounts["hello-sa"].clone();
        let secrets: Vec<_> = sa.secrets.unwrap().into_iter().filter_map(|s| s.name).collect();
        assert_eq!(secrets, vec!["git-creds"]);
        let pull: Vec<_> = sa
            .image_pull_secrets
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(pull, vec!["registry-creds"]);

        let updates = fake
            .writes()
            .iter()
            .filter(|w| w.starts_with("update ServiceAccount"))
            .count();
        assert_eq!(updates, 1);
    }

    // =========================================================================
    // Environment Story Tests
    // =========================================================================

    /// Story: a missing env secret stops the build from being created
    #[tokio::test]
    async fn story_missing_env_secret_blocks_build() {
        let mut function = sample_function();
        function.spec.deploy.env = vec![secret_env("DB_PASSWORD", "db")];
        let fake = FakeCluster::with_function(function);
        catalog(&fake);

        fake.reconcile().await;
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(30)));

        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "SecretNotFound");
        assert_eq!(
            message,
            "Secret não encontrado: db. Crie o Secret no namespace apps antes de deployar a função."
        );
        assert!(fake.lock().pipeline_runs.is_empty());
    }

    /// Story: a reference removed after the build is caught before deploying
    #[tokio::test]
    async fn story_reference_removed_after_build_blocks_deploy() {
        let mut function = sample_function();
        function.spec.deploy.env = vec![secret_env("DB_PASSWORD", "db")];
        let fake = FakeCluster::with_function(function);
        fake.lock().secrets.insert("db".to_string());
        catalog(&fake);

        fake.settle().await;
        fake.succeed_build("sha256:abc123");
        fake.reconcile().await;

        fake.lock().secrets.remove("db");
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(30)));
        assert_eq!(fake.ready().1, "SecretNotFound");
        assert!(fake.lock().services.is_empty());
        assert_eq!(fake.status().image_digest.as_deref(), Some(DIGEST_REF));
    }

    // =========================================================================
    // Serving Story Tests
    // =========================================================================

    /// Story: the Knative Service follows the digest and mirrors readiness
    #[tokio::test]
    async fn story_function_becomes_ready_without_eventing() {
        let fake = FakeCluster::with_function(sample_function());
        catalog(&fake);

        fake.settle().await;
        fake.succeed_build("sha256:abc123");

        // Digest capture, then the Knative Service
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(1)));
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(1)));
        let svc = fake.lock().services["hello"].clone();
        assert_eq!(
            svc.spec.template.spec.containers[0].image.as_deref(),
            Some(DIGEST_REF)
        );
        assert!(svc.metadata.owner_references.is_some());

        // Knative has not reported anything yet
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(10)));
        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::Unknown);
        assert_eq!(reason, "Deploying");
        assert_eq!(message, "Waiting for Knative Service to report readiness");

        fake.service_ready();
        assert_eq!(fake.reconcile().await, Action::await_change());
        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::True);
        assert_eq!(reason, "Ready");
        assert_eq!(message, "Function deployed and ready to accept requests");
        assert_eq!(
            fake.status().url.as_deref(),
            Some("http://hello.apps.svc.cluster.local")
        );
    }

    /// Story: a converged Function is a no-op on the next pass
    #[tokio::test]
    async fn story_converged_function_is_idempotent() {
        let fake = FakeCluster::with_function(sample_function());
        catalog(&fake);
        fake.converge_to_serving().await;
        assert_eq!(fake.reconcile().await, Action::await_change());

        let before = fake.mutation_count();
        assert_eq!(fake.reconcile().await, Action::await_change());
        assert_eq!(fake.reconcile().await, Action::await_change());
        assert_eq!(fake.mutation_count(), before);
    }

    /// Story: Knative's failure reason is surfaced verbatim
    #[tokio::test]
    async fn story_serving_failure_is_mirrored() {
        let fake = FakeCluster::with_function(sample_function());
        catalog(&fake);
        fake.converge_to_serving().await;

        fake.set_service_status(knative_status(serde_json::json!({
            "conditions": [{"type": "Ready", "status": "False", "reason": "RevisionFailed", "message": "image pull backoff"}],
            "url": "http://hello.apps.svc.cluster.local"
        })));
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(10)));
        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "RevisionFailed");
        assert_eq!(message, "Knative Service not ready: image pull backoff");

        fake.set_service_status(knative_status(serde_json::json!({
            "conditions": [{"type": "Ready", "status": "Unknown", "message": "rolling out"}]
        })));
        fake.reconcile().await;
        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::Unknown);
        assert_eq!(reason, "Deploying");
        assert_eq!(message, "Knative Service is deploying: rolling out");
    }

    /// Story: editing env in the spec rolls the Knative Service
    #[tokio::test]
    async fn story_spec_change_updates_service() {
        let fake = FakeCluster::with_function(sample_function());
        catalog(&fake);
        fake.converge_to_serving().await;
        fake.reconcile().await;

        fake.edit(|f| {
            f.spec.deploy.env = vec![EnvVar {
                name: "MODE".to_string(),
                value: Some("prod".to_string()),
                ..Default::default()
            }]
        });
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(1)));
        assert_eq!(
            fake.writes().last().map(String::as_str),
            Some("update Service hello")
        );

        let env = fake.lock().services["hello"].spec.template.spec.containers[0]
            .env
            .clone()
            .unwrap();
        assert_eq!(env[0].name, "MODE");

        assert_eq!(fake.reconcile().await, Action::await_change());
        assert_eq!(fake.status().observed_generation, Some(2));
    }

    /// Story: switching to external visibility drops the cluster-local label
    #[tokio::test]
    async fn story_visibility_change_updates_service() {
        let fake = FakeCluster::with_function(sample_function());
        catalog(&fake);
        fake.converge_to_serving().await;
        fake.reconcile().await;
        assert!(fake.lock().services["hello"].labels().contains_key(VISIBILITY_LABEL));

        fake.edit(|f| f.spec.deploy.visibility = Some(Visibility::External));
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(1)));
        assert_eq!(
            fake.writes().last().map(String::as_str),
            Some("update Service hello")
        );
        assert!(!fake.lock().services["hello"].labels().contains_key(VISIBILITY_LABEL));

        assert_eq!(fake.reconcile().await, Action::await_change());
    }

    // =========================================================================
    // Eventing Story Tests
    // =========================================================================

    fn eventing_function(broker: &str) -> Function {
        let mut function = sample_function();
        function.spec.eventing = EventingSpec {
            broker: broker.to_string(),
            filters: Some(BTreeMap::from([(
                "type".to_string(),
                "order.created".to_string(),
            )])),
        };
        function
    }

    /// Story: a missing broker blocks the Knative Service entirely
    #[tokio::test]
    async fn story_missing_broker_blocks_serving() {
        let fake = FakeCluster::with_function(eventing_function("b1"));
        catalog(&fake);
        fake.settle().await;
        fake.succeed_build("sha256:abc123");
        fake.reconcile().await;

        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(30)));
        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "BrokerNotFound");
        assert_eq!(message, "Knative Broker não encontrado: b1");
        assert!(fake.lock().services.is_empty());
    }

    /// Story: the Trigger is created only after the Service is ready
    #[tokio::test]
    async fn story_function_becomes_ready_with_eventing() {
        let fake = FakeCluster::with_function(eventing_function("b1"));
        fake.lock().brokers.insert("b1".to_string());
        catalog(&fake);

        fake.settle().await;
        fake.succeed_build("sha256:abc123");
        fake.settle().await;
        assert!(fake.lock().triggers.is_empty());

        fake.service_ready();
        assert_eq!(fake.reconcile().await, Action::await_change());

        let trigger = fake.lock().triggers["hello-trigger"].clone();
        assert_eq!(trigger.spec.broker, "b1");
        assert_eq!(
            trigger.spec.subscriber.reference.as_ref().map(|r| r.name.as_str()),
            Some("hello")
        );
        assert!(trigger.metadata.owner_references.is_some());

        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::True);
        assert_eq!(reason, "Ready");
        assert_eq!(
            message,
            "Function deployed with eventing and ready to accept requests"
        );

        let before = fake.mutation_count();
        assert_eq!(fake.reconcile().await, Action::await_change());
        assert_eq!(fake.mutation_count(), before);
    }

    /// Story: changing filters updates the Trigger in place
    #[tokio::test]
    async fn story_filter_change_updates_trigger() {
        let fake = FakeCluster::with_function(eventing_function("b1"));
        fake.lock().brokers.insert("b1".to_string());
        catalog(&fake);
        fake.converge_to_serving().await;
        fake.reconcile().await;

        fake.edit(|f| f.spec.eventing.filters = None);
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(1)));
        assert_eq!(
            fake.writes().last().map(String::as_str),
            Some("update Trigger hello-trigger")
        );

        assert_eq!(fake.reconcile().await, Action::await_change());
        let trigger = fake.lock().triggers["hello-trigger"].clone();
        assert!(trigger.spec.filter.unwrap().attributes.is_none());
    }

    /// Story: dropping the broker deletes the Trigger, then reports Ready
    #[tokio::test]
    async fn story_removing_broker_deletes_trigger() {
        let fake = FakeCluster::with_function(eventing_function("b1"));
        fake.lock().brokers.insert("b1".to_string());
        catalog(&fake);
        fake.converge_to_serving().await;
        fake.reconcile().await;
        assert!(fake.lock().triggers.contains_key("hello-trigger"));

        fake.edit(|f| f.spec.eventing.broker = String::new());
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(1)));
        assert_eq!(
            fake.writes().last().map(String::as_str),
            Some("delete Trigger hello-trigger")
        );
        assert!(fake.lock().triggers.is_empty());

        assert_eq!(fake.reconcile().await, Action::await_change());
        let (status, reason, message) = fake.ready();
        assert_eq!(status, ConditionStatus::True);
        assert_eq!(reason, "Ready");
        assert_eq!(message, "Function deployed and ready to accept requests");
    }

    // =========================================================================
    // Invariant Tests
    // =========================================================================

    /// Story: the digest survives every later pass
    #[tokio::test]
    async fn story_digest_is_never_cleared() {
        let fake = FakeCluster::with_function(eventing_function("b1"));
        catalog(&fake);
        fake.settle().await;
        fake.succeed_build("sha256:abc123");

        for _ in 0..5 {
            fake.reconcile().await;
            assert_eq!(fake.status().image_digest.as_deref(), Some(DIGEST_REF));
        }
        fake.lock().brokers.insert("b1".to_string());
        fake.settle().await;
        fake.service_ready();
        fake.reconcile().await;
        assert_eq!(fake.status().image_digest.as_deref(), Some(DIGEST_REF));
    }

    /// Story: editing the image re-pins the old digest without a rebuild
    #[tokio::test]
    async fn story_image_edit_repins_existing_digest() {
        let fake = FakeCluster::with_function(sample_function());
        catalog(&fake);
        fake.converge_to_serving().await;
        fake.reconcile().await;

        fake.edit(|f| f.spec.build.image = "registry.io/other:v2".to_string());
        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(1)));
        assert_eq!(
            fake.status().image_digest.as_deref(),
            Some("registry.io/other:v2@sha256:abc123")
        );

        assert_eq!(fake.reconcile().await, Action::requeue(Duration::from_secs(1)));
        assert_eq!(
            fake.lock().services["hello"].spec.template.spec.containers[0]
                .image
                .as_deref(),
            Some("registry.io/other:v2@sha256:abc123")
        );
        let builds = fake
            .writes()
            .iter()
            .filter(|w| w.starts_with("create PipelineRun"))
            .count();
        assert_eq!(builds, 1);
    }

    /// Story: every pass performs at most one child mutation
    #[tokio::test]
    async fn story_one_child_mutation_per_pass() {
        let mut function = eventing_function("b1");
        function.spec.build.registry_secret_name = Some("registry-creds".to_string());
        let fake = FakeCluster::with_function(function);
        fake.lock().brokers.insert("b1".to_string());
        catalog(&fake);

        let mut completed = false;
        for step in 0..30 {
            let before = fake.writes().len();
            let action = fake.reconcile().await;
            assert!(fake.writes().len() - before <= 1, "pass {step} wrote twice");

            match step {
                4 => fake.succeed_build("sha256:abc123"),
                8 => fake.service_ready(),
                _ => {}
            }
            if action == Action::await_change() && fake.ready().0 == ConditionStatus::True {
                completed = true;
                break;
            }
        }
        assert!(completed, "function never became ready");
    }

    /// Story: a deleted Function is left alone
    #[tokio::test]
    async fn story_deleted_function_is_ignored() {
        let mut mock = MockFunctionKubeClient::new();
        mock.expect_get_function().returning(|_, _| Ok(None));
        mock.expect_get_service_account().never();
        let ctx = Arc::new(FunctionContext::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(sample_function()), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: store failures propagate to the error policy
    #[tokio::test]
    async fn story_store_errors_propagate() {
        let mut mock = MockFunctionKubeClient::new();
        mock.expect_get_function()
            .returning(|_, _| Ok(Some(sample_function())));
        mock.expect_get_service_account()
            .returning(|_, _| Err(Error::internal("connection refused")));
        mock.expect_patch_function_status().never();
        let ctx = Arc::new(FunctionContext::for_testing(Arc::new(mock)));

        let result = reconcile(Arc::new(sample_function()), ctx).await;
        assert!(result.is_err());
    }

    /// Story: status writes that change nothing are skipped
    #[tokio::test]
    async fn story_unchanged_status_is_not_patched() {
        let mut function = sample_function();
        function.spec.git_auth_secret_name = Some("git-creds".to_string());
        let fake = FakeCluster::with_function(function);
        catalog(&fake);

        fake.reconcile().await;
        fake.reconcile().await;
        let patches = fake.lock().status_patches;
        fake.reconcile().await;
        fake.reconcile().await;
        assert_eq!(fake.lock().status_patches, patches);
    }

    /// Story: requeue intervals come from configuration
    #[tokio::test]
    async fn story_requeue_policy_is_configurable() {
        let fake = FakeCluster::with_function(sample_function());
        let config = ControllerConfig {
            policy: ReconcilePolicy {
                after_write: Duration::from_millis(250),
                ..Default::default()
            },
            ..Default::default()
        };
        let ctx = Arc::new(FunctionContext::new(Arc::new(fake.mock()), config));

        let action = reconcile(Arc::new(sample_function()), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_millis(250)));
    }

    // =========================================================================
    // Error Policy Tests
    // =========================================================================

    #[test]
    fn test_error_policy_retries_transient_errors() {
        let ctx = Arc::new(FunctionContext::for_testing(Arc::new(
            MockFunctionKubeClient::new(),
        )));
        let action = error_policy(Arc::new(sample_function()), &api_error(503), ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn test_error_policy_retries_client_errors() {
        for code in [403, 404, 429] {
            let ctx = Arc::new(FunctionContext::for_testing(Arc::new(
                MockFunctionKubeClient::new(),
            )));
            let action = error_policy(Arc::new(sample_function()), &api_error(code), ctx);
            assert_eq!(action, Action::requeue(Duration::from_secs(30)), "code {code}");
        }
    }

    #[test]
    fn test_error_policy_waits_on_permanent_errors() {
        let ctx = Arc::new(FunctionContext::for_testing(Arc::new(
            MockFunctionKubeClient::new(),
        )));
        let err = Error::validation_for_field("hello", "metadata.namespace", "missing");
        assert_eq!(
            error_policy(Arc::new(sample_function()), &err, ctx),
            Action::await_change()
        );
    }

    #[tokio::test]
    async fn test_function_without_namespace_is_rejected() {
        let mut function = sample_function();
        function.metadata.namespace = None;
        let ctx = Arc::new(FunctionContext::for_testing(Arc::new(
            MockFunctionKubeClient::new(),
        )));

        let err = reconcile(Arc::new(function), ctx).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_phase_order_and_names() {
        assert_eq!(Phase::ALL.first(), Some(&Phase::Identity));
        assert_eq!(Phase::ALL.last(), Some(&Phase::Subscribe));
        assert_eq!(Phase::BuildRun.to_string(), "build-run");
        assert_eq!(Phase::ServingReadiness.to_string(), "serving-readiness");
    }
}
