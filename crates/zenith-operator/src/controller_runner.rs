//! Controller runner: wires the Function controller to its watches

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use zenith_common::crd::{Function, KnativeService, PipelineRun, Trigger};
use zenith_function::{error_policy, reconcile, ControllerConfig, FunctionContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the Function controller future
///
/// Changes to any child the controller owns requeue the owning Function.
pub fn build_function_controller(
    client: Client,
    config: ControllerConfig,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let ctx = Arc::new(FunctionContext::from_client(client.clone(), config));

    let functions: Api<Function> = Api::all(client.clone());
    let service_accounts: Api<ServiceAccount> = Api::all(client.clone());
    let pipeline_runs: Api<PipelineRun> = Api::all(client.clone());
    let services: Api<KnativeService> = Api::all(client.clone());
    let triggers: Api<Trigger> = Api::all(client);

    tracing::info!("- Function controller");

    Box::pin(
        Controller::new(functions, watcher_config())
            .owns(service_accounts, watcher_config())
            .owns(pipeline_runs, watcher_config())
            .owns(services, watcher_config())
            .owns(triggers, watcher_config())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Function")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
