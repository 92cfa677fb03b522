//! # Watch Loop
//!
//! Controller watch loop that monitors GitRepo resources, the jobs they own
//! and the bundle deployments labelled for them, and triggers reconciliation
//! when changes are detected.

use crate::config::ControllerConfig;
use crate::constants::{BUNDLE_NAMESPACE_LABEL, REPO_LABEL, SHARD_LABEL};
use crate::controller::reconciler::{reconcile, Reconciler, ReconcilerError, TriggerSource};
use crate::crd::{BundleDeployment, GitRepo};
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error, is_watch_failure};
use crate::server::ServerState;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::Api;
use kube::Client;
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{controller::Action, watcher, Controller};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Label selector restricting a replica to its shard
///
/// A replica without a shard only handles objects that carry no shard label.
#[must_use]
pub fn shard_selector(shard_id: Option<&str>) -> String {
    match shard_id {
        Some(shard) => format!("{SHARD_LABEL}={shard}"),
        None => format!("!{SHARD_LABEL}"),
    }
}

/// The GitRepo a bundle deployment reports to, from its label pair
#[must_use]
pub fn repo_for_bundle_deployment(deployment: &BundleDeployment) -> Option<ObjectRef<GitRepo>> {
    let labels = deployment.metadata.labels.as_ref()?;
    let name = labels.get(REPO_LABEL)?;
    let namespace = labels.get(BUNDLE_NAMESPACE_LABEL)?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Run the controller watch loop
///
/// Restarts the controller stream after watch errors until a shutdown signal
/// marks the server as not ready. Polling tasks are stopped on the way out.
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
    config: Arc<ControllerConfig>,
) -> Result<(), anyhow::Error> {
    let selector = shard_selector(config.shard_id.as_deref());
    info!(selector = %selector, "Starting controller watch loop...");

    let repos: Api<GitRepo> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client.clone());
    let deployments: Api<BundleDeployment> = Api::all(client);

    let backoff_duration_ms = Arc::new(AtomicU64::new(config.backoff_start_ms));

    let shutdown_server_state = server_state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        }
        shutdown_server_state.is_ready.store(false, Ordering::Relaxed);
        info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
    });

    loop {
        if !server_state.is_ready.load(Ordering::Relaxed) {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let backoff = backoff_duration_ms.clone();
        let loop_config = config.clone();
        let watch_span = tracing::span!(tracing::Level::INFO, "controller.watch", operation = "watch_loop");

        Controller::new(repos.clone(), watcher::Config::default().labels(&selector).any_semantic())
            .owns(jobs.clone(), watcher::Config::default().labels(&selector))
            .watches(deployments.clone(), watcher::Config::default(), |deployment| {
                repo_for_bundle_deployment(&deployment)
            })
            .shutdown_on_signal()
            .run(create_reconcile_fn, handle_reconciliation_error, reconciler.clone())
            .filter_map(move |x| {
                let backoff = backoff.clone();
                let config = loop_config.clone();
                async move {
                    match &x {
                        Ok((object, _)) => {
                            backoff.store(config.backoff_start_ms, Ordering::Relaxed);
                            debug!(resource.name = %object.name, "watch.event.success");
                            Some(x)
                        }
                        // already requeued by the error policy
                        Err(e) if !is_watch_failure(e) => {
                            debug!(error = %e, "watch.event.reconcile_failed");
                            Some(x)
                        }
                        Err(e) => {
                            let error_string = format!("{e:?}");
                            handle_watch_stream_error(
                                &error_string,
                                &backoff,
                                config.backoff_max_ms,
                                config.watch_restart_delay_secs,
                            )
                            .await
                            .map(|()| x)
                        }
                    }
                }
            })
            .for_each(|_| futures::future::ready(()))
            .instrument(watch_span)
            .await;

        if !server_state.is_ready.load(Ordering::Relaxed) {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let delay = config.watch_restart_delay_duration();
        warn!("Controller watch stream ended, restarting in {} seconds...", delay.as_secs());
        tokio::time::sleep(delay).await;
    }

    reconciler.scheduler.shutdown();
    info!("Controller stopped gracefully");
    Ok(())
}

/// Reconcile one GitRepo, tagging the pass with why it was triggered
fn create_reconcile_fn(
    obj: Arc<GitRepo>,
    ctx: Arc<Reconciler>,
) -> impl std::future::Future<Output = Result<Action, ReconcilerError>> + Send {
    let key = format!("{}/{}", obj.namespace_or_default(), obj.name());
    let retrying = match ctx.backoff_states.lock() {
        Ok(states) => states.get(&key).is_some_and(|state| state.error_count > 0),
        Err(_) => false,
    };
    let trigger_source = if retrying {
        TriggerSource::ErrorBackoff
    } else {
        TriggerSource::Watch
    };
    reconcile(obj, ctx, trigger_source)
}
