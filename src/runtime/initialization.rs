//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, and Kubernetes client setup.

use crate::clock::SystemClock;
use crate::config::ControllerConfig;
use crate::constants::{DEFAULT_SERVER_POLL_INTERVAL_MS, DEFAULT_SERVER_STARTUP_TIMEOUT_SECS, FIELD_MANAGER};
use crate::controller::reconciler::Reconciler;
use crate::controller::Collaborators;
use crate::crd::GitRepo;
use crate::git::GitCliFetcher;
use crate::observability;
use crate::server::{start_server, ServerState};
use crate::store::{KubeEventRecorder, KubeStore, ObjectStore};
use anyhow::{anyhow, Context, Result};
use kube::api::{Api, ListParams};
use kube::Client;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    /// Reconciler context
    pub reconciler: Arc<Reconciler>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    /// Controller configuration loaded from the environment
    pub config: Arc<ControllerConfig>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.is_ready.load(Ordering::Relaxed))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Reconciler setup
pub async fn initialize() -> Result<InitializationResult> {
    // must happen before any TLS connection is made
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_provider| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gitops_controller=info".into()),
        )
        .init();

    info!("Starting GitOps Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let config = Arc::new(ControllerConfig::from_env());
    info!(
        namespace = %config.controller_namespace,
        shard = config.shard_id.as_deref().unwrap_or("<none>"),
        "Loaded controller configuration"
    );

    let server_state = Arc::new(ServerState::new());

    let server_state_clone = server_state.clone();
    let server_port = config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let collaborators = Collaborators {
        store: store.clone(),
        events: Arc::new(KubeEventRecorder::new(client.clone(), FIELD_MANAGER)),
        fetcher: Arc::new(GitCliFetcher::new(store, config.git_fetch_timeout())),
        clock: Arc::new(SystemClock),
    };
    let reconciler = Arc::new(Reconciler::new(collaborators, (*config).clone()));

    check_crd_queryable(&client).await;

    info!("Controller initialized, starting watch loop...");
    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
        config,
    })
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(DEFAULT_SERVER_STARTUP_TIMEOUT_SECS);
    let poll_interval = Duration::from_millis(DEFAULT_SERVER_POLL_INTERVAL_MS);
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow!("HTTP server failed to start"));
        }

        // set by start_server once bound
        if server_state.is_ready.load(Ordering::Relaxed) {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Log whether the GitRepo CRD can be listed before the watch starts
///
/// The watch reconciles every existing GitRepo on its initial list, so a
/// failure here is only reported.
async fn check_crd_queryable(client: &Client) {
    let repos: Api<GitRepo> = Api::all(client.clone());
    match repos.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("GitRepo CRD is queryable"),
        Err(e) => {
            error!("CRD is not queryable; {:?}. Is the CRD installed?", e);
            warn!("Continuing despite CRD queryability check failure - controller will retry");
        }
    }
}
