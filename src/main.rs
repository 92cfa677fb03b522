//! # GitOps Controller
//!
//! A Kubernetes controller that turns `GitRepo` resources into apply jobs.
//!
//! ## Overview
//!
//! 1. **Polling** - each GitRepo gets a jittered task that resolves the latest commit
//! 2. **Restrictions** - `GitRepoRestriction` objects constrain and default repo specs
//! 3. **Apply jobs** - one job per repo and commit, recreated on forced resync or spec change
//! 4. **Status** - job state and bundle deployment health are rolled up into the GitRepo
//!
//! Prometheus metrics and health checks are served on `METRICS_PORT`.

use anyhow::Result;
use gitops_controller::runtime::initialization::initialize;
use gitops_controller::runtime::watch_loop::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;
    run_watch_loop(init.client, init.reconciler, init.server_state, init.config).await
}
