// Copyright 2025 CloudTik Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The `cloudtik-scaler` binary: loads a cluster config, resolves the
//! provider and runs the scaling control loop until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cloudtik_common::config::ClusterConfig;
use cloudtik_scaler::config::prepare_cluster_config;
use cloudtik_scaler::heartbeat::ClusterMetrics;
use cloudtik_scaler::monitor::{boot_metrics_service, ScalerMetrics};
use cloudtik_scaler::provider::ProviderRegistry;
use cloudtik_scaler::runner::ExecProcessRunner;
use cloudtik_scaler::scaler::start_cluster_scaler;
use cloudtik_scaler::{ClusterScaler, ClusterScalerOpts, ScaleError, ScaleResult};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "cloudtik-scaler", about = "CloudTik cluster scaling control loop")]
struct ScalerNodeOpts {
    /// Path to the cluster config YAML.
    #[clap(long, env = "CLOUDTIK_CONFIG_PATH")]
    config_path: PathBuf,

    /// Address to serve Prometheus metrics on, e.g. 127.0.0.1:9100.
    #[clap(long, env = "CLOUDTIK_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Seconds between reconciliation ticks.
    #[clap(long, env = "CLOUDTIK_UPDATE_INTERVAL_S", default_value_t = 5)]
    update_interval_s: u64,

    /// Consecutive failing ticks tolerated before exiting.
    #[clap(long, env = "CLOUDTIK_MAX_FAILURES", default_value_t = 5)]
    max_failures: u32,

    /// Ensure a head node exists and is bootstrapped before looping.
    #[clap(long, env = "CLOUDTIK_BOOTSTRAP_HEAD")]
    bootstrap_head: bool,
}

async fn run(opts: ScalerNodeOpts) -> ScaleResult<()> {
    let config = ClusterConfig::from_yaml_file(&opts.config_path)?;
    let prepared = Arc::new(prepare_cluster_config(config)?);
    tracing::info!(
        cluster = prepared.cluster_name(),
        "starting cluster scaler"
    );

    let provider = ProviderRegistry::global()
        .resolve(&prepared.config().provider, prepared.cluster_name())?;
    let metrics = Arc::new(ScalerMetrics::new(prometheus::Registry::new()));
    if let Some(addr) = &opts.metrics_addr {
        boot_metrics_service(addr.clone(), metrics.registry.clone());
    }

    let mut scaler = ClusterScaler::new(
        prepared,
        provider,
        Arc::new(ExecProcessRunner),
        Arc::new(ClusterMetrics::new()),
        metrics,
        ClusterScalerOpts {
            update_interval: Duration::from_secs(opts.update_interval_s),
            max_failures: opts.max_failures,
            ..Default::default()
        },
    );

    if opts.bootstrap_head {
        let head_id = scaler.create_or_update_head_node().await?;
        tracing::info!(%head_id, "head node is ready");
    }

    let (join_handle, shutdown_tx) = start_cluster_scaler(scaler);
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ScaleError::Internal(e.into()))?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(());
    join_handle
        .await
        .map_err(|e| ScaleError::Internal(e.into()))?
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = ScalerNodeOpts::parse();
    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("cluster scaler exited with error: {}", err);
            ExitCode::FAILURE
        }
    }
}
