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

//! The cluster scaler: a periodically ticking controller reconciling the
//! configured cluster shape against the live node set.
//!
//! Each tick takes exactly one provider snapshot, decides terminations and
//! launches from it, and spawns node updaters for anything not yet
//! bootstrapped. Transient provider failures are absorbed at the tick
//! boundary and retried on the next tick.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cloudtik_common::tags::{
    NodeKind, NodeStatus, CLOUDTIK_HEAD_NODE_NUMBER, CLOUDTIK_TAG_CLUSTER_NAME,
    CLOUDTIK_TAG_LAUNCH_CONFIG, CLOUDTIK_TAG_NODE_KIND, CLOUDTIK_TAG_NODE_NAME,
    CLOUDTIK_TAG_NODE_NUMBER, CLOUDTIK_TAG_NODE_STATUS, CLOUDTIK_TAG_RUNTIME_CONFIG,
    CLOUDTIK_TAG_USER_NODE_TYPE,
};
use cloudtik_common::types::NodeId;
use itertools::Itertools;
use tokio::sync::oneshot::Sender;
use tokio::task::JoinHandle;

use crate::config::PreparedConfig;
use crate::demand::{DemandStrategy, SmallestFitDemand};
use crate::error::{ScaleError, ScaleResult};
use crate::heartbeat::ClusterMetrics;
use crate::monitor::ScalerMetrics;
use crate::provider::{NodeProvider, ProviderError};
use crate::runner::ProcessRunner;
use crate::updater::{rsync_argv, NodeUpdater, NodeUpdaterOpts};

/// Where the head node keeps the config any head-executed management
/// command reads.
pub const CLOUDTIK_BOOTSTRAP_CONFIG_PATH: &str = "~/cloudtik_bootstrap_config.yaml";
pub const CLOUDTIK_BOOTSTRAP_KEY_PATH: &str = "~/cloudtik_bootstrap_key.pem";

/// Consecutive ticks a multiple-head violation may persist before the
/// scaler gives up normalizing and surfaces it.
const HEAD_VIOLATION_ESCALATE_TICKS: u32 = 3;

#[derive(Clone, Debug)]
pub struct ClusterScalerOpts {
    /// Throttle between effective ticks; `update()` calls inside the
    /// interval are no-ops.
    pub update_interval: Duration,
    /// Consecutive failing ticks tolerated before the scaler aborts.
    pub max_failures: u32,
    /// Cap on node updaters in flight at once.
    pub max_concurrent_launches: usize,
    /// Soft deadline for a tick; exceeding it only logs.
    pub tick_soft_deadline: Duration,
    /// Bounded wait for a freshly launched head to become visible.
    pub head_visible_timeout: Duration,
    pub updater: NodeUpdaterOpts,
}

impl Default for ClusterScalerOpts {
    fn default() -> Self {
        ClusterScalerOpts {
            update_interval: Duration::from_secs(5),
            max_failures: 5,
            max_concurrent_launches: 10,
            tick_soft_deadline: Duration::from_secs(30),
            head_visible_timeout: Duration::from_secs(60),
            updater: NodeUpdaterOpts::default(),
        }
    }
}

/// One node as seen in the tick's provider snapshot.
struct NodeSnapshot {
    node_id: NodeId,
    ip: Option<String>,
    tags: HashMap<String, String>,
}

impl NodeSnapshot {
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }

    fn kind(&self) -> Option<NodeKind> {
        self.tag(CLOUDTIK_TAG_NODE_KIND)
            .and_then(|s| NodeKind::from_str(s).ok())
    }

    fn status(&self) -> Option<NodeStatus> {
        self.tag(CLOUDTIK_TAG_NODE_STATUS)
            .and_then(|s| NodeStatus::from_str(s).ok())
    }

    fn node_type(&self) -> Option<&str> {
        self.tag(CLOUDTIK_TAG_USER_NODE_TYPE)
    }

    fn node_number(&self) -> Option<u64> {
        self.tag(CLOUDTIK_TAG_NODE_NUMBER).and_then(|s| s.parse().ok())
    }
}

pub struct ClusterScaler {
    prepared: Arc<PreparedConfig>,
    provider: Arc<dyn NodeProvider>,
    runner: Arc<dyn ProcessRunner>,
    cluster_metrics: Arc<ClusterMetrics>,
    metrics: Arc<ScalerMetrics>,
    demand: Box<dyn DemandStrategy>,
    opts: ClusterScalerOpts,

    updaters: HashMap<NodeId, JoinHandle<ScaleResult<()>>>,
    shutdown: Arc<AtomicBool>,
    next_node_number: u64,
    consecutive_failures: u32,
    head_violation_ticks: u32,
    last_update_at: Option<Instant>,
}

impl ClusterScaler {
    pub fn new(
        prepared: Arc<PreparedConfig>,
        provider: Arc<dyn NodeProvider>,
        runner: Arc<dyn ProcessRunner>,
        cluster_metrics: Arc<ClusterMetrics>,
        metrics: Arc<ScalerMetrics>,
        opts: ClusterScalerOpts,
    ) -> Self {
        ClusterScaler {
            prepared,
            provider,
            runner,
            cluster_metrics,
            metrics,
            demand: Box::new(SmallestFitDemand),
            opts,
            updaters: HashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            next_node_number: CLOUDTIK_HEAD_NODE_NUMBER + 1,
            consecutive_failures: 0,
            head_violation_ticks: 0,
            last_update_at: None,
        }
    }

    pub fn with_demand_strategy(mut self, strategy: Box<dyn DemandStrategy>) -> Self {
        self.demand = strategy;
        self
    }

    /// Flag observed by in-flight updaters: once set they finish their
    /// current remote command and exit voluntarily.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> &ScalerMetrics {
        &self.metrics
    }

    /// One reconciliation tick, throttled by `update_interval`.
    ///
    /// Recoverable errors are absorbed and counted; the error is returned
    /// only when fatal or after more than `max_failures` consecutive
    /// failing ticks.
    pub async fn update(&mut self) -> ScaleResult<()> {
        if let Some(last) = self.last_update_at {
            if last.elapsed() < self.opts.update_interval {
                return Ok(());
            }
        }
        self.last_update_at = Some(Instant::now());
        match self.update_inner().await {
            Ok(()) => {
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                self.metrics.update_loop_failures.inc();
                self.consecutive_failures += 1;
                tracing::warn!(
                    consecutive = self.consecutive_failures,
                    "scaler tick failed: {}",
                    err
                );
                if self.consecutive_failures > self.opts.max_failures {
                    tracing::error!("too many consecutive scaler failures, aborting");
                    Err(err)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn update_inner(&mut self) -> ScaleResult<()> {
        let tick_started = Instant::now();
        let prepared = self.prepared.clone();
        self.updaters.retain(|_, handle| !handle.is_finished());

        let nodes = self.snapshot().await?;

        // Nodes the heartbeat tracker has never seen are alive by the
        // provider's word; stamp them so the idle clock starts now, not at
        // epoch zero.
        for node in &nodes {
            if let Some(ip) = &node.ip {
                if !self.cluster_metrics.is_tracked(ip) {
                    self.cluster_metrics.mark_active(ip);
                }
            }
        }

        let mut to_terminate: Vec<NodeId> = self.normalize_heads(&nodes)?;

        let idle_timeout = prepared.idle_timeout_secs();
        let summary = self.cluster_metrics.summary();
        let required = self.demand.required_workers(&prepared, &summary);

        let workers: Vec<&NodeSnapshot> = nodes
            .iter()
            .filter(|n| n.kind() == Some(NodeKind::Worker))
            .collect();

        // Workers of a type the config no longer knows cannot be matched
        // against any launch hash; normalize by terminating them.
        for worker in &workers {
            let known = worker
                .node_type()
                .map_or(false, |t| prepared.node_type(t).is_some());
            if !known {
                tracing::error!(
                    node_id = %worker.node_id,
                    node_type = worker.node_type().unwrap_or("<missing>"),
                    "worker carries an unknown node type tag, terminating"
                );
                to_terminate.push(worker.node_id.clone());
            }
        }

        let mut launches: Vec<(String, u32)> = Vec::new();
        let global_max = prepared.config().max_workers;
        let mut total_desired = 0u32;

        for (type_name, type_config) in prepared.worker_types() {
            let current_hash = prepared.launch_hash(type_name).unwrap_or_default();
            let (current, obsolete): (Vec<&NodeSnapshot>, Vec<&NodeSnapshot>) = workers
                .iter()
                .copied()
                .filter(|n| n.node_type() == Some(type_name.as_str()))
                .partition(|n| n.tag(CLOUDTIK_TAG_LAUNCH_CONFIG) == Some(current_hash));
            for node in &obsolete {
                tracing::info!(
                    node_id = %node.node_id,
                    node_type = %type_name,
                    "launch config hash is stale, node will be relaunched"
                );
                to_terminate.push(node.node_id.clone());
            }

            let is_idle = |node: &&NodeSnapshot| {
                node.ip
                    .as_deref()
                    .map_or(false, |ip| !self.cluster_metrics.is_active(ip, idle_timeout))
            };
            let idle_count = current.iter().filter(|n| is_idle(n)).count();
            let active_count = (current.len() - idle_count) as u32;

            let min = type_config.min_workers.unwrap_or(0);
            let max = type_config.max_workers.unwrap_or(global_max);
            let target = active_count + required.get(type_name).copied().unwrap_or(0);
            let desired = target
                .clamp(min.min(max), max)
                .min(global_max.saturating_sub(total_desired));
            total_desired += desired;

            // Prefer keeping busy, finished, low-numbered nodes.
            let mut survivors = current;
            survivors.sort_by_key(|n| {
                (
                    is_idle(n),
                    n.status() != Some(NodeStatus::UpToDate),
                    n.node_number().unwrap_or(u64::MAX),
                )
            });
            for node in survivors.iter().skip(desired as usize) {
                tracing::info!(
                    node_id = %node.node_id,
                    node_type = %type_name,
                    "terminating excess or idle worker"
                );
                to_terminate.push(node.node_id.clone());
            }
            let kept = survivors.len().min(desired as usize) as u32;
            if desired > kept {
                launches.push((type_name.clone(), desired - kept));
            }
        }

        let terminated: HashSet<NodeId> = to_terminate.iter().cloned().collect();
        self.terminate(to_terminate).await?;
        self.launch(&launches).await?;

        if tick_started.elapsed() > self.opts.tick_soft_deadline {
            tracing::warn!(
                elapsed_ms = tick_started.elapsed().as_millis() as u64,
                "scaler tick exceeded its soft deadline"
            );
        }

        self.spawn_updaters(&nodes, &terminated);
        self.publish(&nodes, &terminated);

        let active_ips: HashSet<String> = nodes
            .iter()
            .filter(|n| !terminated.contains(&n.node_id))
            .filter_map(|n| n.ip.clone())
            .collect();
        self.cluster_metrics.prune(&active_ips);
        Ok(())
    }

    /// The tick's single `non_terminated_nodes` call, plus per-node tag and
    /// IP lookups. Nodes that disappear mid-snapshot are dropped.
    async fn snapshot(&mut self) -> ScaleResult<Vec<NodeSnapshot>> {
        let filter = HashMap::from([(
            CLOUDTIK_TAG_CLUSTER_NAME.to_string(),
            self.prepared.cluster_name().to_string(),
        )]);
        let ids = self.provider.non_terminated_nodes(&filter).await?;
        let mut nodes = Vec::with_capacity(ids.len());
        for node_id in ids {
            let tags = match self.provider.node_tags(&node_id).await {
                Ok(tags) => tags,
                Err(ProviderError::NodeGone(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            let ip = self
                .provider
                .internal_ip(&node_id)
                .await
                .ok()
                .filter(|ip| !ip.is_empty());
            let node = NodeSnapshot { node_id, ip, tags };
            if let Some(number) = node.node_number() {
                self.next_node_number = self.next_node_number.max(number + 1);
            }
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Enforces the zero-or-one-head invariant: keeps the best head and
    /// terminates the rest, escalating if the violation persists.
    fn normalize_heads(&mut self, nodes: &[NodeSnapshot]) -> ScaleResult<Vec<NodeId>> {
        let mut heads: Vec<&NodeSnapshot> = nodes
            .iter()
            .filter(|n| n.kind() == Some(NodeKind::Head))
            .collect();
        if heads.len() <= 1 {
            self.head_violation_ticks = 0;
            return Ok(Vec::new());
        }
        self.head_violation_ticks += 1;
        if self.head_violation_ticks > HEAD_VIOLATION_ESCALATE_TICKS {
            return Err(ScaleError::InvariantViolation(format!(
                "{} head nodes present after {} normalization attempts",
                heads.len(),
                self.head_violation_ticks - 1
            )));
        }
        tracing::error!(
            head_count = heads.len(),
            "multiple head nodes present, terminating extras"
        );
        heads.sort_by_key(|n| {
            (
                n.status() != Some(NodeStatus::UpToDate),
                n.node_number().unwrap_or(u64::MAX),
            )
        });
        Ok(heads[1..].iter().map(|n| n.node_id.clone()).collect())
    }

    async fn terminate(&mut self, to_terminate: Vec<NodeId>) -> ScaleResult<()> {
        if to_terminate.is_empty() {
            self.metrics.stopped_workers.set(0);
            return Ok(());
        }
        let cache_stopped = self
            .prepared
            .config()
            .provider
            .get("cache_stopped_nodes")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let count = to_terminate.len();
        match self.provider.terminate_nodes(to_terminate).await {
            Ok(()) => {}
            Err(ProviderError::NodeGone(node_id)) => {
                tracing::warn!(%node_id, "node disappeared while draining");
                self.metrics.drain_node_exceptions.inc();
            }
            Err(err) => return Err(err.into()),
        }
        self.metrics
            .stopped_workers
            .set(if cache_stopped { count as i64 } else { 0 });
        Ok(())
    }

    async fn launch(&mut self, launches: &[(String, u32)]) -> ScaleResult<()> {
        for (type_name, count) in launches {
            let node_type = self
                .prepared
                .node_type(type_name)
                .expect("launch targets only known node types");
            let launch_hash = self
                .prepared
                .launch_hash(type_name)
                .unwrap_or_default()
                .to_string();
            tracing::info!(node_type = %type_name, count, "launching workers");
            let timer = self.metrics.worker_create_node_time.start_timer();
            for _ in 0..*count {
                let number = self.next_node_number;
                self.next_node_number += 1;
                let tags = HashMap::from([
                    (
                        CLOUDTIK_TAG_CLUSTER_NAME.to_string(),
                        self.prepared.cluster_name().to_string(),
                    ),
                    (
                        CLOUDTIK_TAG_NODE_KIND.to_string(),
                        NodeKind::Worker.as_str().to_string(),
                    ),
                    (CLOUDTIK_TAG_USER_NODE_TYPE.to_string(), type_name.clone()),
                    (
                        CLOUDTIK_TAG_NODE_STATUS.to_string(),
                        NodeStatus::Uninitialized.as_str().to_string(),
                    ),
                    (CLOUDTIK_TAG_LAUNCH_CONFIG.to_string(), launch_hash.clone()),
                    (
                        CLOUDTIK_TAG_NODE_NAME.to_string(),
                        format!(
                            "cloudtik-{}-worker-{}",
                            self.prepared.cluster_name(),
                            number
                        ),
                    ),
                    (CLOUDTIK_TAG_NODE_NUMBER.to_string(), number.to_string()),
                ]);
                self.provider
                    .create_node(&node_type.node_config, tags, 1)
                    .await?;
                self.metrics.started_nodes.inc();
            }
            timer.observe_duration();
        }
        Ok(())
    }

    /// Spawns updaters for nodes that need one: fresh workers, workers
    /// stuck in a non-terminal status, and up-to-date workers whose runtime
    /// hash went stale. Capped by `max_concurrent_launches`.
    fn spawn_updaters(&mut self, nodes: &[NodeSnapshot], terminated: &HashSet<NodeId>) {
        let mut budget = self
            .opts
            .max_concurrent_launches
            .saturating_sub(self.updaters.len());
        for node in nodes {
            if budget == 0 {
                break;
            }
            if terminated.contains(&node.node_id)
                || node.kind() != Some(NodeKind::Worker)
                || self.updaters.contains_key(&node.node_id)
            {
                continue;
            }
            let needs_update = match node.status() {
                Some(NodeStatus::UpdateFailed) => false,
                Some(NodeStatus::UpToDate) => {
                    node.tag(CLOUDTIK_TAG_RUNTIME_CONFIG) != Some(self.prepared.runtime_hash())
                }
                _ => true,
            };
            if !needs_update {
                continue;
            }
            let updater = NodeUpdater::new(
                node.node_id.clone(),
                NodeKind::Worker,
                self.prepared.clone(),
                self.provider.clone(),
                self.runner.clone(),
                self.shutdown.clone(),
                self.opts.updater.clone(),
            );
            let metrics = self.metrics.clone();
            let handle = tokio::spawn(async move {
                let timer = metrics.update_time.start_timer();
                let result = updater.run().await;
                timer.observe_duration();
                if result.is_err() {
                    metrics.failed_updates.inc();
                }
                result
            });
            self.updaters.insert(node.node_id.clone(), handle);
            budget -= 1;
        }
    }

    fn publish(&self, nodes: &[NodeSnapshot], terminated: &HashSet<NodeId>) {
        let live_workers: Vec<&NodeSnapshot> = nodes
            .iter()
            .filter(|n| n.kind() == Some(NodeKind::Worker) && !terminated.contains(&n.node_id))
            .collect();
        let running = live_workers
            .iter()
            .filter(|n| n.status() == Some(NodeStatus::UpToDate))
            .count();
        let pending = live_workers
            .iter()
            .filter(|n| !n.status().map_or(false, |s| s.is_terminal()))
            .count();
        self.metrics.running_workers.set(running as i64);
        self.metrics.pending_workers.set(pending as i64);
    }

    /// One-shot path executed before the control loop: makes sure a head
    /// node exists, bootstraps it, and persists the bootstrap config and
    /// key onto it.
    pub async fn create_or_update_head_node(&mut self) -> ScaleResult<NodeId> {
        let filter = head_filter(self.prepared.cluster_name());
        let existing = self.provider.non_terminated_nodes(&filter).await?;
        let head_id = match existing.into_iter().sorted().next() {
            Some(id) => id,
            None => {
                self.launch_head_node().await?;
                self.wait_for_head_node(&filter).await?
            }
        };

        let updater = NodeUpdater::new(
            head_id.clone(),
            NodeKind::Head,
            self.prepared.clone(),
            self.provider.clone(),
            self.runner.clone(),
            self.shutdown.clone(),
            self.opts.updater.clone(),
        );
        updater.run().await?;

        self.write_bootstrap_files(&head_id).await?;
        Ok(head_id)
    }

    async fn launch_head_node(&mut self) -> ScaleResult<()> {
        let head_type_name = self.prepared.head_node_type().to_string();
        let head_type = self
            .prepared
            .node_type(&head_type_name)
            .ok_or_else(|| ScaleError::Config("head node type is not configured".to_string()))?;
        let launch_hash = self
            .prepared
            .launch_hash(&head_type_name)
            .unwrap_or_default()
            .to_string();
        let tags = HashMap::from([
            (
                CLOUDTIK_TAG_CLUSTER_NAME.to_string(),
                self.prepared.cluster_name().to_string(),
            ),
            (
                CLOUDTIK_TAG_NODE_KIND.to_string(),
                NodeKind::Head.as_str().to_string(),
            ),
            (CLOUDTIK_TAG_USER_NODE_TYPE.to_string(), head_type_name),
            (
                CLOUDTIK_TAG_NODE_STATUS.to_string(),
                NodeStatus::Uninitialized.as_str().to_string(),
            ),
            (CLOUDTIK_TAG_LAUNCH_CONFIG.to_string(), launch_hash),
            (
                CLOUDTIK_TAG_NODE_NAME.to_string(),
                format!("cloudtik-{}-head", self.prepared.cluster_name()),
            ),
            (
                CLOUDTIK_TAG_NODE_NUMBER.to_string(),
                CLOUDTIK_HEAD_NODE_NUMBER.to_string(),
            ),
        ]);
        tracing::info!("launching head node");
        self.provider
            .create_node(&head_type.node_config, tags, 1)
            .await?;
        self.metrics.started_nodes.inc();
        Ok(())
    }

    /// `create_node` may be asynchronous; poll until the head shows up.
    async fn wait_for_head_node(&self, filter: &HashMap<String, String>) -> ScaleResult<NodeId> {
        let deadline = Instant::now() + self.opts.head_visible_timeout;
        loop {
            let ids = self.provider.non_terminated_nodes(filter).await?;
            if let Some(id) = ids.into_iter().sorted().next() {
                return Ok(id);
            }
            if Instant::now() >= deadline {
                return Err(ScaleError::InvariantViolation(
                    "head node did not become visible after launch".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn write_bootstrap_files(&self, head_id: &str) -> ScaleResult<()> {
        let ip = self.provider.internal_ip(head_id).await?;
        let auth = &self.prepared.config().auth;

        let local_config = std::env::temp_dir().join(format!(
            "cloudtik-{}-bootstrap.yaml",
            self.prepared.cluster_name()
        ));
        std::fs::write(&local_config, self.prepared.to_yaml()?)
            .map_err(|e| anyhow::anyhow!("failed to stage bootstrap config: {}", e))?;
        self.runner
            .check_call(&rsync_argv(
                auth,
                &ip,
                &local_config.to_string_lossy(),
                CLOUDTIK_BOOTSTRAP_CONFIG_PATH,
            ))
            .await?;

        if let Some(key) = &auth.ssh_private_key {
            self.runner
                .check_call(&rsync_argv(auth, &ip, key, CLOUDTIK_BOOTSTRAP_KEY_PATH))
                .await?;
        }
        Ok(())
    }
}

fn head_filter(cluster_name: &str) -> HashMap<String, String> {
    HashMap::from([
        (
            CLOUDTIK_TAG_CLUSTER_NAME.to_string(),
            cluster_name.to_string(),
        ),
        (
            CLOUDTIK_TAG_NODE_KIND.to_string(),
            NodeKind::Head.as_str().to_string(),
        ),
    ])
}

/// The head node any head-executed management command should talk to.
///
/// Prefers an `up-to-date` head; with `allow_uninitialized` a head in any
/// other state (e.g. `update-failed`) is returned when no healthy one
/// exists.
pub async fn get_running_head_node(
    prepared: &PreparedConfig,
    provider: &dyn NodeProvider,
    allow_uninitialized: bool,
) -> ScaleResult<Option<NodeId>> {
    let filter = head_filter(prepared.cluster_name());
    let mut fallback = None;
    for node_id in provider.non_terminated_nodes(&filter).await?.into_iter().sorted() {
        let tags = match provider.node_tags(&node_id).await {
            Ok(tags) => tags,
            Err(ProviderError::NodeGone(_)) => continue,
            Err(err) => return Err(err.into()),
        };
        if tags.get(CLOUDTIK_TAG_NODE_STATUS).map(|s| s.as_str())
            == Some(NodeStatus::UpToDate.as_str())
        {
            return Ok(Some(node_id));
        }
        if fallback.is_none() {
            fallback = Some(node_id);
        }
    }
    Ok(if allow_uninitialized { fallback } else { None })
}

/// Runs the scaler on its own task, ticking every `update_interval` until
/// shut down or a fatal error. The returned sender stops the loop; the
/// join handle yields the loop's outcome.
pub fn start_cluster_scaler(
    mut scaler: ClusterScaler,
) -> (JoinHandle<ScaleResult<()>>, Sender<()>) {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
    let period = scaler.opts.update_interval.max(Duration::from_millis(100));
    let join_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown_rx => {
                    tracing::info!("Cluster scaler is stopped");
                    scaler.shutdown.store(true, Ordering::SeqCst);
                    return Ok(());
                }
            }
            if let Err(err) = scaler.update().await {
                tracing::error!("cluster scaler aborted: {}", err);
                scaler.shutdown.store(true, Ordering::SeqCst);
                return Err(err);
            }
        }
    });
    (join_handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use cloudtik_common::config::ClusterConfig;
    use serde_json::json;

    use super::*;
    use crate::config::prepare_cluster_config;
    use crate::provider::MockProvider;
    use crate::runner::MockProcessRunner;

    fn prepared(yaml: &str) -> Arc<PreparedConfig> {
        Arc::new(prepare_cluster_config(ClusterConfig::from_yaml_str(yaml).unwrap()).unwrap())
    }

    fn small_cluster() -> Arc<PreparedConfig> {
        prepared(
            r#"
cluster_name: default
min_workers: 2
max_workers: 2
idle_timeout_minutes: 5
provider:
    type: mock
setup_commands: ["setup_cmd"]
worker_start_commands: ["worker_start_cmd"]
"#,
        )
    }

    fn scaler_for(
        prepared: Arc<PreparedConfig>,
        provider: Arc<MockProvider>,
        runner: Arc<MockProcessRunner>,
    ) -> ClusterScaler {
        ClusterScaler::new(
            prepared,
            provider,
            runner,
            Arc::new(ClusterMetrics::new()),
            Arc::new(ScalerMetrics::for_test()),
            ClusterScalerOpts {
                update_interval: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_each_tick_takes_one_snapshot() {
        let provider = Arc::new(MockProvider::new(false));
        let runner = Arc::new(MockProcessRunner::new());
        let mut scaler = scaler_for(small_cluster(), provider.clone(), runner);

        scaler.update().await.unwrap();
        assert_eq!(provider.non_terminated_nodes_call_count(), 1);
        scaler.update().await.unwrap();
        assert_eq!(provider.non_terminated_nodes_call_count(), 2);
    }

    #[tokio::test]
    async fn test_update_is_throttled_within_interval() {
        let provider = Arc::new(MockProvider::new(false));
        let runner = Arc::new(MockProcessRunner::new());
        let mut scaler = scaler_for(small_cluster(), provider.clone(), runner);
        scaler.opts.update_interval = Duration::from_secs(3600);

        scaler.update().await.unwrap();
        scaler.update().await.unwrap();
        scaler.update().await.unwrap();
        assert_eq!(provider.non_terminated_nodes_call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_provider_failure_is_absorbed() {
        let provider = Arc::new(MockProvider::new(false));
        let runner = Arc::new(MockProcessRunner::new());
        let mut scaler = scaler_for(small_cluster(), provider.clone(), runner);
        scaler.opts.max_failures = 2;

        provider.set_throw(true);
        scaler.update().await.unwrap();
        assert_eq!(scaler.metrics.update_loop_failures.get(), 1);

        // The next healthy tick resets the failure streak.
        provider.set_throw(false);
        scaler.update().await.unwrap();
        assert_eq!(scaler.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_exceeding_max_failures_surfaces_the_error() {
        let provider = Arc::new(MockProvider::new(false));
        let runner = Arc::new(MockProcessRunner::new());
        let mut scaler = scaler_for(small_cluster(), provider.clone(), runner);
        scaler.opts.max_failures = 1;

        provider.set_throw(true);
        scaler.update().await.unwrap();
        assert!(scaler.update().await.is_err());
    }

    #[tokio::test]
    async fn test_get_running_head_node_prefers_up_to_date() {
        let prepared = small_cluster();
        let provider = Arc::new(MockProvider::new(false));

        provider
            .create_node(
                &json!({}),
                HashMap::from([
                    (
                        CLOUDTIK_TAG_CLUSTER_NAME.to_string(),
                        "default".to_string(),
                    ),
                    (CLOUDTIK_TAG_NODE_KIND.to_string(), "head".to_string()),
                    (
                        CLOUDTIK_TAG_NODE_STATUS.to_string(),
                        "update-failed".to_string(),
                    ),
                ]),
                1,
            )
            .await
            .unwrap();

        // Only the failed head exists: found only when uninitialized
        // state is allowed.
        assert_eq!(
            get_running_head_node(&prepared, provider.as_ref(), false)
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            get_running_head_node(&prepared, provider.as_ref(), true)
                .await
                .unwrap(),
            Some("0".to_string())
        );

        provider
            .create_node(
                &json!({}),
                HashMap::from([
                    (
                        CLOUDTIK_TAG_CLUSTER_NAME.to_string(),
                        "default".to_string(),
                    ),
                    (CLOUDTIK_TAG_NODE_KIND.to_string(), "head".to_string()),
                    (
                        CLOUDTIK_TAG_NODE_STATUS.to_string(),
                        "up-to-date".to_string(),
                    ),
                ]),
                1,
            )
            .await
            .unwrap();

        assert_eq!(
            get_running_head_node(&prepared, provider.as_ref(), false)
                .await
                .unwrap(),
            Some("1".to_string())
        );
        assert_eq!(
            get_running_head_node(&prepared, provider.as_ref(), true)
                .await
                .unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn test_head_bootstrap_writes_config_files() {
        let prepared = small_cluster();
        let provider = Arc::new(MockProvider::new(false));
        let runner = Arc::new(MockProcessRunner::new());
        let mut scaler = scaler_for(prepared, provider.clone(), runner.clone());

        let head_id = scaler.create_or_update_head_node().await.unwrap();
        provider.finish_starting_nodes();
        let tags = provider.node_tags(&head_id).await.unwrap();
        assert_eq!(tags[CLOUDTIK_TAG_NODE_KIND], "head");
        assert_eq!(
            tags[CLOUDTIK_TAG_NODE_NUMBER],
            CLOUDTIK_HEAD_NODE_NUMBER.to_string()
        );
        assert_eq!(tags[CLOUDTIK_TAG_NODE_STATUS], "up-to-date");
        assert!(runner.has_call("172.0.0.0", CLOUDTIK_BOOTSTRAP_CONFIG_PATH));
    }
}
