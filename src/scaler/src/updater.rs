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

//! The per-node bootstrap pipeline.
//!
//! An updater drives one freshly launched (or re-provisioned) node through
//! waiting-for-ssh, syncing-files, setting-up and starting. Completion
//! markers (the file-mounts tag, the runtime hash, `up-to-date`) are only
//! written after the corresponding work succeeded, so a crashed updater can
//! never leave a node looking newer than it is.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cloudtik_common::config::{AuthConfig, DockerConfig};
use cloudtik_common::tags::{
    NodeKind, NodeStatus, CLOUDTIK_TAG_FILE_MOUNTS_CONTENTS, CLOUDTIK_TAG_NODE_STATUS,
    CLOUDTIK_TAG_RUNTIME_CONFIG,
};
use cloudtik_common::types::NodeId;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::Instrument;

use crate::config::PreparedConfig;
use crate::error::{ScaleError, ScaleResult};
use crate::provider::{NodeProvider, ProviderError};
use crate::runner::ProcessRunner;

#[derive(Clone, Debug)]
pub struct NodeUpdaterOpts {
    /// Wall-clock deadline for the node to become reachable over ssh.
    pub ssh_ready_deadline: Duration,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay: Duration,
}

impl Default for NodeUpdaterOpts {
    fn default() -> Self {
        NodeUpdaterOpts {
            ssh_ready_deadline: Duration::from_secs(120),
            retry_base_delay_ms: 20,
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

pub struct NodeUpdater {
    node_id: NodeId,
    kind: NodeKind,
    prepared: Arc<PreparedConfig>,
    provider: Arc<dyn NodeProvider>,
    runner: Arc<dyn ProcessRunner>,
    shutdown: Arc<AtomicBool>,
    opts: NodeUpdaterOpts,
}

impl NodeUpdater {
    pub fn new(
        node_id: NodeId,
        kind: NodeKind,
        prepared: Arc<PreparedConfig>,
        provider: Arc<dyn NodeProvider>,
        runner: Arc<dyn ProcessRunner>,
        shutdown: Arc<AtomicBool>,
        opts: NodeUpdaterOpts,
    ) -> Self {
        NodeUpdater {
            node_id,
            kind,
            prepared,
            provider,
            runner,
            shutdown,
            opts,
        }
    }

    /// Runs the pipeline to completion. On any stage failure the node is
    /// tagged `update-failed` and the error is returned; a shutdown request
    /// exits cleanly after the current remote command.
    pub async fn run(self) -> ScaleResult<()> {
        let span = tracing::info_span!("node_update", node_id = %self.node_id, kind = %self.kind);
        async {
            match self.run_inner().await {
                Ok(()) => Ok(()),
                Err(err) => {
                    tracing::warn!("node update failed: {}", err);
                    // Best effort: the node may already be gone.
                    let _ = self.set_status(NodeStatus::UpdateFailed).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_inner(&self) -> ScaleResult<()> {
        let tags = self.provider.node_tags(&self.node_id).await?;
        if tags.get(CLOUDTIK_TAG_NODE_STATUS).map(|s| s.as_str())
            == Some(NodeStatus::UpToDate.as_str())
            && tags.get(CLOUDTIK_TAG_RUNTIME_CONFIG).map(|s| s.as_str())
                == Some(self.prepared.runtime_hash())
        {
            tracing::info!("node already up to date, nothing to do");
            return Ok(());
        }

        self.set_status(NodeStatus::WaitingForSsh).await?;
        let ip = match self.wait_ready().await? {
            Some(ip) => ip,
            None => return Ok(()),
        };

        self.sync_files(&ip, &tags).await?;
        if self.shutdown_requested() {
            return Ok(());
        }

        self.set_status(NodeStatus::SettingUp).await?;
        let mut setup = self.prepared.initialization_commands().to_vec();
        setup.extend(self.prepared.setup_commands(self.kind));
        self.run_commands(&ip, &setup).await?;
        if self.shutdown_requested() {
            return Ok(());
        }

        self.run_commands(&ip, self.prepared.start_commands(self.kind))
            .await?;

        self.provider
            .set_node_tags(
                &self.node_id,
                HashMap::from([
                    (
                        CLOUDTIK_TAG_NODE_STATUS.to_string(),
                        NodeStatus::UpToDate.as_str().to_string(),
                    ),
                    (
                        CLOUDTIK_TAG_RUNTIME_CONFIG.to_string(),
                        self.prepared.runtime_hash().to_string(),
                    ),
                ]),
            )
            .await?;
        tracing::info!("node update finished");
        Ok(())
    }

    /// Polls the provider for the node's IP and probes it with a trivial
    /// remote command, backing off exponentially until the deadline.
    /// Returns `None` when shutdown was requested while waiting.
    async fn wait_ready(&self) -> ScaleResult<Option<String>> {
        let deadline = Instant::now() + self.opts.ssh_ready_deadline;
        let mut backoff = ExponentialBackoff::from_millis(self.opts.retry_base_delay_ms)
            .max_delay(self.opts.retry_max_delay)
            .map(jitter);
        loop {
            if self.shutdown_requested() {
                return Ok(None);
            }
            match self.probe().await {
                Ok(ip) => return Ok(Some(ip)),
                // No point waiting out the deadline on a terminated node.
                Err(err @ ScaleError::Provider(ProviderError::NodeGone(_))) => return Err(err),
                Err(err) => {
                    if Instant::now() >= deadline {
                        tracing::warn!("node never became reachable: {}", err);
                        return Err(ScaleError::UpdaterTimeout(self.node_id.clone()));
                    }
                    tracing::debug!("node not reachable yet: {}", err);
                }
            }
            let delay = backoff.next().expect("backoff iterator is infinite");
            tokio::time::sleep(delay).await;
        }
    }

    async fn probe(&self) -> ScaleResult<String> {
        let ip = self.provider.internal_ip(&self.node_id).await?;
        if ip.is_empty() {
            return Err(ScaleError::Internal(anyhow::anyhow!(
                "node has no internal ip yet"
            )));
        }
        self.runner.check_call(&self.ssh_argv(&ip, "uptime")).await?;
        Ok(ip)
    }

    async fn sync_files(&self, ip: &str, tags: &HashMap<String, String>) -> ScaleResult<()> {
        if tags.get(CLOUDTIK_TAG_FILE_MOUNTS_CONTENTS).map(|s| s.as_str())
            == Some(self.prepared.file_mounts_hash())
        {
            tracing::info!("file mounts unchanged, skipping sync");
            return Ok(());
        }
        self.set_status(NodeStatus::SyncingFiles).await?;
        for (destination, source) in &self.prepared.config().file_mounts {
            self.runner
                .check_call(&self.rsync_argv(ip, source, destination))
                .await?;
            if self.shutdown_requested() {
                return Ok(());
            }
        }
        for path in &self.prepared.config().cluster_synced_files {
            self.runner
                .check_call(&self.rsync_argv(ip, path, path))
                .await?;
            if self.shutdown_requested() {
                return Ok(());
            }
        }
        self.provider
            .set_node_tags(
                &self.node_id,
                HashMap::from([(
                    CLOUDTIK_TAG_FILE_MOUNTS_CONTENTS.to_string(),
                    self.prepared.file_mounts_hash().to_string(),
                )]),
            )
            .await?;
        Ok(())
    }

    async fn run_commands(&self, ip: &str, commands: &[String]) -> ScaleResult<()> {
        for command in commands {
            if self.shutdown_requested() {
                return Ok(());
            }
            self.runner.check_call(&self.ssh_argv(ip, command)).await?;
        }
        Ok(())
    }

    async fn set_status(&self, status: NodeStatus) -> ScaleResult<()> {
        self.provider
            .set_node_tags(
                &self.node_id,
                HashMap::from([(
                    CLOUDTIK_TAG_NODE_STATUS.to_string(),
                    status.as_str().to_string(),
                )]),
            )
            .await?;
        Ok(())
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn ssh_argv(&self, ip: &str, command: &str) -> Vec<String> {
        ssh_argv(
            &self.prepared.config().auth,
            &self.prepared.config().docker,
            ip,
            command,
        )
    }

    fn rsync_argv(&self, ip: &str, source: &str, destination: &str) -> Vec<String> {
        rsync_argv(&self.prepared.config().auth, ip, source, destination)
    }
}

pub(crate) fn ssh_argv(
    auth: &AuthConfig,
    docker: &DockerConfig,
    ip: &str,
    command: &str,
) -> Vec<String> {
    let mut argv = vec![
        "ssh".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
    ];
    if let Some(key) = &auth.ssh_private_key {
        argv.push("-i".to_string());
        argv.push(key.clone());
    }
    argv.push(format!("{}@{}", auth.ssh_user, ip));
    if docker.enabled {
        argv.push(format!(
            "docker exec {} /bin/bash -c '{}'",
            docker.container_name, command
        ));
    } else {
        argv.push(command.to_string());
    }
    argv
}

pub(crate) fn rsync_argv(
    auth: &AuthConfig,
    ip: &str,
    source: &str,
    destination: &str,
) -> Vec<String> {
    let mut ssh_command = "ssh -o StrictHostKeyChecking=no".to_string();
    if let Some(key) = &auth.ssh_private_key {
        ssh_command.push_str(" -i ");
        ssh_command.push_str(key);
    }
    vec![
        "rsync".to_string(),
        "-avz".to_string(),
        "-e".to_string(),
        ssh_command,
        source.to_string(),
        format!("{}@{}:{}", auth.ssh_user, ip, destination),
    ]
}

#[cfg(test)]
mod tests {
    use cloudtik_common::config::ClusterConfig;
    use cloudtik_common::tags::{
        CLOUDTIK_TAG_CLUSTER_NAME, CLOUDTIK_TAG_NODE_KIND, NODE_KIND_WORKER,
    };
    use serde_json::json;

    use super::*;
    use crate::config::prepare_cluster_config;
    use crate::provider::MockProvider;
    use crate::runner::MockProcessRunner;

    fn prepared() -> Arc<PreparedConfig> {
        let config = ClusterConfig::from_yaml_str(
            r#"
cluster_name: default
min_workers: 2
max_workers: 2
provider:
    type: mock
initialization_commands: ["init_cmd"]
setup_commands: ["setup_cmd"]
worker_setup_commands: ["worker_setup_cmd"]
worker_start_commands: ["worker_start_cmd"]
"#,
        )
        .unwrap();
        Arc::new(prepare_cluster_config(config).unwrap())
    }

    async fn seed_worker(provider: &MockProvider, tags: HashMap<String, String>) -> NodeId {
        let mut all = HashMap::from([
            (
                CLOUDTIK_TAG_CLUSTER_NAME.to_string(),
                "default".to_string(),
            ),
            (
                CLOUDTIK_TAG_NODE_KIND.to_string(),
                NODE_KIND_WORKER.to_string(),
            ),
            (
                CLOUDTIK_TAG_NODE_STATUS.to_string(),
                NodeStatus::Uninitialized.as_str().to_string(),
            ),
        ]);
        all.extend(tags);
        provider.create_node(&json!({}), all, 1).await.unwrap();
        provider.finish_starting_nodes();
        "0".to_string()
    }

    fn updater(
        node_id: NodeId,
        prepared: Arc<PreparedConfig>,
        provider: Arc<MockProvider>,
        runner: Arc<MockProcessRunner>,
    ) -> NodeUpdater {
        NodeUpdater::new(
            node_id,
            NodeKind::Worker,
            prepared,
            provider,
            runner,
            Arc::new(AtomicBool::new(false)),
            NodeUpdaterOpts {
                ssh_ready_deadline: Duration::from_secs(5),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_full_pipeline_tags_up_to_date() {
        let prepared = prepared();
        let provider = Arc::new(MockProvider::new(false));
        let runner = Arc::new(MockProcessRunner::new());
        let node_id = seed_worker(&provider, HashMap::new()).await;

        updater(node_id.clone(), prepared.clone(), provider.clone(), runner.clone())
            .run()
            .await
            .unwrap();

        let tags = provider.node_tags(&node_id).await.unwrap();
        assert_eq!(
            tags[CLOUDTIK_TAG_NODE_STATUS],
            NodeStatus::UpToDate.as_str()
        );
        assert_eq!(tags[CLOUDTIK_TAG_RUNTIME_CONFIG], prepared.runtime_hash());
        for command in ["init_cmd", "setup_cmd", "worker_setup_cmd", "worker_start_cmd"] {
            assert!(runner.has_call("172.0.0.0", command), "missing {}", command);
        }
    }

    #[tokio::test]
    async fn test_up_to_date_node_runs_zero_commands() {
        let prepared = prepared();
        let provider = Arc::new(MockProvider::new(false));
        let runner = Arc::new(MockProcessRunner::new());
        let node_id = seed_worker(
            &provider,
            HashMap::from([
                (
                    CLOUDTIK_TAG_NODE_STATUS.to_string(),
                    NodeStatus::UpToDate.as_str().to_string(),
                ),
                (
                    CLOUDTIK_TAG_RUNTIME_CONFIG.to_string(),
                    prepared.runtime_hash().to_string(),
                ),
            ]),
        )
        .await;

        updater(node_id, prepared, provider, runner.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_runtime_hash_reruns_commands() {
        let prepared = prepared();
        let provider = Arc::new(MockProvider::new(false));
        let runner = Arc::new(MockProcessRunner::new());
        let node_id = seed_worker(
            &provider,
            HashMap::from([
                (
                    CLOUDTIK_TAG_NODE_STATUS.to_string(),
                    NodeStatus::UpToDate.as_str().to_string(),
                ),
                (
                    CLOUDTIK_TAG_RUNTIME_CONFIG.to_string(),
                    "0123456789abcdef".to_string(),
                ),
            ]),
        )
        .await;

        updater(node_id.clone(), prepared.clone(), provider.clone(), runner.clone())
            .run()
            .await
            .unwrap();
        assert!(runner.call_count() > 0);
        let tags = provider.node_tags(&node_id).await.unwrap();
        assert_eq!(tags[CLOUDTIK_TAG_RUNTIME_CONFIG], prepared.runtime_hash());
    }

    #[tokio::test]
    async fn test_failing_setup_tags_update_failed() {
        let prepared = prepared();
        let provider = Arc::new(MockProvider::new(false));
        let runner = Arc::new(MockProcessRunner::new());
        runner.fail_cmds(vec!["worker_setup_cmd".to_string()]);
        let node_id = seed_worker(&provider, HashMap::new()).await;

        let err = updater(node_id.clone(), prepared, provider.clone(), runner.clone())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::CommandFailed { code: 1, .. }));
        let tags = provider.node_tags(&node_id).await.unwrap();
        assert_eq!(
            tags[CLOUDTIK_TAG_NODE_STATUS],
            NodeStatus::UpdateFailed.as_str()
        );
        // The start command never ran.
        assert!(!runner.has_call("172.0.0.0", "worker_start_cmd"));
    }

    #[tokio::test]
    async fn test_unreachable_node_times_out_as_update_failed() {
        let prepared = prepared();
        let provider = Arc::new(MockProvider::new(false));
        let runner = Arc::new(MockProcessRunner::new());
        runner.fail_cmds(vec!["uptime".to_string()]);
        let node_id = seed_worker(&provider, HashMap::new()).await;

        let mut updater =
            updater(node_id.clone(), prepared, provider.clone(), runner.clone());
        updater.opts.ssh_ready_deadline = Duration::from_millis(50);
        let err = updater.run().await.unwrap_err();
        assert!(matches!(err, ScaleError::UpdaterTimeout(_)));
        let tags = provider.node_tags(&node_id).await.unwrap();
        assert_eq!(
            tags[CLOUDTIK_TAG_NODE_STATUS],
            NodeStatus::UpdateFailed.as_str()
        );
    }

    #[tokio::test]
    async fn test_docker_wraps_remote_commands() {
        let config = ClusterConfig::from_yaml_str(
            r#"
cluster_name: default
provider:
    type: mock
docker:
    enabled: true
    image: example
    container_name: mock
worker_start_commands: ["worker_start_cmd"]
"#,
        )
        .unwrap();
        let prepared = Arc::new(prepare_cluster_config(config).unwrap());
        let provider = Arc::new(MockProvider::new(false));
        let runner = Arc::new(MockProcessRunner::new());
        let node_id = seed_worker(&provider, HashMap::new()).await;

        updater(node_id, prepared, provider, runner.clone())
            .run()
            .await
            .unwrap();
        assert!(runner.has_call("172.0.0.0", "docker exec mock"));
    }
}
