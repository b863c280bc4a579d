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

//! Config preparation: default filling, advisory validation and the launch
//! and runtime fingerprints the scaler compares node tags against.
//!
//! Validation is advisory on purpose: an unknown key is reported, not
//! rejected, so a config written for a newer schema still scales the
//! cluster it describes. Only structurally unusable configs are fatal.

use std::collections::BTreeMap;

use cloudtik_common::config::{ClusterConfig, NodeTypeConfig};
use cloudtik_common::tags::NodeKind;
use cloudtik_common::util::hash::{config_fingerprint, file_mounts_fingerprint};
use serde_json::json;

use crate::error::{ScaleError, ScaleResult};

/// Node type names synthesized when a config carries no explicit
/// `available_node_types`.
pub const DEFAULT_HEAD_NODE_TYPE: &str = "head.default";
pub const DEFAULT_WORKER_NODE_TYPE: &str = "worker.default";

/// A cluster config with defaults filled and fingerprints computed.
#[derive(Clone, Debug)]
pub struct PreparedConfig {
    config: ClusterConfig,
    launch_hashes: BTreeMap<String, String>,
    runtime_hash: String,
    file_mounts_hash: String,
    warnings: Vec<String>,
}

/// Reports config problems that do not prevent scaling. Each entry is also
/// logged at warn level by [`prepare_cluster_config`].
pub fn validate_cluster_config(config: &ClusterConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    for key in config.unrecognized.keys() {
        warnings.push(format!("unknown config key: {}", key));
    }
    if config.docker.enabled && config.docker.image.is_empty() {
        warnings.push("docker is enabled but no image is configured".to_string());
    }
    if config.max_workers < config.min_workers {
        warnings.push(format!(
            "min_workers {} exceeds max_workers {}",
            config.min_workers, config.max_workers
        ));
    }
    warnings
}

/// Fills defaults, validates, and computes the fingerprints.
///
/// Fatal only on configs the scaler cannot act on at all: an empty cluster
/// name, an unresolvable provider, or a head node type that is not among
/// the available node types.
pub fn prepare_cluster_config(mut config: ClusterConfig) -> ScaleResult<PreparedConfig> {
    if config.cluster_name.is_empty() {
        return Err(ScaleError::Config("cluster_name must not be empty".to_string()));
    }
    if config.provider_type().is_none() {
        return Err(ScaleError::Config(
            "provider config must carry a type".to_string(),
        ));
    }

    let warnings = validate_cluster_config(&config);
    for warning in &warnings {
        tracing::warn!("cluster config: {}", warning);
    }

    fillout_node_types(&mut config)?;
    fill_node_type_min_max_workers(&mut config);

    let file_mounts_hash = file_mounts_fingerprint(&config.file_mounts)
        .map_err(|e| ScaleError::Config(format!("failed to hash file mounts: {}", e)))?;
    let runtime_hash = config_fingerprint(&json!({
        "file_mounts_contents": file_mounts_hash,
        "cluster_synced_files": config.cluster_synced_files,
        "initialization_commands": config.initialization_commands,
        "setup_commands": config.setup_commands,
        "head_setup_commands": config.head_setup_commands,
        "worker_setup_commands": config.worker_setup_commands,
        "head_start_commands": config.head_start_commands,
        "worker_start_commands": config.worker_start_commands,
        "runtime": config.runtime,
    }));

    let auth = serde_json::to_value(&config.auth)
        .map_err(|e| ScaleError::Config(format!("unserializable auth config: {}", e)))?;
    let launch_hashes = config
        .available_node_types
        .iter()
        .map(|(name, node_type)| {
            let hash = config_fingerprint(&json!({
                "auth": auth,
                "node_config": node_type.node_config,
            }));
            (name.clone(), hash)
        })
        .collect();

    Ok(PreparedConfig {
        config,
        launch_hashes,
        runtime_hash,
        file_mounts_hash,
        warnings,
    })
}

/// Synthesizes default node types for bare configs and resolves the head
/// type, merging `head_node` extras into its launch config.
fn fillout_node_types(config: &mut ClusterConfig) -> ScaleResult<()> {
    if config.available_node_types.is_empty() {
        config
            .available_node_types
            .insert(DEFAULT_HEAD_NODE_TYPE.to_string(), NodeTypeConfig::default());
        config.available_node_types.insert(
            DEFAULT_WORKER_NODE_TYPE.to_string(),
            NodeTypeConfig::default(),
        );
        config.head_node_type = DEFAULT_HEAD_NODE_TYPE.to_string();
    }
    if !config.available_node_types.contains_key(&config.head_node_type) {
        return Err(ScaleError::Config(format!(
            "head_node_type {:?} is not among available_node_types",
            config.head_node_type
        )));
    }
    if let Some(extras) = config.head_node.as_object().cloned() {
        let head_type = config
            .available_node_types
            .get_mut(&config.head_node_type)
            .unwrap();
        if !head_type.node_config.is_object() {
            head_type.node_config = json!({});
        }
        let node_config = head_type.node_config.as_object_mut().unwrap();
        for (key, value) in extras {
            node_config.entry(key).or_insert(value);
        }
    }
    Ok(())
}

/// The head type never counts as a worker; worker types missing bounds
/// inherit the globals. With a single worker type the global `min_workers`
/// applies to it directly.
fn fill_node_type_min_max_workers(config: &mut ClusterConfig) {
    let head_node_type = config.head_node_type.clone();
    let worker_type_count = config
        .available_node_types
        .keys()
        .filter(|name| **name != head_node_type)
        .count();
    let global_min = config.min_workers;
    let global_max = config.max_workers;
    for (name, node_type) in &mut config.available_node_types {
        if *name == head_node_type {
            node_type.min_workers = Some(0);
            node_type.max_workers = Some(0);
            continue;
        }
        let max = node_type.max_workers.unwrap_or(global_max);
        let default_min = if worker_type_count == 1 { global_min } else { 0 };
        let min = node_type.min_workers.unwrap_or(default_min).min(max);
        node_type.min_workers = Some(min);
        node_type.max_workers = Some(max);
    }
}

impl PreparedConfig {
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn idle_timeout_secs(&self) -> u64 {
        u64::from(self.config.idle_timeout_minutes) * 60
    }

    pub fn head_node_type(&self) -> &str {
        &self.config.head_node_type
    }

    pub fn node_type(&self, name: &str) -> Option<&NodeTypeConfig> {
        self.config.available_node_types.get(name)
    }

    /// Node types that may hold workers, i.e. everything but the head type.
    pub fn worker_types(&self) -> impl Iterator<Item = (&String, &NodeTypeConfig)> {
        self.config
            .available_node_types
            .iter()
            .filter(|(name, _)| *name != &self.config.head_node_type)
    }

    /// The launch fingerprint expected on live nodes of `node_type`.
    pub fn launch_hash(&self, node_type: &str) -> Option<&str> {
        self.launch_hashes.get(node_type).map(|s| s.as_str())
    }

    pub fn runtime_hash(&self) -> &str {
        &self.runtime_hash
    }

    pub fn file_mounts_hash(&self) -> &str {
        &self.file_mounts_hash
    }

    pub fn initialization_commands(&self) -> &[String] {
        &self.config.initialization_commands
    }

    pub fn setup_commands(&self, kind: NodeKind) -> Vec<String> {
        let mut commands = self.config.setup_commands.clone();
        match kind {
            NodeKind::Head => commands.extend(self.config.head_setup_commands.clone()),
            NodeKind::Worker => commands.extend(self.config.worker_setup_commands.clone()),
        }
        commands
    }

    pub fn start_commands(&self, kind: NodeKind) -> &[String] {
        match kind {
            NodeKind::Head => &self.config.head_start_commands,
            NodeKind::Worker => &self.config.worker_start_commands,
        }
    }

    pub fn to_yaml(&self) -> ScaleResult<String> {
        serde_yaml::to_string(&self.config)
            .map_err(|e| ScaleError::Config(format!("unserializable cluster config: {}", e)))
    }
}
