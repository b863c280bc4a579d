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

//! The declarative cluster configuration data model.
//!
//! This is the raw, user-facing shape of the YAML document. Default filling,
//! validation and fingerprint computation happen in the scaler's config
//! preparer; the structs here only mirror the file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ResourceMap;

#[derive(Error, Debug)]
pub enum ConfigParseError {
    #[error("failed to read cluster config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse cluster config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A named launch template: per-provider launch configuration (opaque),
/// a resource vector and per-type worker bounds.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NodeTypeConfig {
    #[serde(default)]
    pub node_config: serde_json::Value,
    #[serde(default)]
    pub resources: ResourceMap,
    #[serde(default)]
    pub min_workers: Option<u32>,
    #[serde(default)]
    pub max_workers: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AuthConfig {
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_private_key: Option<String>,
    #[serde(default)]
    pub ssh_proxy_command: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            ssh_user: default_ssh_user(),
            ssh_private_key: None,
            ssh_proxy_command: None,
        }
    }
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DockerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub image: String,
    #[serde(default = "default_container_name")]
    pub container_name: String,
    #[serde(default)]
    pub run_options: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        DockerConfig {
            enabled: false,
            image: String::new(),
            container_name: default_container_name(),
            run_options: Vec::new(),
        }
    }
}

fn default_container_name() -> String {
    "cloudtik".to_string()
}

/// The cluster configuration file, top to bottom.
///
/// `provider`, `head_node` and `runtime` are opaque to the core: the first
/// is handed to the provider factory, the other two only participate in the
/// launch and runtime fingerprints.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub cluster_name: String,

    /// Global bound applied across node types.
    #[serde(default)]
    pub min_workers: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,

    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u32,

    pub provider: serde_json::Value,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub available_node_types: BTreeMap<String, NodeTypeConfig>,

    #[serde(default)]
    pub head_node_type: String,

    /// Extra launch configuration merged into the head type's node config.
    #[serde(default)]
    pub head_node: serde_json::Value,

    /// Destination path to source path.
    #[serde(default)]
    pub file_mounts: BTreeMap<String, String>,

    /// Additional paths synced to every node after the file mounts.
    #[serde(default)]
    pub cluster_synced_files: Vec<String>,

    #[serde(default)]
    pub initialization_commands: Vec<String>,
    #[serde(default)]
    pub setup_commands: Vec<String>,
    #[serde(default)]
    pub head_setup_commands: Vec<String>,
    #[serde(default)]
    pub worker_setup_commands: Vec<String>,
    #[serde(default)]
    pub head_start_commands: Vec<String>,
    #[serde(default)]
    pub worker_start_commands: Vec<String>,

    #[serde(default)]
    pub runtime: serde_json::Value,

    /// Keys the schema does not recognize. Parsing keeps them so validation
    /// can report each one without rejecting the document.
    #[serde(flatten)]
    pub unrecognized: BTreeMap<String, serde_json::Value>,
}

fn default_max_workers() -> u32 {
    2
}

fn default_idle_timeout_minutes() -> u32 {
    5
}

impl ClusterConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigParseError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_yaml_file(path: &std::path::Path) -> Result<Self, ConfigParseError> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    /// The `provider.type` discriminant used to resolve the provider factory.
    pub fn provider_type(&self) -> Option<&str> {
        self.provider.get("type").and_then(|v| v.as_str())
    }
}
