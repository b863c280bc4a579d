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

//! An in-memory provider backing the `mock` provider type.
//!
//! Besides serving tests, it documents the provider contract precisely:
//! tag-superset filtering, cache-stopped resurrection, spot handling and
//! the per-request termination batch cap.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use cloudtik_common::tags::CLOUDTIK_TAG_USER_NODE_TYPE;
use cloudtik_common::types::{NodeId, NodeState};
use itertools::Itertools;
use parking_lot::Mutex;

use super::{NodeProvider, ProviderError, ProviderResult, MAX_NODES_PER_TERMINATE_REQUEST};

#[derive(Clone, Debug)]
struct MockNode {
    state: NodeState,
    tags: HashMap<String, String>,
    node_config: serde_json::Value,
    internal_ip: String,
    external_ip: String,
}

impl MockNode {
    fn matches(&self, tag_filters: &HashMap<String, String>) -> bool {
        tag_filters
            .iter()
            .all(|(k, v)| self.tags.get(k) == Some(v))
    }

    fn is_spot(&self) -> bool {
        self.node_config
            .get("spot")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudRequestKind {
    StopInstances,
    TerminateInstances,
}

/// One underlying cloud request issued by the mock, recorded so tests can
/// assert batch sizes and stop-versus-terminate routing.
#[derive(Clone, Debug)]
pub struct CloudCall {
    pub kind: CloudRequestKind,
    pub instance_ids: Vec<NodeId>,
}

#[derive(Default)]
struct MockProviderCore {
    nodes: BTreeMap<u64, MockNode>,
    next_id: u64,
    cloud_calls: Vec<CloudCall>,
}

/// In-memory [`NodeProvider`]. All state lives behind a single mutex; the
/// scaler control loop and the updater tasks hit it concurrently.
pub struct MockProvider {
    core: Mutex<MockProviderCore>,
    cache_stopped: bool,
    unique_external_ips: bool,
    throw: AtomicBool,
    error_creates: AtomicBool,
    num_non_terminated_nodes_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(cache_stopped: bool) -> Self {
        MockProvider {
            core: Mutex::new(MockProviderCore::default()),
            cache_stopped,
            unique_external_ips: false,
            throw: AtomicBool::new(false),
            error_creates: AtomicBool::new(false),
            num_non_terminated_nodes_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_unique_external_ips(mut self) -> Self {
        self.unique_external_ips = true;
        self
    }

    /// Makes `non_terminated_nodes` fail with a transient error.
    pub fn set_throw(&self, throw: bool) {
        self.throw.store(throw, Ordering::SeqCst);
    }

    /// Makes `create_node` fail with a transient error.
    pub fn set_error_creates(&self, error_creates: bool) {
        self.error_creates.store(error_creates, Ordering::SeqCst);
    }

    pub fn non_terminated_nodes_call_count(&self) -> usize {
        self.num_non_terminated_nodes_calls.load(Ordering::SeqCst)
    }

    /// Flips every pending node to running, simulating cloud boot.
    pub fn finish_starting_nodes(&self) {
        let mut core = self.core.lock();
        for node in core.nodes.values_mut() {
            if node.state == NodeState::Pending {
                node.state = NodeState::Running;
            }
        }
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        let core = self.core.lock();
        parse_id(node_id).and_then(|id| core.nodes.get(&id).map(|n| n.state))
    }

    /// The underlying cloud requests issued so far.
    pub fn cloud_calls(&self) -> Vec<CloudCall> {
        self.core.lock().cloud_calls.clone()
    }

    fn live_node<'a>(
        core: &'a MockProviderCore,
        node_id: &str,
    ) -> ProviderResult<(u64, &'a MockNode)> {
        let id =
            parse_id(node_id).ok_or_else(|| ProviderError::NodeGone(node_id.to_string()))?;
        let node = core
            .nodes
            .get(&id)
            .ok_or_else(|| ProviderError::NodeGone(node_id.to_string()))?;
        Ok((id, node))
    }
}

fn parse_id(node_id: &str) -> Option<u64> {
    node_id.parse().ok()
}

#[async_trait]
impl NodeProvider for MockProvider {
    async fn non_terminated_nodes(
        &self,
        tag_filters: &HashMap<String, String>,
    ) -> ProviderResult<Vec<NodeId>> {
        self.num_non_terminated_nodes_calls
            .fetch_add(1, Ordering::SeqCst);
        if self.throw.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("oops".to_string()));
        }
        let core = self.core.lock();
        Ok(core
            .nodes
            .iter()
            .filter(|(_, n)| n.state.is_non_terminated() && n.matches(tag_filters))
            .map(|(id, _)| id.to_string())
            .collect())
    }

    async fn is_running(&self, node_id: &str) -> ProviderResult<bool> {
        let core = self.core.lock();
        let (_, node) = Self::live_node(&core, node_id)?;
        Ok(node.state == NodeState::Running)
    }

    async fn is_terminated(&self, node_id: &str) -> ProviderResult<bool> {
        let core = self.core.lock();
        match parse_id(node_id).and_then(|id| core.nodes.get(&id)) {
            Some(node) => Ok(!node.state.is_non_terminated()),
            None => Ok(true),
        }
    }

    async fn node_tags(&self, node_id: &str) -> ProviderResult<HashMap<String, String>> {
        // Tags of stopped or terminated nodes are not retrievable; real
        // clouds drop them from the describe responses.
        let core = self.core.lock();
        let (_, node) = Self::live_node(&core, node_id)?;
        if !node.state.is_non_terminated() {
            return Err(ProviderError::NodeGone(node_id.to_string()));
        }
        Ok(node.tags.clone())
    }

    async fn internal_ip(&self, node_id: &str) -> ProviderResult<String> {
        let core = self.core.lock();
        let (_, node) = Self::live_node(&core, node_id)?;
        Ok(node.internal_ip.clone())
    }

    async fn external_ip(&self, node_id: &str) -> ProviderResult<Option<String>> {
        let core = self.core.lock();
        let (_, node) = Self::live_node(&core, node_id)?;
        Ok(Some(node.external_ip.clone()))
    }

    async fn create_node(
        &self,
        node_config: &serde_json::Value,
        tags: HashMap<String, String>,
        count: u32,
    ) -> ProviderResult<()> {
        if self.error_creates.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("create_node failed".to_string()));
        }
        let mut core = self.core.lock();
        let mut remaining = count;
        if self.cache_stopped {
            // Resurrect stopped nodes of the same node type before asking
            // for fresh capacity. Revival never crosses node types.
            let requested_type = tags.get(CLOUDTIK_TAG_USER_NODE_TYPE).cloned();
            for node in core.nodes.values_mut() {
                if remaining == 0 {
                    break;
                }
                if node.state == NodeState::Stopped
                    && node.tags.get(CLOUDTIK_TAG_USER_NODE_TYPE).cloned() == requested_type
                {
                    node.state = NodeState::Pending;
                    node.tags.extend(tags.clone());
                    remaining -= 1;
                }
            }
        }
        for _ in 0..remaining {
            let id = core.next_id;
            core.next_id += 1;
            let external_ip = if self.unique_external_ips {
                format!("1.2.3.{}", id)
            } else {
                "1.2.3.4".to_string()
            };
            core.nodes.insert(
                id,
                MockNode {
                    state: NodeState::Pending,
                    tags: tags.clone(),
                    node_config: node_config.clone(),
                    internal_ip: format!("172.0.0.{}", id),
                    external_ip,
                },
            );
        }
        Ok(())
    }

    async fn set_node_tags(
        &self,
        node_id: &str,
        tags: HashMap<String, String>,
    ) -> ProviderResult<()> {
        let mut core = self.core.lock();
        let id =
            parse_id(node_id).ok_or_else(|| ProviderError::NodeGone(node_id.to_string()))?;
        let node = core
            .nodes
            .get_mut(&id)
            .ok_or_else(|| ProviderError::NodeGone(node_id.to_string()))?;
        node.tags.extend(tags);
        Ok(())
    }

    async fn terminate_node(&self, node_id: &str) -> ProviderResult<()> {
        self.terminate_nodes(vec![node_id.to_string()]).await
    }

    async fn terminate_nodes(&self, node_ids: Vec<NodeId>) -> ProviderResult<()> {
        let mut core = self.core.lock();
        let mut to_stop = Vec::new();
        let mut to_terminate = Vec::new();
        for node_id in node_ids {
            let id = match parse_id(&node_id).filter(|id| core.nodes.contains_key(id)) {
                Some(id) => id,
                None => return Err(ProviderError::NodeGone(node_id)),
            };
            let spot = core.nodes[&id].is_spot();
            if self.cache_stopped && !spot {
                to_stop.push(node_id);
            } else {
                to_terminate.push(node_id);
            }
        }
        for (kind, ids, state) in [
            (CloudRequestKind::StopInstances, to_stop, NodeState::Stopped),
            (
                CloudRequestKind::TerminateInstances,
                to_terminate,
                NodeState::Terminated,
            ),
        ] {
            let batches = ids.into_iter().chunks(MAX_NODES_PER_TERMINATE_REQUEST);
            for chunk in &batches {
                let instance_ids = chunk.collect_vec();
                for node_id in &instance_ids {
                    let id = parse_id(node_id).unwrap();
                    core.nodes.get_mut(&id).unwrap().state = state;
                }
                core.cloud_calls.push(CloudCall { kind, instance_ids });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_tag_superset_filtering() {
        let provider = MockProvider::new(false);
        let tags = HashMap::from([("cloudtik-node-kind".to_string(), "worker".to_string())]);
        provider.create_node(&json!({}), tags, 2).await.unwrap();
        provider
            .create_node(&json!({}), HashMap::new(), 1)
            .await
            .unwrap();

        let filter = HashMap::from([("cloudtik-node-kind".to_string(), "worker".to_string())]);
        assert_eq!(provider.non_terminated_nodes(&filter).await.unwrap().len(), 2);
        assert_eq!(
            provider
                .non_terminated_nodes(&HashMap::new())
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_node_tags_of_terminated_node_is_gone() {
        let provider = MockProvider::new(false);
        provider
            .create_node(&json!({}), HashMap::new(), 1)
            .await
            .unwrap();
        provider.terminate_node("0").await.unwrap();
        assert!(matches!(
            provider.node_tags("0").await,
            Err(ProviderError::NodeGone(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_stopped_revives_same_type_only() {
        let provider = MockProvider::new(true);
        let worker_tags = HashMap::from([(
            CLOUDTIK_TAG_USER_NODE_TYPE.to_string(),
            "m4.large".to_string(),
        )]);
        provider
            .create_node(&json!({}), worker_tags.clone(), 1)
            .await
            .unwrap();
        provider.terminate_node("0").await.unwrap();
        assert_eq!(provider.node_state("0"), Some(NodeState::Stopped));

        // A different node type must not pick up the stopped instance.
        let other_tags = HashMap::from([(
            CLOUDTIK_TAG_USER_NODE_TYPE.to_string(),
            "p2.xlarge".to_string(),
        )]);
        provider
            .create_node(&json!({}), other_tags, 1)
            .await
            .unwrap();
        assert_eq!(provider.node_state("0"), Some(NodeState::Stopped));

        // The same type revives it instead of creating a fresh node.
        provider
            .create_node(&json!({}), worker_tags, 1)
            .await
            .unwrap();
        assert_eq!(provider.node_state("0"), Some(NodeState::Pending));
        assert_eq!(
            provider
                .non_terminated_nodes(&HashMap::new())
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_spot_nodes_are_always_terminated() {
        let provider = MockProvider::new(true);
        provider
            .create_node(&json!({"spot": true}), HashMap::new(), 1)
            .await
            .unwrap();
        provider
            .create_node(&json!({}), HashMap::new(), 1)
            .await
            .unwrap();
        provider
            .terminate_nodes(vec!["0".to_string(), "1".to_string()])
            .await
            .unwrap();

        assert_eq!(provider.node_state("0"), Some(NodeState::Terminated));
        assert_eq!(provider.node_state("1"), Some(NodeState::Stopped));
        let calls = provider.cloud_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls
            .iter()
            .any(|c| c.kind == CloudRequestKind::TerminateInstances
                && c.instance_ids == vec!["0".to_string()]));
        assert!(calls
            .iter()
            .any(|c| c.kind == CloudRequestKind::StopInstances
                && c.instance_ids == vec!["1".to_string()]));
    }
}
