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

//! The node provider abstraction: CRUD over cloud VMs keyed by opaque node
//! id and string tags. Concrete cloud adapters live outside the core; the
//! core only sees this trait plus the name-to-factory registry.

mod mock;
mod registry;

use std::collections::HashMap;

use async_trait::async_trait;
use cloudtik_common::types::NodeId;
use thiserror::Error;

pub use mock::{CloudCall, CloudRequestKind, MockProvider};
pub use registry::ProviderRegistry;

/// Hard cap on instance ids per underlying cloud request when stopping or
/// terminating. Carried by every provider implementation.
pub const MAX_NODES_PER_TERMINATE_REQUEST: usize = 1000;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// The failure discriminant at the provider boundary. The scaler branches
/// on it: `Transient` is counted and retried next tick, `NodeGone` drops
/// the node from local state, `Fatal` propagates to the owner.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("node {0} is gone")]
    NodeGone(NodeId),
    #[error("fatal provider failure: {0}")]
    Fatal(String),
}

/// Abstract CRUD over cloud VMs.
///
/// Implementations must be thread safe; the scaler shares one provider
/// between the control loop and all in-flight node updaters.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Ids of nodes whose tags are a superset of `tag_filters` and whose
    /// state is neither stopped nor terminated.
    async fn non_terminated_nodes(
        &self,
        tag_filters: &HashMap<String, String>,
    ) -> ProviderResult<Vec<NodeId>>;

    async fn is_running(&self, node_id: &str) -> ProviderResult<bool>;

    async fn is_terminated(&self, node_id: &str) -> ProviderResult<bool>;

    /// Tags of a live node. Fails with [`ProviderError::NodeGone`] if the
    /// provider reports the node stopped or terminated; callers must not
    /// assume tags of dead nodes are retrievable.
    async fn node_tags(&self, node_id: &str) -> ProviderResult<HashMap<String, String>>;

    async fn internal_ip(&self, node_id: &str) -> ProviderResult<String>;

    async fn external_ip(&self, node_id: &str) -> ProviderResult<Option<String>>;

    /// Launches `count` nodes carrying `tags`. May be asynchronous: the
    /// nodes must become visible to `non_terminated_nodes` within a bounded
    /// time but not necessarily before this returns. When a cache-stopped
    /// policy is configured, previously stopped nodes of the same node type
    /// are resurrected before fresh capacity is requested.
    async fn create_node(
        &self,
        node_config: &serde_json::Value,
        tags: HashMap<String, String>,
        count: u32,
    ) -> ProviderResult<()>;

    /// Merges `tags` into the node's existing tags, atomically per node.
    async fn set_node_tags(&self, node_id: &str, tags: HashMap<String, String>)
        -> ProviderResult<()>;

    async fn terminate_node(&self, node_id: &str) -> ProviderResult<()>;

    /// Stops or terminates a set of nodes, batching at most
    /// [`MAX_NODES_PER_TERMINATE_REQUEST`] ids per underlying cloud call.
    /// Spot-class instances are always hard-terminated, even when the
    /// cache-stopped policy applies to on-demand instances.
    async fn terminate_nodes(&self, node_ids: Vec<NodeId>) -> ProviderResult<()>;
}
