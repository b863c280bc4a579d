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

//! The cluster heartbeat tracker: per-IP liveness, resources and load, fed
//! by node agents and consumed by the scaler.
//!
//! All operations are linearized under one internal mutex; readers get a
//! consistent point-in-time snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};

use cloudtik_common::types::{NodeId, ResourceMap};
use cloudtik_common::util::epoch_secs;
use parking_lot::Mutex;

/// Per-IP load vector as last reported by the node agent.
pub type LoadMap = BTreeMap<String, f64>;

#[derive(Default)]
struct ClusterMetricsCore {
    last_heartbeat_time_by_ip: HashMap<String, u64>,
    agent_id_by_ip: HashMap<String, Vec<u8>>,
    node_id_by_ip: HashMap<String, NodeId>,
    static_resources_by_ip: HashMap<String, ResourceMap>,
    available_resources_by_ip: HashMap<String, ResourceMap>,
    load_by_ip: HashMap<String, LoadMap>,
    /// IPs known alive out-of-band but with no agent heartbeat yet.
    waiting_for_agent: HashSet<String>,
    resource_requests: Vec<ResourceMap>,
}

/// A consistent snapshot of the tracker, taken under the mutex.
#[derive(Clone, Debug, Default)]
pub struct ClusterMetricsSummary {
    pub last_heartbeat_time_by_ip: HashMap<String, u64>,
    pub static_resources_by_ip: HashMap<String, ResourceMap>,
    pub available_resources_by_ip: HashMap<String, ResourceMap>,
    pub resource_requests: Vec<ResourceMap>,
}

pub struct ClusterMetrics {
    core: Mutex<ClusterMetricsCore>,
}

impl ClusterMetrics {
    pub fn new() -> Self {
        ClusterMetrics {
            core: Mutex::new(ClusterMetricsCore::default()),
        }
    }

    /// Ingests one heartbeat. A changed agent id means the in-node agent
    /// restarted; the resource and load history for the IP is dropped so
    /// stale readings from the previous incarnation cannot linger.
    pub fn update(
        &self,
        ip: &str,
        agent_id: &[u8],
        node_id: Option<&str>,
        static_resources: ResourceMap,
        available_resources: ResourceMap,
        load: LoadMap,
    ) {
        self.update_at(
            ip,
            agent_id,
            node_id,
            static_resources,
            available_resources,
            load,
            epoch_secs(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_at(
        &self,
        ip: &str,
        agent_id: &[u8],
        node_id: Option<&str>,
        static_resources: ResourceMap,
        available_resources: ResourceMap,
        load: LoadMap,
        now_secs: u64,
    ) {
        let mut core = self.core.lock();
        if let Some(known) = core.agent_id_by_ip.get(ip) {
            if known != agent_id {
                tracing::info!(ip, "heartbeat agent restarted, dropping load history");
                core.static_resources_by_ip.remove(ip);
                core.available_resources_by_ip.remove(ip);
                core.load_by_ip.remove(ip);
            }
        }
        core.agent_id_by_ip.insert(ip.to_string(), agent_id.to_vec());
        if let Some(node_id) = node_id {
            core.node_id_by_ip.insert(ip.to_string(), node_id.to_string());
        }
        core.static_resources_by_ip
            .insert(ip.to_string(), static_resources);
        core.available_resources_by_ip
            .insert(ip.to_string(), available_resources);
        core.load_by_ip.insert(ip.to_string(), load);
        core.last_heartbeat_time_by_ip
            .insert(ip.to_string(), now_secs);
        core.waiting_for_agent.remove(ip);
    }

    /// Stamps the IP as alive without touching resource data. Used for
    /// nodes known alive by out-of-band signals, e.g. a node the scaler
    /// just saw in a provider snapshot but whose agent has not reported.
    pub fn mark_active(&self, ip: &str) {
        self.mark_active_at(ip, epoch_secs())
    }

    pub fn mark_active_at(&self, ip: &str, now_secs: u64) {
        let mut core = self.core.lock();
        if !core.agent_id_by_ip.contains_key(ip) {
            core.waiting_for_agent.insert(ip.to_string());
        }
        core.last_heartbeat_time_by_ip
            .insert(ip.to_string(), now_secs);
    }

    /// True iff the IP has ever been stamped.
    pub fn is_tracked(&self, ip: &str) -> bool {
        self.core.lock().last_heartbeat_time_by_ip.contains_key(ip)
    }

    /// True iff the last heartbeat is no older than `idle_timeout_s`.
    /// A heartbeat exactly at the threshold still counts as active.
    pub fn is_active(&self, ip: &str, idle_timeout_s: u64) -> bool {
        self.is_active_at(ip, idle_timeout_s, epoch_secs())
    }

    pub fn is_active_at(&self, ip: &str, idle_timeout_s: u64, now_secs: u64) -> bool {
        let core = self.core.lock();
        match core.last_heartbeat_time_by_ip.get(ip) {
            Some(last) => now_secs.saturating_sub(*last) <= idle_timeout_s,
            None => false,
        }
    }

    /// Drops every entry whose IP is not in `active_ips`. Called after a
    /// reconciliation pass so terminated nodes do not accumulate.
    pub fn prune(&self, active_ips: &HashSet<String>) {
        let mut core = self.core.lock();
        core.last_heartbeat_time_by_ip
            .retain(|ip, _| active_ips.contains(ip));
        core.agent_id_by_ip.retain(|ip, _| active_ips.contains(ip));
        core.node_id_by_ip.retain(|ip, _| active_ips.contains(ip));
        core.static_resources_by_ip
            .retain(|ip, _| active_ips.contains(ip));
        core.available_resources_by_ip
            .retain(|ip, _| active_ips.contains(ip));
        core.load_by_ip.retain(|ip, _| active_ips.contains(ip));
        core.waiting_for_agent.retain(|ip| active_ips.contains(ip));
    }

    /// Replaces the outstanding resource-request list used as the demand
    /// hint for scaling up.
    pub fn request_resources(&self, bundles: Vec<ResourceMap>) {
        self.core.lock().resource_requests = bundles;
    }

    pub fn summary(&self) -> ClusterMetricsSummary {
        let core = self.core.lock();
        ClusterMetricsSummary {
            last_heartbeat_time_by_ip: core.last_heartbeat_time_by_ip.clone(),
            static_resources_by_ip: core.static_resources_by_ip.clone(),
            available_resources_by_ip: core.available_resources_by_ip.clone(),
            resource_requests: core.resource_requests.clone(),
        }
    }
}

impl Default for ClusterMetrics {
    fn default() -> Self {
        Self::new()
    }
}
