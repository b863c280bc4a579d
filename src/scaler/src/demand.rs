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

//! Mapping outstanding resource requests to node counts.
//!
//! The exact demand function is a policy choice, so it sits behind a trait.
//! The default grows by one node of the smallest type that satisfies each
//! request that current capacity cannot absorb.

use std::collections::BTreeMap;

use cloudtik_common::types::{add_resources, covers, ResourceMap};

use crate::config::PreparedConfig;
use crate::heartbeat::ClusterMetricsSummary;

pub trait DemandStrategy: Send + Sync {
    /// Additional workers wanted per node type, on top of what the live
    /// fleet can already absorb. The scaler clamps the result against the
    /// per-type and global bounds.
    fn required_workers(
        &self,
        prepared: &PreparedConfig,
        summary: &ClusterMetricsSummary,
    ) -> BTreeMap<String, u32>;
}

/// Grow by one of the smallest node type satisfying demand.
pub struct SmallestFitDemand;

impl SmallestFitDemand {
    fn resource_weight(resources: &ResourceMap) -> u64 {
        resources.values().sum()
    }
}

impl DemandStrategy for SmallestFitDemand {
    fn required_workers(
        &self,
        prepared: &PreparedConfig,
        summary: &ClusterMetricsSummary,
    ) -> BTreeMap<String, u32> {
        let mut required: BTreeMap<String, u32> = BTreeMap::new();
        if summary.resource_requests.is_empty() {
            return required;
        }

        // Pool what the live fleet still has available.
        let mut pool = ResourceMap::new();
        for available in summary.available_resources_by_ip.values() {
            add_resources(&mut pool, available);
        }

        // Smallest types first so each unmet request lands on the cheapest
        // node that can hold it.
        let mut types: Vec<_> = prepared
            .worker_types()
            .map(|(name, t)| (name.clone(), t.resources.clone()))
            .collect();
        types.sort_by_key(|(name, resources)| (Self::resource_weight(resources), name.clone()));

        for request in &summary.resource_requests {
            if take_from_pool(&mut pool, request) {
                continue;
            }
            let fitting = types
                .iter()
                .find(|(_, resources)| covers(resources, request));
            match fitting {
                Some((name, resources)) => {
                    *required.entry(name.clone()).or_insert(0) += 1;
                    // The new node's leftover capacity absorbs later requests.
                    add_resources(&mut pool, resources);
                    let fits = take_from_pool(&mut pool, request);
                    debug_assert!(fits);
                }
                None => {
                    tracing::warn!(
                        request = ?request,
                        "no node type can satisfy resource request, ignoring"
                    );
                }
            }
        }
        required
    }
}

fn take_from_pool(pool: &mut ResourceMap, request: &ResourceMap) -> bool {
    if !covers(pool, request) {
        return false;
    }
    for (name, amount) in request {
        if *amount == 0 {
            continue;
        }
        *pool.get_mut(name).unwrap() -= amount;
    }
    true
}

#[cfg(test)]
mod tests {
    use cloudtik_common::config::ClusterConfig;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::prepare_cluster_config;

    fn multi_type_config() -> PreparedConfig {
        let config = ClusterConfig::from_yaml_str(
            r#"
cluster_name: multi
max_workers: 20
provider:
    type: mock
available_node_types:
    empty_node:
        node_config: {}
        resources: {}
        max_workers: 0
    m4.large:
        node_config: {}
        resources:
            CPU: 2
        max_workers: 10
    m4.16xlarge:
        node_config: {}
        resources:
            CPU: 64
        max_workers: 4
    p2.xlarge:
        node_config: {}
        resources:
            CPU: 16
            GPU: 1
        max_workers: 10
head_node_type: empty_node
"#,
        )
        .unwrap();
        prepare_cluster_config(config).unwrap()
    }

    fn request(cpu: u64, gpu: u64) -> ResourceMap {
        let mut r = ResourceMap::from([("CPU".to_string(), cpu)]);
        if gpu > 0 {
            r.insert("GPU".to_string(), gpu);
        }
        r
    }

    #[test]
    fn test_no_requests_no_growth() {
        let prepared = multi_type_config();
        let summary = ClusterMetricsSummary::default();
        assert!(SmallestFitDemand
            .required_workers(&prepared, &summary)
            .is_empty());
    }

    #[test]
    fn test_smallest_fitting_type_wins() {
        let prepared = multi_type_config();
        let summary = ClusterMetricsSummary {
            resource_requests: vec![request(1, 0)],
            ..Default::default()
        };
        let required = SmallestFitDemand.required_workers(&prepared, &summary);
        assert_eq!(required, BTreeMap::from([("m4.large".to_string(), 1)]));
    }

    #[test]
    fn test_gpu_requests_pick_gpu_type() {
        let prepared = multi_type_config();
        let summary = ClusterMetricsSummary {
            resource_requests: vec![request(1, 1)],
            ..Default::default()
        };
        let required = SmallestFitDemand.required_workers(&prepared, &summary);
        assert_eq!(required, BTreeMap::from([("p2.xlarge".to_string(), 1)]));
    }

    #[test]
    fn test_existing_capacity_absorbs_requests() {
        let prepared = multi_type_config();
        let summary = ClusterMetricsSummary {
            available_resources_by_ip: std::collections::HashMap::from([(
                "172.0.0.0".to_string(),
                request(4, 0),
            )]),
            resource_requests: vec![request(2, 0), request(2, 0)],
            ..Default::default()
        };
        assert!(SmallestFitDemand
            .required_workers(&prepared, &summary)
            .is_empty());
    }

    #[test]
    fn test_new_node_leftover_absorbs_later_requests() {
        let prepared = multi_type_config();
        let summary = ClusterMetricsSummary {
            resource_requests: vec![request(1, 0), request(1, 0)],
            ..Default::default()
        };
        // Both one-CPU requests share a single two-CPU node.
        let required = SmallestFitDemand.required_workers(&prepared, &summary);
        assert_eq!(required, BTreeMap::from([("m4.large".to_string(), 1)]));
    }

    #[test]
    fn test_unsatisfiable_request_is_ignored() {
        let prepared = multi_type_config();
        let summary = ClusterMetricsSummary {
            resource_requests: vec![request(1024, 0)],
            ..Default::default()
        };
        assert!(SmallestFitDemand
            .required_workers(&prepared, &summary)
            .is_empty());
    }
}
