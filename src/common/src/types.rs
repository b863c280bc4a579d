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

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque provider-assigned node identifier.
pub type NodeId = String;

/// A resource vector: resource name to integer capacity, e.g. `{CPU: 16}`.
/// Kept sorted so printing and fingerprinting are deterministic.
pub type ResourceMap = BTreeMap<String, u64>;

/// Provider-visible lifecycle state of a VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    Pending,
    Running,
    Stopped,
    Terminated,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Stopped => "stopped",
            NodeState::Terminated => "terminated",
        }
    }

    /// Whether the provider reports this node among the non-terminated set.
    pub fn is_non_terminated(&self) -> bool {
        matches!(self, NodeState::Pending | NodeState::Running)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NodeState::Pending),
            "running" => Ok(NodeState::Running),
            "stopped" => Ok(NodeState::Stopped),
            "terminated" => Ok(NodeState::Terminated),
            other => Err(format!("unknown node state: {}", other)),
        }
    }
}

/// Sums `rhs` into `lhs`, resource by resource.
pub fn add_resources(lhs: &mut ResourceMap, rhs: &ResourceMap) {
    for (name, amount) in rhs {
        *lhs.entry(name.clone()).or_insert(0) += amount;
    }
}

/// True iff `capacity` covers every resource in `demand`.
pub fn covers(capacity: &ResourceMap, demand: &ResourceMap) -> bool {
    demand
        .iter()
        .all(|(name, amount)| capacity.get(name).copied().unwrap_or(0) >= *amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers() {
        let capacity = ResourceMap::from([("CPU".to_string(), 16), ("GPU".to_string(), 1)]);
        let fits = ResourceMap::from([("CPU".to_string(), 8)]);
        let too_big = ResourceMap::from([("CPU".to_string(), 32)]);
        let missing = ResourceMap::from([("TPU".to_string(), 1)]);
        assert!(covers(&capacity, &fits));
        assert!(!covers(&capacity, &too_big));
        assert!(!covers(&capacity, &missing));
    }

    #[test]
    fn test_add_resources() {
        let mut total = ResourceMap::from([("CPU".to_string(), 2)]);
        add_resources(
            &mut total,
            &ResourceMap::from([("CPU".to_string(), 2), ("GPU".to_string(), 1)]),
        );
        assert_eq!(total["CPU"], 4);
        assert_eq!(total["GPU"], 1);
    }
}
