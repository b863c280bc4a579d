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

//! The node tag vocabulary. Tags are the only channel through which the
//! scaler communicates intent to a cloud provider, so the keys and the
//! status values below are a wire contract and must stay stable across
//! versions.

use std::fmt;
use std::str::FromStr;

/// Tag holding the name of the cluster the node belongs to.
pub const CLOUDTIK_TAG_CLUSTER_NAME: &str = "cloudtik-cluster-name";

/// Tag for the kind of node, `head` or `worker`.
pub const CLOUDTIK_TAG_NODE_KIND: &str = "cloudtik-node-kind";

/// Tag for the user-defined node type name the node was launched from.
pub const CLOUDTIK_TAG_USER_NODE_TYPE: &str = "cloudtik-user-node-type";

/// Tag for the bootstrap status of the node, written by its updater.
pub const CLOUDTIK_TAG_NODE_STATUS: &str = "cloudtik-node-status";

/// Tag holding the hash of the launch configuration the node was created
/// with. A mismatch against the current hash means relaunch.
pub const CLOUDTIK_TAG_LAUNCH_CONFIG: &str = "cloudtik-launch-config";

/// Tag holding the hash of the in-node runtime configuration (commands and
/// file mounts). A mismatch means re-setup, not relaunch.
pub const CLOUDTIK_TAG_RUNTIME_CONFIG: &str = "cloudtik-runtime-config";

/// Tag holding the hash of the file mount contents last synced to the node.
pub const CLOUDTIK_TAG_FILE_MOUNTS_CONTENTS: &str = "cloudtik-file-mounts-contents";

/// Tag holding a human readable node name.
pub const CLOUDTIK_TAG_NODE_NAME: &str = "cloudtik-node-name";

/// Tag holding the sequential number of the node within the cluster.
pub const CLOUDTIK_TAG_NODE_NUMBER: &str = "cloudtik-node-number";

/// The node number reserved for the head node.
pub const CLOUDTIK_HEAD_NODE_NUMBER: u64 = 0;

pub const NODE_KIND_HEAD: &str = "head";
pub const NODE_KIND_WORKER: &str = "worker";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Head,
    Worker,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Head => NODE_KIND_HEAD,
            NodeKind::Worker => NODE_KIND_WORKER,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            NODE_KIND_HEAD => Ok(NodeKind::Head),
            NODE_KIND_WORKER => Ok(NodeKind::Worker),
            other => Err(format!("unknown node kind: {}", other)),
        }
    }
}

/// The bootstrap status of a node, driven by its updater.
///
/// `UpToDate` and `UpdateFailed` are terminal; every other status means an
/// updater either has not run yet or is still in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Uninitialized,
    WaitingForSsh,
    SyncingFiles,
    SettingUp,
    UpToDate,
    UpdateFailed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Uninitialized => "uninitialized",
            NodeStatus::WaitingForSsh => "waiting-for-ssh",
            NodeStatus::SyncingFiles => "syncing-files",
            NodeStatus::SettingUp => "setting-up",
            NodeStatus::UpToDate => "up-to-date",
            NodeStatus::UpdateFailed => "update-failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::UpToDate | NodeStatus::UpdateFailed)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(NodeStatus::Uninitialized),
            "waiting-for-ssh" => Ok(NodeStatus::WaitingForSsh),
            "syncing-files" => Ok(NodeStatus::SyncingFiles),
            "setting-up" => Ok(NodeStatus::SettingUp),
            "up-to-date" => Ok(NodeStatus::UpToDate),
            "update-failed" => Ok(NodeStatus::UpdateFailed),
            other => Err(format!("unknown node status: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            NodeStatus::Uninitialized,
            NodeStatus::WaitingForSsh,
            NodeStatus::SyncingFiles,
            NodeStatus::SettingUp,
            NodeStatus::UpToDate,
            NodeStatus::UpdateFailed,
        ] {
            assert_eq!(status.as_str().parse::<NodeStatus>().unwrap(), status);
        }
        assert!("running".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(NodeStatus::UpToDate.is_terminal());
        assert!(NodeStatus::UpdateFailed.is_terminal());
        assert!(!NodeStatus::SettingUp.is_terminal());
    }
}
