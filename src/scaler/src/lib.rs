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

//! The cluster scaling control loop: heartbeat tracking, per-node
//! bootstrap, and the reconciliation tick that drives a fleet of cloud
//! nodes toward the configured cluster shape.

pub mod config;
pub mod demand;
pub mod error;
pub mod heartbeat;
pub mod monitor;
pub mod provider;
pub mod runner;
pub mod scaler;
pub mod updater;

pub use error::{ScaleError, ScaleResult};
pub use scaler::{start_cluster_scaler, ClusterScaler, ClusterScalerOpts};
