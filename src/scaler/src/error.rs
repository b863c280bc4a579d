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

use cloudtik_common::config::ConfigParseError;
use cloudtik_common::types::NodeId;
use thiserror::Error;

use crate::provider::ProviderError;

pub type ScaleResult<T> = std::result::Result<T, ScaleError>;

#[derive(Error, Debug)]
pub enum ScaleError {
    #[error("invalid cluster config: {0}")]
    Config(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("command exited with code {code}: {}", .cmd.join(" "))]
    CommandFailed { code: i32, cmd: Vec<String> },
    #[error("node {0} never became reachable within the deadline")]
    UpdaterTimeout(NodeId),
    #[error("cluster invariant violated: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ScaleError {
    /// Errors that must surface to the owner instead of being absorbed at
    /// the tick boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScaleError::Config(_) | ScaleError::Provider(ProviderError::Fatal(_))
        )
    }
}

impl From<ConfigParseError> for ScaleError {
    fn from(error: ConfigParseError) -> Self {
        ScaleError::Config(error.to_string())
    }
}
