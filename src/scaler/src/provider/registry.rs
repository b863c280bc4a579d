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

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use super::{MockProvider, NodeProvider, ProviderError, ProviderResult};

type ProviderFactory =
    fn(provider_config: &serde_json::Value, cluster_name: &str) -> ProviderResult<Arc<dyn NodeProvider>>;

/// Process-wide name-to-factory table resolving `provider.type`.
///
/// Populated once at first use; there is no re-registration at runtime.
/// Cloud-specific adapters hook in through [`ProviderRegistry::global_with`]
/// before anything resolves a provider.
pub struct ProviderRegistry {
    factories: HashMap<&'static str, ProviderFactory>,
}

static GLOBAL_PROVIDER_REGISTRY: OnceLock<ProviderRegistry> = OnceLock::new();

impl ProviderRegistry {
    fn builtin() -> Self {
        let mut factories: HashMap<&'static str, ProviderFactory> = HashMap::new();
        factories.insert("mock", |provider_config, _cluster_name| {
            let cache_stopped = provider_config
                .get("cache_stopped_nodes")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Ok(Arc::new(MockProvider::new(cache_stopped)) as Arc<dyn NodeProvider>)
        });
        ProviderRegistry { factories }
    }

    /// The global registry, initialized with the builtin entries on first
    /// access.
    pub fn global() -> &'static Self {
        GLOBAL_PROVIDER_REGISTRY.get_or_init(Self::builtin)
    }

    /// One-shot initializer for programs that ship extra provider adapters.
    /// Returns `false` if the registry was already initialized.
    pub fn global_with(extra: HashMap<&'static str, ProviderFactory>) -> bool {
        GLOBAL_PROVIDER_REGISTRY
            .set({
                let mut registry = Self::builtin();
                registry.factories.extend(extra);
                registry
            })
            .is_ok()
    }

    /// Instantiates the provider named by `provider_config["type"]`.
    pub fn resolve(
        &self,
        provider_config: &serde_json::Value,
        cluster_name: &str,
    ) -> ProviderResult<Arc<dyn NodeProvider>> {
        let provider_type = provider_config
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::Fatal("provider config has no type".to_string()))?;
        let factory = self.factories.get(provider_type).ok_or_else(|| {
            ProviderError::Fatal(format!("unknown provider type: {}", provider_type))
        })?;
        factory(provider_config, cluster_name)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_resolve_mock_provider() {
        let registry = ProviderRegistry::global();
        let config = json!({"type": "mock", "region": "us-east-1"});
        assert!(registry.resolve(&config, "default").is_ok());
    }

    #[test]
    fn test_unknown_provider_type_is_fatal() {
        let registry = ProviderRegistry::global();
        let config = json!({"type": "no-such-cloud"});
        let err = match registry.resolve(&config, "default") {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, ProviderError::Fatal(_)));
    }
}
