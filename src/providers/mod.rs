//! Model provider clients.

pub mod base;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::config::schema::ProvidersConfig;
use base::ModelProvider;
use http::HttpProvider;

/// Build a provider instance per configured endpoint.
pub fn build_providers(config: &ProvidersConfig) -> HashMap<String, Arc<dyn ModelProvider>> {
    let mut providers: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
    for (id, endpoint) in &config.endpoints {
        providers.insert(id.clone(), Arc::new(HttpProvider::new(id, endpoint)));
    }
    if !providers.is_empty() {
        info!(
            "Configured {} providers: {:?}",
            providers.len(),
            providers.keys().collect::<Vec<_>>()
        );
    }
    providers
}
