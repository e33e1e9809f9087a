// src/rpc.rs

use crate::chain::ChainId;
use crate::error::{ProviderError, Result};
use ethers::prelude::{Http, Provider};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Builds a timeout-bound HTTP JSON-RPC provider for one network.
pub fn build_http_provider(
    chain_id: ChainId,
    url: &str,
    timeout: Duration,
) -> Result<Arc<Provider<Http>>> {
    let parsed = Url::parse(url).map_err(|e| ProviderError::InvalidConfiguration {
        chain_id,
        key: chain_id.rpc_env_key(),
        message: format!("invalid rpc url: {e}"),
    })?;

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::InvalidConfiguration {
            chain_id,
            key: chain_id.rpc_env_key(),
            message: format!("failed to build http client: {e}"),
        })?;

    let http = Http::new_with_client(parsed, client);
    Ok(Arc::new(Provider::new(http)))
}

/// Host part of an endpoint, for logs and metric labels. Never the full URL,
/// which often carries an API key.
pub fn endpoint_label(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}
