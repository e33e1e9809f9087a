//! Error taxonomy shared by every provider in the crate.
//!
//! Failures on the authoritative path propagate to the caller unchanged.
//! Failures on a shadow or comparison path are absorbed by the component that
//! owns that path and only surface through [`crate::telemetry::EventSink`].

use crate::chain::ChainId;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// A required endpoint or credential is absent for one network.
    #[error("configuration missing for chain {chain_id}: {key}")]
    ConfigurationMissing { chain_id: ChainId, key: String },

    /// A configured value is present but cannot be used.
    #[error("invalid configuration for chain {chain_id}: {key}: {message}")]
    InvalidConfiguration {
        chain_id: ChainId,
        key: String,
        message: String,
    },

    #[error("upstream {provider} unavailable: {message}")]
    UpstreamUnavailable { provider: String, message: String },

    #[error("upstream {provider} timed out after {timeout:?}")]
    UpstreamTimeout { provider: String, timeout: Duration },

    /// Every candidate of a fallback chain without a terminal element failed.
    #[error("fallback chain '{chain}' exhausted after {attempts} attempts: {last_error}")]
    ChainExhausted {
        chain: String,
        attempts: usize,
        last_error: Box<ProviderError>,
    },

    #[error("chain {0} is not supported by this router")]
    UnsupportedNetwork(ChainId),

    #[error("chain {chain_id} is misconfigured and cannot serve requests: {reason}")]
    NetworkUnusable { chain_id: ChainId, reason: String },

    #[error("snapshot object {bucket}/{key} not found")]
    SnapshotNotFound { bucket: String, key: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    pub fn unavailable(provider: impl Into<String>, err: impl Display) -> Self {
        Self::UpstreamUnavailable {
            provider: provider.into(),
            message: err.to_string(),
        }
    }

    pub fn timeout(provider: impl Into<String>, timeout: Duration) -> Self {
        Self::UpstreamTimeout {
            provider: provider.into(),
            timeout,
        }
    }

    pub fn missing(chain_id: ChainId, key: impl Into<String>) -> Self {
        Self::ConfigurationMissing {
            chain_id,
            key: key.into(),
        }
    }

    /// Timeouts are treated as unavailability everywhere a caller branches on it.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable { .. } | Self::UpstreamTimeout { .. }
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationMissing { .. } | Self::InvalidConfiguration { .. }
        )
    }
}

impl From<ethers::providers::ProviderError> for ProviderError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        Self::unavailable("rpc", err)
    }
}

impl From<ethers::abi::Error> for ProviderError {
    fn from(err: ethers::abi::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::unavailable("http", err)
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_counts_as_unavailable() {
        let err = ProviderError::timeout("rpc", Duration::from_secs(5));
        assert!(err.is_unavailable());
        assert!(!err.is_configuration());

        let missing = ProviderError::missing(ChainId::MODE, "WEB3_RPC_34443");
        assert!(missing.is_configuration());
        assert!(!missing.is_unavailable());
    }

    #[test]
    fn test_chain_exhausted_keeps_last_error() {
        let err = ProviderError::ChainExhausted {
            chain: "simulator".to_string(),
            attempts: 2,
            last_error: Box::new(ProviderError::unavailable("tenderly", "503")),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("simulator"));
        assert!(rendered.contains("503"));
    }
}
