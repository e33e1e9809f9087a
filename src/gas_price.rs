//! Gas price readers. The composite prefers EIP-1559 fee estimation and
//! falls back to `eth_gasPrice`; the container puts a short-lived cache in
//! front of it.

use crate::chain::ChainId;
use crate::error::{ProviderError, Result};
use crate::fallback::FallbackChain;
use crate::provider::{DataProvider, GasPriceProvider};
use crate::telemetry::ProviderContext;
use async_trait::async_trait;
use ethers::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasPriceSource {
    Eip1559,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasPrice {
    pub wei: U256,
    pub source: GasPriceSource,
}

async fn bounded<T, F>(provider: &str, timeout: Duration, call: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, String>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(ProviderError::unavailable(provider, message)),
        Err(_) => Err(ProviderError::timeout(provider, timeout)),
    }
}

/// `maxFeePerGas` from the node's EIP-1559 estimate.
pub struct Eip1559GasPriceProvider<M: Middleware> {
    chain_id: ChainId,
    provider: Arc<M>,
    timeout: Duration,
}

impl<M: Middleware + 'static> Eip1559GasPriceProvider<M> {
    pub fn new(chain_id: ChainId, provider: Arc<M>, timeout: Duration) -> Self {
        Self {
            chain_id,
            provider,
            timeout,
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> DataProvider for Eip1559GasPriceProvider<M> {
    type Key = ();
    type Value = GasPrice;

    fn name(&self) -> &str {
        "gas_price_eip1559"
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, _key: &()) -> Result<GasPrice> {
        let (max_fee, _priority) = bounded(self.name(), self.timeout, async {
            self.provider
                .estimate_eip1559_fees(None)
                .await
                .map_err(|e| e.to_string())
        })
        .await?;
        Ok(GasPrice {
            wei: max_fee,
            source: GasPriceSource::Eip1559,
        })
    }
}

/// `eth_gasPrice`.
pub struct LegacyGasPriceProvider<M: Middleware> {
    chain_id: ChainId,
    provider: Arc<M>,
    timeout: Duration,
}

impl<M: Middleware + 'static> LegacyGasPriceProvider<M> {
    pub fn new(chain_id: ChainId, provider: Arc<M>, timeout: Duration) -> Self {
        Self {
            chain_id,
            provider,
            timeout,
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> DataProvider for LegacyGasPriceProvider<M> {
    type Key = ();
    type Value = GasPrice;

    fn name(&self) -> &str {
        "gas_price_legacy"
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, _key: &()) -> Result<GasPrice> {
        let wei = bounded(self.name(), self.timeout, async {
            self.provider.get_gas_price().await.map_err(|e| e.to_string())
        })
        .await?;
        Ok(GasPrice {
            wei,
            source: GasPriceSource::Legacy,
        })
    }
}

/// EIP-1559 first, legacy when it fails. Evaluated on every call.
pub struct OnChainGasPriceProvider {
    chain_id: ChainId,
    ctx: ProviderContext,
    eip1559: GasPriceProvider,
    legacy: GasPriceProvider,
}

impl OnChainGasPriceProvider {
    pub fn new(
        chain_id: ChainId,
        ctx: ProviderContext,
        eip1559: GasPriceProvider,
        legacy: GasPriceProvider,
    ) -> Self {
        Self {
            chain_id,
            ctx,
            eip1559,
            legacy,
        }
    }
}

#[async_trait]
impl DataProvider for OnChainGasPriceProvider {
    type Key = ();
    type Value = GasPrice;

    fn name(&self) -> &str {
        "gas_price_onchain"
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, key: &()) -> Result<GasPrice> {
        FallbackChain::new(format!("gas_price:{}", self.chain_id), self.ctx.clone())
            .candidate(self.eip1559.name().to_string(), || self.eip1559.fetch(key))
            .candidate(self.legacy.name().to_string(), || self.legacy.fetch(key))
            .try_build()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        outcome: Option<GasPrice>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DataProvider for Fixed {
        type Key = ();
        type Value = GasPrice;

        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(&self, _key: &()) -> Result<GasPrice> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
                .ok_or_else(|| ProviderError::unavailable(self.name, "method not found"))
        }
    }

    fn fixed(name: &'static str, outcome: Option<GasPrice>) -> Arc<Fixed> {
        Arc::new(Fixed {
            name,
            outcome,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_prefers_eip1559() {
        let eip = fixed(
            "eip1559",
            Some(GasPrice {
                wei: U256::from(30),
                source: GasPriceSource::Eip1559,
            }),
        );
        let legacy = fixed("legacy", None);
        let provider =
            OnChainGasPriceProvider::new(ChainId::MODE, ProviderContext::null(), eip.clone(), legacy.clone());

        let price = provider.fetch(&()).await.unwrap();
        assert_eq!(price.source, GasPriceSource::Eip1559);
        assert_eq!(legacy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_legacy() {
        let eip = fixed("eip1559", None);
        let legacy = fixed(
            "legacy",
            Some(GasPrice {
                wei: U256::from(7),
                source: GasPriceSource::Legacy,
            }),
        );
        let provider =
            OnChainGasPriceProvider::new(ChainId::MODE, ProviderContext::null(), eip.clone(), legacy);

        let price = provider.fetch(&()).await.unwrap();
        assert_eq!(price.wei, U256::from(7));

        // Evaluated per call, not once at construction.
        provider.fetch(&()).await.unwrap();
        assert_eq!(eip.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_both_failing_is_exhausted() {
        let provider = OnChainGasPriceProvider::new(
            ChainId::MODE,
            ProviderContext::null(),
            fixed("a", None),
            fixed("b", None),
        );
        let err = provider.fetch(&()).await.unwrap_err();
        assert!(matches!(err, ProviderError::ChainExhausted { attempts: 2, .. }));
    }
}
