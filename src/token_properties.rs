//! Token properties: fee-on-transfer detection through an on-chain fee
//! detector, cached per token.
//!
//! The detector simulates a flash-borrow of the token against a base token and
//! reports the buy and sell fees it observed. Tokens it cannot evaluate come
//! back without fee data and are not cached, so a later request retries them.

use crate::cache::CacheProvider;
use crate::chain::{ChainId, NetworkDescriptor};
use crate::contracts::token_fee_detector::ValidateCall;
use crate::error::Result;
use crate::metrics;
use crate::multicall::{Call, CallResult, Multicall};
use crate::provider::{DataProvider, TokenFeeProvider};
use crate::tokens::TokenRequest;
use async_trait::async_trait;
use ethers::abi::{AbiEncode, ParamType};
use ethers::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Amount of the token the detector borrows to measure its fees.
pub const DEFAULT_AMOUNT_TO_FLASH_BORROW: u64 = 100_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFeeResult {
    pub buy_fee_bps: Option<u32>,
    pub sell_fee_bps: Option<u32>,
}

impl TokenFeeResult {
    /// Whether the detector produced any fee at all.
    pub fn is_known(&self) -> bool {
        self.buy_fee_bps.is_some() || self.sell_fee_bps.is_some()
    }

    pub fn has_fee(&self) -> bool {
        self.buy_fee_bps.unwrap_or(0) > 0 || self.sell_fee_bps.unwrap_or(0) > 0
    }
}

pub type TokenFeeMap = BTreeMap<Address, TokenFeeResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenValidationResult {
    Unknown,
    FeeOnTransfer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenProperties {
    pub fee: Option<TokenFeeResult>,
    pub validation: Option<TokenValidationResult>,
}

impl TokenProperties {
    fn from_fee(fee: Option<TokenFeeResult>) -> Self {
        match fee {
            Some(fee) if fee.is_known() => Self {
                fee: Some(fee),
                validation: fee.has_fee().then_some(TokenValidationResult::FeeOnTransfer),
            },
            _ => Self::default(),
        }
    }

    pub fn is_fee_on_transfer(&self) -> bool {
        self.validation == Some(TokenValidationResult::FeeOnTransfer)
    }
}

pub type TokenPropertiesMap = BTreeMap<Address, TokenProperties>;

fn decode_fees(result: &CallResult) -> TokenFeeResult {
    if !result.success {
        return TokenFeeResult::default();
    }
    let Ok(tokens) = ethers::abi::decode(
        &[ParamType::Uint(256), ParamType::Uint(256)],
        result.return_data.as_ref(),
    ) else {
        return TokenFeeResult::default();
    };
    let bps = |i: usize| {
        tokens
            .get(i)
            .and_then(|t| t.clone().into_uint())
            .and_then(|v| u32::try_from(v).ok())
    };
    TokenFeeResult {
        buy_fee_bps: bps(0),
        sell_fee_bps: bps(1),
    }
}

/// Calls the fee detector's `validate` once per token through Multicall3.
/// Networks without a detector, or without a base token to borrow against,
/// report no fees.
pub struct OnChainTokenFeeFetcher<M: Middleware> {
    chain_id: ChainId,
    multicall: Multicall<M>,
    detector: Option<Address>,
    base_token: Option<Address>,
    amount_to_borrow: U256,
}

impl<M: Middleware + 'static> OnChainTokenFeeFetcher<M> {
    pub fn new(multicall: Multicall<M>, descriptor: &NetworkDescriptor) -> Self {
        Self {
            chain_id: descriptor.chain_id,
            multicall,
            detector: descriptor.addresses.token_fee_detector,
            base_token: descriptor.base_tokens.first().copied(),
            amount_to_borrow: U256::from(DEFAULT_AMOUNT_TO_FLASH_BORROW),
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> DataProvider for OnChainTokenFeeFetcher<M> {
    type Key = TokenRequest;
    type Value = TokenFeeMap;

    fn name(&self) -> &str {
        "token_fee_onchain"
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, request: &TokenRequest) -> Result<TokenFeeMap> {
        let (Some(detector), Some(base_token)) = (self.detector, self.base_token) else {
            debug!(chain_id = %self.chain_id, "no fee detector on this network");
            return Ok(TokenFeeMap::new());
        };
        if request.addresses.is_empty() {
            return Ok(TokenFeeMap::new());
        }

        let calls = request
            .addresses
            .iter()
            .map(|token| Call {
                target: detector,
                call_data: ValidateCall {
                    token: *token,
                    base_token,
                    amount_to_borrow: self.amount_to_borrow,
                }
                .encode()
                .into(),
            })
            .collect();
        let block = request
            .block_number
            .map(|b| BlockId::Number(BlockNumber::Number(b.into())));
        let results = self.multicall.run(calls, block).await?;

        Ok(request
            .addresses
            .iter()
            .zip(results.iter())
            .map(|(token, result)| (*token, decode_fees(result)))
            .collect())
    }
}

/// Per-token cache in front of a fee fetcher. A failed fetch is logged and
/// the affected tokens come back with unknown properties.
pub struct CachingTokenPropertiesProvider {
    chain_id: ChainId,
    cache: Arc<dyn CacheProvider<Address, TokenProperties>>,
    ttl: Duration,
    fee_fetcher: TokenFeeProvider,
}

impl CachingTokenPropertiesProvider {
    pub fn new(
        chain_id: ChainId,
        cache: Arc<dyn CacheProvider<Address, TokenProperties>>,
        ttl: Duration,
        fee_fetcher: TokenFeeProvider,
    ) -> Self {
        Self {
            chain_id,
            cache,
            ttl,
            fee_fetcher,
        }
    }
}

#[async_trait]
impl DataProvider for CachingTokenPropertiesProvider {
    type Key = TokenRequest;
    type Value = TokenPropertiesMap;

    fn name(&self) -> &str {
        "token_properties"
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, request: &TokenRequest) -> Result<TokenPropertiesMap> {
        let mut properties = TokenPropertiesMap::new();
        let mut missing = Vec::new();
        for address in &request.addresses {
            match self.cache.get(address).await {
                Ok(Some(cached)) => {
                    metrics::increment_cache_hit(self.cache.name());
                    properties.insert(*address, cached);
                }
                Ok(None) => {
                    metrics::increment_cache_miss(self.cache.name());
                    missing.push(*address);
                }
                Err(e) => {
                    warn!(cache = %self.cache.name(), error = %e, "token properties cache unavailable");
                    metrics::increment_cache_tier_error(self.cache.name());
                    missing.push(*address);
                }
            }
        }
        if missing.is_empty() {
            return Ok(properties);
        }

        let fees = match self
            .fee_fetcher
            .fetch(&TokenRequest::new(missing.iter().copied(), request.block_number))
            .await
        {
            Ok(fees) => fees,
            Err(e) => {
                warn!(chain_id = %self.chain_id, error = %e, "token fee fetch failed");
                TokenFeeMap::new()
            }
        };

        let mut fee_on_transfer = 0usize;
        for address in missing {
            let props = TokenProperties::from_fee(fees.get(&address).copied());
            if props.fee.is_some() {
                if props.is_fee_on_transfer() {
                    fee_on_transfer += 1;
                }
                if let Err(e) = self.cache.set(address, props, self.ttl).await {
                    warn!(cache = %self.cache.name(), error = %e, "failed to cache token properties");
                }
            }
            properties.insert(address, props);
        }
        if fee_on_transfer > 0 {
            info!(chain_id = %self.chain_id, count = fee_on_transfer, "fee-on-transfer tokens detected");
        }
        Ok(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::error::ProviderError;
    use ethers::abi::Token as AbiToken;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedFees {
        fees: TokenFeeMap,
        fail: bool,
        calls: AtomicUsize,
    }

    impl ScriptedFees {
        fn new(fees: TokenFeeMap, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fees,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DataProvider for ScriptedFees {
        type Key = TokenRequest;
        type Value = TokenFeeMap;

        fn name(&self) -> &str {
            "scripted_fees"
        }

        async fn fetch(&self, request: &TokenRequest) -> Result<TokenFeeMap> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::unavailable("scripted_fees", "rpc down"));
            }
            Ok(request
                .addresses
                .iter()
                .filter_map(|a| self.fees.get(a).map(|f| (*a, *f)))
                .collect())
        }
    }

    fn provider(fetcher: Arc<ScriptedFees>) -> CachingTokenPropertiesProvider {
        CachingTokenPropertiesProvider::new(
            ChainId::MODE,
            Arc::new(InMemoryCache::new("token_properties")),
            Duration::from_secs(30_000),
            fetcher,
        )
    }

    #[tokio::test]
    async fn test_fee_tokens_are_flagged_and_cached() {
        let taxed = Address::repeat_byte(1);
        let plain = Address::repeat_byte(2);
        let unknown = Address::repeat_byte(3);
        let fees: TokenFeeMap = [
            (
                taxed,
                TokenFeeResult {
                    buy_fee_bps: Some(300),
                    sell_fee_bps: Some(500),
                },
            ),
            (
                plain,
                TokenFeeResult {
                    buy_fee_bps: Some(0),
                    sell_fee_bps: Some(0),
                },
            ),
        ]
        .into_iter()
        .collect();
        let fetcher = ScriptedFees::new(fees, false);
        let provider = provider(fetcher.clone());

        let request = TokenRequest::new([taxed, plain, unknown], None);
        let result = provider.fetch(&request).await.unwrap();
        assert!(result[&taxed].is_fee_on_transfer());
        assert_eq!(result[&taxed].fee.unwrap().sell_fee_bps, Some(500));
        assert!(!result[&plain].is_fee_on_transfer());
        assert!(result[&plain].fee.is_some());
        assert_eq!(result[&unknown], TokenProperties::default());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // Known tokens come from the cache; only the unknown one is refetched.
        provider.fetch(&request).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        provider.fetch(&TokenRequest::new([taxed, plain], None)).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_yields_unknown_properties() {
        let token = Address::repeat_byte(7);
        let fetcher = ScriptedFees::new(TokenFeeMap::new(), true);
        let provider = provider(fetcher.clone());

        let result = provider.fetch(&TokenRequest::new([token], None)).await.unwrap();
        assert_eq!(result[&token], TokenProperties::default());

        provider.fetch(&TokenRequest::new([token], None)).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_decode_fees_bounds_values() {
        let ok = CallResult {
            success: true,
            return_data: ethers::abi::encode(&[AbiToken::Uint(U256::from(100)), AbiToken::Uint(U256::zero())])
                .into(),
        };
        assert_eq!(
            decode_fees(&ok),
            TokenFeeResult {
                buy_fee_bps: Some(100),
                sell_fee_bps: Some(0),
            }
        );

        let oversized = CallResult {
            success: true,
            return_data: ethers::abi::encode(&[AbiToken::Uint(U256::MAX), AbiToken::Uint(U256::from(25))]).into(),
        };
        assert_eq!(decode_fees(&oversized).buy_fee_bps, None);
        assert_eq!(decode_fees(&oversized).sell_fee_bps, Some(25));

        let reverted = CallResult {
            success: false,
            return_data: Bytes::default(),
        };
        assert!(!decode_fees(&reverted).is_known());
    }
}
