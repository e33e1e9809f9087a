//! Cached routes keyed by pair, trade type and chain.
//!
//! Entries expire by block: an entry written at block `b` with
//! `blocks_to_live = n` is served up to block `b + n`. Reads state their tier
//! through [`RouteCacheRead`]; unvalidated entries are only visible to an
//! optimistic read. Writes honour [`CacheMode`].

use crate::chain::{network_descriptor, ChainId};
use crate::error::Result;
use crate::intent::{CacheMode, RouteCacheRead};
use crate::metrics;
use crate::quote::{QuoteRoute, TradeType};
use crate::telemetry::{ProviderContext, ProviderEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairTradeTypeChainId {
    pub token_in: Address,
    pub token_out: Address,
    pub trade_type: TradeType,
    pub chain_id: ChainId,
}

/// `<tokenIn>/<tokenOut>/<tradeType>/<chainId>` with lowercase addresses.
impl fmt::Display for PairTradeTypeChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}/{}/{}",
            self.token_in, self.token_out, self.trade_type, self.chain_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRoute {
    pub route: QuoteRoute,
    pub percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRoutes {
    pub routes: Vec<CachedRoute>,
    pub key: PairTradeTypeChainId,
    pub block_number: u64,
    pub blocks_to_live: u64,
    /// Set once a caching request has confirmed the routes.
    pub validated: bool,
}

impl CachedRoutes {
    pub fn is_fresh_at(&self, current_block: u64) -> bool {
        current_block <= self.block_number.saturating_add(self.blocks_to_live)
    }

    /// Wall-clock lifetime for stores that expire by time, using the
    /// network's block time when the network is known.
    pub fn ttl_secs(&self, default_seconds_per_block: u64) -> u64 {
        let seconds_per_block = network_descriptor(self.key.chain_id)
            .map(|d| d.seconds_per_block)
            .unwrap_or(default_seconds_per_block);
        self.blocks_to_live.saturating_mul(seconds_per_block)
    }

    pub fn visible_to(&self, read: RouteCacheRead) -> bool {
        self.validated || read.is_optimistic()
    }

    fn same_routes(&self, other: &CachedRoutes) -> bool {
        self.routes == other.routes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteCacheWrite {
    Written,
    /// The fresh routes were compared against the existing entry.
    Compared { written: bool, matched: Option<bool> },
}

/// Storage contract plus the read and write policy shared by every backend.
#[async_trait]
pub trait RouteCachingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Mode used when the request does not override it.
    fn default_mode(&self) -> CacheMode {
        CacheMode::Livemode
    }

    async fn load(&self, key: &PairTradeTypeChainId) -> Result<Option<CachedRoutes>>;

    async fn store(&self, routes: &CachedRoutes) -> Result<()>;

    async fn get(
        &self,
        key: &PairTradeTypeChainId,
        read: RouteCacheRead,
        current_block: u64,
    ) -> Result<Option<CachedRoutes>> {
        let entry = self.load(key).await?;
        Ok(entry.filter(|e| e.is_fresh_at(current_block) && e.visible_to(read)))
    }

    async fn set(
        &self,
        ctx: &ProviderContext,
        routes: CachedRoutes,
        mode: Option<CacheMode>,
    ) -> Result<RouteCacheWrite> {
        let mode = mode.unwrap_or_else(|| self.default_mode());
        if mode == CacheMode::Livemode {
            self.store(&routes).await?;
            return Ok(RouteCacheWrite::Written);
        }

        let existing = self.load(&routes.key).await?;
        let matched = existing.as_ref().map(|e| e.same_routes(&routes));
        if let Some(matched) = matched {
            metrics::increment_route_cache_comparison(if matched { "match" } else { "mismatch" });
            ctx.emit(ProviderEvent::CacheComparison {
                cache: self.name().to_string(),
                key: routes.key.to_string(),
                matched,
                detail: format!("mode={mode:?} block={}", routes.block_number),
            });
        }

        let written = mode == CacheMode::Tapcompare;
        if written {
            self.store(&routes).await?;
        }
        debug!(cache = %self.name(), key = %routes.key, ?mode, written, ?matched, "route cache write");
        Ok(RouteCacheWrite::Compared { written, matched })
    }
}

#[derive(Debug)]
pub struct InMemoryRouteCachingProvider {
    table_name: String,
    default_mode: CacheMode,
    entries: DashMap<PairTradeTypeChainId, CachedRoutes>,
}

impl InMemoryRouteCachingProvider {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            default_mode: CacheMode::Livemode,
            entries: DashMap::new(),
        }
    }

    pub fn with_default_mode(mut self, mode: CacheMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RouteCachingProvider for InMemoryRouteCachingProvider {
    fn name(&self) -> &str {
        &self.table_name
    }

    fn default_mode(&self) -> CacheMode {
        self.default_mode
    }

    async fn load(&self, key: &PairTradeTypeChainId) -> Result<Option<CachedRoutes>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn store(&self, routes: &CachedRoutes) -> Result<()> {
        self.entries.insert(routes.key, routes.clone());
        Ok(())
    }
}

/// Pairs, by token symbol, whose routes are populated into the cache. `*`
/// matches any token.
pub fn pairs_to_track(chain_id: ChainId, trade_type: TradeType) -> &'static [&'static str] {
    match (chain_id, trade_type) {
        (ChainId::MODE, TradeType::ExactInput) => &[
            "WETH/USDC",
            "USDC/WETH",
            "USDT/WETH",
            "WETH/USDT",
            "WETH/*",
            "USDC/*",
            "USDT/*",
            "DAI/*",
            "WBTC/*",
        ],
        (ChainId::MODE, TradeType::ExactOutput) => &["USDC/WETH", "*/WETH", "*/USDC", "*/USDT", "*/DAI"],
        _ => &[],
    }
}

pub fn should_track(chain_id: ChainId, trade_type: TradeType, symbol_in: &str, symbol_out: &str) -> bool {
    pairs_to_track(chain_id, trade_type).iter().any(|pair| {
        let Some((want_in, want_out)) = pair.split_once('/') else {
            return false;
        };
        let matches = |want: &str, got: &str| want == "*" || want.eq_ignore_ascii_case(got);
        matches(want_in, symbol_in) && matches(want_out, symbol_out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::FeeTier;
    use crate::intent::{Intent, RouteOperation};
    use crate::telemetry::ChannelSink;
    use std::sync::Arc;

    const PIX: &str = "0x4Bd692dbA81074BC2FA9abDcffE7324680d7A1c1";
    const LAMP: &str = "0xF7ca2401709BC01Eba07d46c8d59e865C983e1AC";

    fn key() -> PairTradeTypeChainId {
        PairTradeTypeChainId {
            token_in: PIX.parse().unwrap(),
            token_out: LAMP.parse().unwrap(),
            trade_type: TradeType::ExactInput,
            chain_id: ChainId::MODE,
        }
    }

    fn routes(block: u64, validated: bool, fee: FeeTier) -> CachedRoutes {
        let key = key();
        CachedRoutes {
            routes: vec![CachedRoute {
                route: QuoteRoute::new(vec![key.token_in, key.token_out], vec![fee]).unwrap(),
                percent: 100,
            }],
            key,
            block_number: block,
            blocks_to_live: 10,
            validated,
        }
    }

    #[test]
    fn test_ttl_follows_network_block_time() {
        let mode = routes(100, true, FeeTier::Low);
        assert_eq!(mode.ttl_secs(2), 10 * 60);

        let mut mainnet = mode.clone();
        mainnet.key.chain_id = ChainId::MAINNET;
        assert_eq!(mainnet.ttl_secs(2), 10 * 12);

        let mut unknown = mode;
        unknown.key.chain_id = ChainId(999_999);
        assert_eq!(unknown.ttl_secs(2), 20);
    }

    #[test]
    fn test_key_string_is_lowercase() {
        assert_eq!(
            key().to_string(),
            format!("{}/{}/0/34443", PIX.to_lowercase(), LAMP.to_lowercase())
        );
        let exact_out = PairTradeTypeChainId {
            trade_type: TradeType::ExactOutput,
            ..key()
        };
        assert!(exact_out.to_string().ends_with("/1/34443"));
    }

    #[tokio::test]
    async fn test_unvalidated_entries_need_optimistic_read() {
        let cache = InMemoryRouteCachingProvider::new("CachedRoutes");
        cache
            .set(&ProviderContext::null(), routes(100, false, FeeTier::Low), None)
            .await
            .unwrap();

        let populate = RouteOperation::for_intent(Intent::Caching);
        let serve = RouteOperation::for_intent(Intent::Quote);
        assert!(cache.get(&key(), populate.read(), 105).await.unwrap().is_none());
        assert!(cache.get(&key(), serve.read(), 105).await.unwrap().is_some());
        assert!(cache.get(&key(), serve.read(), 111).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tapcompare_writes_and_reports() {
        let (sink, mut events) = ChannelSink::new();
        let ctx = ProviderContext::new(Arc::new(sink));
        let cache = InMemoryRouteCachingProvider::new("CachedRoutes");
        cache.set(&ctx, routes(100, true, FeeTier::Low), None).await.unwrap();

        let outcome = cache
            .set(&ctx, routes(101, true, FeeTier::Medium), Some(CacheMode::Tapcompare))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RouteCacheWrite::Compared {
                written: true,
                matched: Some(false)
            }
        );
        assert_eq!(cache.load(&key()).await.unwrap().unwrap().block_number, 101);
        assert!(matches!(
            events.recv().await,
            Some(ProviderEvent::CacheComparison { matched: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_darkmode_never_writes() {
        let cache = InMemoryRouteCachingProvider::new("CachedRoutes").with_default_mode(CacheMode::Darkmode);
        let outcome = cache
            .set(&ProviderContext::null(), routes(100, true, FeeTier::Low), None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RouteCacheWrite::Compared {
                written: false,
                matched: None
            }
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pairs_to_track_wildcards() {
        assert!(should_track(ChainId::MODE, TradeType::ExactInput, "WETH", "PIX"));
        assert!(should_track(ChainId::MODE, TradeType::ExactOutput, "PIX", "usdc"));
        assert!(!should_track(ChainId::MODE, TradeType::ExactOutput, "WETH", "PIX"));
        assert!(!should_track(ChainId::MAINNET, TradeType::ExactInput, "WETH", "USDC"));
    }
}
