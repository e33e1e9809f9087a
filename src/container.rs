//! # Container Assembler
//!
//! Builds, once per process and for every configured network, the bundle of
//! providers the router consumes. Networks are built concurrently and
//! independently: a network whose configuration is incomplete is marked
//! unusable and every other network still comes up.
//!
//! ## Per-network wiring
//!
//! ```text
//! rpc transport ─ multicall ─ V3PoolProvider (source of truth)
//!                              ├─ CachingProvider (in memory)    = current ─┐
//!                              └─ StoreCachingPoolProvider (store) = target ─┴─ TrafficSwitchProvider
//!               ─ OnChainQuoteProvider (x2 + TrafficSwitchProvider when the network is migrating)
//!               ─ subgraph: compressed snapshot → snapshot → static
//!               ─ tokens: cache → token list → on chain
//!               ─ blocked tokens: cache → unsupported token list
//!               ─ token properties: cache → fee detector
//!               ─ gas price: cache → (EIP-1559 → legacy)
//!               ─ simulator: remote → eth_estimateGas
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sor_provider_sdk::chain::ChainId;
//! use sor_provider_sdk::container::{ContainerAssembler, ExternalServices};
//! use sor_provider_sdk::settings::Settings;
//! use sor_provider_sdk::telemetry::ProviderContext;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = Settings::new()?;
//! let services = ExternalServices::from_settings(&settings).await?;
//! let container = ContainerAssembler::new(settings, services, ProviderContext::tracing())
//!     .build()
//!     .await;
//! let deps = container.dependencies_for(ChainId::MODE)?;
//! # Ok(())
//! # }
//! ```

use crate::cache::{CachingProvider, InMemoryCache};
use crate::chain::{ChainId, NetworkDescriptor};
use crate::error::{ProviderError, Result};
use crate::gas_price::{Eip1559GasPriceProvider, LegacyGasPriceProvider, OnChainGasPriceProvider};
use crate::metrics;
use crate::multicall::Multicall;
use crate::pool_store::{InMemoryPoolStore, PoolStore, StoreCachingPoolProvider};
use crate::pools::{PoolAccessorComparator, PoolAddressing, V3PoolProvider};
use crate::provider::{
    DataProvider, GasPriceProvider, PoolProvider, QuoteProvider, SubgraphProvider, TokenProvider,
    TokenPropertiesProvider, TokenValidationProvider,
};
use crate::quote::{OnChainQuoteProvider, QuoteBatchComparator};
use crate::redis_manager::RedisManager;
use crate::route_cache::{InMemoryRouteCachingProvider, RouteCachingProvider};
use crate::rpc::{build_http_provider, endpoint_label};
use crate::settings::Settings;
use crate::simulator::{EthEstimateGasSimulator, FallbackSimulator, Simulator, TenderlySimulator};
use crate::subgraph::{build_subgraph_provider, HttpSnapshotStore, SnapshotStore};
use crate::telemetry::{ProviderContext, ProviderEvent};
use crate::token_properties::{CachingTokenPropertiesProvider, OnChainTokenFeeFetcher};
use crate::tokens::{
    build_blocked_token_list_provider, build_token_list_provider, CachingTokenProviderWithFallback,
    OnChainTokenProvider, TokenValidatorProvider,
};
use crate::traffic_switch::{SwitchHandle, TrafficSwitchProvider};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Fully wired providers for one network. Immutable once built.
pub struct NetworkDependencies {
    pub chain_id: ChainId,
    pub descriptor: NetworkDescriptor,
    pub pool_provider: PoolProvider,
    pub pool_switch: SwitchHandle,
    pub quote_provider: QuoteProvider,
    /// Present when the quote provider is being migrated on this network.
    pub quote_switch: Option<SwitchHandle>,
    pub subgraph_provider: SubgraphProvider,
    pub token_provider: TokenProvider,
    /// Tokens the router must not route through.
    pub blocked_token_list_provider: TokenProvider,
    pub token_validator: TokenValidationProvider,
    pub token_properties_provider: TokenPropertiesProvider,
    pub gas_price_provider: GasPriceProvider,
    pub simulator: Arc<dyn Simulator>,
    /// Absent unless a cached routes table is configured.
    pub route_caching_provider: Option<Arc<dyn RouteCachingProvider>>,
}

impl std::fmt::Debug for NetworkDependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkDependencies")
            .field("chain_id", &self.chain_id)
            .field("pool_provider", &self.pool_provider.name())
            .field("quote_provider", &self.quote_provider.name())
            .field("subgraph_provider", &self.subgraph_provider.name())
            .field("blocked_token_list_provider", &self.blocked_token_list_provider.name())
            .field("simulator", &self.simulator.name())
            .field(
                "route_caching_provider",
                &self.route_caching_provider.as_ref().map(|p| p.name().to_string()),
            )
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum NetworkBundle {
    Ready(Arc<NetworkDependencies>),
    /// Construction failed; requests must fail fast.
    Unusable(ProviderError),
}

impl NetworkBundle {
    pub fn is_ready(&self) -> bool {
        matches!(self, NetworkBundle::Ready(_))
    }
}

/// Collaborators shared by every network.
#[derive(Clone)]
pub struct ExternalServices {
    pub snapshot_store: Option<Arc<dyn SnapshotStore>>,
    pub pool_store: Arc<dyn PoolStore>,
    pub route_caching_provider: Option<Arc<dyn RouteCachingProvider>>,
}

impl ExternalServices {
    /// In-memory stores, no snapshot store.
    pub fn in_memory(settings: &Settings) -> Self {
        Self {
            snapshot_store: None,
            pool_store: Arc::new(InMemoryPoolStore::new(settings.pool_store.table_name.clone())),
            route_caching_provider: settings.route_cache.cached_routes_table().map(|table| {
                Arc::new(InMemoryRouteCachingProvider::new(table)) as Arc<dyn RouteCachingProvider>
            }),
        }
    }

    /// Snapshot store over HTTP when configured, Redis tiers when configured
    /// and compiled in, in-memory tiers otherwise.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let mut services = Self::in_memory(settings);

        if let Some(base_url) = &settings.snapshot.base_url {
            let store = HttpSnapshotStore::new(
                base_url.clone(),
                Duration::from_millis(settings.snapshot.timeout_ms),
            )?;
            info!(endpoint = %endpoint_label(base_url), "using http snapshot store");
            services.snapshot_store = Some(Arc::new(store));
        }

        if let Some(redis) = &settings.redis {
            match RedisManager::new(redis.clone()).await {
                Ok(manager) => services.attach_redis(settings, manager),
                Err(e) => warn!(error = %e, "redis unavailable, keeping in-memory stores"),
            }
        }
        Ok(services)
    }

    #[cfg(feature = "redis")]
    fn attach_redis(&mut self, settings: &Settings, manager: RedisManager) {
        use crate::redis_manager::{RedisPoolStore, RedisRouteCachingProvider};
        self.pool_store = Arc::new(RedisPoolStore::new(
            settings.pool_store.table_name.clone(),
            manager.clone(),
        ));
        if let Some(table) = settings.route_cache.cached_routes_table() {
            self.route_caching_provider = Some(Arc::new(RedisRouteCachingProvider::new(table, manager)));
        }
    }

    #[cfg(not(feature = "redis"))]
    fn attach_redis(&mut self, _settings: &Settings, _manager: RedisManager) {}
}

/// Built container: one bundle per configured network.
pub struct ContainerInjected {
    bundles: BTreeMap<ChainId, NetworkBundle>,
    ctx: ProviderContext,
}

impl ContainerInjected {
    pub fn from_bundles(bundles: BTreeMap<ChainId, NetworkBundle>, ctx: ProviderContext) -> Self {
        Self { bundles, ctx }
    }

    /// Fails fast for networks that are not configured or failed to build.
    pub fn dependencies_for(&self, chain_id: ChainId) -> Result<Arc<NetworkDependencies>> {
        match self.bundles.get(&chain_id) {
            Some(NetworkBundle::Ready(deps)) => Ok(deps.clone()),
            Some(NetworkBundle::Unusable(cause)) => Err(ProviderError::NetworkUnusable {
                chain_id,
                reason: cause.to_string(),
            }),
            None => Err(ProviderError::UnsupportedNetwork(chain_id)),
        }
    }

    /// Why a network failed to build.
    pub fn unusable_cause(&self, chain_id: ChainId) -> Option<&ProviderError> {
        match self.bundles.get(&chain_id) {
            Some(NetworkBundle::Unusable(cause)) => Some(cause),
            _ => None,
        }
    }

    pub fn bundle(&self, chain_id: ChainId) -> Option<&NetworkBundle> {
        self.bundles.get(&chain_id)
    }

    pub fn chains(&self) -> impl Iterator<Item = (&ChainId, &NetworkBundle)> {
        self.bundles.iter()
    }

    pub fn ready_chains(&self) -> Vec<ChainId> {
        self.bundles
            .iter()
            .filter(|(_, b)| b.is_ready())
            .map(|(c, _)| *c)
            .collect()
    }

    pub fn context(&self) -> &ProviderContext {
        &self.ctx
    }
}

pub struct ContainerAssembler {
    settings: Arc<Settings>,
    services: ExternalServices,
    ctx: ProviderContext,
}

impl ContainerAssembler {
    pub fn new(settings: Settings, services: ExternalServices, ctx: ProviderContext) -> Self {
        Self {
            settings: Arc::new(settings),
            services,
            ctx,
        }
    }

    /// Builds every configured network concurrently. Never fails as a whole.
    pub async fn build(self) -> ContainerInjected {
        let chains = self.settings.supported_chains();
        info!(networks = chains.len(), activity_id = %self.ctx.activity_id, "assembling provider container");

        let this = &self;
        let builds = chains
            .iter()
            .map(|chain_id| async move { (*chain_id, this.build_network(*chain_id).await) });
        let results = join_all(builds).await;

        let mut bundles = BTreeMap::new();
        for (chain_id, result) in results {
            let bundle = match result {
                Ok(deps) => {
                    info!(chain_id = %chain_id, deps = ?deps, "network ready");
                    NetworkBundle::Ready(Arc::new(deps))
                }
                Err(e) => {
                    error!(chain_id = %chain_id, error = %e, fatal = true, "network unusable");
                    metrics::increment_network_unusable(chain_id.0);
                    self.ctx.emit(ProviderEvent::NetworkUnusable {
                        chain_id,
                        reason: e.to_string(),
                    });
                    NetworkBundle::Unusable(e)
                }
            };
            bundles.insert(chain_id, bundle);
        }
        ContainerInjected::from_bundles(bundles, self.ctx)
    }

    async fn build_network(&self, chain_id: ChainId) -> Result<NetworkDependencies> {
        let settings = &self.settings;
        let ctx = self.ctx.clone();
        let descriptor = settings.descriptor_for(chain_id)?;
        let rpc_url = settings.rpc_url(chain_id)?;
        let provider = build_http_provider(chain_id, &rpc_url, descriptor.rpc_timeout)?;
        info!(
            chain_id = %chain_id,
            network = descriptor.name,
            endpoint = %endpoint_label(&rpc_url),
            timeout_ms = descriptor.rpc_timeout.as_millis() as u64,
            "building network bundle"
        );

        let multicall = Multicall::new(
            provider.clone(),
            descriptor.addresses.multicall,
            descriptor.non_optimistic_batch_params.multicall_chunk,
        )
        .with_gas_limit_per_call(descriptor.multicall_gas_limit_per_call)
        .with_timeout(descriptor.rpc_timeout);

        // Pools: in-memory cache vs durable store, raw provider as source of truth.
        let addressing = PoolAddressing::from_descriptor(&descriptor)?;
        let raw_pools = Arc::new(V3PoolProvider::new(chain_id, multicall.clone(), addressing));
        let in_memory_pools: PoolProvider = Arc::new(CachingProvider::in_memory(
            raw_pools.clone(),
            &format!("pools:{chain_id}"),
            settings.cache_ttl.pool(),
        ));
        let store_pools: PoolProvider = Arc::new(StoreCachingPoolProvider::new(
            chain_id,
            self.services.pool_store.clone(),
            raw_pools.clone(),
            addressing,
        ));
        let pool_switch = TrafficSwitchProvider::builder(format!("pool:{chain_id}"))
            .current(in_memory_pools)
            .target(store_pools)
            .source_of_truth(raw_pools)
            .comparator(Arc::new(PoolAccessorComparator))
            .config(settings.traffic_switch.pool.clone())
            .context(ctx.clone())
            .build()?;
        let pool_handle = pool_switch.handle();
        let pool_provider: PoolProvider = Arc::new(pool_switch);

        // Quotes.
        let current_quotes: QuoteProvider = Arc::new(OnChainQuoteProvider::new(
            "quote_onchain_current",
            provider.clone(),
            &descriptor,
        )?);
        let (quote_provider, quote_switch) = if descriptor.quote_migration {
            let target_quotes: QuoteProvider = Arc::new(OnChainQuoteProvider::new(
                "quote_onchain_target",
                provider.clone(),
                &descriptor,
            )?);
            let switch = TrafficSwitchProvider::builder(format!("quote:{chain_id}"))
                .current(current_quotes)
                .target(target_quotes)
                .comparator(Arc::new(QuoteBatchComparator))
                .config(settings.traffic_switch.quote.clone())
                .context(ctx.clone())
                .build()?;
            let handle = switch.handle();
            (Arc::new(switch) as QuoteProvider, Some(handle))
        } else {
            (current_quotes, None)
        };

        let subgraph_provider = build_subgraph_provider(
            ctx.clone(),
            chain_id,
            self.services.snapshot_store.clone(),
            settings.snapshot_locations(),
            pool_provider.clone(),
            descriptor.base_tokens.clone(),
        )
        .await;

        // Tokens.
        let token_list: TokenProvider = Arc::new(
            build_token_list_provider(
                ctx.clone(),
                chain_id,
                self.services.snapshot_store.clone(),
                settings.token_list_source(),
                descriptor.rpc_timeout,
            )
            .await,
        );
        let on_chain_tokens: TokenProvider =
            Arc::new(OnChainTokenProvider::new(chain_id, multicall.clone()));
        let token_provider: TokenProvider = Arc::new(CachingTokenProviderWithFallback::new(
            chain_id,
            Arc::new(InMemoryCache::new(format!("tokens:{chain_id}"))),
            settings.cache_ttl.token(),
            token_list,
            on_chain_tokens,
        ));
        let blocked_token_list_provider: TokenProvider = Arc::new(
            build_blocked_token_list_provider(
                ctx.clone(),
                chain_id,
                settings.blocked_token_list_source(),
                descriptor.rpc_timeout,
                settings.cache_ttl.blocked_token(),
            )
            .await,
        );
        let token_validator: TokenValidationProvider = Arc::new(CachingProvider::in_memory(
            TokenValidatorProvider::new(chain_id, multicall.clone()),
            &format!("token_validation:{chain_id}"),
            settings.cache_ttl.token_validation(),
        ));
        let token_properties_provider: TokenPropertiesProvider =
            Arc::new(CachingTokenPropertiesProvider::new(
                chain_id,
                Arc::new(InMemoryCache::new(format!("token_properties:{chain_id}"))),
                settings.cache_ttl.token_properties(),
                Arc::new(OnChainTokenFeeFetcher::new(multicall.clone(), &descriptor)),
            ));

        // Gas price.
        let on_chain_gas = OnChainGasPriceProvider::new(
            chain_id,
            ctx.clone(),
            Arc::new(Eip1559GasPriceProvider::new(
                chain_id,
                provider.clone(),
                descriptor.rpc_timeout,
            )),
            Arc::new(LegacyGasPriceProvider::new(
                chain_id,
                provider.clone(),
                descriptor.rpc_timeout,
            )),
        );
        let gas_price_provider: GasPriceProvider = Arc::new(CachingProvider::in_memory(
            on_chain_gas,
            &format!("gas_price:{chain_id}"),
            settings.cache_ttl.gas_price(),
        ));

        // Simulation.
        let remote: Option<Arc<dyn Simulator>> = match settings.simulation.credentials() {
            Some(credentials) => Some(Arc::new(TenderlySimulator::new(
                chain_id,
                credentials,
                settings.simulation.timeout(),
            )?)),
            None => {
                warn!(chain_id = %chain_id, "remote simulation not configured, using local estimation only");
                None
            }
        };
        let local: Arc<dyn Simulator> = Arc::new(EthEstimateGasSimulator::new(
            chain_id,
            provider.clone(),
            descriptor.rpc_timeout,
        ));
        let simulator: Arc<dyn Simulator> =
            Arc::new(FallbackSimulator::new(chain_id, ctx.clone(), remote, local));

        Ok(NetworkDependencies {
            chain_id,
            descriptor,
            pool_provider,
            pool_switch: pool_handle,
            quote_provider,
            quote_switch,
            subgraph_provider,
            token_provider,
            blocked_token_list_provider,
            token_validator,
            token_properties_provider,
            gas_price_provider,
            simulator,
            route_caching_provider: self.services.route_caching_provider.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_network_is_unsupported() {
        let container = ContainerInjected::from_bundles(BTreeMap::new(), ProviderContext::null());
        assert!(matches!(
            container.dependencies_for(ChainId::MODE),
            Err(ProviderError::UnsupportedNetwork(_))
        ));
    }

    #[test]
    fn test_unusable_network_fails_fast() {
        let mut bundles = BTreeMap::new();
        bundles.insert(
            ChainId::MODE,
            NetworkBundle::Unusable(ProviderError::missing(ChainId::MODE, "WEB3_RPC_34443")),
        );
        let container = ContainerInjected::from_bundles(bundles, ProviderContext::null());

        let err = container.dependencies_for(ChainId::MODE).unwrap_err();
        assert!(matches!(err, ProviderError::NetworkUnusable { .. }));
        assert!(err.to_string().contains("WEB3_RPC_34443"));
        assert!(container.unusable_cause(ChainId::MODE).unwrap().is_configuration());
        assert!(container.ready_chains().is_empty());
    }
}
