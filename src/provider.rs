//! # Provider Abstraction
//!
//! Every data source the router depends on (pool state, quotes, subgraph pool
//! lists, token metadata, gas prices) is a [`DataProvider`]: one async
//! `fetch(key) -> value` capability with a typed key and value.
//!
//! ## Overview
//!
//! Because callers only see the trait, a provider can be wrapped without the
//! caller noticing:
//!
//! - [`crate::cache::CachingProvider`] adds a read-through TTL cache
//! - [`crate::traffic_switch::TrafficSwitchProvider`] runs two implementations
//!   side by side and compares them
//! - [`crate::pool_store::StoreCachingPoolProvider`] adds a durable store tier
//!
//! Each wrapper implements `DataProvider` with the same key and value types as
//! what it wraps, so layers compose in any order.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sor_provider_sdk::provider::DataProvider;
//! use sor_provider_sdk::error::Result;
//! use async_trait::async_trait;
//!
//! struct Doubler;
//!
//! #[async_trait]
//! impl DataProvider for Doubler {
//!     type Key = u64;
//!     type Value = u64;
//!
//!     fn name(&self) -> &str {
//!         "doubler"
//!     }
//!
//!     async fn fetch(&self, key: &u64) -> Result<u64> {
//!         Ok(key * 2)
//!     }
//! }
//! ```

use crate::chain::ChainId;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// A keyed, async data source.
///
/// Implementations are immutable after construction. Internal caches they
/// own are the only mutable state allowed.
#[async_trait]
pub trait DataProvider: Send + Sync {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Human-readable name used in logs, metrics and events.
    fn name(&self) -> &str;

    /// Network this provider was built for, if it is network-scoped.
    fn chain_id(&self) -> Option<ChainId> {
        None
    }

    async fn fetch(&self, key: &Self::Key) -> Result<Self::Value>;
}

#[async_trait]
impl<P> DataProvider for Arc<P>
where
    P: DataProvider + ?Sized,
{
    type Key = P::Key;
    type Value = P::Value;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn chain_id(&self) -> Option<ChainId> {
        (**self).chain_id()
    }

    async fn fetch(&self, key: &Self::Key) -> Result<Self::Value> {
        (**self).fetch(key).await
    }
}

/// Type-erased provider handle shared across a network bundle.
pub type SharedProvider<K, V> = Arc<dyn DataProvider<Key = K, Value = V>>;

pub type PoolProvider = SharedProvider<crate::pools::PoolRequest, crate::pools::PoolAccessor>;
pub type QuoteProvider = SharedProvider<crate::quote::QuoteRequest, crate::quote::QuoteBatch>;
pub type SubgraphProvider =
    SharedProvider<crate::subgraph::SubgraphQuery, Arc<Vec<crate::subgraph::SubgraphPool>>>;
pub type TokenProvider =
    SharedProvider<crate::tokens::TokenRequest, crate::tokens::TokenAccessor>;
pub type TokenValidationProvider =
    SharedProvider<ethers::types::Address, crate::tokens::TokenValidation>;
pub type GasPriceProvider = SharedProvider<(), crate::gas_price::GasPrice>;
pub type TokenFeeProvider =
    SharedProvider<crate::tokens::TokenRequest, crate::token_properties::TokenFeeMap>;
pub type TokenPropertiesProvider =
    SharedProvider<crate::tokens::TokenRequest, crate::token_properties::TokenPropertiesMap>;
