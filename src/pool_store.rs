//! Durable pool-state tier keyed by `(chain, pool address, block number)`.
//!
//! Pool state at a fixed block never changes, so entries written by one
//! process are valid for every other process reading the same block.

use crate::chain::ChainId;
use crate::error::{ProviderError, Result};
use crate::pools::{PoolAccessor, PoolAddressing, PoolKey, PoolRequest, V3PoolState};
use crate::provider::DataProvider;
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait PoolStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(
        &self,
        chain_id: ChainId,
        pool_address: Address,
        block_number: u64,
    ) -> Result<Option<V3PoolState>>;

    async fn put(&self, chain_id: ChainId, block_number: u64, pool: &V3PoolState) -> Result<()>;
}

/// Store used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryPoolStore {
    table_name: String,
    entries: DashMap<(ChainId, Address, u64), V3PoolState>,
}

impl InMemoryPoolStore {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PoolStore for InMemoryPoolStore {
    fn name(&self) -> &str {
        &self.table_name
    }

    async fn get(
        &self,
        chain_id: ChainId,
        pool_address: Address,
        block_number: u64,
    ) -> Result<Option<V3PoolState>> {
        Ok(self
            .entries
            .get(&(chain_id, pool_address, block_number))
            .map(|e| e.value().clone()))
    }

    async fn put(&self, chain_id: ChainId, block_number: u64, pool: &V3PoolState) -> Result<()> {
        self.entries
            .insert((chain_id, pool.address, block_number), pool.clone());
        Ok(())
    }
}

/// Pool provider with a durable store in front of an inner provider.
///
/// Requests without a block number bypass the store: "latest" is not a stable
/// key. Store failures propagate, they are not treated as misses.
pub struct StoreCachingPoolProvider<P> {
    name: String,
    chain_id: ChainId,
    store: Arc<dyn PoolStore>,
    inner: P,
    addressing: PoolAddressing,
}

impl<P> StoreCachingPoolProvider<P>
where
    P: DataProvider<Key = PoolRequest, Value = PoolAccessor>,
{
    pub fn new(chain_id: ChainId, store: Arc<dyn PoolStore>, inner: P, addressing: PoolAddressing) -> Self {
        Self {
            name: format!("store_caching({})", store.name()),
            chain_id,
            store,
            inner,
            addressing,
        }
    }
}

#[async_trait]
impl<P> DataProvider for StoreCachingPoolProvider<P>
where
    P: DataProvider<Key = PoolRequest, Value = PoolAccessor>,
{
    type Key = PoolRequest;
    type Value = PoolAccessor;

    fn name(&self) -> &str {
        &self.name
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, request: &PoolRequest) -> Result<PoolAccessor> {
        let Some(block_number) = request.block_number else {
            return self.inner.fetch(request).await;
        };

        let mut found = Vec::new();
        let mut missing: Vec<PoolKey> = Vec::new();
        for key in &request.pools {
            let address = self.addressing.pool_address(key);
            match self.store.get(self.chain_id, address, block_number).await? {
                Some(pool) => found.push(pool),
                None => missing.push(*key),
            }
        }

        debug!(
            store = %self.store.name(),
            chain_id = %self.chain_id,
            block_number,
            hits = found.len(),
            misses = missing.len(),
            "pool store lookup"
        );

        let mut accessor = PoolAccessor::new(found);
        if missing.is_empty() {
            return Ok(accessor);
        }

        let fetched = self
            .inner
            .fetch(&PoolRequest::new(missing, Some(block_number)))
            .await?;
        for pool in fetched.all_pools() {
            self.store
                .put(self.chain_id, block_number, pool)
                .await
                .map_err(|e| ProviderError::Store(format!("{}: {e}", self.store.name())))?;
        }
        accessor.merge(fetched);
        Ok(accessor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::FeeTier;
    use ethers::types::{H256, U256};

    #[tokio::test]
    async fn test_in_memory_store_is_block_scoped() {
        let store = InMemoryPoolStore::new("V3PoolsCachingDB");
        let pool = V3PoolState {
            address: Address::repeat_byte(9),
            token0: Address::repeat_byte(1),
            token1: Address::repeat_byte(2),
            fee: FeeTier::Medium,
            sqrt_price_x96: U256::one(),
            tick: -5,
            liquidity: 1,
        };
        store.put(ChainId::MODE, 100, &pool).await.unwrap();

        assert_eq!(
            store.get(ChainId::MODE, pool.address, 100).await.unwrap(),
            Some(pool.clone())
        );
        assert!(store.get(ChainId::MODE, pool.address, 101).await.unwrap().is_none());
        assert!(store.get(ChainId::MAINNET, pool.address, 100).await.unwrap().is_none());
        assert_eq!(store.name(), "V3PoolsCachingDB");
    }

    #[test]
    fn test_addressing_is_deterministic() {
        let addressing = PoolAddressing {
            factory: Address::repeat_byte(0xfa),
            init_code_hash: H256::repeat_byte(0x11),
        };
        let key = PoolKey::new(Address::repeat_byte(2), Address::repeat_byte(1), FeeTier::Low);
        assert_eq!(addressing.pool_address(&key), addressing.pool_address(&key));
    }
}
