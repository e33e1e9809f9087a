// Redis-backed durable tiers: pool state store and route cache.
// Entries are bincode-encoded and written with SET EX.

use crate::error::{ProviderError, Result};
use serde::{Deserialize, Serialize};

#[cfg(feature = "redis")]
use crate::chain::ChainId;
#[cfg(feature = "redis")]
use crate::intent::CacheMode;
#[cfg(feature = "redis")]
use crate::pool_store::PoolStore;
#[cfg(feature = "redis")]
use crate::pools::V3PoolState;
#[cfg(feature = "redis")]
use crate::route_cache::{CachedRoutes, PairTradeTypeChainId, RouteCachingProvider};
#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use ethers::types::Address;
#[cfg(feature = "redis")]
use redis::aio::ConnectionManager;
#[cfg(feature = "redis")]
use redis::{AsyncCommands, Client};
#[cfg(feature = "redis")]
use tracing::{debug, info};

/// Connection and expiry settings for the Redis tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Pool state at a fixed block never changes; this only bounds storage.
    pub pool_state_ttl_secs: u64,
    /// Block time for route expiry on networks without a descriptor.
    pub seconds_per_block: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_state_ttl_secs: 86_400,
            seconds_per_block: 2,
        }
    }
}

#[cfg(feature = "redis")]
fn store_error(context: &str, err: impl std::fmt::Display) -> ProviderError {
    ProviderError::Store(format!("{context}: {err}"))
}

/// Shared connection. Cloning is cheap; every clone multiplexes the same
/// connection.
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisManager {
    conn: ConnectionManager,
    config: RedisConfig,
}

#[cfg(not(feature = "redis"))]
pub struct RedisManager {
    _config: RedisConfig,
}

impl RedisManager {
    #[cfg(feature = "redis")]
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| store_error("failed to create redis client", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| store_error("failed to connect to redis", e))?;
        info!(url = %config.url, "redis connected");
        Ok(Self { conn, config })
    }

    #[cfg(not(feature = "redis"))]
    pub async fn new(_config: RedisConfig) -> Result<Self> {
        Err(ProviderError::Store(
            "redis feature not enabled, build with --features redis".to_string(),
        ))
    }

    #[cfg(feature = "redis")]
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    #[cfg(feature = "redis")]
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| store_error("redis GET", e))
    }

    #[cfg(feature = "redis")]
    async fn set_bytes(&self, key: &str, bytes: Vec<u8>, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, bytes, ttl_secs.max(1))
            .await
            .map_err(|e| store_error("redis SET EX", e))
    }

    #[cfg(feature = "redis")]
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("redis health check failed", e))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(ProviderError::Store(format!("unexpected redis response: {pong}")))
        }
    }
}

pub fn pool_state_key(table: &str, chain_id: u64, pool: &str, block_number: u64) -> String {
    format!("{table}:{chain_id}:{}:{block_number}", pool.to_lowercase())
}

#[cfg(feature = "redis")]
pub struct RedisPoolStore {
    table_name: String,
    manager: RedisManager,
}

#[cfg(feature = "redis")]
impl RedisPoolStore {
    pub fn new(table_name: impl Into<String>, manager: RedisManager) -> Self {
        Self {
            table_name: table_name.into(),
            manager,
        }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl PoolStore for RedisPoolStore {
    fn name(&self) -> &str {
        &self.table_name
    }

    async fn get(&self, chain_id: ChainId, pool_address: Address, block_number: u64) -> Result<Option<V3PoolState>> {
        let key = pool_state_key(&self.table_name, chain_id.0, &format!("{pool_address:?}"), block_number);
        let Some(bytes) = self.manager.get_bytes(&key).await? else {
            crate::metrics::increment_cache_miss(&self.table_name);
            return Ok(None);
        };
        crate::metrics::increment_cache_hit(&self.table_name);
        let state = bincode::deserialize(&bytes).map_err(|e| store_error("decode pool state", e))?;
        Ok(Some(state))
    }

    async fn put(&self, chain_id: ChainId, block_number: u64, pool: &V3PoolState) -> Result<()> {
        let key = pool_state_key(&self.table_name, chain_id.0, &format!("{:?}", pool.address), block_number);
        let bytes = bincode::serialize(pool).map_err(|e| store_error("encode pool state", e))?;
        self.manager
            .set_bytes(&key, bytes, self.manager.config().pool_state_ttl_secs)
            .await?;
        debug!(key = %key, "stored pool state");
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub struct RedisRouteCachingProvider {
    table_name: String,
    default_mode: CacheMode,
    manager: RedisManager,
}

#[cfg(feature = "redis")]
impl RedisRouteCachingProvider {
    pub fn new(table_name: impl Into<String>, manager: RedisManager) -> Self {
        Self {
            table_name: table_name.into(),
            default_mode: CacheMode::Livemode,
            manager,
        }
    }

    pub fn with_default_mode(mut self, mode: CacheMode) -> Self {
        self.default_mode = mode;
        self
    }

    fn key(&self, key: &PairTradeTypeChainId) -> String {
        format!("{}:{key}", self.table_name)
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl RouteCachingProvider for RedisRouteCachingProvider {
    fn name(&self) -> &str {
        &self.table_name
    }

    fn default_mode(&self) -> CacheMode {
        self.default_mode
    }

    async fn load(&self, key: &PairTradeTypeChainId) -> Result<Option<CachedRoutes>> {
        match self.manager.get_bytes(&self.key(key)).await? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| store_error("decode cached routes", e))?,
            )),
            None => Ok(None),
        }
    }

    async fn store(&self, routes: &CachedRoutes) -> Result<()> {
        let bytes = bincode::serialize(routes).map_err(|e| store_error("encode cached routes", e))?;
        let ttl = routes.ttl_secs(self.manager.config().seconds_per_block);
        self.manager.set_bytes(&self.key(&routes.key), bytes, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_state_key_is_lowercase() {
        assert_eq!(
            pool_state_key("V3PoolsCachingDB", 34443, "0xABcd", 7),
            "V3PoolsCachingDB:34443:0xabcd:7"
        );
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_disabled_feature_is_store_error() {
        let err = RedisManager::new(RedisConfig::default()).await.err().unwrap();
        assert!(matches!(err, ProviderError::Store(_)));
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_pool_store_round_trip() {
        use crate::chain::FeeTier;
        use ethers::types::U256;

        let manager = RedisManager::new(RedisConfig::default()).await.unwrap();
        let store = RedisPoolStore::new("V3PoolsCachingDB", manager);
        let pool = V3PoolState {
            address: Address::repeat_byte(3),
            token0: Address::repeat_byte(1),
            token1: Address::repeat_byte(2),
            fee: FeeTier::Low,
            sqrt_price_x96: U256::from(1u64 << 40),
            tick: -12,
            liquidity: 99,
        };
        store.put(ChainId::MODE, 10, &pool).await.unwrap();
        assert_eq!(store.get(ChainId::MODE, pool.address, 10).await.unwrap(), Some(pool));
    }
}
