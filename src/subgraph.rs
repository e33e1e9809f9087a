//! Subgraph-derived pool lists.
//!
//! The freshest source is a gzip snapshot in object storage, then the same
//! snapshot uncompressed, and finally a static list derived from the
//! network's base tokens. [`build_subgraph_provider`] wires them into a
//! [`FallbackChain`] whose last element cannot fail.

use crate::chain::{ChainId, FeeTier};
use crate::error::{ProviderError, Result};
use crate::fallback::FallbackChain;
use crate::pools::{PoolKey, PoolRequest};
use crate::provider::{DataProvider, PoolProvider, SubgraphProvider};
use crate::telemetry::ProviderContext;
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgraphToken {
    pub id: String,
}

/// One pool entry as published in the pool snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphPool {
    pub id: String,
    #[serde(rename = "feeTier")]
    pub fee_tier: String,
    pub liquidity: String,
    pub token0: SubgraphToken,
    pub token1: SubgraphToken,
    #[serde(rename = "tvlETH", default)]
    pub tvl_eth: f64,
    #[serde(rename = "tvlUSD", default)]
    pub tvl_usd: f64,
}

impl SubgraphPool {
    pub fn involves(&self, token: Address) -> bool {
        let needle = format!("{token:?}");
        self.token0.id.eq_ignore_ascii_case(&needle) || self.token1.id.eq_ignore_ascii_case(&needle)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SubgraphQuery {
    pub token_in: Option<Address>,
    pub token_out: Option<Address>,
    pub block_number: Option<u64>,
}

/// Remote object storage holding pool snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    fn name(&self) -> &str;

    /// Missing objects fail with [`ProviderError::SnapshotNotFound`].
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

/// Object store reached over plain HTTP: `GET {base_url}/{bucket}/{key}`.
pub struct HttpSnapshotStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSnapshotStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl SnapshotStore for HttpSnapshotStore {
    fn name(&self) -> &str {
        "http_snapshot_store"
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}/{}", self.base_url, bucket, key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::unavailable(self.name(), e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::SnapshotNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        let response = response
            .error_for_status()
            .map_err(|e| ProviderError::unavailable(self.name(), e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::unavailable(self.name(), e))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    objects: DashMap<(String, String), Vec<u8>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.objects
            .insert((bucket.to_string(), key.to_string()), bytes);
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    fn name(&self) -> &str {
        "in_memory_snapshot_store"
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|e| e.value().clone())
            .ok_or_else(|| ProviderError::SnapshotNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

/// Object key of a network's snapshot. Mainnet uses the bare key.
pub fn snapshot_key(base_key: &str, chain_id: ChainId) -> String {
    if chain_id == ChainId::MAINNET {
        base_key.to_string()
    } else {
        format!("{base_key}-{chain_id}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotEncoding {
    Gzip,
    Plain,
}

impl SnapshotEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotEncoding::Gzip => "gzip",
            SnapshotEncoding::Plain => "plain",
        }
    }
}

pub fn decode_snapshot(bytes: &[u8], encoding: SnapshotEncoding) -> Result<Vec<SubgraphPool>> {
    let pools = match encoding {
        SnapshotEncoding::Plain => serde_json::from_slice(bytes)?,
        SnapshotEncoding::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(bytes);
            let mut json = Vec::new();
            decoder
                .read_to_end(&mut json)
                .map_err(|e| ProviderError::Decode(format!("gzip snapshot: {e}")))?;
            serde_json::from_slice(&json)?
        }
    };
    Ok(pools)
}

/// Subgraph provider serving a snapshot loaded once at construction.
#[derive(Debug)]
pub struct SnapshotSubgraphProvider {
    name: String,
    chain_id: ChainId,
    pools: Arc<Vec<SubgraphPool>>,
}

impl SnapshotSubgraphProvider {
    /// Downloads and decodes the snapshot. Fails if the object is missing or
    /// malformed, which lets a fallback chain move to the next tier.
    pub async fn eager_build(
        store: Arc<dyn SnapshotStore>,
        bucket: &str,
        base_key: &str,
        chain_id: ChainId,
        encoding: SnapshotEncoding,
    ) -> Result<Self> {
        let key = snapshot_key(base_key, chain_id);
        let bytes = store.get_object(bucket, &key).await?;
        let pools = decode_snapshot(&bytes, encoding)?;
        info!(
            store = %store.name(),
            bucket,
            key = %key,
            encoding = encoding.as_str(),
            pools = pools.len(),
            "loaded subgraph snapshot"
        );
        Ok(Self {
            name: format!("snapshot_subgraph({})", encoding.as_str()),
            chain_id,
            pools: Arc::new(pools),
        })
    }

    pub fn from_pools(chain_id: ChainId, pools: Vec<SubgraphPool>) -> Self {
        Self {
            name: "snapshot_subgraph(inline)".to_string(),
            chain_id,
            pools: Arc::new(pools),
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

#[async_trait]
impl DataProvider for SnapshotSubgraphProvider {
    type Key = SubgraphQuery;
    type Value = Arc<Vec<SubgraphPool>>;

    fn name(&self) -> &str {
        &self.name
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, _query: &SubgraphQuery) -> Result<Arc<Vec<SubgraphPool>>> {
        Ok(self.pools.clone())
    }
}

/// Terminal subgraph provider: candidate pools between the base tokens and
/// the requested pair, across every fee tier, read through the pool provider.
pub struct StaticSubgraphProvider {
    chain_id: ChainId,
    pool_provider: PoolProvider,
    base_tokens: Vec<Address>,
}

impl StaticSubgraphProvider {
    pub fn new(chain_id: ChainId, pool_provider: PoolProvider, base_tokens: Vec<Address>) -> Self {
        Self {
            chain_id,
            pool_provider,
            base_tokens,
        }
    }

    fn candidate_keys(&self, query: &SubgraphQuery) -> Vec<PoolKey> {
        let tokens: BTreeSet<Address> = self
            .base_tokens
            .iter()
            .copied()
            .chain(query.token_in)
            .chain(query.token_out)
            .collect();
        let tokens: Vec<Address> = tokens.into_iter().collect();

        let mut keys = Vec::new();
        for (i, a) in tokens.iter().enumerate() {
            for b in &tokens[i + 1..] {
                for fee in FeeTier::ALL {
                    keys.push(PoolKey::new(*a, *b, fee));
                }
            }
        }
        keys
    }
}

#[async_trait]
impl DataProvider for StaticSubgraphProvider {
    type Key = SubgraphQuery;
    type Value = Arc<Vec<SubgraphPool>>;

    fn name(&self) -> &str {
        "static_subgraph"
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, query: &SubgraphQuery) -> Result<Arc<Vec<SubgraphPool>>> {
        let keys = self.candidate_keys(query);
        debug!(chain_id = %self.chain_id, candidates = keys.len(), "deriving static subgraph pools");

        let accessor = self
            .pool_provider
            .fetch(&PoolRequest::new(keys, query.block_number))
            .await?;

        let pools = accessor
            .all_pools()
            .filter(|p| p.liquidity > 0)
            .map(|p| SubgraphPool {
                id: format!("{:?}", p.address),
                fee_tier: p.fee.as_u32().to_string(),
                liquidity: p.liquidity.to_string(),
                token0: SubgraphToken {
                    id: format!("{:?}", p.token0),
                },
                token1: SubgraphToken {
                    id: format!("{:?}", p.token1),
                },
                // No pricing source here; TVL stays unset.
                tvl_eth: 0.0,
                tvl_usd: 0.0,
            })
            .collect();
        Ok(Arc::new(pools))
    }
}

/// Where a network's snapshots live. Absent values disable that tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotLocations {
    pub compressed_bucket: Option<String>,
    pub compressed_key: Option<String>,
    pub bucket: Option<String>,
    pub key: Option<String>,
}

async fn snapshot_tier(
    store: Option<Arc<dyn SnapshotStore>>,
    bucket: Option<String>,
    key: Option<String>,
    chain_id: ChainId,
    encoding: SnapshotEncoding,
    bucket_setting: &'static str,
) -> Result<SubgraphProvider> {
    let store = store.ok_or_else(|| ProviderError::missing(chain_id, "snapshot.base_url"))?;
    let bucket = bucket.ok_or_else(|| ProviderError::missing(chain_id, bucket_setting))?;
    let key = key.ok_or_else(|| ProviderError::missing(chain_id, format!("{bucket_setting} key")))?;
    let provider =
        SnapshotSubgraphProvider::eager_build(store, &bucket, &key, chain_id, encoding).await?;
    Ok(Arc::new(provider))
}

/// Compressed snapshot, then plain snapshot, then the static derivation.
/// Never fails.
pub async fn build_subgraph_provider(
    ctx: ProviderContext,
    chain_id: ChainId,
    store: Option<Arc<dyn SnapshotStore>>,
    locations: SnapshotLocations,
    pool_provider: PoolProvider,
    base_tokens: Vec<Address>,
) -> SubgraphProvider {
    let compressed_store = store.clone();
    let SnapshotLocations {
        compressed_bucket,
        compressed_key,
        bucket,
        key,
    } = locations;

    FallbackChain::new(format!("subgraph:{chain_id}"), ctx)
        .candidate("compressed_snapshot", move || {
            snapshot_tier(
                compressed_store,
                compressed_bucket,
                compressed_key,
                chain_id,
                SnapshotEncoding::Gzip,
                "POOL_CACHE_BUCKET_3",
            )
        })
        .candidate("snapshot", move || {
            snapshot_tier(store, bucket, key, chain_id, SnapshotEncoding::Plain, "POOL_CACHE_BUCKET_2")
        })
        .build_or("static", move || async move {
            let provider: SubgraphProvider =
                Arc::new(StaticSubgraphProvider::new(chain_id, pool_provider, base_tokens));
            provider
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn sample_json() -> Vec<u8> {
        br#"[{"id":"0xpool","feeTier":"500","liquidity":"10","token0":{"id":"0xa"},"token1":{"id":"0xb"},"tvlETH":1.5,"tvlUSD":3000.0}]"#.to_vec()
    }

    #[test]
    fn test_snapshot_key_is_chain_scoped() {
        assert_eq!(snapshot_key("poolCache.json", ChainId::MAINNET), "poolCache.json");
        assert_eq!(snapshot_key("poolCache.json", ChainId::MODE), "poolCache.json-34443");
    }

    #[test]
    fn test_decode_gzip_and_plain() {
        let plain = decode_snapshot(&sample_json(), SnapshotEncoding::Plain).unwrap();
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].fee_tier, "500");

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&sample_json()).unwrap();
        let gz = encoder.finish().unwrap();
        assert_eq!(decode_snapshot(&gz, SnapshotEncoding::Gzip).unwrap(), plain);

        assert!(decode_snapshot(&sample_json(), SnapshotEncoding::Gzip).is_err());
    }

    #[tokio::test]
    async fn test_in_memory_store_reports_not_found() {
        let store = InMemorySnapshotStore::new();
        let err = store.get_object("bucket", "missing").await.unwrap_err();
        assert!(matches!(err, ProviderError::SnapshotNotFound { .. }));
    }

    #[tokio::test]
    async fn test_eager_build_reads_chain_key() {
        let store = Arc::new(InMemorySnapshotStore::new());
        store.put("bucket", "pools-34443", sample_json());
        let provider = SnapshotSubgraphProvider::eager_build(
            store,
            "bucket",
            "pools",
            ChainId::MODE,
            SnapshotEncoding::Plain,
        )
        .await
        .unwrap();
        assert_eq!(provider.len(), 1);
        let pools = provider.fetch(&SubgraphQuery::default()).await.unwrap();
        assert_eq!(pools[0].id, "0xpool");
    }

    struct FixedPools(crate::pools::PoolAccessor);

    #[async_trait]
    impl DataProvider for FixedPools {
        type Key = PoolRequest;
        type Value = crate::pools::PoolAccessor;

        fn name(&self) -> &str {
            "fixed_pools"
        }

        async fn fetch(&self, _request: &PoolRequest) -> Result<crate::pools::PoolAccessor> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_static_pools_carry_no_tvl() {
        use crate::pools::{PoolAccessor, V3PoolState};
        use ethers::types::U256;

        let pool = |byte: u8, liquidity: u128| V3PoolState {
            address: Address::repeat_byte(byte),
            token0: Address::repeat_byte(1),
            token1: Address::repeat_byte(2),
            fee: FeeTier::Medium,
            sqrt_price_x96: U256::from(1u64) << 96,
            tick: 0,
            liquidity,
        };
        let pools: PoolProvider = Arc::new(FixedPools(PoolAccessor::new(vec![
            pool(0xaa, 5_000_000),
            pool(0xbb, 0),
        ])));
        let provider = StaticSubgraphProvider::new(
            ChainId::MODE,
            pools,
            vec![Address::repeat_byte(1), Address::repeat_byte(2)],
        );

        let result = provider.fetch(&SubgraphQuery::default()).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].liquidity, "5000000");
        assert_eq!(result[0].fee_tier, "3000");
        assert_eq!(result[0].tvl_eth, 0.0);
        assert_eq!(result[0].tvl_usd, 0.0);
    }

    #[test]
    fn test_involves_ignores_case() {
        let token = Address::repeat_byte(0xab);
        let pool = SubgraphPool {
            id: "p".into(),
            fee_tier: "3000".into(),
            liquidity: "1".into(),
            token0: SubgraphToken {
                id: format!("{token:?}").to_uppercase().replace("0X", "0x"),
            },
            token1: SubgraphToken { id: "0x00".into() },
            tvl_eth: 0.0,
            tvl_usd: 0.0,
        };
        assert!(pool.involves(token));
        assert!(!pool.involves(Address::repeat_byte(1)));
    }
}
