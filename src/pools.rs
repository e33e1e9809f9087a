//! V3 pool state over Multicall3.
//!
//! Pool addresses are derived with CREATE2 from the factory and init code
//! hash, so no factory lookups are needed. `slot0()` and `liquidity()` are
//! fetched in one batched round trip; pools whose calls revert (not deployed)
//! are left out of the result.

use crate::chain::{ChainId, FeeTier, NetworkDescriptor};
use crate::contracts::uniswap_v3::{LiquidityCall, Slot0Call};
use crate::error::{ProviderError, Result};
use crate::multicall::{Call, CallResult, Multicall};
use crate::provider::DataProvider;
use crate::traffic_switch::{Comparison, ResultComparator};
use async_trait::async_trait;
use ethers::abi::{AbiEncode, ParamType, Token};
use ethers::prelude::*;
use ethers::utils::{get_create2_address_from_hash, keccak256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Orders two tokens the way V3 factories do.
pub fn sort_tokens(a: Address, b: Address) -> (Address, Address) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    pub token0: Address,
    pub token1: Address,
    pub fee: FeeTier,
}

impl PoolKey {
    pub fn new(token_a: Address, token_b: Address, fee: FeeTier) -> Self {
        let (token0, token1) = sort_tokens(token_a, token_b);
        Self {
            token0,
            token1,
            fee,
        }
    }
}

/// Key for pool providers: the pools wanted and an optional pinned block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolRequest {
    pub pools: Vec<PoolKey>,
    pub block_number: Option<u64>,
}

impl PoolRequest {
    /// Deduplicates and sorts so equal requests hash equally.
    pub fn new(pools: impl IntoIterator<Item = PoolKey>, block_number: Option<u64>) -> Self {
        let pools: BTreeSet<PoolKey> = pools.into_iter().collect();
        Self {
            pools: pools.into_iter().collect(),
            block_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V3PoolState {
    pub address: Address,
    pub token0: Address,
    pub token1: Address,
    pub fee: FeeTier,
    pub sqrt_price_x96: U256,
    pub tick: i32,
    pub liquidity: u128,
}

/// Pools returned by a pool provider, indexed by address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAccessor {
    pools: BTreeMap<Address, V3PoolState>,
}

impl PoolAccessor {
    pub fn new(pools: impl IntoIterator<Item = V3PoolState>) -> Self {
        Self {
            pools: pools.into_iter().map(|p| (p.address, p)).collect(),
        }
    }

    pub fn get_pool(&self, token_a: Address, token_b: Address, fee: FeeTier) -> Option<&V3PoolState> {
        let key = PoolKey::new(token_a, token_b, fee);
        self.pools
            .values()
            .find(|p| p.token0 == key.token0 && p.token1 == key.token1 && p.fee == key.fee)
    }

    pub fn get_pool_by_address(&self, address: &Address) -> Option<&V3PoolState> {
        self.pools.get(address)
    }

    pub fn all_pools(&self) -> impl Iterator<Item = &V3PoolState> {
        self.pools.values()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn merge(&mut self, other: PoolAccessor) {
        self.pools.extend(other.pools);
    }
}

/// CREATE2 inputs for one V3 deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAddressing {
    pub factory: Address,
    pub init_code_hash: H256,
}

impl PoolAddressing {
    pub fn from_descriptor(descriptor: &NetworkDescriptor) -> Result<Self> {
        let factory = descriptor
            .addresses
            .v3_factory
            .ok_or_else(|| ProviderError::missing(descriptor.chain_id, "v3_factory"))?;
        Ok(Self {
            factory,
            init_code_hash: descriptor.addresses.pool_init_code_hash,
        })
    }

    pub fn pool_address(&self, key: &PoolKey) -> Address {
        let salt = keccak256(ethers::abi::encode(&[
            Token::Address(key.token0),
            Token::Address(key.token1),
            Token::Uint(U256::from(key.fee.as_u32())),
        ]));
        get_create2_address_from_hash(self.factory, salt, self.init_code_hash)
    }
}

pub struct V3PoolProvider<M: Middleware> {
    chain_id: ChainId,
    multicall: Multicall<M>,
    addressing: PoolAddressing,
}

impl<M: Middleware + 'static> V3PoolProvider<M> {
    pub fn new(chain_id: ChainId, multicall: Multicall<M>, addressing: PoolAddressing) -> Self {
        Self {
            chain_id,
            multicall,
            addressing,
        }
    }

    pub fn addressing(&self) -> PoolAddressing {
        self.addressing
    }
}

fn decode_pool(
    key: &PoolKey,
    address: Address,
    slot0: &CallResult,
    liquidity: &CallResult,
) -> Option<V3PoolState> {
    if !slot0.success || !liquidity.success {
        return None;
    }
    let slot0 = ethers::abi::decode(
        &[
            ParamType::Uint(160),
            ParamType::Int(24),
            ParamType::Uint(16),
            ParamType::Uint(16),
            ParamType::Uint(16),
            ParamType::Uint(8),
            ParamType::Bool,
        ],
        slot0.return_data.as_ref(),
    )
    .ok()?;
    let liquidity = ethers::abi::decode(&[ParamType::Uint(128)], liquidity.return_data.as_ref()).ok()?;

    let sqrt_price_x96 = slot0.first()?.clone().into_uint()?;
    // int24 arrives sign-extended; the low 32 bits are its i32 form.
    let tick = slot0.get(1)?.clone().into_int()?.low_u32() as i32;
    let liquidity = u128::try_from(liquidity.first()?.clone().into_uint()?).ok()?;

    Some(V3PoolState {
        address,
        token0: key.token0,
        token1: key.token1,
        fee: key.fee,
        sqrt_price_x96,
        tick,
        liquidity,
    })
}

#[async_trait]
impl<M: Middleware + 'static> DataProvider for V3PoolProvider<M> {
    type Key = PoolRequest;
    type Value = PoolAccessor;

    fn name(&self) -> &str {
        "v3_pool_onchain"
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, request: &PoolRequest) -> Result<PoolAccessor> {
        if request.pools.is_empty() {
            return Ok(PoolAccessor::default());
        }

        let addresses: Vec<Address> = request
            .pools
            .iter()
            .map(|key| self.addressing.pool_address(key))
            .collect();

        let slot0_data: Bytes = Slot0Call.encode().into();
        let liquidity_data: Bytes = LiquidityCall.encode().into();
        let mut calls = Vec::with_capacity(addresses.len() * 2);
        for address in &addresses {
            calls.push(Call {
                target: *address,
                call_data: slot0_data.clone(),
            });
            calls.push(Call {
                target: *address,
                call_data: liquidity_data.clone(),
            });
        }

        let block = request
            .block_number
            .map(|b| BlockId::Number(BlockNumber::Number(b.into())));
        let results = self.multicall.run(calls, block).await?;

        let pools: Vec<V3PoolState> = request
            .pools
            .iter()
            .zip(addresses)
            .enumerate()
            .filter_map(|(i, (key, address))| {
                decode_pool(key, address, &results[i * 2], &results[i * 2 + 1])
            })
            .collect();

        debug!(
            chain_id = %self.chain_id,
            requested = request.pools.len(),
            found = pools.len(),
            block = ?request.block_number,
            "fetched v3 pool state"
        );
        Ok(PoolAccessor::new(pools))
    }
}

/// Pool comparison that names the pools that diverge.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolAccessorComparator;

impl ResultComparator<PoolAccessor> for PoolAccessorComparator {
    fn compare(&self, current: &PoolAccessor, target: &PoolAccessor) -> Comparison {
        let mut diverging: Vec<String> = Vec::new();
        let addresses: BTreeSet<&Address> = current.pools.keys().chain(target.pools.keys()).collect();
        for address in addresses {
            match (current.pools.get(address), target.pools.get(address)) {
                (Some(a), Some(b)) if a == b => {}
                (Some(_), Some(_)) => diverging.push(format!("{address:?}: state differs")),
                (Some(_), None) => diverging.push(format!("{address:?}: missing in target")),
                (None, Some(_)) => diverging.push(format!("{address:?}: missing in current")),
                (None, None) => {}
            }
        }
        if diverging.is_empty() {
            Comparison::Match
        } else {
            Comparison::Mismatch(format!("{} pools differ: {}", diverging.len(), diverging.join(", ")))
        }
    }
}

/// Type-erased pool provider handle.
pub type SharedPoolProvider = Arc<dyn DataProvider<Key = PoolRequest, Value = PoolAccessor>>;
