//! Network identifiers and the declarative per-network descriptor table.
//!
//! Everything that differs between networks (RPC timeout, quote batching,
//! protocol addresses, base tokens) lives in a [`NetworkDescriptor`], so the
//! container assembler has a single code path for every chain.

use crate::routing_config::RoutingConfig;
use ethers::types::{Address, H256};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl ChainId {
    pub const MAINNET: ChainId = ChainId(1);
    pub const OPTIMISM: ChainId = ChainId(10);
    pub const ARBITRUM_ONE: ChainId = ChainId(42161);
    pub const MODE: ChainId = ChainId(34443);

    /// Name of the environment variable carrying this network's RPC endpoint.
    pub fn rpc_env_key(&self) -> String {
        format!("WEB3_RPC_{}", self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChainId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(ChainId)
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        ChainId(id)
    }
}

/// Uniswap V3 fee tiers, in hundredths of a bip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeeTier {
    Lowest,
    Low,
    Medium,
    High,
}

impl FeeTier {
    pub const ALL: [FeeTier; 4] = [FeeTier::Lowest, FeeTier::Low, FeeTier::Medium, FeeTier::High];

    pub fn as_u32(&self) -> u32 {
        match self {
            FeeTier::Lowest => 100,
            FeeTier::Low => 500,
            FeeTier::Medium => 3000,
            FeeTier::High => 10000,
        }
    }

    pub fn from_u32(fee: u32) -> Option<Self> {
        match fee {
            100 => Some(FeeTier::Lowest),
            500 => Some(FeeTier::Low),
            3000 => Some(FeeTier::Medium),
            10000 => Some(FeeTier::High),
            _ => None,
        }
    }
}

/// Multicall batching for the on-chain quoter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchParams {
    pub multicall_chunk: usize,
    pub gas_limit_per_call: u64,
    /// Fraction of sub-calls (0..=1) that must succeed for a batch to be accepted.
    pub quote_min_success_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
    pub retries: usize,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolAddresses {
    pub v3_factory: Option<Address>,
    pub quoter_v2: Option<Address>,
    pub multicall: Address,
    pub pool_init_code_hash: H256,
    /// Fee-on-transfer detector. Without one, token fees are not fetched.
    pub token_fee_detector: Option<Address>,
}

#[derive(Debug, Clone)]
pub struct NetworkDescriptor {
    pub chain_id: ChainId,
    pub name: &'static str,
    pub rpc_timeout: Duration,
    pub multicall_gas_limit_per_call: u64,
    pub optimistic_batch_params: BatchParams,
    pub non_optimistic_batch_params: BatchParams,
    pub retry_options: RetryOptions,
    pub addresses: ProtocolAddresses,
    pub base_tokens: Vec<Address>,
    pub seconds_per_block: u64,
    /// Whether the quote provider is wrapped in a traffic switch on this network.
    pub quote_migration: bool,
    pub routing: RoutingConfig,
}

pub const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";
pub const UNISWAP_V3_FACTORY: &str = "0x1F98431c8aD98523631AE4a59f267346ea31F984";
pub const UNISWAP_QUOTER_V2: &str = "0x61fFE014bA17989E743c5F6cB21bF9697530B21e";
pub const V3_POOL_INIT_CODE_HASH: &str =
    "0xe34f199b19b2b4f47f68442619d555527d244f78a3297ea89325f843f87b8b54";

pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_GAS_LIMIT_PER_CALL: u64 = 375_000;

fn addr(s: &str) -> Address {
    s.parse().unwrap_or_default()
}

fn h256(s: &str) -> H256 {
    s.parse().unwrap_or_default()
}

fn default_retry() -> RetryOptions {
    RetryOptions {
        retries: 2,
        min_timeout_ms: 100,
        max_timeout_ms: 1_000,
    }
}

fn uniswap_addresses() -> ProtocolAddresses {
    ProtocolAddresses {
        v3_factory: Some(addr(UNISWAP_V3_FACTORY)),
        quoter_v2: Some(addr(UNISWAP_QUOTER_V2)),
        multicall: addr(MULTICALL3_ADDRESS),
        pool_init_code_hash: h256(V3_POOL_INIT_CODE_HASH),
        token_fee_detector: None,
    }
}

fn descriptor(
    chain_id: ChainId,
    name: &'static str,
    rpc_timeout_ms: u64,
    seconds_per_block: u64,
    addresses: ProtocolAddresses,
    base_tokens: &[&str],
    quote_migration: bool,
) -> NetworkDescriptor {
    NetworkDescriptor {
        chain_id,
        name,
        rpc_timeout: Duration::from_millis(rpc_timeout_ms),
        multicall_gas_limit_per_call: DEFAULT_GAS_LIMIT_PER_CALL,
        optimistic_batch_params: BatchParams {
            multicall_chunk: 110,
            gas_limit_per_call: 1_200_000,
            quote_min_success_rate: 0.1,
        },
        non_optimistic_batch_params: BatchParams {
            multicall_chunk: 80,
            gas_limit_per_call: 1_500_000,
            quote_min_success_rate: 0.2,
        },
        retry_options: default_retry(),
        addresses,
        base_tokens: base_tokens.iter().map(|t| addr(t)).collect(),
        seconds_per_block,
        quote_migration,
        routing: RoutingConfig::default(),
    }
}

static DESCRIPTORS: Lazy<HashMap<ChainId, NetworkDescriptor>> = Lazy::new(|| {
    let table = vec![
        descriptor(
            ChainId::MAINNET,
            "mainnet",
            DEFAULT_RPC_TIMEOUT_MS,
            12,
            uniswap_addresses(),
            &[
                "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2", // WETH
                "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", // USDC
                "0xdAC17F958D2ee523a2206206994597C13D831ec7", // USDT
                "0x6B175474E89094C44Da98b954EedeAC495271d0F", // DAI
            ],
            false,
        ),
        descriptor(
            ChainId::OPTIMISM,
            "optimism",
            DEFAULT_RPC_TIMEOUT_MS,
            2,
            uniswap_addresses(),
            &[
                "0x4200000000000000000000000000000000000006", // WETH
                "0x0b2C639c533813f4Aa9D7837CAf62653d097Ff85", // USDC
            ],
            false,
        ),
        descriptor(
            ChainId::ARBITRUM_ONE,
            "arbitrum",
            DEFAULT_RPC_TIMEOUT_MS,
            1,
            uniswap_addresses(),
            &[
                "0x82aF49447D8a07e3bd95BD0d56f35241523fBab1", // WETH
                "0xaf88d065e77c8cC2239327C5EDb3A432268e5831", // USDC
            ],
            false,
        ),
        // Protocol addresses on MODE come from configuration.
        descriptor(
            ChainId::MODE,
            "mode",
            8_000,
            60,
            ProtocolAddresses {
                v3_factory: None,
                quoter_v2: None,
                multicall: addr(MULTICALL3_ADDRESS),
                pool_init_code_hash: h256(V3_POOL_INIT_CODE_HASH),
                token_fee_detector: None,
            },
            &[
                "0x4200000000000000000000000000000000000006", // WETH
                "0xd988097fb8612cc24eeC14542bC03424c656005f", // USDC
                "0xf0F161fDA2712DB8b566946122a5af183995e2eD", // USDT
            ],
            true,
        ),
    ];
    table.into_iter().map(|d| (d.chain_id, d)).collect()
});

/// Built-in descriptor for a chain, if the router knows it.
pub fn network_descriptor(chain_id: ChainId) -> Option<NetworkDescriptor> {
    DESCRIPTORS.get(&chain_id).cloned()
}

pub fn known_chains() -> Vec<ChainId> {
    let mut chains: Vec<ChainId> = DESCRIPTORS.keys().copied().collect();
    chains.sort();
    chains
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_uses_longer_rpc_timeout() {
        let mode = network_descriptor(ChainId::MODE).expect("mode descriptor");
        assert_eq!(mode.rpc_timeout, Duration::from_millis(8_000));
        assert_eq!(mode.seconds_per_block, 60);
        assert!(mode.quote_migration);
        assert!(mode.addresses.v3_factory.is_none());

        let mainnet = network_descriptor(ChainId::MAINNET).expect("mainnet descriptor");
        assert_eq!(mainnet.rpc_timeout, Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS));
        assert_eq!(mainnet.multicall_gas_limit_per_call, 375_000);
    }

    #[test]
    fn test_chain_id_parsing() {
        assert_eq!("34443".parse::<ChainId>().unwrap(), ChainId::MODE);
        assert_eq!(ChainId::MODE.rpc_env_key(), "WEB3_RPC_34443");
        assert!("mode".parse::<ChainId>().is_err());
        assert_eq!(FeeTier::from_u32(3000), Some(FeeTier::Medium));
        assert_eq!(FeeTier::from_u32(42), None);
    }

    #[test]
    fn test_unknown_chain_has_no_descriptor() {
        assert!(network_descriptor(ChainId(999_999)).is_none());
        assert_eq!(known_chains().len(), 4);
    }
}
