//! Token metadata: on-chain ERC-20 reads, token lists, and the cached
//! composite the router consumes.

use crate::cache::{CacheProvider, CachingProvider};
use crate::chain::ChainId;
use crate::contracts::erc20::{DecimalsCall, SymbolCall};
use crate::error::{ProviderError, Result};
use crate::fallback::FallbackChain;
use crate::metrics;
use crate::multicall::{Call, CallResult, Multicall};
use crate::provider::{DataProvider, TokenProvider};
use crate::subgraph::SnapshotStore;
use crate::telemetry::ProviderContext;
use async_trait::async_trait;
use ethers::abi::{AbiEncode, ParamType};
use ethers::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
}

/// Addresses are sorted and deduplicated so equal requests hash equally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenRequest {
    pub addresses: Vec<Address>,
    pub block_number: Option<u64>,
}

impl TokenRequest {
    pub fn new(addresses: impl IntoIterator<Item = Address>, block_number: Option<u64>) -> Self {
        let addresses: BTreeSet<Address> = addresses.into_iter().collect();
        Self {
            addresses: addresses.into_iter().collect(),
            block_number,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenAccessor {
    tokens: BTreeMap<Address, Token>,
}

impl TokenAccessor {
    pub fn new(tokens: impl IntoIterator<Item = Token>) -> Self {
        Self {
            tokens: tokens.into_iter().map(|t| (t.address, t)).collect(),
        }
    }

    pub fn get_token_by_address(&self, address: &Address) -> Option<&Token> {
        self.tokens.get(address)
    }

    pub fn get_token_by_symbol(&self, symbol: &str) -> Option<&Token> {
        self.tokens
            .values()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
    }

    pub fn all_tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn merge(&mut self, other: TokenAccessor) {
        self.tokens.extend(other.tokens);
    }
}

fn decode_decimals(result: &CallResult) -> Option<u8> {
    if !result.success {
        return None;
    }
    let tokens = ethers::abi::decode(&[ParamType::Uint(8)], result.return_data.as_ref()).ok()?;
    let value = tokens.first()?.clone().into_uint()?;
    u8::try_from(value).ok()
}

fn decode_symbol(result: &CallResult) -> Option<String> {
    if !result.success {
        return None;
    }
    let tokens = ethers::abi::decode(&[ParamType::String], result.return_data.as_ref()).ok()?;
    tokens.first()?.clone().into_string()
}

/// Reads `decimals()` and `symbol()` through Multicall3. Tokens whose calls
/// revert are left out.
pub struct OnChainTokenProvider<M: Middleware> {
    chain_id: ChainId,
    multicall: Multicall<M>,
}

impl<M: Middleware + 'static> OnChainTokenProvider<M> {
    pub fn new(chain_id: ChainId, multicall: Multicall<M>) -> Self {
        Self { chain_id, multicall }
    }
}

#[async_trait]
impl<M: Middleware + 'static> DataProvider for OnChainTokenProvider<M> {
    type Key = TokenRequest;
    type Value = TokenAccessor;

    fn name(&self) -> &str {
        "token_onchain"
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, request: &TokenRequest) -> Result<TokenAccessor> {
        if request.addresses.is_empty() {
            return Ok(TokenAccessor::default());
        }

        let decimals_data: Bytes = DecimalsCall.encode().into();
        let symbol_data: Bytes = SymbolCall.encode().into();
        let mut calls = Vec::with_capacity(request.addresses.len() * 2);
        for token in &request.addresses {
            calls.push(Call {
                target: *token,
                call_data: decimals_data.clone(),
            });
            calls.push(Call {
                target: *token,
                call_data: symbol_data.clone(),
            });
        }

        let block = request
            .block_number
            .map(|b| BlockId::Number(BlockNumber::Number(b.into())));
        let results = self.multicall.run(calls, block).await?;

        let mut tokens = Vec::with_capacity(request.addresses.len());
        for (i, address) in request.addresses.iter().enumerate() {
            match (decode_decimals(&results[i * 2]), decode_symbol(&results[i * 2 + 1])) {
                (Some(decimals), Some(symbol)) => tokens.push(Token {
                    address: *address,
                    symbol,
                    decimals,
                }),
                _ => debug!(token = ?address, "token metadata calls failed, skipping"),
            }
        }

        info!(
            chain_id = %self.chain_id,
            requested = request.addresses.len(),
            resolved = tokens.len(),
            "fetched token metadata on chain"
        );
        Ok(TokenAccessor::new(tokens))
    }
}

#[derive(Debug, Deserialize)]
struct TokenListDocument {
    tokens: Vec<TokenListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenListEntry {
    chain_id: u64,
    address: Address,
    symbol: String,
    decimals: u8,
}

/// Token list in the standard `{"tokens": [...]}` format, filtered to one
/// chain. Unknown addresses are simply absent from the result.
#[derive(Debug, Clone)]
pub struct StaticTokenListProvider {
    name: &'static str,
    chain_id: ChainId,
    tokens: Arc<TokenAccessor>,
}

impl StaticTokenListProvider {
    pub fn from_json(chain_id: ChainId, json: &[u8]) -> Result<Self> {
        let document: TokenListDocument = serde_json::from_slice(json)?;
        let tokens = document
            .tokens
            .into_iter()
            .filter(|t| t.chain_id == chain_id.0)
            .map(|t| Token {
                address: t.address,
                symbol: t.symbol,
                decimals: t.decimals,
            });
        Ok(Self {
            name: "token_list",
            chain_id,
            tokens: Arc::new(TokenAccessor::new(tokens)),
        })
    }

    pub fn empty(chain_id: ChainId) -> Self {
        Self {
            name: "token_list",
            chain_id,
            tokens: Arc::new(TokenAccessor::default()),
        }
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl DataProvider for StaticTokenListProvider {
    type Key = TokenRequest;
    type Value = TokenAccessor;

    fn name(&self) -> &str {
        self.name
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, request: &TokenRequest) -> Result<TokenAccessor> {
        Ok(TokenAccessor::new(
            request
                .addresses
                .iter()
                .filter_map(|a| self.tokens.get_token_by_address(a).cloned()),
        ))
    }
}

/// Where the token list can be loaded from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenListSource {
    pub bucket: Option<String>,
    pub key: String,
    pub url: Option<String>,
    pub path: Option<String>,
}

async fn fetch_token_list_url(chain_id: ChainId, url: String, timeout: Duration) -> Result<StaticTokenListProvider> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let body = client
        .get(&url)
        .send()
        .await?
        .error_for_status()
        .map_err(|e| ProviderError::unavailable("token_list_url", e))?
        .bytes()
        .await?;
    StaticTokenListProvider::from_json(chain_id, &body)
}

async fn read_token_list_file(chain_id: ChainId, path: String) -> Result<StaticTokenListProvider> {
    let bytes = tokio::fs::read(&path).await?;
    StaticTokenListProvider::from_json(chain_id, &bytes)
}

async fn load_token_list(
    name: &'static str,
    ctx: ProviderContext,
    chain_id: ChainId,
    store: Option<Arc<dyn SnapshotStore>>,
    source: TokenListSource,
    timeout: Duration,
) -> StaticTokenListProvider {
    let TokenListSource { bucket, key, url, path } = source;
    let list = FallbackChain::new(format!("{name}:{chain_id}"), ctx)
        .candidate("token_list_bucket", move || async move {
            let store = store.ok_or_else(|| ProviderError::missing(chain_id, "snapshot.base_url"))?;
            let bucket = bucket.ok_or_else(|| ProviderError::missing(chain_id, "TOKEN_LIST_CACHE_BUCKET"))?;
            let bytes = store.get_object(&bucket, &key).await?;
            StaticTokenListProvider::from_json(chain_id, &bytes)
        })
        .candidate("token_list_url", move || async move {
            let url = url.ok_or_else(|| ProviderError::missing(chain_id, "token_list.url"))?;
            fetch_token_list_url(chain_id, url, timeout).await
        })
        .candidate("token_list_file", move || async move {
            let path = path.ok_or_else(|| ProviderError::missing(chain_id, "token_list.path"))?;
            read_token_list_file(chain_id, path).await
        })
        .build_or("empty", move || async move { StaticTokenListProvider::empty(chain_id) })
        .await;
    list.named(name)
}

/// Token list from the bucket, then the public URL, then a local file, then
/// an empty list.
pub async fn build_token_list_provider(
    ctx: ProviderContext,
    chain_id: ChainId,
    store: Option<Arc<dyn SnapshotStore>>,
    source: TokenListSource,
    timeout: Duration,
) -> StaticTokenListProvider {
    load_token_list("token_list", ctx, chain_id, store, source, timeout).await
}

/// Unsupported tokens, cached per request. An unavailable list blocks nothing.
pub async fn build_blocked_token_list_provider(
    ctx: ProviderContext,
    chain_id: ChainId,
    source: TokenListSource,
    timeout: Duration,
    ttl: Duration,
) -> CachingProvider<StaticTokenListProvider> {
    let list = load_token_list("blocked_token_list", ctx, chain_id, None, source, timeout).await;
    info!(chain_id = %chain_id, blocked = list.len(), "loaded blocked token list");
    CachingProvider::in_memory(list, &format!("blocked_tokens:{chain_id}"), ttl)
}

/// Per-token cache in front of the token list, with on-chain reads for
/// whatever the list does not know.
pub struct CachingTokenProviderWithFallback {
    chain_id: ChainId,
    cache: Arc<dyn CacheProvider<Address, Token>>,
    ttl: Duration,
    primary: TokenProvider,
    fallback: TokenProvider,
}

impl CachingTokenProviderWithFallback {
    pub fn new(
        chain_id: ChainId,
        cache: Arc<dyn CacheProvider<Address, Token>>,
        ttl: Duration,
        primary: TokenProvider,
        fallback: TokenProvider,
    ) -> Self {
        Self {
            chain_id,
            cache,
            ttl,
            primary,
            fallback,
        }
    }

    async fn cached(&self, address: &Address) -> Option<Token> {
        match self.cache.get(address).await {
            Ok(Some(token)) => {
                metrics::increment_cache_hit(self.cache.name());
                Some(token)
            }
            Ok(None) => {
                metrics::increment_cache_miss(self.cache.name());
                None
            }
            Err(e) => {
                warn!(cache = %self.cache.name(), error = %e, "token cache unavailable");
                metrics::increment_cache_tier_error(self.cache.name());
                None
            }
        }
    }
}

#[async_trait]
impl DataProvider for CachingTokenProviderWithFallback {
    type Key = TokenRequest;
    type Value = TokenAccessor;

    fn name(&self) -> &str {
        "caching_token_with_fallback"
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, request: &TokenRequest) -> Result<TokenAccessor> {
        let mut found = TokenAccessor::default();
        let mut missing = Vec::new();
        for address in &request.addresses {
            match self.cached(address).await {
                Some(token) => {
                    found.tokens.insert(*address, token);
                }
                None => missing.push(*address),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let mut fresh = match self
            .primary
            .fetch(&TokenRequest::new(missing.iter().copied(), request.block_number))
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(provider = %self.primary.name(), error = %e, "primary token provider failed");
                TokenAccessor::default()
            }
        };

        let unresolved: Vec<Address> = missing
            .iter()
            .filter(|a| fresh.get_token_by_address(a).is_none())
            .copied()
            .collect();
        if !unresolved.is_empty() {
            debug!(count = unresolved.len(), "resolving tokens through fallback provider");
            let on_chain = self
                .fallback
                .fetch(&TokenRequest::new(unresolved, request.block_number))
                .await?;
            fresh.merge(on_chain);
        }

        for token in fresh.all_tokens() {
            if let Err(e) = self.cache.set(token.address, token.clone(), self.ttl).await {
                warn!(cache = %self.cache.name(), error = %e, "failed to cache token");
            }
        }
        found.merge(fresh);
        Ok(found)
    }
}

/// Outcome of checking a token contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenValidation {
    Valid { decimals: u8 },
    /// The contract does not answer `decimals()`.
    NotErc20,
}

impl TokenValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, TokenValidation::Valid { .. })
    }
}

/// On-chain `decimals()` check. RPC failures propagate so they are never
/// cached as a verdict.
pub struct TokenValidatorProvider<M: Middleware> {
    chain_id: ChainId,
    multicall: Multicall<M>,
}

impl<M: Middleware + 'static> TokenValidatorProvider<M> {
    pub fn new(chain_id: ChainId, multicall: Multicall<M>) -> Self {
        Self { chain_id, multicall }
    }
}

#[async_trait]
impl<M: Middleware + 'static> DataProvider for TokenValidatorProvider<M> {
    type Key = Address;
    type Value = TokenValidation;

    fn name(&self) -> &str {
        "token_validator"
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, token: &Address) -> Result<TokenValidation> {
        let results = self
            .multicall
            .run(
                vec![Call {
                    target: *token,
                    call_data: DecimalsCall.encode().into(),
                }],
                None,
            )
            .await?;
        let result = results
            .first()
            .ok_or_else(|| ProviderError::Decode("empty validation result".to_string()))?;
        Ok(match decode_decimals(result) {
            Some(decimals) => TokenValidation::Valid { decimals },
            None => TokenValidation::NotErc20,
        })
    }
}
