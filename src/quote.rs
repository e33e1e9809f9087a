//! On-chain quoting through QuoterV2.
//!
//! Every (route, amount) pair becomes one `quoteExactInput` or
//! `quoteExactOutput` sub-call in a Multicall3 batch. A reverted sub-call gives
//! `quote: None` for that amount; the batch as a whole only fails if too few
//! sub-calls succeed, in which case it is retried with exponential backoff.

use crate::chain::{BatchParams, ChainId, FeeTier, NetworkDescriptor, RetryOptions};
use crate::contracts::uniswap_v3::{QuoteExactInputCall, QuoteExactOutputCall};
use crate::error::{ProviderError, Result};
use crate::multicall::{CallResult, Call, Multicall};
use crate::provider::DataProvider;
use crate::traffic_switch::{Comparison, ResultComparator};
use async_trait::async_trait;
use ethers::abi::{AbiEncode, ParamType};
use ethers::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeType {
    ExactInput,
    ExactOutput,
}

/// Numeric form, as used in cache keys.
impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeType::ExactInput => write!(f, "0"),
            TradeType::ExactOutput => write!(f, "1"),
        }
    }
}

/// A V3 route as a token path with one fee tier per hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuoteRoute {
    tokens: Vec<Address>,
    fees: Vec<FeeTier>,
}

impl QuoteRoute {
    pub fn new(tokens: Vec<Address>, fees: Vec<FeeTier>) -> Result<Self> {
        if tokens.len() < 2 || tokens.len() != fees.len() + 1 {
            return Err(ProviderError::InvalidRequest(format!(
                "route needs n+1 tokens for n fees, got {} tokens and {} fees",
                tokens.len(),
                fees.len()
            )));
        }
        Ok(Self { tokens, fees })
    }

    pub fn tokens(&self) -> &[Address] {
        &self.tokens
    }

    pub fn fees(&self) -> &[FeeTier] {
        &self.fees
    }

    pub fn token_in(&self) -> Address {
        self.tokens[0]
    }

    pub fn token_out(&self) -> Address {
        self.tokens[self.tokens.len() - 1]
    }

    /// Packed `token (20) | fee (3) | token ...`. Exact output paths run from
    /// the output token back to the input token.
    pub fn encode_path(&self, trade_type: TradeType) -> Bytes {
        let mut tokens: Vec<Address> = self.tokens.clone();
        let mut fees: Vec<FeeTier> = self.fees.clone();
        if trade_type == TradeType::ExactOutput {
            tokens.reverse();
            fees.reverse();
        }

        let mut out = Vec::with_capacity(tokens.len() * 20 + fees.len() * 3);
        for (i, token) in tokens.iter().enumerate() {
            out.extend_from_slice(token.as_bytes());
            if let Some(fee) = fees.get(i) {
                out.extend_from_slice(&fee.as_u32().to_be_bytes()[1..]);
            }
        }
        out.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub trade_type: TradeType,
    pub amounts: Vec<U256>,
    pub routes: Vec<QuoteRoute>,
    pub block_number: Option<u64>,
    /// Selects the quoter batch parameters for this request.
    pub optimistic_cached_routes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountQuote {
    pub amount: U256,
    /// `None` when the sub-call reverted.
    pub quote: Option<U256>,
    pub sqrt_price_x96_after_list: Vec<U256>,
    pub initialized_ticks_crossed_list: Vec<u32>,
    pub gas_estimate: Option<U256>,
}

impl AmountQuote {
    fn failed(amount: U256) -> Self {
        Self {
            amount,
            quote: None,
            sqrt_price_x96_after_list: Vec::new(),
            initialized_ticks_crossed_list: Vec::new(),
            gas_estimate: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteWithQuotes {
    pub route: QuoteRoute,
    pub quotes: Vec<AmountQuote>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteBatch {
    pub routes_with_quotes: Vec<RouteWithQuotes>,
    pub block_number: Option<u64>,
}

fn decode_quote(amount: U256, result: &CallResult) -> AmountQuote {
    if !result.success {
        return AmountQuote::failed(amount);
    }
    let decoded = ethers::abi::decode(
        &[
            ParamType::Uint(256),
            ParamType::Array(Box::new(ParamType::Uint(160))),
            ParamType::Array(Box::new(ParamType::Uint(32))),
            ParamType::Uint(256),
        ],
        result.return_data.as_ref(),
    );
    let Ok(tokens) = decoded else {
        return AmountQuote::failed(amount);
    };
    let mut tokens = tokens.into_iter();
    let quote = tokens.next().and_then(|t| t.into_uint());
    let sqrt_prices = tokens
        .next()
        .and_then(|t| t.into_array())
        .map(|items| items.into_iter().filter_map(|t| t.into_uint()).collect())
        .unwrap_or_default();
    let ticks_crossed = tokens
        .next()
        .and_then(|t| t.into_array())
        .map(|items| {
            items
                .into_iter()
                .filter_map(|t| t.into_uint())
                .map(|u| u.low_u32())
                .collect()
        })
        .unwrap_or_default();
    let gas_estimate = tokens.next().and_then(|t| t.into_uint());

    AmountQuote {
        amount,
        quote,
        sqrt_price_x96_after_list: sqrt_prices,
        initialized_ticks_crossed_list: ticks_crossed,
        gas_estimate,
    }
}

pub struct OnChainQuoteProvider<M: Middleware> {
    name: String,
    chain_id: ChainId,
    provider: Arc<M>,
    multicall_address: Address,
    quoter: Address,
    optimistic_batch: BatchParams,
    non_optimistic_batch: BatchParams,
    retry: RetryOptions,
    timeout: Duration,
}

impl<M: Middleware + 'static> OnChainQuoteProvider<M> {
    pub fn new(name: impl Into<String>, provider: Arc<M>, descriptor: &NetworkDescriptor) -> Result<Self> {
        let quoter = descriptor
            .addresses
            .quoter_v2
            .ok_or_else(|| ProviderError::missing(descriptor.chain_id, "quoter_v2"))?;
        Ok(Self {
            name: name.into(),
            chain_id: descriptor.chain_id,
            provider,
            multicall_address: descriptor.addresses.multicall,
            quoter,
            optimistic_batch: descriptor.optimistic_batch_params,
            non_optimistic_batch: descriptor.non_optimistic_batch_params,
            retry: descriptor.retry_options,
            timeout: descriptor.rpc_timeout,
        })
    }

    fn batch_params(&self, optimistic: bool) -> BatchParams {
        if optimistic {
            self.optimistic_batch
        } else {
            self.non_optimistic_batch
        }
    }

    fn build_calls(&self, request: &QuoteRequest) -> Vec<Call> {
        let mut calls = Vec::with_capacity(request.routes.len() * request.amounts.len());
        for route in &request.routes {
            let path = route.encode_path(request.trade_type);
            for amount in &request.amounts {
                let call_data: Vec<u8> = match request.trade_type {
                    TradeType::ExactInput => QuoteExactInputCall {
                        path: path.clone(),
                        amount_in: *amount,
                    }
                    .encode(),
                    TradeType::ExactOutput => QuoteExactOutputCall {
                        path: path.clone(),
                        amount_out: *amount,
                    }
                    .encode(),
                };
                calls.push(Call {
                    target: self.quoter,
                    call_data: call_data.into(),
                });
            }
        }
        calls
    }

    async fn attempt(&self, calls: &[Call], batch: BatchParams, block: Option<BlockId>) -> Result<Vec<CallResult>> {
        let multicall = Multicall::new(self.provider.clone(), self.multicall_address, batch.multicall_chunk)
            .with_gas_limit_per_call(batch.gas_limit_per_call)
            .with_timeout(self.timeout);
        let results = multicall.run(calls.to_vec(), block).await?;

        let successes = results.iter().filter(|r| r.success).count();
        let rate = successes as f64 / results.len().max(1) as f64;
        if rate < batch.quote_min_success_rate {
            warn!(
                provider = %self.name,
                chain_id = %self.chain_id,
                rate,
                required = batch.quote_min_success_rate,
                "quote batch success rate too low"
            );
            return Err(ProviderError::unavailable(
                self.name.clone(),
                format!(
                    "success rate {:.2} below {:.2}",
                    rate, batch.quote_min_success_rate
                ),
            ));
        }
        Ok(results)
    }
}

#[async_trait]
impl<M: Middleware + 'static> DataProvider for OnChainQuoteProvider<M> {
    type Key = QuoteRequest;
    type Value = QuoteBatch;

    fn name(&self) -> &str {
        &self.name
    }

    fn chain_id(&self) -> Option<ChainId> {
        Some(self.chain_id)
    }

    async fn fetch(&self, request: &QuoteRequest) -> Result<QuoteBatch> {
        if request.routes.is_empty() || request.amounts.is_empty() {
            return Ok(QuoteBatch {
                routes_with_quotes: Vec::new(),
                block_number: request.block_number,
            });
        }

        let batch = self.batch_params(request.optimistic_cached_routes);
        let calls = self.build_calls(request);
        let block = request
            .block_number
            .map(|b| BlockId::Number(BlockNumber::Number(b.into())));

        let strategy = ExponentialBackoff::from_millis(self.retry.min_timeout_ms.max(1))
            .max_delay(Duration::from_millis(self.retry.max_timeout_ms))
            .map(jitter)
            .take(self.retry.retries);
        let results = Retry::spawn(strategy, || self.attempt(&calls, batch, block)).await?;

        let per_route = request.amounts.len();
        let routes_with_quotes = request
            .routes
            .iter()
            .enumerate()
            .map(|(r, route)| RouteWithQuotes {
                route: route.clone(),
                quotes: request
                    .amounts
                    .iter()
                    .enumerate()
                    .map(|(a, amount)| decode_quote(*amount, &results[r * per_route + a]))
                    .collect(),
            })
            .collect();

        debug!(
            provider = %self.name,
            chain_id = %self.chain_id,
            routes = request.routes.len(),
            amounts = per_route,
            optimistic = request.optimistic_cached_routes,
            "quoted routes on chain"
        );
        Ok(QuoteBatch {
            routes_with_quotes,
            block_number: request.block_number,
        })
    }
}

/// Compares quoted amounts only. Gas estimates and tick data are allowed to
/// differ between quoter deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuoteBatchComparator;

impl ResultComparator<QuoteBatch> for QuoteBatchComparator {
    fn compare(&self, current: &QuoteBatch, target: &QuoteBatch) -> Comparison {
        if current.routes_with_quotes.len() != target.routes_with_quotes.len() {
            return Comparison::Mismatch(format!(
                "route count differs: current={} target={}",
                current.routes_with_quotes.len(),
                target.routes_with_quotes.len()
            ));
        }
        let mut diverging = 0usize;
        let mut first = None;
        for (c, t) in current
            .routes_with_quotes
            .iter()
            .zip(&target.routes_with_quotes)
        {
            for (cq, tq) in c.quotes.iter().zip(&t.quotes) {
                if cq.quote != tq.quote {
                    diverging += 1;
                    first.get_or_insert_with(|| {
                        format!(
                            "amount {} quoted {:?} vs {:?}",
                            cq.amount, cq.quote, tq.quote
                        )
                    });
                }
            }
            if c.quotes.len() != t.quotes.len() {
                diverging += 1;
            }
        }
        match first {
            None if diverging == 0 => Comparison::Match,
            Some(detail) => Comparison::Mismatch(format!("{diverging} quotes differ, first: {detail}")),
            None => Comparison::Mismatch(format!("{diverging} routes have different amount counts")),
        }
    }
}
