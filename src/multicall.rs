use crate::error::{ProviderError, Result};
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A single contract call to be batched in a multicall.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    pub target: Address,
    pub call_data: Bytes,
}

/// Outcome of one sub-call. Failed sub-calls do not fail the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub success: bool,
    pub return_data: Bytes,
}

#[allow(deprecated)]
static AGGREGATE3: Lazy<Function> = Lazy::new(|| Function {
    name: "aggregate3".to_string(),
    inputs: vec![Param {
        name: "calls".to_string(),
        kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Bool,
            ParamType::Bytes,
        ]))),
        internal_type: None,
    }],
    outputs: vec![Param {
        name: "returnData".to_string(),
        kind: result_array_type(),
        internal_type: None,
    }],
    constant: None,
    state_mutability: StateMutability::Payable,
});

fn result_array_type() -> ParamType {
    ParamType::Array(Box::new(ParamType::Tuple(vec![
        ParamType::Bool,
        ParamType::Bytes,
    ])))
}

/// Multicall3 `aggregate3` executor.
///
/// Identical calls are coalesced, the rest is split into chunks of
/// `batch_size`. Every chunk carries a gas budget of `gas_limit_per_call` per
/// sub-call and a bounded timeout.
///
/// ## Example
///
/// ```rust,ignore
/// let multicall = Multicall::new(provider, multicall_address, 100)
///     .with_gas_limit_per_call(375_000);
/// let results = multicall.run(calls, None).await?;
/// ```
#[derive(Clone)]
pub struct Multicall<M: Middleware> {
    pub provider: Arc<M>,
    multicall_address: Address,
    batch_size: usize,
    gas_limit_per_call: u64,
    timeout: Duration,
}

impl<M: Middleware + 'static> Multicall<M> {
    pub fn new(provider: Arc<M>, multicall_address: Address, batch_size: usize) -> Self {
        Self {
            provider,
            multicall_address,
            batch_size: batch_size.max(1),
            gas_limit_per_call: crate::chain::DEFAULT_GAS_LIMIT_PER_CALL,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_gas_limit_per_call(mut self, gas: u64) -> Self {
        self.gas_limit_per_call = gas;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Runs a batch of calls, optionally at a specific block. Results keep the
    /// order of `calls`.
    pub async fn run(&self, calls: Vec<Call>, block: Option<BlockId>) -> Result<Vec<CallResult>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        // Coalesce identical calls to reduce load
        let mut unique_calls = indexmap::IndexMap::new();
        let mut original_indices = Vec::with_capacity(calls.len());
        for call in &calls {
            let (index, _) = unique_calls.insert_full((call.target, call.call_data.clone()), ());
            original_indices.push(index);
        }

        let unique_call_vec: Vec<Call> = unique_calls
            .into_keys()
            .map(|(target, call_data)| Call { target, call_data })
            .collect();
        debug!(
            total = calls.len(),
            unique = unique_call_vec.len(),
            "multicall coalesced calls"
        );

        let mut unique_results: Vec<CallResult> = Vec::with_capacity(unique_call_vec.len());
        for chunk in unique_call_vec.chunks(self.batch_size) {
            let results = self.execute_aggregate3(chunk, block).await?;
            if results.len() != chunk.len() {
                return Err(ProviderError::Decode(format!(
                    "multicall returned {} results for {} calls",
                    results.len(),
                    chunk.len()
                )));
            }
            unique_results.extend(results);
        }

        Ok(original_indices
            .into_iter()
            .map(|index| unique_results[index].clone())
            .collect())
    }

    async fn execute_aggregate3(
        &self,
        calls: &[Call],
        block: Option<BlockId>,
    ) -> Result<Vec<CallResult>> {
        // Call3 struct: (address target, bool allowFailure, bytes callData)
        let call_tokens: Vec<Token> = calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bool(true),
                    Token::Bytes(call.call_data.to_vec()),
                ])
            })
            .collect();
        let calldata = AGGREGATE3.encode_input(&[Token::Array(call_tokens)])?;

        let gas = U256::from(self.gas_limit_per_call) * U256::from(calls.len());
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.multicall_address)
            .data(calldata)
            .gas(gas)
            .into();

        let response = match tokio::time::timeout(self.timeout, self.provider.call(&tx, block)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ProviderError::unavailable("multicall", e)),
            Err(_) => return Err(ProviderError::timeout("multicall", self.timeout)),
        };

        decode_aggregate3(&response)
    }
}

/// Decodes `(bool success, bytes returnData)[]`.
pub fn decode_aggregate3(response: &[u8]) -> Result<Vec<CallResult>> {
    let decoded = ethers::abi::decode(&[result_array_type()], response)?;
    let results = decoded
        .into_iter()
        .next()
        .and_then(|t| t.into_array())
        .ok_or_else(|| ProviderError::Decode("invalid multicall response format".to_string()))?;

    results
        .into_iter()
        .map(|token| match token {
            Token::Tuple(fields) => match fields.as_slice() {
                [Token::Bool(success), Token::Bytes(data)] => Ok(CallResult {
                    success: *success,
                    return_data: Bytes::from(data.clone()),
                }),
                _ => Err(ProviderError::Decode("malformed multicall result".to_string())),
            },
            _ => Err(ProviderError::Decode("malformed multicall result".to_string())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_aggregate3_keeps_failures() {
        let encoded = ethers::abi::encode(&[Token::Array(vec![
            Token::Tuple(vec![Token::Bool(true), Token::Bytes(vec![0xaa])]),
            Token::Tuple(vec![Token::Bool(false), Token::Bytes(vec![])]),
        ])]);
        let results = decode_aggregate3(&encoded).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert_eq!(results[0].return_data.to_vec(), vec![0xaa]);
        assert!(!results[1].success);
    }

    #[test]
    fn test_decode_aggregate3_rejects_garbage() {
        assert!(decode_aggregate3(&[1, 2, 3]).is_err());
    }
}
