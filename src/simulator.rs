//! Swap transaction simulation: a remote simulation service with a local
//! `eth_estimateGas` fallback.

use crate::chain::ChainId;
use crate::error::{ProviderError, Result};
use crate::fallback::FallbackChain;
use crate::telemetry::ProviderContext;
use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_SIMULATION_TIMEOUT_MS: u64 = 2_500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub from: Address,
    pub to: Address,
    pub calldata: Bytes,
    pub value: U256,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStatus {
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationOutcome {
    pub status: SimulationStatus,
    pub gas_estimate: Option<U256>,
    pub simulator: String,
}

impl SimulationOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == SimulationStatus::Succeeded
    }
}

#[async_trait]
pub trait Simulator: Send + Sync {
    fn name(&self) -> &str;

    async fn simulate(&self, request: &SimulationRequest) -> Result<SimulationOutcome>;
}

/// Credentials for the remote simulation service. All of them must be set
/// for the remote simulator to be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSimulationCredentials {
    pub base_url: String,
    pub user: String,
    pub project: String,
    pub access_key: String,
}

#[derive(Debug, Deserialize)]
struct SimulateResponse {
    transaction: SimulatedTransaction,
}

#[derive(Debug, Deserialize)]
struct SimulatedTransaction {
    status: bool,
    #[serde(default)]
    gas_used: Option<u64>,
    #[serde(default)]
    error_message: Option<String>,
}

/// Remote simulation over HTTP, authenticated with an access key header.
pub struct TenderlySimulator {
    chain_id: ChainId,
    credentials: RemoteSimulationCredentials,
    client: reqwest::Client,
    timeout: Duration,
}

impl TenderlySimulator {
    pub fn new(chain_id: ChainId, credentials: RemoteSimulationCredentials, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            chain_id,
            credentials,
            client,
            timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/api/v1/account/{}/project/{}/simulate",
            self.credentials.base_url.trim_end_matches('/'),
            self.credentials.user,
            self.credentials.project
        )
    }
}

#[async_trait]
impl Simulator for TenderlySimulator {
    fn name(&self) -> &str {
        "tenderly"
    }

    async fn simulate(&self, request: &SimulationRequest) -> Result<SimulationOutcome> {
        let body = json!({
            "network_id": self.chain_id.to_string(),
            "from": request.from,
            "to": request.to,
            "input": request.calldata,
            "value": request.value.to_string(),
            "block_number": request.block_number,
            "estimate_gas": true,
            "save": false,
        });

        let response = self
            .client
            .post(self.endpoint())
            .header("X-Access-Key", &self.credentials.access_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::timeout(self.name(), self.timeout)
                } else {
                    ProviderError::unavailable(self.name(), e)
                }
            })?
            .error_for_status()
            .map_err(|e| ProviderError::unavailable(self.name(), e))?;

        let parsed: SimulateResponse = response.json().await?;
        let status = if parsed.transaction.status {
            SimulationStatus::Succeeded
        } else {
            SimulationStatus::Failed {
                reason: parsed
                    .transaction
                    .error_message
                    .unwrap_or_else(|| "reverted".to_string()),
            }
        };
        debug!(chain_id = %self.chain_id, ?status, "remote simulation finished");
        Ok(SimulationOutcome {
            status,
            gas_estimate: parsed.transaction.gas_used.map(U256::from),
            simulator: self.name().to_string(),
        })
    }
}

/// Local simulation through `eth_estimateGas`. A revert is a failed outcome,
/// not an error.
pub struct EthEstimateGasSimulator<M: Middleware> {
    chain_id: ChainId,
    provider: Arc<M>,
    timeout: Duration,
}

impl<M: Middleware + 'static> EthEstimateGasSimulator<M> {
    pub fn new(chain_id: ChainId, provider: Arc<M>, timeout: Duration) -> Self {
        Self {
            chain_id,
            provider,
            timeout,
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> Simulator for EthEstimateGasSimulator<M> {
    fn name(&self) -> &str {
        "eth_estimate_gas"
    }

    async fn simulate(&self, request: &SimulationRequest) -> Result<SimulationOutcome> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(request.from)
            .to(request.to)
            .data(request.calldata.clone())
            .value(request.value)
            .into();
        let block = request
            .block_number
            .map(|b| BlockId::Number(BlockNumber::Number(b.into())));

        let estimate = tokio::time::timeout(self.timeout, self.provider.estimate_gas(&tx, block))
            .await
            .map_err(|_| ProviderError::timeout(self.name(), self.timeout))?;

        let outcome = match estimate {
            Ok(gas) => SimulationOutcome {
                status: SimulationStatus::Succeeded,
                gas_estimate: Some(gas),
                simulator: self.name().to_string(),
            },
            Err(e) => {
                warn!(chain_id = %self.chain_id, error = %e, "gas estimation reverted");
                SimulationOutcome {
                    status: SimulationStatus::Failed {
                        reason: e.to_string(),
                    },
                    gas_estimate: None,
                    simulator: self.name().to_string(),
                }
            }
        };
        Ok(outcome)
    }
}

/// Remote simulator first, local estimation when it fails or is not
/// configured.
pub struct FallbackSimulator {
    chain_id: ChainId,
    ctx: ProviderContext,
    remote: Option<Arc<dyn Simulator>>,
    local: Arc<dyn Simulator>,
}

impl FallbackSimulator {
    pub fn new(
        chain_id: ChainId,
        ctx: ProviderContext,
        remote: Option<Arc<dyn Simulator>>,
        local: Arc<dyn Simulator>,
    ) -> Self {
        Self {
            chain_id,
            ctx,
            remote,
            local,
        }
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }
}

#[async_trait]
impl Simulator for FallbackSimulator {
    fn name(&self) -> &str {
        "fallback_simulator"
    }

    async fn simulate(&self, request: &SimulationRequest) -> Result<SimulationOutcome> {
        let mut chain: FallbackChain<'_, SimulationOutcome> =
            FallbackChain::new(format!("simulator:{}", self.chain_id), self.ctx.clone());
        if let Some(remote) = &self.remote {
            chain = chain.candidate(remote.name().to_string(), move || remote.simulate(request));
        }
        chain
            .candidate(self.local.name().to_string(), || self.local.simulate(request))
            .try_build()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{ChannelSink, ProviderEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Simulator for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn simulate(&self, _request: &SimulationRequest) -> Result<SimulationOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::unavailable(self.name, "503"));
            }
            Ok(SimulationOutcome {
                status: SimulationStatus::Succeeded,
                gas_estimate: Some(U256::from(100_000)),
                simulator: self.name.to_string(),
            })
        }
    }

    fn scripted(name: &'static str, fail: bool) -> Arc<Scripted> {
        Arc::new(Scripted {
            name,
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    fn request() -> SimulationRequest {
        SimulationRequest {
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            calldata: Bytes::default(),
            value: U256::zero(),
            block_number: None,
        }
    }

    #[tokio::test]
    async fn test_remote_failure_uses_local() {
        let (sink, mut events) = ChannelSink::new();
        let remote = scripted("remote", true);
        let local = scripted("local", false);
        let simulator = FallbackSimulator::new(
            ChainId::MODE,
            ProviderContext::new(Arc::new(sink)),
            Some(remote.clone()),
            local.clone(),
        );

        let outcome = simulator.simulate(&request()).await.unwrap();
        assert_eq!(outcome.simulator, "local");
        assert!(outcome.succeeded());
        assert!(matches!(
            events.recv().await,
            Some(ProviderEvent::FallbackStep { attempt: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_without_remote_goes_local() {
        let local = scripted("local", false);
        let simulator = FallbackSimulator::new(ChainId::MODE, ProviderContext::null(), None, local.clone());
        assert!(!simulator.has_remote());
        simulator.simulate(&request()).await.unwrap();
        assert_eq!(local.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_success_skips_local() {
        let local = scripted("local", false);
        let simulator = FallbackSimulator::new(
            ChainId::MODE,
            ProviderContext::null(),
            Some(scripted("remote", false)),
            local.clone(),
        );
        assert_eq!(simulator.simulate(&request()).await.unwrap().simulator, "remote");
        assert_eq!(local.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remote_endpoint() {
        let simulator = TenderlySimulator::new(
            ChainId::MODE,
            RemoteSimulationCredentials {
                base_url: "https://api.tenderly.co/".into(),
                user: "u".into(),
                project: "p".into(),
                access_key: "k".into(),
            },
            Duration::from_millis(DEFAULT_SIMULATION_TIMEOUT_MS),
        )
        .unwrap();
        assert_eq!(
            simulator.endpoint(),
            "https://api.tenderly.co/api/v1/account/u/project/p/simulate"
        );
    }
}
