//! Provider doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use sor_provider_sdk::chain::ChainId;
use sor_provider_sdk::error::{ProviderError, Result};
use sor_provider_sdk::pools::{PoolAccessor, PoolRequest};
use sor_provider_sdk::provider::DataProvider;
use sor_provider_sdk::telemetry::ProviderEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Answers `"{prefix}:{key}"`.
    Answer(&'static str),
    Fail,
    /// Answers after sleeping.
    Slow(Duration, &'static str),
}

/// Keyed provider that counts its calls and follows a fixed behaviour.
pub struct ScriptedProvider {
    name: &'static str,
    chain_id: Option<ChainId>,
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            name,
            chain_id: None,
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn on_chain(name: &'static str, chain_id: ChainId, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            name,
            chain_id: Some(chain_id),
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataProvider for ScriptedProvider {
    type Key = u32;
    type Value = String;

    fn name(&self) -> &str {
        self.name
    }

    fn chain_id(&self) -> Option<ChainId> {
        self.chain_id
    }

    async fn fetch(&self, key: &u32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Answer(prefix) => Ok(format!("{prefix}:{key}")),
            Behaviour::Fail => Err(ProviderError::unavailable(self.name, "upstream returned 503")),
            Behaviour::Slow(delay, prefix) => {
                tokio::time::sleep(*delay).await;
                Ok(format!("{prefix}:{key}"))
            }
        }
    }
}

/// Pool provider that knows no pools.
pub struct EmptyPoolProvider;

#[async_trait]
impl DataProvider for EmptyPoolProvider {
    type Key = PoolRequest;
    type Value = PoolAccessor;

    fn name(&self) -> &str {
        "empty_pools"
    }

    async fn fetch(&self, _request: &PoolRequest) -> Result<PoolAccessor> {
        Ok(PoolAccessor::new(Vec::new()))
    }
}

/// Waits for the next event, failing the test after one second.
pub async fn next_event(events: &mut UnboundedReceiver<ProviderEvent>) -> ProviderEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("no event within 1s")
        .expect("event channel closed")
}

/// Every event already emitted.
pub fn drain(events: &mut UnboundedReceiver<ProviderEvent>) -> Vec<ProviderEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
