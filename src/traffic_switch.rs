//! # Traffic Switch
//!
//! Runs two implementations of the same provider side by side so one can
//! replace the other in production without a flag-day cutover.
//!
//! ## States
//!
//! | state              | authoritative | shadow  |
//! |--------------------|---------------|---------|
//! | `Shadowing`        | current       | target  |
//! | `Promoted`         | target        | current |
//! | `CutoverComplete`  | target        | none    |
//!
//! Transitions are operator driven through [`SwitchHandle`] (or by loading a
//! new [`TrafficSwitchConfig`]); the proxy never changes state on its own.
//!
//! ## Guarantees
//!
//! - The caller only ever waits on the authoritative provider. The shadow call
//!   runs on its own task and its outcome is reported through the
//!   [`crate::telemetry::EventSink`].
//! - An authoritative failure propagates as-is. The shadow is never used as an
//!   implicit fallback.
//! - A shadow failure or timeout is reported and swallowed.
//! - On a mismatch, the source of truth (if any) is consulted off the caller's
//!   path to tell which side drifted.

use crate::chain::ChainId;
use crate::error::{ProviderError, Result};
use crate::metrics;
use crate::provider::{DataProvider, SharedProvider};
use crate::telemetry::{ProviderContext, ProviderEvent, SwitchSide};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    #[default]
    Shadowing,
    Promoted,
    CutoverComplete,
}

impl std::str::FromStr for SwitchState {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shadowing" => Ok(SwitchState::Shadowing),
            "promoted" => Ok(SwitchState::Promoted),
            "cutover_complete" | "cutover-complete" => Ok(SwitchState::CutoverComplete),
            other => Err(ProviderError::InvalidRequest(format!(
                "unknown traffic switch state '{other}'"
            ))),
        }
    }
}

fn default_sample_pct() -> f64 {
    100.0
}

fn default_shadow_timeout_ms() -> u64 {
    10_000
}

fn default_audit_on_mismatch() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSwitchConfig {
    #[serde(default, alias = "mode")]
    pub state: SwitchState,
    /// Percentage of calls (0..=100) that also invoke the shadow side.
    #[serde(default = "default_sample_pct")]
    pub shadow_sample_pct: f64,
    /// In `Promoted`, percentage of calls (0..=100) answered by the target.
    #[serde(default = "default_sample_pct")]
    pub promotion_pct: f64,
    #[serde(default = "default_shadow_timeout_ms")]
    pub shadow_timeout_ms: u64,
    #[serde(default = "default_audit_on_mismatch")]
    pub audit_on_mismatch: bool,
}

impl Default for TrafficSwitchConfig {
    fn default() -> Self {
        Self {
            state: SwitchState::default(),
            shadow_sample_pct: default_sample_pct(),
            promotion_pct: default_sample_pct(),
            shadow_timeout_ms: default_shadow_timeout_ms(),
            audit_on_mismatch: default_audit_on_mismatch(),
        }
    }
}

impl TrafficSwitchConfig {
    pub fn shadow_timeout(&self) -> Duration {
        Duration::from_millis(self.shadow_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    Match,
    Mismatch(String),
}

/// Decides whether two results from different implementations agree.
pub trait ResultComparator<V>: Send + Sync {
    fn compare(&self, current: &V, target: &V) -> Comparison;
}

/// Exact equality, with both values in the divergence message.
pub struct EqualityComparator<V>(PhantomData<fn(&V)>);

impl<V> Default for EqualityComparator<V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<V> ResultComparator<V> for EqualityComparator<V>
where
    V: PartialEq + Debug,
{
    fn compare(&self, current: &V, target: &V) -> Comparison {
        if current == target {
            Comparison::Match
        } else {
            Comparison::Mismatch(format!("current={current:?} target={target:?}"))
        }
    }
}

fn sampled(pct: f64) -> bool {
    if pct >= 100.0 {
        true
    } else if pct <= 0.0 {
        false
    } else {
        rand::thread_rng().gen_range(0.0..100.0) < pct
    }
}

/// Operator control over a running switch. Cheap to clone.
#[derive(Clone)]
pub struct SwitchHandle {
    name: String,
    config: Arc<ArcSwap<TrafficSwitchConfig>>,
}

impl SwitchHandle {
    pub fn config(&self) -> TrafficSwitchConfig {
        self.config.load().as_ref().clone()
    }

    pub fn state(&self) -> SwitchState {
        self.config.load().state
    }

    pub fn update(&self, config: TrafficSwitchConfig) {
        info!(switch = %self.name, state = ?config.state, "traffic switch config updated");
        self.config.store(Arc::new(config));
    }

    pub fn set_state(&self, state: SwitchState) {
        let mut next = self.config();
        let previous = next.state;
        next.state = state;
        self.config.store(Arc::new(next));
        info!(switch = %self.name, from = ?previous, to = ?state, "traffic switch state changed");
    }

    /// Shadowing -> Promoted.
    pub fn promote(&self) -> Result<()> {
        self.transition(SwitchState::Shadowing, SwitchState::Promoted)
    }

    /// Promoted -> CutoverComplete. The current provider stops being called.
    pub fn complete_cutover(&self) -> Result<()> {
        self.transition(SwitchState::Promoted, SwitchState::CutoverComplete)
    }

    /// Back to Shadowing from any state.
    pub fn rollback(&self) {
        self.set_state(SwitchState::Shadowing);
    }

    pub fn set_shadow_sample_pct(&self, pct: f64) {
        let mut next = self.config();
        next.shadow_sample_pct = pct.clamp(0.0, 100.0);
        self.config.store(Arc::new(next));
    }

    pub fn set_promotion_pct(&self, pct: f64) {
        let mut next = self.config();
        next.promotion_pct = pct.clamp(0.0, 100.0);
        self.config.store(Arc::new(next));
    }

    fn transition(&self, from: SwitchState, to: SwitchState) -> Result<()> {
        let current = self.state();
        if current != from {
            return Err(ProviderError::InvalidRequest(format!(
                "switch '{}' cannot move to {:?} from {:?}",
                self.name, to, current
            )));
        }
        self.set_state(to);
        Ok(())
    }
}

/// Result of a drift audit against the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditReport {
    /// `None` when that side failed to answer.
    pub current_agrees: Option<bool>,
    pub target_agrees: Option<bool>,
}

pub struct TrafficSwitchBuilder<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    name: String,
    current: Option<SharedProvider<K, V>>,
    target: Option<SharedProvider<K, V>>,
    source_of_truth: Option<SharedProvider<K, V>>,
    comparator: Option<Arc<dyn ResultComparator<V>>>,
    config: TrafficSwitchConfig,
    ctx: ProviderContext,
}

impl<K, V> TrafficSwitchBuilder<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn current(mut self, provider: SharedProvider<K, V>) -> Self {
        self.current = Some(provider);
        self
    }

    pub fn target(mut self, provider: SharedProvider<K, V>) -> Self {
        self.target = Some(provider);
        self
    }

    pub fn source_of_truth(mut self, provider: SharedProvider<K, V>) -> Self {
        self.source_of_truth = Some(provider);
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn ResultComparator<V>>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn config(mut self, config: TrafficSwitchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn context(mut self, ctx: ProviderContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Fails if a side is missing or the providers belong to different networks.
    pub fn build(self) -> Result<TrafficSwitchProvider<K, V>> {
        let current = self.current.ok_or_else(|| {
            ProviderError::InvalidRequest(format!("switch '{}' has no current provider", self.name))
        })?;
        let target = self.target.ok_or_else(|| {
            ProviderError::InvalidRequest(format!("switch '{}' has no target provider", self.name))
        })?;
        let comparator = self.comparator.ok_or_else(|| {
            ProviderError::InvalidRequest(format!("switch '{}' has no comparator", self.name))
        })?;

        let mut chain_id = None;
        let sides = [Some(&current), Some(&target), self.source_of_truth.as_ref()];
        for provider in sides.into_iter().flatten() {
            match (chain_id, provider.chain_id()) {
                (None, Some(id)) => chain_id = Some(id),
                (Some(expected), Some(id)) if expected != id => {
                    return Err(ProviderError::InvalidConfiguration {
                        chain_id: expected,
                        key: self.name.clone(),
                        message: format!(
                            "provider '{}' belongs to chain {} but the switch serves chain {}",
                            provider.name(),
                            id,
                            expected
                        ),
                    });
                }
                _ => {}
            }
        }

        Ok(TrafficSwitchProvider {
            name: self.name,
            chain_id,
            current,
            target,
            source_of_truth: self.source_of_truth,
            comparator,
            config: Arc::new(ArcSwap::from_pointee(self.config)),
            ctx: self.ctx,
        })
    }
}

/// Proxy over a current and a target provider with optional source of truth.
pub struct TrafficSwitchProvider<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    name: String,
    chain_id: Option<ChainId>,
    current: SharedProvider<K, V>,
    target: SharedProvider<K, V>,
    source_of_truth: Option<SharedProvider<K, V>>,
    comparator: Arc<dyn ResultComparator<V>>,
    config: Arc<ArcSwap<TrafficSwitchConfig>>,
    ctx: ProviderContext,
}

impl<K, V> TrafficSwitchProvider<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<String>) -> TrafficSwitchBuilder<K, V> {
        TrafficSwitchBuilder {
            name: name.into(),
            current: None,
            target: None,
            source_of_truth: None,
            comparator: None,
            config: TrafficSwitchConfig::default(),
            ctx: ProviderContext::null(),
        }
    }

    pub fn handle(&self) -> SwitchHandle {
        SwitchHandle {
            name: self.name.clone(),
            config: self.config.clone(),
        }
    }

    pub fn state(&self) -> SwitchState {
        self.config.load().state
    }

    fn side(&self, side: SwitchSide) -> &SharedProvider<K, V> {
        match side {
            SwitchSide::Current => &self.current,
            SwitchSide::Target => &self.target,
        }
    }

    fn comparison_job(&self, config: &TrafficSwitchConfig) -> ComparisonJob<K, V> {
        ComparisonJob {
            name: self.name.clone(),
            source_of_truth: if config.audit_on_mismatch {
                self.source_of_truth.clone()
            } else {
                None
            },
            comparator: self.comparator.clone(),
            ctx: self.ctx.clone(),
            timeout: config.shadow_timeout(),
        }
    }

    async fn call_authoritative(&self, side: SwitchSide, key: &K) -> Result<V> {
        let provider = self.side(side);
        let started = Instant::now();
        let result = provider.fetch(key).await;
        metrics::record_provider_call(provider.name(), started.elapsed());
        if let Err(e) = &result {
            metrics::increment_provider_error(provider.name());
            debug!(switch = %self.name, side = side.as_str(), error = %e, "authoritative provider failed");
        }
        result
    }

    /// Compares current, target and source of truth for `key` right now.
    ///
    /// Used for periodic drift audits. All three calls run concurrently and
    /// none of them is retried.
    pub async fn audit(&self, key: &K) -> Result<AuditReport> {
        let source_of_truth = self.source_of_truth.as_ref().ok_or_else(|| {
            ProviderError::InvalidRequest(format!("switch '{}' has no source of truth", self.name))
        })?;

        let (current, target, truth) = tokio::join!(
            self.current.fetch(key),
            self.target.fetch(key),
            source_of_truth.fetch(key)
        );
        let truth = truth?;
        let agrees = |value: Result<V>| {
            value
                .ok()
                .map(|v| self.comparator.compare(&v, &truth) == Comparison::Match)
        };
        let report = AuditReport {
            current_agrees: agrees(current),
            target_agrees: agrees(target),
        };
        self.ctx.emit(ProviderEvent::SourceOfTruthAudit {
            provider: self.name.clone(),
            key: format!("{key:?}"),
            current_agrees: report.current_agrees,
            target_agrees: report.target_agrees,
        });
        Ok(report)
    }
}

#[async_trait]
impl<K, V> DataProvider for TrafficSwitchProvider<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Key = K;
    type Value = V;

    fn name(&self) -> &str {
        &self.name
    }

    fn chain_id(&self) -> Option<ChainId> {
        self.chain_id
    }

    async fn fetch(&self, key: &K) -> Result<V> {
        let config = self.config.load_full();

        let authoritative = match config.state {
            SwitchState::CutoverComplete => {
                return self.call_authoritative(SwitchSide::Target, key).await;
            }
            SwitchState::Shadowing => SwitchSide::Current,
            SwitchState::Promoted => {
                if sampled(config.promotion_pct) {
                    SwitchSide::Target
                } else {
                    SwitchSide::Current
                }
            }
        };

        if !sampled(config.shadow_sample_pct) {
            return self.call_authoritative(authoritative, key).await;
        }

        let shadow_side = authoritative.other();
        let shadow = self.side(shadow_side).clone();
        let job = self.comparison_job(&config);
        let (tx, rx) = oneshot::channel::<V>();
        let shadow_key = key.clone();
        tokio::spawn(async move {
            job.run(shadow, shadow_side, shadow_key, rx).await;
        });

        let result = self.call_authoritative(authoritative, key).await;
        if let Ok(value) = &result {
            // Receiver gone means the shadow already finished with a failure.
            let _ = tx.send(value.clone());
        }
        result
    }
}

/// Everything the detached shadow task needs, owned.
struct ComparisonJob<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    name: String,
    source_of_truth: Option<SharedProvider<K, V>>,
    comparator: Arc<dyn ResultComparator<V>>,
    ctx: ProviderContext,
    timeout: Duration,
}

impl<K, V> ComparisonJob<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn run(
        self,
        shadow: SharedProvider<K, V>,
        shadow_side: SwitchSide,
        key: K,
        authoritative: oneshot::Receiver<V>,
    ) {
        let key_repr = format!("{key:?}");

        let shadow_value = match tokio::time::timeout(self.timeout, shadow.fetch(&key)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(switch = %self.name, side = shadow_side.as_str(), key = %key_repr, error = %e, "shadow call failed");
                metrics::increment_shadow_outcome(&self.name, "failure");
                self.ctx.emit(ProviderEvent::ShadowFailure {
                    provider: self.name,
                    key: key_repr,
                    side: shadow_side,
                    error: e.to_string(),
                });
                return;
            }
            Err(_) => {
                warn!(switch = %self.name, side = shadow_side.as_str(), key = %key_repr, timeout = ?self.timeout, "shadow call timed out");
                metrics::increment_shadow_outcome(&self.name, "timeout");
                self.ctx.emit(ProviderEvent::ShadowTimeout {
                    provider: self.name,
                    key: key_repr,
                    side: shadow_side,
                    timeout: self.timeout,
                });
                return;
            }
        };

        // Authoritative failure already reached the caller; nothing to compare.
        let Ok(authoritative_value) = authoritative.await else {
            return;
        };

        let (current, target) = match shadow_side {
            SwitchSide::Target => (&authoritative_value, &shadow_value),
            SwitchSide::Current => (&shadow_value, &authoritative_value),
        };

        match self.comparator.compare(current, target) {
            Comparison::Match => {
                metrics::increment_shadow_outcome(&self.name, "match");
                self.ctx.emit(ProviderEvent::ShadowMatch {
                    provider: self.name.clone(),
                    key: key_repr,
                });
            }
            Comparison::Mismatch(divergence) => {
                warn!(switch = %self.name, key = %key_repr, divergence = %divergence, "shadow mismatch");
                metrics::increment_shadow_outcome(&self.name, "mismatch");
                self.ctx.emit(ProviderEvent::ShadowMismatch {
                    provider: self.name.clone(),
                    key: key_repr.clone(),
                    divergence,
                });
                self.tie_break(&key, key_repr, current, target).await;
            }
        }
    }

    async fn tie_break(&self, key: &K, key_repr: String, current: &V, target: &V) {
        let Some(truth_provider) = &self.source_of_truth else {
            return;
        };
        let truth = match tokio::time::timeout(self.timeout, truth_provider.fetch(key)).await {
            Ok(Ok(truth)) => truth,
            Ok(Err(e)) => {
                warn!(switch = %self.name, key = %key_repr, error = %e, "source of truth failed during audit");
                return;
            }
            Err(_) => {
                warn!(switch = %self.name, key = %key_repr, "source of truth timed out during audit");
                return;
            }
        };

        let current_agrees = self.comparator.compare(current, &truth) == Comparison::Match;
        let target_agrees = self.comparator.compare(target, &truth) == Comparison::Match;
        let label = match (current_agrees, target_agrees) {
            (true, false) => "current",
            (false, true) => "target",
            (true, true) => "both",
            (false, false) => "neither",
        };
        metrics::increment_audit(&self.name, label);
        self.ctx.emit(ProviderEvent::SourceOfTruthAudit {
            provider: self.name.clone(),
            key: key_repr,
            current_agrees: Some(current_agrees),
            target_agrees: Some(target_agrees),
        });
    }
}
