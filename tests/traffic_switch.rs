//! Integration tests for the traffic switch
//!
//! Tests cover:
//! - Caller-visible result per state
//! - Shadow failures and timeouts stay invisible to the caller
//! - Mismatch reporting and source-of-truth tie break
//! - Operator transitions through the switch handle

mod common;

use common::{next_event, Behaviour, ScriptedProvider};
use sor_provider_sdk::chain::ChainId;
use sor_provider_sdk::error::ProviderError;
use sor_provider_sdk::provider::{DataProvider, SharedProvider};
use sor_provider_sdk::telemetry::{ChannelSink, ProviderContext, ProviderEvent, SwitchSide};
use sor_provider_sdk::traffic_switch::{
    EqualityComparator, SwitchState, TrafficSwitchConfig, TrafficSwitchProvider,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn config(state: SwitchState) -> TrafficSwitchConfig {
    TrafficSwitchConfig {
        state,
        shadow_sample_pct: 100.0,
        promotion_pct: 100.0,
        shadow_timeout_ms: 100,
        audit_on_mismatch: true,
    }
}

fn switch(
    current: SharedProvider<u32, String>,
    target: SharedProvider<u32, String>,
    source_of_truth: Option<SharedProvider<u32, String>>,
    state: SwitchState,
) -> (TrafficSwitchProvider<u32, String>, UnboundedReceiver<ProviderEvent>) {
    let (sink, events) = ChannelSink::new();
    let mut builder = TrafficSwitchProvider::builder("pool:test")
        .current(current)
        .target(target)
        .comparator(Arc::new(EqualityComparator::default()))
        .config(config(state))
        .context(ProviderContext::new(Arc::new(sink)));
    if let Some(truth) = source_of_truth {
        builder = builder.source_of_truth(truth);
    }
    (builder.build().unwrap(), events)
}

#[tokio::test]
async fn test_shadowing_returns_current_and_reports_match() {
    let current = ScriptedProvider::new("current", Behaviour::Answer("same"));
    let target = ScriptedProvider::new("target", Behaviour::Answer("same"));
    let (proxy, mut events) = switch(current.clone(), target.clone(), None, SwitchState::Shadowing);

    assert_eq!(proxy.fetch(&1).await.unwrap(), "same:1");
    assert!(matches!(next_event(&mut events).await, ProviderEvent::ShadowMatch { .. }));
    assert_eq!(current.calls(), 1);
    assert_eq!(target.calls(), 1);
}

#[tokio::test]
async fn test_shadow_failure_never_reaches_caller() {
    let current = ScriptedProvider::new("current", Behaviour::Answer("v"));
    let target = ScriptedProvider::new("target", Behaviour::Fail);
    let (proxy, mut events) = switch(current, target, None, SwitchState::Shadowing);

    assert_eq!(proxy.fetch(&9).await.unwrap(), "v:9");
    match next_event(&mut events).await {
        ProviderEvent::ShadowFailure { side, key, error, .. } => {
            assert_eq!(side, SwitchSide::Target);
            assert_eq!(key, "9");
            assert!(error.contains("503"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_shadow_does_not_delay_caller() {
    let current = ScriptedProvider::new("current", Behaviour::Answer("v"));
    let target = ScriptedProvider::new("target", Behaviour::Slow(Duration::from_secs(30), "v"));
    let (proxy, mut events) = switch(current, target, None, SwitchState::Shadowing);

    let started = tokio::time::Instant::now();
    assert_eq!(proxy.fetch(&2).await.unwrap(), "v:2");
    assert!(started.elapsed() < Duration::from_millis(100));

    assert!(matches!(
        next_event(&mut events).await,
        ProviderEvent::ShadowTimeout { side: SwitchSide::Target, .. }
    ));
}

#[tokio::test]
async fn test_mismatch_is_audited_against_source_of_truth() {
    let current = ScriptedProvider::new("current", Behaviour::Answer("stale"));
    let target = ScriptedProvider::new("target", Behaviour::Answer("fresh"));
    let truth = ScriptedProvider::new("truth", Behaviour::Answer("fresh"));
    let (proxy, mut events) = switch(current, target, Some(truth.clone()), SwitchState::Shadowing);

    assert_eq!(proxy.fetch(&4).await.unwrap(), "stale:4");
    assert!(matches!(next_event(&mut events).await, ProviderEvent::ShadowMismatch { .. }));
    assert_eq!(
        next_event(&mut events).await,
        ProviderEvent::SourceOfTruthAudit {
            provider: "pool:test".into(),
            key: "4".into(),
            current_agrees: Some(false),
            target_agrees: Some(true),
        }
    );
    assert_eq!(truth.calls(), 1);
}

#[tokio::test]
async fn test_promoted_returns_target_and_shadows_current() {
    let current = ScriptedProvider::new("current", Behaviour::Fail);
    let target = ScriptedProvider::new("target", Behaviour::Answer("t"));
    let (proxy, mut events) = switch(current.clone(), target, None, SwitchState::Promoted);

    assert_eq!(proxy.fetch(&3).await.unwrap(), "t:3");
    assert!(matches!(
        next_event(&mut events).await,
        ProviderEvent::ShadowFailure { side: SwitchSide::Current, .. }
    ));
    assert_eq!(current.calls(), 1);
}

#[tokio::test]
async fn test_cutover_complete_stops_calling_current() {
    let current = ScriptedProvider::new("current", Behaviour::Answer("c"));
    let target = ScriptedProvider::new("target", Behaviour::Answer("t"));
    let (proxy, _events) = switch(current.clone(), target.clone(), None, SwitchState::CutoverComplete);

    assert_eq!(proxy.fetch(&1).await.unwrap(), "t:1");
    assert_eq!(proxy.fetch(&2).await.unwrap(), "t:2");
    assert_eq!(current.calls(), 0);
    assert_eq!(target.calls(), 2);
}

#[tokio::test]
async fn test_authoritative_failure_propagates() {
    let current = ScriptedProvider::new("current", Behaviour::Fail);
    let target = ScriptedProvider::new("target", Behaviour::Answer("t"));
    let (proxy, _events) = switch(current, target, None, SwitchState::Shadowing);

    let err = proxy.fetch(&1).await.unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn test_handle_drives_promotion() {
    let current = ScriptedProvider::new("current", Behaviour::Answer("c"));
    let target = ScriptedProvider::new("target", Behaviour::Answer("t"));
    let (proxy, _events) = switch(current, target, None, SwitchState::Shadowing);
    let handle = proxy.handle();
    handle.set_shadow_sample_pct(0.0);

    assert_eq!(proxy.fetch(&1).await.unwrap(), "c:1");
    assert!(handle.complete_cutover().is_err());

    handle.promote().unwrap();
    assert_eq!(proxy.state(), SwitchState::Promoted);
    assert_eq!(proxy.fetch(&1).await.unwrap(), "t:1");

    handle.set_promotion_pct(0.0);
    assert_eq!(proxy.fetch(&1).await.unwrap(), "c:1");

    handle.rollback();
    assert_eq!(handle.state(), SwitchState::Shadowing);
}

#[test]
fn test_providers_from_different_chains_are_rejected() {
    let current = ScriptedProvider::on_chain("current", ChainId::MODE, Behaviour::Answer("c"));
    let target = ScriptedProvider::on_chain("target", ChainId::MAINNET, Behaviour::Answer("t"));
    let result = TrafficSwitchProvider::<u32, String>::builder("pool:mixed")
        .current(current)
        .target(target)
        .comparator(Arc::new(EqualityComparator::default()))
        .build();

    assert!(matches!(result, Err(ProviderError::InvalidConfiguration { .. })));
}
