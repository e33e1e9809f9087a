//! Integration tests for fallback chains
//!
//! Tests cover:
//! - First success wins, later candidates never run
//! - Terminal candidate absorbs total failure
//! - Snapshot tiers for subgraph providers

mod common;

use common::{drain, EmptyPoolProvider};
use sor_provider_sdk::chain::ChainId;
use sor_provider_sdk::error::ProviderError;
use sor_provider_sdk::fallback::FallbackChain;
use sor_provider_sdk::provider::DataProvider;
use sor_provider_sdk::subgraph::{
    build_subgraph_provider, InMemorySnapshotStore, SnapshotLocations, SnapshotStore, SubgraphQuery,
};
use sor_provider_sdk::telemetry::{ChannelSink, ProviderContext, ProviderEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SNAPSHOT: &[u8] = br#"[{"id":"0x1111111111111111111111111111111111111111","feeTier":"3000","liquidity":"42","token0":{"id":"0xa"},"token1":{"id":"0xb"}}]"#;

#[tokio::test]
async fn test_second_candidate_wins_third_never_runs() {
    let (sink, mut events) = ChannelSink::new();
    let third_calls = Arc::new(AtomicUsize::new(0));
    let third = third_calls.clone();

    let value = FallbackChain::new("numbers", ProviderContext::new(Arc::new(sink)))
        .candidate("first", || async { Err(ProviderError::unavailable("first", "down")) })
        .candidate("second", || async { Ok(2u32) })
        .candidate("third", move || async move {
            third.fetch_add(1, Ordering::SeqCst);
            Ok(3u32)
        })
        .try_build()
        .await
        .unwrap();

    assert_eq!(value, 2);
    assert_eq!(third_calls.load(Ordering::SeqCst), 0);

    let events = drain(&mut events);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], ProviderEvent::FallbackStep { candidate, attempt: 1, .. } if candidate == "first"));
    assert!(matches!(&events[1], ProviderEvent::FallbackSelected { candidate, attempt: 2, .. } if candidate == "second"));
}

#[tokio::test]
async fn test_terminal_absorbs_total_failure() {
    let (sink, mut events) = ChannelSink::new();
    let value = FallbackChain::new("labels", ProviderContext::new(Arc::new(sink)))
        .candidate("a", || async { Err(ProviderError::unavailable("a", "down")) })
        .candidate("b", || async { Err(ProviderError::timeout("b", std::time::Duration::from_secs(1))) })
        .build_or("static", || async { "static".to_string() })
        .await;

    assert_eq!(value, "static");
    let events = drain(&mut events);
    let steps = events
        .iter()
        .filter(|e| matches!(e, ProviderEvent::FallbackStep { .. }))
        .count();
    assert_eq!(steps, 2);
    assert!(matches!(events.last(), Some(ProviderEvent::FallbackSelected { attempt: 3, .. })));
}

#[tokio::test]
async fn test_exhausted_chain_reports_last_error() {
    let err = FallbackChain::<u32>::new("nothing", ProviderContext::null())
        .candidate("a", || async { Err(ProviderError::unavailable("a", "down")) })
        .candidate("b", || async { Err(ProviderError::Decode("bad".into())) })
        .try_build()
        .await
        .unwrap_err();

    match err {
        ProviderError::ChainExhausted {
            attempts, last_error, ..
        } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last_error, ProviderError::Decode(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

fn locations() -> SnapshotLocations {
    SnapshotLocations {
        compressed_bucket: Some("pool-cache-gz".into()),
        compressed_key: Some("poolCache.json.gz".into()),
        bucket: Some("pool-cache".into()),
        key: Some("poolCache.json".into()),
    }
}

#[tokio::test]
async fn test_missing_compressed_snapshot_uses_plain_snapshot() {
    let store = Arc::new(InMemorySnapshotStore::new());
    store.put("pool-cache", "poolCache.json-34443", SNAPSHOT.to_vec());
    let store: Arc<dyn SnapshotStore> = store;
    let (sink, mut events) = ChannelSink::new();

    let provider = build_subgraph_provider(
        ProviderContext::new(Arc::new(sink)),
        ChainId::MODE,
        Some(store),
        locations(),
        Arc::new(EmptyPoolProvider),
        Vec::new(),
    )
    .await;

    assert_eq!(provider.name(), "snapshot_subgraph(plain)");
    let pools = provider.fetch(&SubgraphQuery::default()).await.unwrap();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].liquidity, "42");

    let steps: Vec<ProviderEvent> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ProviderEvent::FallbackStep { .. }))
        .collect();
    assert_eq!(steps.len(), 1);
    match &steps[0] {
        ProviderEvent::FallbackStep { candidate, error, .. } => {
            assert_eq!(candidate, "compressed_snapshot");
            assert!(error.contains("not found"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_no_snapshot_store_falls_to_static() {
    let provider = build_subgraph_provider(
        ProviderContext::null(),
        ChainId::MODE,
        None,
        locations(),
        Arc::new(EmptyPoolProvider),
        vec![Default::default()],
    )
    .await;

    assert_eq!(provider.name(), "static_subgraph");
    assert!(provider.fetch(&SubgraphQuery::default()).await.unwrap().is_empty());
}
