// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use std::time::Duration;

/// Initializes the descriptions for all the metrics exported by the providers.
/// This should be called once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "cache_hits_total",
        Unit::Count,
        "Read-through cache hits, labeled by cache name."
    );
    describe_counter!(
        "cache_miss_total",
        Unit::Count,
        "Read-through cache misses, labeled by cache name."
    );
    describe_counter!(
        "cache_tier_errors_total",
        Unit::Count,
        "Cache tier failures that degraded to a direct inner call, labeled by cache name."
    );
    describe_gauge!("cache_size_gauge", "Current number of entries per cache.");

    describe_counter!(
        "traffic_switch_shadow_total",
        Unit::Count,
        "Shadow comparisons, labeled by provider and outcome (match, mismatch, failure, timeout)."
    );
    describe_counter!(
        "traffic_switch_audit_total",
        Unit::Count,
        "Source-of-truth audits, labeled by provider and agreeing side."
    );

    describe_counter!(
        "fallback_steps_total",
        Unit::Count,
        "Failed fallback candidates, labeled by chain and candidate."
    );
    describe_counter!(
        "fallback_selected_total",
        Unit::Count,
        "Selected fallback candidate, labeled by chain and candidate."
    );

    describe_histogram!(
        "provider_call_duration_seconds",
        Unit::Seconds,
        "Upstream provider call latency, labeled by provider."
    );
    describe_counter!(
        "provider_errors_total",
        Unit::Count,
        "Upstream provider failures, labeled by provider."
    );

    describe_counter!(
        "network_unusable_total",
        Unit::Count,
        "Networks whose dependency bundle failed to build, labeled by chain id."
    );
    describe_counter!(
        "route_cache_comparisons_total",
        Unit::Count,
        "Route cache Tapcompare/Darkmode comparisons, labeled by result."
    );
}

/// Installs the Prometheus recorder with an HTTP scrape endpoint.
#[cfg(feature = "observability")]
pub fn install_prometheus_exporter(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}

// --- Helper functions to update metrics ---

pub fn increment_cache_hit(cache_name: &str) {
    counter!("cache_hits_total", 1, "cache" => cache_name.to_string());
}

pub fn increment_cache_miss(cache_name: &str) {
    counter!("cache_miss_total", 1, "cache" => cache_name.to_string());
}

pub fn increment_cache_tier_error(cache_name: &str) {
    counter!("cache_tier_errors_total", 1, "cache" => cache_name.to_string());
}

pub fn set_cache_size(cache_name: &str, size: f64) {
    gauge!("cache_size_gauge", size, "cache" => cache_name.to_string());
}

pub fn increment_shadow_outcome(provider: &str, outcome: &'static str) {
    counter!("traffic_switch_shadow_total", 1, "provider" => provider.to_string(), "outcome" => outcome);
}

pub fn increment_audit(provider: &str, agrees_with: &'static str) {
    counter!("traffic_switch_audit_total", 1, "provider" => provider.to_string(), "agrees_with" => agrees_with);
}

pub fn increment_fallback_step(chain: &str, candidate: &str) {
    counter!("fallback_steps_total", 1, "chain" => chain.to_string(), "candidate" => candidate.to_string());
}

pub fn increment_fallback_selected(chain: &str, candidate: &str) {
    counter!("fallback_selected_total", 1, "chain" => chain.to_string(), "candidate" => candidate.to_string());
}

pub fn record_provider_call(provider: &str, duration: Duration) {
    histogram!("provider_call_duration_seconds", duration.as_secs_f64(), "provider" => provider.to_string());
}

pub fn increment_provider_error(provider: &str) {
    counter!("provider_errors_total", 1, "provider" => provider.to_string());
}

pub fn increment_network_unusable(chain_id: u64) {
    counter!("network_unusable_total", 1, "chain_id" => chain_id.to_string());
}

pub fn increment_route_cache_comparison(result: &'static str) {
    counter!("route_cache_comparisons_total", 1, "result" => result);
}
