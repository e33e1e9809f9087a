//! # SOR Provider SDK
//!
//! Provider composition layer for a swap router. The router asks for pools,
//! quotes, tokens, gas prices and simulations through keyed providers; this
//! crate builds those providers once per network and layers them.
//!
//! ## Overview
//!
//! - **Cache layer**: TTL-bounded memoization in front of any provider
//! - **Fallback chain**: ordered candidates, first success wins
//! - **Traffic switch**: serve one provider, shadow another, compare
//! - **Intent resolution**: request intent selects the route-cache behaviour
//! - **Container assembly**: one isolated provider bundle per network
//!
//! ## Architecture
//!
//! ### Composition primitives
//! [`provider::DataProvider`] is the single seam. [`cache::CachingProvider`],
//! [`fallback::FallbackChain`] and [`traffic_switch::TrafficSwitchProvider`]
//! wrap providers and are providers themselves.
//!
//! ### Domain providers
//! On-chain pools, quotes, tokens and gas prices over a Multicall3 transport,
//! snapshot-backed subgraph data, route cache tiers and swap simulation.
//!
//! ### Assembly
//! [`container::ContainerAssembler`] turns [`settings::Settings`] into a
//! [`container::ContainerInjected`]; [`request::RequestInjector`] resolves
//! per-request dependencies from it.

// Composition primitives
/// Keyed async provider trait and shared handles
pub mod provider;
/// TTL cache layer
pub mod cache;
/// Ordered fallback chain
pub mod fallback;
/// Shadowing traffic switch
pub mod traffic_switch;

// Domain providers
/// V3 pool state and addressing
pub mod pools;
/// Durable pool state store
pub mod pool_store;
/// On-chain quoting
pub mod quote;
/// Token metadata and validation
pub mod tokens;
/// Fee-on-transfer detection
pub mod token_properties;
/// Gas price readers
pub mod gas_price;
/// Subgraph pool snapshots
pub mod subgraph;
/// Cached routes
pub mod route_cache;
/// Swap simulation
pub mod simulator;
/// Swap execution options
pub mod swap_options;

// Request semantics
/// Intent to route-cache behaviour
pub mod intent;
/// Router tuning and quote speed presets
pub mod routing_config;

// Assembly
/// Per-network container assembler
pub mod container;
/// Per-request injection
pub mod request;

// Infrastructure
/// Network ids and descriptors
pub mod chain;
/// Error taxonomy
pub mod error;
/// HTTP JSON-RPC transport
pub mod rpc;
/// Multicall3 batch RPC
pub mod multicall;
/// Redis-backed store tiers (optional, feature-gated)
pub mod redis_manager;
/// Metrics and observability
pub mod metrics;
/// Structured events and tracing setup
pub mod telemetry;

// Contracts (Public ABIs Only)
/// Smart contract ABIs used for encoding calls
pub mod contracts;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use cache::CachingProvider;
pub use chain::{ChainId, NetworkDescriptor};
pub use container::{ContainerAssembler, ContainerInjected, NetworkDependencies};
pub use error::{ProviderError, Result};
pub use fallback::FallbackChain;
pub use intent::{Intent, RouteOperation};
pub use provider::DataProvider;
pub use request::{RequestInjected, RequestInjector};
pub use settings::Settings;
pub use telemetry::{ProviderContext, ProviderEvent};
pub use traffic_switch::TrafficSwitchProvider;
