//! Per-request injection: resolves the network bundle, the route operation
//! for the request intent and the routing tuning for the quote speed.

use crate::chain::ChainId;
use crate::container::{ContainerInjected, NetworkDependencies};
use crate::error::Result;
use crate::intent::{Intent, RouteOperation};
use crate::routing_config::{QuoteSpeed, QuoteSpeedConfig, RoutingConfig};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RequestInjected {
    pub request_id: Uuid,
    pub chain_id: ChainId,
    pub intent: Intent,
    pub dependencies: Arc<NetworkDependencies>,
    pub operation: RouteOperation,
    pub quote_speed: QuoteSpeed,
    pub quote_speed_config: QuoteSpeedConfig,
    /// Network routing tuning with the quote speed preset applied.
    pub routing_config: RoutingConfig,
}

impl RequestInjected {
    /// Fresh routes are written back unless the request is a fast quote or
    /// its intent never touches the cache.
    pub fn writes_cached_routes(&self) -> bool {
        self.operation.uses_cached_routes() && self.quote_speed_config.writes_cached_routes()
    }
}

pub struct RequestInjector;

impl RequestInjector {
    pub fn inject(
        container: &ContainerInjected,
        chain_id: ChainId,
        intent: Intent,
        quote_speed: QuoteSpeed,
    ) -> Result<RequestInjected> {
        let dependencies = container.dependencies_for(chain_id)?;
        let operation = RouteOperation::for_intent(intent);
        let quote_speed_config = QuoteSpeedConfig::for_speed(quote_speed);
        let routing_config = quote_speed_config.apply(&dependencies.descriptor.routing);
        let request_id = Uuid::new_v4();

        debug!(
            request_id = %request_id,
            chain_id = %chain_id,
            intent = %intent,
            ?quote_speed,
            optimistic = operation.optimistic_cached_routes(),
            "request injected"
        );

        Ok(RequestInjected {
            request_id,
            chain_id,
            intent,
            dependencies,
            operation,
            quote_speed,
            quote_speed_config,
            routing_config,
        })
    }

    /// Same as [`RequestInjector::inject`] for raw query parameters. Unknown
    /// intents fall back to quote; unknown speeds are rejected.
    pub fn inject_raw(
        container: &ContainerInjected,
        chain_id: ChainId,
        intent: Option<&str>,
        quote_speed: Option<&str>,
    ) -> Result<RequestInjected> {
        let intent = Intent::parse_or_default(intent);
        let quote_speed = match quote_speed {
            Some(raw) => raw.parse()?,
            None => QuoteSpeed::default(),
        };
        Self::inject(container, chain_id, intent, quote_speed)
    }
}
