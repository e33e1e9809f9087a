//! Request intent and the cache behaviour it selects.
//!
//! [`resolve`] is the flat lookup table. The routing path does not consume it
//! directly: it goes through [`RouteOperation`], where populating the route
//! cache and serving from it are different types. Only [`ServeRoutes`] can mint
//! an [`OptimisticRead`], and an optimistic route-cache read is impossible
//! without one, so a cache-population request cannot consume optimistic
//! entries and cannot trigger another population request from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// Background request that validates and writes route cache entries.
    Caching,
    #[default]
    Quote,
    Swap,
    Pricing,
}

impl Intent {
    pub const ALL: [Intent; 4] = [Intent::Caching, Intent::Quote, Intent::Swap, Intent::Pricing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Caching => "caching",
            Intent::Quote => "quote",
            Intent::Swap => "swap",
            Intent::Pricing => "pricing",
        }
    }

    /// Unknown or missing intents take the default quote path.
    pub fn parse_or_default(raw: Option<&str>) -> Intent {
        match raw.map(str::parse::<Intent>) {
            Some(Ok(intent)) => intent,
            Some(Err(unknown)) => {
                debug!(intent = %unknown.0, "unknown intent, using quote");
                Intent::Quote
            }
            None => Intent::Quote,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownIntent(pub String);

impl fmt::Display for UnknownIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown intent '{}'", self.0)
    }
}

impl std::error::Error for UnknownIntent {}

impl FromStr for Intent {
    type Err = UnknownIntent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "caching" => Ok(Intent::Caching),
            "quote" => Ok(Intent::Quote),
            "swap" => Ok(Intent::Swap),
            "pricing" => Ok(Intent::Pricing),
            other => Err(UnknownIntent(other.to_string())),
        }
    }
}

/// How a route-cache write treats an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMode {
    /// Overwrite the entry.
    Livemode,
    /// Write the fresh value and compare it with the previous one.
    Tapcompare,
    /// Compare only, never write.
    Darkmode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentConfig {
    pub use_cached_routes: bool,
    /// `None` keeps the route cache provider's own mode.
    pub overwrite_cache_mode: Option<CacheMode>,
    pub optimistic_cached_routes: bool,
}

pub const fn resolve(intent: Intent) -> IntentConfig {
    match intent {
        Intent::Caching => IntentConfig {
            use_cached_routes: true,
            overwrite_cache_mode: Some(CacheMode::Tapcompare),
            optimistic_cached_routes: false,
        },
        Intent::Quote => IntentConfig {
            use_cached_routes: true,
            overwrite_cache_mode: None,
            optimistic_cached_routes: true,
        },
        Intent::Swap => IntentConfig {
            use_cached_routes: true,
            overwrite_cache_mode: None,
            optimistic_cached_routes: false,
        },
        Intent::Pricing => IntentConfig {
            use_cached_routes: true,
            overwrite_cache_mode: None,
            optimistic_cached_routes: true,
        },
    }
}

/// Permission to read not-yet-validated route cache entries.
///
/// The field is private: the only constructor is [`ServeRoutes::optimistic_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimisticRead {
    _sealed: (),
}

/// Route-cache read tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteCacheRead {
    /// Only entries already validated by a caching request.
    Validated,
    /// Validated or pending entries.
    Optimistic(OptimisticRead),
}

impl RouteCacheRead {
    pub fn is_optimistic(&self) -> bool {
        matches!(self, RouteCacheRead::Optimistic(_))
    }
}

/// A cache-population request. Always writes with `Tapcompare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulateRoutes {
    _sealed: (),
}

impl PopulateRoutes {
    pub fn cache_mode(&self) -> CacheMode {
        CacheMode::Tapcompare
    }

    pub fn read(&self) -> RouteCacheRead {
        RouteCacheRead::Validated
    }
}

/// A request that serves routes to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeRoutes {
    use_cached_routes: bool,
    optimistic: bool,
    cache_mode: Option<CacheMode>,
}

impl ServeRoutes {
    pub fn use_cached_routes(&self) -> bool {
        self.use_cached_routes
    }

    pub fn cache_mode(&self) -> Option<CacheMode> {
        self.cache_mode
    }

    pub fn optimistic_read(&self) -> Option<OptimisticRead> {
        self.optimistic.then_some(OptimisticRead { _sealed: () })
    }

    pub fn read(&self) -> RouteCacheRead {
        match self.optimistic_read() {
            Some(token) => RouteCacheRead::Optimistic(token),
            None => RouteCacheRead::Validated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOperation {
    Populate(PopulateRoutes),
    Serve(ServeRoutes),
}

impl RouteOperation {
    /// The caching intent is always a population, whatever the table says
    /// about optimism.
    pub fn for_intent(intent: Intent) -> Self {
        let config = resolve(intent);
        match intent {
            Intent::Caching => RouteOperation::Populate(PopulateRoutes { _sealed: () }),
            _ => RouteOperation::Serve(ServeRoutes {
                use_cached_routes: config.use_cached_routes,
                optimistic: config.optimistic_cached_routes,
                cache_mode: config.overwrite_cache_mode,
            }),
        }
    }

    pub fn read(&self) -> RouteCacheRead {
        match self {
            RouteOperation::Populate(op) => op.read(),
            RouteOperation::Serve(op) => op.read(),
        }
    }

    pub fn uses_cached_routes(&self) -> bool {
        match self {
            RouteOperation::Populate(_) => true,
            RouteOperation::Serve(op) => op.use_cached_routes(),
        }
    }

    pub fn cache_mode(&self) -> Option<CacheMode> {
        match self {
            RouteOperation::Populate(op) => Some(op.cache_mode()),
            RouteOperation::Serve(op) => op.cache_mode(),
        }
    }

    /// The flag handed to providers that still take a boolean.
    pub fn optimistic_cached_routes(&self) -> bool {
        self.read().is_optimistic()
    }

    pub fn is_population(&self) -> bool {
        matches!(self, RouteOperation::Populate(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caching_is_never_optimistic() {
        let config = resolve(Intent::Caching);
        assert!(!config.optimistic_cached_routes);
        assert_eq!(config.overwrite_cache_mode, Some(CacheMode::Tapcompare));

        let op = RouteOperation::for_intent(Intent::Caching);
        assert!(op.is_population());
        assert_eq!(op.read(), RouteCacheRead::Validated);
        assert_eq!(op.cache_mode(), Some(CacheMode::Tapcompare));
    }

    #[test]
    fn test_quote_and_pricing_are_optimistic() {
        for intent in [Intent::Quote, Intent::Pricing] {
            assert!(resolve(intent).optimistic_cached_routes);
            assert!(RouteOperation::for_intent(intent).read().is_optimistic());
        }
        assert!(!resolve(Intent::Swap).optimistic_cached_routes);
        assert!(!RouteOperation::for_intent(Intent::Swap).read().is_optimistic());
    }

    #[test]
    fn test_every_intent_uses_cached_routes() {
        for intent in Intent::ALL {
            assert!(resolve(intent).use_cached_routes);
            assert!(RouteOperation::for_intent(intent).uses_cached_routes());
        }
    }

    #[test]
    fn test_unknown_intent_defaults_to_quote() {
        assert_eq!(Intent::parse_or_default(Some("caching")), Intent::Caching);
        assert_eq!(Intent::parse_or_default(Some("bogus")), Intent::Quote);
        assert_eq!(Intent::parse_or_default(None), Intent::Quote);
        assert_eq!(" Swap ".parse::<Intent>().unwrap(), Intent::Swap);
    }
}
