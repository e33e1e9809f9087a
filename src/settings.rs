use crate::chain::{network_descriptor, ChainId, NetworkDescriptor};
use crate::error::{ProviderError, Result};
use crate::redis_manager::RedisConfig;
use crate::simulator::{RemoteSimulationCredentials, DEFAULT_SIMULATION_TIMEOUT_MS};
use crate::subgraph::SnapshotLocations;
use crate::tokens::TokenListSource;
use crate::traffic_switch::TrafficSwitchConfig;
use config::{Config, ConfigError, File, FileFormat};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

fn default_networks() -> Vec<u64> {
    vec![ChainId::MODE.0]
}

/// Per-network protocol addresses and limits that override the built-in
/// descriptor.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ProtocolOverride {
    #[serde(default)]
    pub v3_factory: Option<Address>,
    #[serde(default)]
    pub quoter_v2: Option<Address>,
    #[serde(default)]
    pub multicall: Option<Address>,
    #[serde(default)]
    pub token_fee_detector: Option<Address>,
    #[serde(default)]
    pub rpc_timeout_ms: Option<u64>,
    #[serde(default)]
    pub quote_migration: Option<bool>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct SnapshotSettings {
    /// Object store endpoint. Without it only the static subgraph tier works.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub compressed_bucket: Option<String>,
    #[serde(default)]
    pub compressed_key: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_snapshot_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_snapshot_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TokenListSettings {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_token_list_key")]
    pub key: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Local copy of the token list, tried after the bucket and the URL.
    #[serde(default)]
    pub path: Option<String>,
    /// Unsupported tokens the router must never route through.
    #[serde(default)]
    pub blocked_url: Option<String>,
    #[serde(default)]
    pub blocked_path: Option<String>,
}

fn default_token_list_key() -> String {
    "tokens.json".to_string()
}

impl Default for TokenListSettings {
    fn default() -> Self {
        Self {
            bucket: None,
            key: default_token_list_key(),
            url: None,
            path: None,
            blocked_url: None,
            blocked_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct RouteCacheSettings {
    #[serde(default)]
    pub routes_table_name: Option<String>,
    #[serde(default)]
    pub caching_request_flag_table_name: Option<String>,
    #[serde(default)]
    pub cached_routes_table_name: Option<String>,
    #[serde(default)]
    pub caching_quote_function_name: Option<String>,
}

impl RouteCacheSettings {
    /// Route caching is only wired when a cached routes table is configured.
    pub fn cached_routes_table(&self) -> Option<&str> {
        self.cached_routes_table_name
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PoolStoreSettings {
    #[serde(default = "default_pool_store_table")]
    pub table_name: String,
}

fn default_pool_store_table() -> String {
    "V3PoolsCachingDB".to_string()
}

impl Default for PoolStoreSettings {
    fn default() -> Self {
        Self {
            table_name: default_pool_store_table(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SimulationSettings {
    #[serde(default = "default_simulation_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub node_api_key: Option<String>,
    #[serde(default = "default_simulation_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_simulation_base_url() -> String {
    "https://api.tenderly.co".to_string()
}

fn default_simulation_timeout_ms() -> u64 {
    DEFAULT_SIMULATION_TIMEOUT_MS
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            base_url: default_simulation_base_url(),
            user: None,
            project: None,
            access_key: None,
            node_api_key: None,
            timeout_ms: default_simulation_timeout_ms(),
        }
    }
}

impl SimulationSettings {
    /// Credentials for the remote simulator, when all of them are set.
    pub fn credentials(&self) -> Option<RemoteSimulationCredentials> {
        Some(RemoteSimulationCredentials {
            base_url: self.base_url.clone(),
            user: self.user.clone().filter(|s| !s.is_empty())?,
            project: self.project.clone().filter(|s| !s.is_empty())?,
            access_key: self.access_key.clone().filter(|s| !s.is_empty())?,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct CacheTtl {
    #[serde(default = "default_token_secs")]
    pub token_secs: u64,
    #[serde(default = "default_pool_secs")]
    pub pool_secs: u64,
    #[serde(default = "default_gas_price_secs")]
    pub gas_price_secs: u64,
    #[serde(default = "default_token_validation_secs")]
    pub token_validation_secs: u64,
    #[serde(default = "default_token_secs")]
    pub blocked_token_secs: u64,
    #[serde(default = "default_token_validation_secs")]
    pub token_properties_secs: u64,
}

fn default_token_secs() -> u64 {
    3_600
}
fn default_pool_secs() -> u64 {
    180
}
fn default_gas_price_secs() -> u64 {
    15
}
fn default_token_validation_secs() -> u64 {
    30_000
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            token_secs: default_token_secs(),
            pool_secs: default_pool_secs(),
            gas_price_secs: default_gas_price_secs(),
            token_validation_secs: default_token_validation_secs(),
            blocked_token_secs: default_token_secs(),
            token_properties_secs: default_token_validation_secs(),
        }
    }
}

impl CacheTtl {
    pub fn token(&self) -> Duration {
        Duration::from_secs(self.token_secs)
    }
    pub fn pool(&self) -> Duration {
        Duration::from_secs(self.pool_secs)
    }
    pub fn gas_price(&self) -> Duration {
        Duration::from_secs(self.gas_price_secs)
    }
    pub fn token_validation(&self) -> Duration {
        Duration::from_secs(self.token_validation_secs)
    }
    pub fn blocked_token(&self) -> Duration {
        Duration::from_secs(self.blocked_token_secs)
    }
    pub fn token_properties(&self) -> Duration {
        Duration::from_secs(self.token_properties_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct TrafficSwitchSettings {
    #[serde(default)]
    pub pool: TrafficSwitchConfig,
    #[serde(default)]
    pub quote: TrafficSwitchConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Prometheus listen address, used with the `observability` feature.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_log_filter() -> String {
    "info,sor_provider_sdk=debug".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_log_filter(),
            metrics_addr: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    #[serde(default = "default_networks")]
    pub networks: Vec<u64>,
    /// RPC endpoint per chain id.
    #[serde(default)]
    pub rpc: HashMap<String, String>,
    #[serde(default)]
    pub protocol_overrides: HashMap<String, ProtocolOverride>,
    #[serde(default)]
    pub snapshot: SnapshotSettings,
    #[serde(default)]
    pub token_list: TokenListSettings,
    #[serde(default)]
    pub route_cache: RouteCacheSettings,
    #[serde(default)]
    pub pool_store: PoolStoreSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub cache_ttl: CacheTtl,
    #[serde(default)]
    pub traffic_switch: TrafficSwitchSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            networks: default_networks(),
            rpc: HashMap::new(),
            protocol_overrides: HashMap::new(),
            snapshot: SnapshotSettings::default(),
            token_list: TokenListSettings::default(),
            route_cache: RouteCacheSettings::default(),
            pool_store: PoolStoreSettings::default(),
            simulation: SimulationSettings::default(),
            cache_ttl: CacheTtl::default(),
            traffic_switch: TrafficSwitchSettings::default(),
            logging: LoggingSettings::default(),
            redis: None,
        }
    }
}

fn set_if_present(target: &mut Option<String>, value: Option<String>) {
    if let Some(v) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        *target = Some(v);
    }
}

impl Settings {
    /// Reads `Config.toml` (optional) from the working directory, then the
    /// process environment.
    pub fn new() -> std::result::Result<Self, ConfigError> {
        Self::load("Config.toml")
    }

    pub fn load(path: &str) -> std::result::Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .build()?;
        let mut settings: Self = s.try_deserialize()?;
        settings.apply_overrides_from(|key| env::var(key).ok());
        Ok(settings)
    }

    pub fn from_toml_str(toml: &str) -> std::result::Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Applies the deployment environment variables. `lookup` is
    /// `std::env::var` in production and a map in tests.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for chain in self.networks.clone() {
            let chain = ChainId(chain);
            if let Some(url) = lookup(&chain.rpc_env_key()).filter(|u| !u.trim().is_empty()) {
                self.rpc.insert(chain.to_string(), url.trim().to_string());
            }
        }

        set_if_present(&mut self.snapshot.compressed_bucket, lookup("POOL_CACHE_BUCKET_3"));
        set_if_present(&mut self.snapshot.compressed_key, lookup("POOL_CACHE_GZIP_KEY"));
        set_if_present(&mut self.snapshot.bucket, lookup("POOL_CACHE_BUCKET_2"));
        set_if_present(&mut self.snapshot.key, lookup("POOL_CACHE_KEY"));
        set_if_present(&mut self.token_list.bucket, lookup("TOKEN_LIST_CACHE_BUCKET"));

        set_if_present(&mut self.route_cache.routes_table_name, lookup("ROUTES_TABLE_NAME"));
        set_if_present(
            &mut self.route_cache.caching_request_flag_table_name,
            lookup("ROUTES_CACHING_REQUEST_FLAG_TABLE_NAME"),
        );
        set_if_present(
            &mut self.route_cache.cached_routes_table_name,
            lookup("CACHED_ROUTES_TABLE_NAME"),
        );
        set_if_present(
            &mut self.route_cache.caching_quote_function_name,
            lookup("AWS_LAMBDA_FUNCTION_NAME"),
        );

        set_if_present(&mut self.simulation.user, lookup("TENDERLY_USER"));
        set_if_present(&mut self.simulation.project, lookup("TENDERLY_PROJECT"));
        set_if_present(&mut self.simulation.access_key, lookup("TENDERLY_ACCESS_KEY"));
        set_if_present(&mut self.simulation.node_api_key, lookup("TENDERLY_NODE_API_KEY"));
    }

    pub fn supported_chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<ChainId> = self.networks.iter().copied().map(ChainId).collect();
        chains.sort();
        chains.dedup();
        chains
    }

    pub fn rpc_url(&self, chain_id: ChainId) -> Result<String> {
        self.rpc
            .get(&chain_id.to_string())
            .filter(|u| !u.trim().is_empty())
            .cloned()
            .ok_or_else(|| ProviderError::missing(chain_id, chain_id.rpc_env_key()))
    }

    /// Built-in descriptor with this deployment's overrides applied.
    pub fn descriptor_for(&self, chain_id: ChainId) -> Result<NetworkDescriptor> {
        let mut descriptor =
            network_descriptor(chain_id).ok_or(ProviderError::UnsupportedNetwork(chain_id))?;
        if let Some(o) = self.protocol_overrides.get(&chain_id.to_string()) {
            if o.v3_factory.is_some() {
                descriptor.addresses.v3_factory = o.v3_factory;
            }
            if o.quoter_v2.is_some() {
                descriptor.addresses.quoter_v2 = o.quoter_v2;
            }
            if let Some(multicall) = o.multicall {
                descriptor.addresses.multicall = multicall;
            }
            if o.token_fee_detector.is_some() {
                descriptor.addresses.token_fee_detector = o.token_fee_detector;
            }
            if let Some(ms) = o.rpc_timeout_ms {
                descriptor.rpc_timeout = Duration::from_millis(ms);
            }
            if let Some(flag) = o.quote_migration {
                descriptor.quote_migration = flag;
            }
        }
        Ok(descriptor)
    }

    pub fn snapshot_locations(&self) -> SnapshotLocations {
        SnapshotLocations {
            compressed_bucket: self.snapshot.compressed_bucket.clone(),
            compressed_key: self.snapshot.compressed_key.clone(),
            bucket: self.snapshot.bucket.clone(),
            key: self.snapshot.key.clone(),
        }
    }

    pub fn token_list_source(&self) -> TokenListSource {
        TokenListSource {
            bucket: self.token_list.bucket.clone(),
            key: self.token_list.key.clone(),
            url: self.token_list.url.clone(),
            path: self.token_list.path.clone(),
        }
    }

    /// The blocked list has no bucket copy; it comes from a URL or a file.
    pub fn blocked_token_list_source(&self) -> TokenListSource {
        TokenListSource {
            bucket: None,
            key: String::new(),
            url: self.token_list.blocked_url.clone(),
            path: self.token_list.blocked_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.networks, vec![34443]);
        assert_eq!(settings.pool_store.table_name, "V3PoolsCachingDB");
        assert_eq!(settings.cache_ttl.gas_price_secs, 15);
        assert_eq!(settings.cache_ttl.token_validation_secs, 30_000);
        assert_eq!(settings.cache_ttl.blocked_token(), Duration::from_secs(3_600));
        assert_eq!(settings.cache_ttl.token_properties(), Duration::from_secs(30_000));
        assert!(settings.route_cache.cached_routes_table().is_none());
        assert_eq!(settings.simulation.timeout_ms, 2_500);
        assert!(settings.simulation.credentials().is_none());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WEB3_RPC_34443", " https://mainnet.mode.network "),
            ("POOL_CACHE_BUCKET_3", "pool-cache-gz"),
            ("POOL_CACHE_GZIP_KEY", "poolCache.json.gz"),
            ("TENDERLY_USER", "user"),
            ("TENDERLY_PROJECT", "project"),
            ("TENDERLY_ACCESS_KEY", "key"),
            ("CACHED_ROUTES_TABLE_NAME", ""),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.rpc_url(ChainId::MODE).unwrap(), "https://mainnet.mode.network");
        assert_eq!(settings.snapshot.compressed_bucket.as_deref(), Some("pool-cache-gz"));
        assert!(settings.simulation.credentials().is_some());
        assert!(settings.route_cache.cached_routes_table().is_none());

        settings.apply_overrides_from(|k| (k == "CACHED_ROUTES_TABLE_NAME").then(|| "RoutesDb".to_string()));
        assert_eq!(settings.route_cache.cached_routes_table(), Some("RoutesDb"));
    }

    #[test]
    fn test_missing_rpc_is_configuration_missing() {
        let err = Settings::default().rpc_url(ChainId::MODE).unwrap_err();
        assert!(matches!(err, ProviderError::ConfigurationMissing { .. }));
    }

    #[test]
    fn test_protocol_overrides_apply() {
        let settings = Settings::from_toml_str(
            r#"
            networks = [34443]

            [protocol_overrides.34443]
            v3_factory = "0x6dd3FB9653B10e806650F107C3B5A0a6fF974F65"
            rpc_timeout_ms = 9000

            [traffic_switch.pool]
            mode = "promoted"
            "#,
        )
        .unwrap();
        let descriptor = settings.descriptor_for(ChainId::MODE).unwrap();
        assert!(descriptor.addresses.v3_factory.is_some());
        assert_eq!(descriptor.rpc_timeout, Duration::from_millis(9000));
        assert_eq!(
            settings.traffic_switch.pool.state,
            crate::traffic_switch::SwitchState::Promoted
        );

        let err = settings.descriptor_for(ChainId(999)).unwrap_err();
        assert!(matches!(err, ProviderError::UnsupportedNetwork(_)));
    }
}
