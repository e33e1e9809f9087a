//! # Container Bootstrap
//!
//! Loads settings, builds the provider container for every configured
//! network and reports which networks are ready to serve requests.
//!
//! ## Usage
//!
//! ```bash
//! WEB3_RPC_34443=https://mainnet.mode.network cargo run --bin container_bootstrap
//! cargo run --bin container_bootstrap -- --config deploy/Config.toml --strict
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use sor_provider_sdk::container::{ContainerAssembler, ExternalServices, NetworkBundle};
use sor_provider_sdk::settings::Settings;
use sor_provider_sdk::telemetry::{init_tracing, ProviderContext};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "container_bootstrap", about = "Build and check per-network provider bundles")]
struct Args {
    /// Settings file, TOML.
    #[arg(long, default_value = "Config.toml")]
    config: String,

    /// Exit with an error when any configured network is unusable.
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let settings = Settings::load(&args.config)
        .with_context(|| format!("failed to load settings from {}", args.config))?;
    init_tracing(settings.logging.json, &settings.logging.filter)?;

    #[cfg(feature = "observability")]
    if let Some(addr) = &settings.logging.metrics_addr {
        sor_provider_sdk::metrics::install_prometheus_exporter(addr.parse()?)?;
        info!(addr = %addr, "prometheus exporter listening");
    }

    info!(networks = ?settings.networks, "starting container bootstrap");
    let services = ExternalServices::from_settings(&settings).await?;
    let container = ContainerAssembler::new(settings, services, ProviderContext::tracing())
        .build()
        .await;

    let mut unusable = 0usize;
    for (chain_id, bundle) in container.chains() {
        match bundle {
            NetworkBundle::Ready(deps) => info!(
                chain_id = %chain_id,
                network = deps.descriptor.name,
                quote_migration = deps.quote_switch.is_some(),
                pool_switch = ?deps.pool_switch.state(),
                "network ready"
            ),
            NetworkBundle::Unusable(cause) => {
                unusable += 1;
                error!(chain_id = %chain_id, error = %cause, "network unusable");
            }
        }
    }

    info!(
        ready = container.ready_chains().len(),
        unusable,
        activity_id = %container.context().activity_id,
        "container bootstrap finished"
    );
    if args.strict && unusable > 0 {
        bail!("{unusable} network(s) unusable");
    }
    Ok(())
}
