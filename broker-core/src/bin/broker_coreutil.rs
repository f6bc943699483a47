//! Standalone utility for exercising the broker-core policy loaders and
//! maintenance loop without a transport attached: load the fabric,
//! authorization, and general-policy files named on the command line, run
//! one maintenance tick, and print a summary.

use std::path::PathBuf;

use broker_core::configuration::{load_authorization, load_fabric_config, GeneralPolicy};
use broker_core::core::{BrokerCore, BrokerCoreConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "broker-coreutil", about = "Inspect broker-core policy files and run one maintenance tick")]
struct Cli {
    /// Path to the fabric-policy JSON file.
    #[arg(long)]
    fabric_config: Option<PathBuf>,

    /// Path to the authorization JSON file.
    #[arg(long)]
    authz_config: Option<PathBuf>,

    /// Path to the general policy key=value file.
    #[arg(long)]
    general_config: Option<PathBuf>,

    /// This broker's id within the fabric.
    #[arg(long, default_value = "local")]
    broker_id: String,

    /// This broker's tenant id (exempt from per-tenant limits).
    #[arg(long, default_value = "ops")]
    ops_tenant: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let mut core = BrokerCore::new(BrokerCoreConfig {
        local_broker_id: cli.broker_id,
        ops_tenant_id: cli.ops_tenant,
        tenant_byte_limit: 10_000_000,
        tenant_connection_limit: 10_000,
        tenant_service_limit: 10_000,
        tenant_subscription_limit: 10_000,
    });

    if let Some(path) = &cli.fabric_config {
        let fabric = load_fabric_config(path)?;
        println!("loaded fabric config with {} node(s)", fabric.len());
        core.fabric = broker_core::configuration::FabricConfigurationService::new(fabric);
    }

    if let Some(path) = &cli.authz_config {
        core.authorization = load_authorization(path)?;
        println!("loaded authorization policy from {}", path.display());
    }

    if let Some(path) = &cli.general_config {
        let policy = GeneralPolicy::load(path)?;
        if let Some(keep_alive) = policy.keep_alive_minutes() {
            println!("keepAlive = {keep_alive} minutes");
        }
        if let Some(limit) = policy.connection_limit() {
            println!("connectionLimit = {limit}");
        }
    }

    let revoked_additions = core.run_maintenance()?;
    println!(
        "maintenance tick complete: {} broker(s) tracked, {} revocation addition(s) flushed",
        core.registry.all_states().count(),
        revoked_additions.len()
    );

    Ok(())
}
