//! fleet-steward: reconciliation loop for a worker fleet behind a gateway
//!
//! See DESIGN.md for how the pieces fit together.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fleet_steward::config::Config;
use fleet_steward::edge::{EdgeReconfigurer, EdgeSettings};
use fleet_steward::fleet::cli::{self, FleetCommands};
use fleet_steward::fleet::executor::{Executor, ExecutorSettings};
use fleet_steward::fleet::observer::Observer;
use fleet_steward::fleet::{startup, Steward, StewardSettings};
use fleet_steward::oracle::GatewayOracle;
use fleet_steward::provider::OpenStackClient;
use fleet_steward::relay::{Relay, SshRelay};

#[derive(Parser)]
#[command(name = "fleet-steward")]
#[command(about = "Keeps a fixed-size worker fleet running behind a gateway and proxy")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "fleet-steward.toml")]
    config: PathBuf,

    /// Observe and decide, never create or destroy
    #[arg(long)]
    dry_run: bool,

    /// Cloud password (overrides config file)
    #[arg(long, env = "OS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Desired-count file (overrides config file)
    #[arg(long, env = "STEWARD_DESIRED_COUNT_FILE")]
    desired_count_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<FleetCommands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fleet_steward=info".parse()?)
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(FleetCommands::Run);

    info!("Starting fleet-steward");
    info!("Config file: {}", cli.config.display());

    let mut config = Config::load(&cli.config)?;

    // Apply CLI overrides
    if cli.dry_run {
        config.control.dry_run = true;
    }
    if let Some(password) = cli.password {
        config.cloud.password = password;
    }
    if let Some(path) = cli.desired_count_file {
        config.fleet.desired_count_file = path;
    }
    config.validate()?;

    info!("Cloud: {}", config.cloud.auth_url);
    info!("Worker prefix: {}", config.fleet.worker_prefix);
    info!("Desired count file: {}", config.fleet.desired_count_file.display());

    let client = OpenStackClient::new(config.cloud.clone())?;
    client
        .authenticate()
        .await
        .context("cloud credentials rejected")?;
    let provider = Arc::new(client);
    let relay: Arc<dyn Relay> = Arc::new(SshRelay::new(&config.ssh));

    let edge = EdgeReconfigurer::new(provider.clone(), relay.clone(), EdgeSettings::from_config(&config)?);
    let settings = StewardSettings::from_config(&config);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
                shutdown.cancel();
            }
        });
    }

    let topology = if command == FleetCommands::Run {
        startup(&edge, relay.as_ref(), &settings, &shutdown)
            .await
            .context("edge not reachable")?
    } else {
        edge.topology().await?
    };

    let gateway = topology
        .gateway
        .public
        .with_context(|| format!("gateway '{}' has no floating address", topology.gateway.name))?;

    let oracle = Arc::new(GatewayOracle::new(relay.clone(), gateway, &config.oracle));
    let observer = Observer::new(provider.clone(), oracle, config.subnet()?);
    let executor = Executor::new(provider.clone(), relay.clone(), ExecutorSettings::from_config(&config)?);
    let mut steward = Steward::new(settings.clone(), observer, executor, edge, gateway);

    if command != FleetCommands::Run {
        match cli::execute_command(&steward, command).await {
            Ok(output) => {
                print!("{}", output);
                return Ok(());
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    steward.run(shutdown).await;
    Ok(())
}
