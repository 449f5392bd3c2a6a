//! Nexus Gateway executable

use clap::{Arg, ArgAction, Command};
use nexus_common::NexusConfig;
use nexus_gateway::{serve, Supervisor};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("nexus-gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Nexus-Vanguard - supervisory control plane for the analytics backend")
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address (default: from config)")
                .required(false),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    init_tracing(matches.get_flag("verbose"));

    let config = NexusConfig::from_env();
    let bind_addr = matches
        .get_one::<String>("bind")
        .cloned()
        .unwrap_or_else(|| {
            format!("{}:{}", config.gateway.bind_address, config.gateway.port)
        });

    info!("Starting Nexus Gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Binding to: {bind_addr}");

    let supervisor = Supervisor::new(config);
    supervisor.start();

    // Graceful shutdown on ctrl-c, components torn down in LIFO order.
    let shutdown = supervisor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.shutdown();
            std::process::exit(0);
        }
    });

    if let Err(e) = serve(supervisor, &bind_addr).await {
        error!("Server error: {e}");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "nexus_gateway=debug,nexus_vanguard=debug,nexus_router=debug,nexus_limits=debug,info"
    } else {
        "nexus_gateway=info,nexus_vanguard=info,nexus_router=info,info"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
