//! Command-line interface of the `mcs-gateway` binary.

use crate::config::ServerConfig;
use crate::handlers::InstanceHandlers;
use crate::logging::{init_logging, LogConfig};
use crate::runtime::RuntimeConfig;
use crate::server::{ApiService, HttpServer};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "mcs-gateway", version)]
#[command(about = "Mission-control HTTP API gateway", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// YAML configuration file (defaults apply if it does not exist)
        #[arg(short, long, env = "MCS_CONFIG", default_value = "mcs-gateway.yaml")]
        config: PathBuf,

        /// Address and port to bind to, overrides `http.bind`
        #[arg(long)]
        addr: Option<String>,

        /// Register the instance routes for this instance (repeatable)
        #[arg(long = "instance")]
        instances: Vec<String>,
    },
    /// Print the resolved route table and exit
    Routes {
        #[arg(short, long, env = "MCS_CONFIG", default_value = "mcs-gateway.yaml")]
        config: PathBuf,

        #[arg(long = "instance")]
        instances: Vec<String>,
    },
}

fn load_config(path: &Path) -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::load(path)?;
    config.apply_env();
    Ok(config)
}

/// Build the service with the binary's handler set.
pub fn build_service(config: &ServerConfig, instances: &[String]) -> anyhow::Result<ApiService> {
    let service = ApiService::new(config).context("failed to start the handler pool")?;
    for instance in instances {
        service
            .register_instance(instance, &InstanceHandlers)
            .with_context(|| format!("failed to register routes of instance '{instance}'"))?;
    }
    Ok(service)
}

pub fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            addr,
            instances,
        } => {
            init_logging(&LogConfig::from_env())?;
            let runtime = RuntimeConfig::from_env();
            may::config().set_stack_size(runtime.stack_size);
            let mut config = load_config(&config)?;
            if let Some(addr) = addr {
                config.http.bind = addr;
            }
            let service = build_service(&config, &instances)?;
            let bind = config.http.bind.clone();
            let handle = HttpServer::new(service, config.http.clone())
                .stack_size(runtime.stack_size)
                .start(bind.as_str())
                .with_context(|| format!("failed to bind {bind}"))?;
            info!(addr = %handle.local_addr(), instances = instances.len(), "mcs-gateway started");

            wait_for_shutdown()?;
            handle.stop();
            Ok(())
        }
        Commands::Routes { config, instances } => {
            let config = load_config(&config)?;
            let service = build_service(&config, &instances)?;
            service.route_table().dump_routes();
            Ok(())
        }
    }
}

#[cfg(unix)]
fn wait_for_shutdown() -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("failed to register signal handlers")?;
    if let Some(sig) = signals.forever().next() {
        info!(signal = sig, "Shutting down");
    }
    Ok(())
}

#[cfg(not(unix))]
fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(())
}
