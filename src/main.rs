mod api;
mod server;
mod transport;

use clap::{Parser, Subcommand};
use courier_core::config;
use courier_plugins::Registry;
use courier_store::Store;
use server::Server;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "courier",
    version,
    about = "Courier — multi-session WhatsApp automation daemon"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon.
    Start,
    /// Inspect the store and last recorded stats.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Always-on service: panics are logged; a background task panic
    // stays contained to its task.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!("panic: {info}");
    }));

    match cli.command {
        Commands::Start => {
            let cfg = config::load(&cli.config)?;
            let store = Store::new(&cfg.store).await?;
            let transport = transport::build(&cfg);
            let registry = Arc::new(Registry::new(courier_plugins::builtin_set()));

            let server = Arc::new(Server::new(cfg, store, transport, registry));
            server.run().await?;
        }
        Commands::Status => {
            let cfg = config::load(&cli.config)?;
            println!("Courier — status\n");
            println!("Config: {}", cli.config);
            println!("Store: {}", cfg.store.db_path);

            let store = Store::new(&cfg.store).await?;
            println!("Stored sessions: {}", store.count_sessions().await?);
            println!("Active sessions: {}", store.count_active_sessions().await?);
            match store.latest_snapshot().await? {
                Some((active, total, recorded_at)) => {
                    println!(
                        "Last snapshot: {active} active connections, {total} users (at {recorded_at})"
                    );
                }
                None => println!("Last snapshot: none recorded yet"),
            }
        }
    }

    Ok(())
}
