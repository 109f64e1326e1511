use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use banwatch::config::Config;
use banwatch::Banwatch;

#[derive(Parser)]
#[command(name = "banwatch")]
#[command(author, version, about = "VPN subscription-sharing detector")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    let server = match Banwatch::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Startup error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}
