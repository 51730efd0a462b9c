use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tracing::{info, warn};

use exchange_chat::{
    cli::{Cli, Command, RatesArgs, normalize_currencies},
    client,
    exchange::ExchangeService,
    rates::{HttpRateProvider, query_date},
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let server = Server::bind(&args.config()).await?;
            let addr = server.local_addr()?;
            info!("server listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
        Command::Rates(args) => print_rates(args).await?,
    }

    Ok(())
}

async fn print_rates(args: RatesArgs) -> Result<()> {
    let timeout = std::time::Duration::from_secs(args.fetch_timeout_secs);
    let provider = HttpRateProvider::new(args.api_url, timeout)?;
    let service = ExchangeService::new(Arc::new(provider), normalize_currencies(&args.currencies));

    let date = query_date(Local::now().date_naive(), args.days)
        .with_context(|| format!("{} days back is out of range", args.days))?;

    match service.snapshot_for(&date).await {
        Ok(snapshot) => println!("{}", serde_json::to_string_pretty(&[snapshot])?),
        Err(err) => {
            warn!(error = %err, "exchange lookup failed");
            println!("No data to display.");
        }
    }

    Ok(())
}
