use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    audit::DEFAULT_AUDIT_LOG,
    rates::DEFAULT_API_URL,
    server::{DEFAULT_FETCH_TIMEOUT, ServerConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting WebSocket connections on /ws.
    Serve(ServeArgs),
    /// Join a running server from the terminal.
    Client(ClientArgs),
    /// Print exchange rates for a past day and exit.
    Rates(RatesArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Base URL of the exchange-rate API.
    #[arg(long, default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Currency codes included in every snapshot.
    #[arg(long = "currency", default_values_t = default_currencies())]
    pub currencies: Vec<String>,

    /// File receiving one line per executed exchange command.
    #[arg(long, default_value = DEFAULT_AUDIT_LOG)]
    pub audit_log: PathBuf,

    /// Skip the audit trail entirely.
    #[arg(long, conflicts_with = "audit_log")]
    pub no_audit_log: bool,

    /// Upper bound on a single upstream request, at least one second.
    #[arg(
        long,
        default_value_t = DEFAULT_FETCH_TIMEOUT.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub fetch_timeout_secs: u64,
}

impl ServeArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            api_url: self.api_url.clone(),
            currencies: normalize_currencies(&self.currencies),
            audit_log: (!self.no_audit_log).then(|| self.audit_log.clone()),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket endpoint of the server.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    pub server: String,

    /// Name shown in front of your messages.
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RatesArgs {
    /// Number of days to look back.
    pub days: u64,

    /// Currency codes to include.
    #[arg(long = "currency", default_values_t = default_currencies())]
    pub currencies: Vec<String>,

    /// Base URL of the exchange-rate API.
    #[arg(long, default_value = DEFAULT_API_URL)]
    pub api_url: String,

    #[arg(
        long,
        default_value_t = DEFAULT_FETCH_TIMEOUT.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub fetch_timeout_secs: u64,
}

fn default_currencies() -> Vec<String> {
    vec!["USD".to_string(), "EUR".to_string()]
}

/// Upper-cases codes and drops blanks and repeats, keeping first-seen order.
pub fn normalize_currencies(codes: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(codes.len());
    for code in codes {
        let code = code.trim().to_ascii_uppercase();
        if !code.is_empty() && !normalized.contains(&code) {
            normalized.push(code);
        }
    }
    normalized
}
