//! Command line client for the lloadd monitoring API.

use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "lloadctl", version)]
#[command(about = "Inspect a running lloadd through its monitoring API", long_about = None)]
struct Cli {
    /// Base URL of the monitoring listener.
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,

    /// Bearer token, see `[admin] api_key`.
    #[arg(short, long, env = "LLOADD_API_KEY")]
    key: String,

    #[command(subcommand)]
    command: Query,
}

#[derive(Subcommand)]
enum Query {
    /// Daemon summary: threads, listeners, shutdown state
    Daemon,
    /// Tiers and their selection policies
    Tiers,
    /// Backend pools, counters and fitness
    Backends {
        /// Only show backends of this tier.
        #[arg(long)]
        tier: Option<String>,
    },
    /// Client and upstream connections
    Connections,
}

impl Query {
    fn path(&self) -> &'static str {
        match self {
            Query::Daemon => "/monitor/daemon",
            Query::Tiers => "/monitor/tiers",
            Query::Backends { .. } => "/monitor/backends",
            Query::Connections => "/monitor/connections",
        }
    }

    /// Narrow the reply down to what was asked for.
    fn select(&self, reply: Value) -> Value {
        match (self, reply) {
            (Query::Backends { tier: Some(tier) }, Value::Array(backends)) => Value::Array(
                backends
                    .into_iter()
                    .filter(|b| b.get("tier").and_then(Value::as_str) == Some(tier.as_str()))
                    .collect(),
            ),
            (_, reply) => reply,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let url = format!("{}{}", cli.url.trim_end_matches('/'), cli.command.path());

    let res = reqwest::Client::new()
        .get(&url)
        .bearer_auth(&cli.key)
        .send()
        .await?;

    let status = res.status();
    if !status.is_success() {
        eprintln!("{} answered {}", url, status);
        if let Ok(body) = res.text().await {
            if !body.is_empty() {
                eprintln!("{}", body);
            }
        }
        std::process::exit(1);
    }

    let reply = cli.command.select(res.json().await?);
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
