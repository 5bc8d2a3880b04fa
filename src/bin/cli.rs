//! CLI for zone administration over the HTTP admin API

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::time::Duration;
use zonelog::common::utils::parse_duration;

#[derive(Parser)]
#[command(name = "zonelog")]
#[command(about = "zonelog administration CLI")]
#[command(version)]
struct Cli {
    /// Admin API URL of a zone server
    #[arg(long, default_value = "http://localhost:2633")]
    url: String,

    /// Admin bearer token
    #[arg(long, env = "ZONELOG_ADMIN_TOKEN")]
    token: Option<String>,

    /// Request timeout (e.g. "500ms", "10s")
    #[arg(long, default_value = "10s", value_parser = parse_timeout)]
    timeout: Duration,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the server's consensus state
    Status,

    /// Submit a command to the zone log (must reach the leader)
    Exec {
        /// Command text
        sql: String,

        /// Also ship the command to slave zones
        #[arg(long)]
        federated: bool,
    },

    /// Add a server to a zone
    AddServer {
        #[arg(long)]
        zone: i32,

        #[arg(long, default_value = "")]
        name: String,

        #[arg(long)]
        endpoint: String,
    },

    /// Remove a server from a zone
    DeleteServer {
        #[arg(long)]
        zone: i32,

        #[arg(long)]
        server: i32,
    },

    /// Make the leader re-match a follower from the end of its log
    ResetServer {
        #[arg(long)]
        zone: i32,

        #[arg(long)]
        server: i32,
    },
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

struct AdminClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl AdminClient {
    async fn send(&self, request: reqwest::RequestBuilder) -> anyhow::Result<Value> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.context("request failed")?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("no details");
            if let Some(endpoint) = body["leader_endpoint"].as_str() {
                bail!("{} ({}); leader is at {}", message, status, endpoint);
            }
            bail!("{} ({})", message, status);
        }
        Ok(body)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), path)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = AdminClient {
        http: reqwest::Client::builder()
            .timeout(cli.timeout)
            .build()
            .context("failed to build HTTP client")?,
        url: cli.url,
        token: cli.token,
    };

    match cli.command {
        Commands::Status => {
            let status = client.send(client.http.get(client.url("/raft/status"))).await?;
            println!("Zone server status:");
            println!("  Server: {} (zone {})", status["server_id"], status["zone_id"]);
            println!("  Role: {}", status["role"].as_str().unwrap_or("unknown"));
            println!("  Term: {}", status["term"]);
            println!("  Leader: {}", status["leader_id"]);
            println!("  Voted for: {}", status["votedfor"]);
            println!(
                "  Log: last {} (term {}), commit {}, applied {}",
                status["last_log_index"],
                status["last_log_term"],
                status["commit_index"],
                status["applied_index"]
            );
            println!("  Federation cursor: {}", status["fed_cursor"]);
            if status["halted"].as_bool().unwrap_or(false) {
                println!("  HALTED after a storage failure");
            }
        }

        Commands::Exec { sql, federated } => {
            let body = json!({ "sql": sql, "federated": federated });
            let reply = client
                .send(client.http.post(client.url("/log")).json(&body))
                .await?;
            println!("Committed at index {}", reply["index"]);
        }

        Commands::AddServer {
            zone,
            name,
            endpoint,
        } => {
            let body = json!({ "name": name, "endpoint": endpoint });
            let reply = client
                .send(
                    client
                        .http
                        .post(client.url(&format!("/zone/{}/server", zone)))
                        .json(&body),
                )
                .await?;
            println!("Added server {} to zone {}", reply["server_id"], zone);
        }

        Commands::DeleteServer { zone, server } => {
            client
                .send(
                    client
                        .http
                        .delete(client.url(&format!("/zone/{}/server/{}", zone, server))),
                )
                .await?;
            println!("Removed server {} from zone {}", server, zone);
        }

        Commands::ResetServer { zone, server } => {
            client
                .send(
                    client
                        .http
                        .post(client.url(&format!("/zone/{}/server/{}/reset", zone, server))),
                )
                .await?;
            println!("Reset replication index of server {} in zone {}", server, zone);
        }
    }

    Ok(())
}
