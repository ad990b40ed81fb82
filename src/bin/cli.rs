use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use graphmcp::middleware::CREDENTIAL_HEADER;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "graphmcp-cli")]
#[command(about = "Operator commands for a running graphmcp gateway", long_about = None)]
struct Cli {
    /// Gateway base URL
    #[arg(long, env = "GRAPHMCP_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Credential sent with session commands
    #[arg(long, env = "GRAPHITI_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show gateway and backend health
    Health,

    /// List the tools the gateway exposes
    Tools,

    /// List live sessions
    Sessions,

    /// Terminate a session
    Terminate {
        /// Session id
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let base = cli.url.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    let with_token = |request: reqwest::RequestBuilder| match &cli.token {
        Some(token) => request.header(CREDENTIAL_HEADER, token),
        None => request,
    };

    match cli.command {
        Commands::Health => {
            let response = client
                .get(format!("{}/health", base))
                .send()
                .await
                .context("Failed to reach gateway")?;
            let status = response.status();
            let body: Value = response.json().await.context("Invalid health response")?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            if !status.is_success() {
                bail!("Gateway unhealthy ({})", status);
            }
        }

        Commands::Tools => {
            let body: Value = client
                .get(format!("{}/tools", base))
                .send()
                .await
                .context("Failed to reach gateway")?
                .error_for_status()?
                .json()
                .await?;

            let tools = body["tools"].as_array().cloned().unwrap_or_default();
            println!("{} tools:", tools.len());
            for tool in tools {
                println!(
                    "  {:<24} {}",
                    tool["name"].as_str().unwrap_or("?"),
                    tool["description"].as_str().unwrap_or("")
                );
            }
        }

        Commands::Sessions => {
            let body: Value = with_token(client.get(format!("{}/sessions", base)))
                .send()
                .await
                .context("Failed to reach gateway")?
                .error_for_status()?
                .json()
                .await?;

            let sessions = body["sessions"].as_array().cloned().unwrap_or_default();
            println!(
                "{} of {} sessions:",
                sessions.len(),
                body["max_sessions"].as_u64().unwrap_or(0)
            );
            println!(
                "  {:<38} {:<26} {:>8} {:>9}",
                "ID", "CREATED", "IDLE(s)", "REQUESTS"
            );
            for session in sessions {
                println!(
                    "  {:<38} {:<26} {:>8} {:>9}",
                    session["id"].as_str().unwrap_or("?"),
                    session["created_at"].as_str().unwrap_or("?"),
                    session["idle_secs"].as_u64().unwrap_or(0),
                    session["request_count"].as_u64().unwrap_or(0),
                );
            }
        }

        Commands::Terminate { id } => {
            let response = with_token(client.delete(format!("{}/sessions/{}", base, id)))
                .send()
                .await
                .context("Failed to reach gateway")?;

            match response.status() {
                reqwest::StatusCode::NO_CONTENT => println!("Session {} terminated", id),
                reqwest::StatusCode::NOT_FOUND => bail!("Session {} not found", id),
                other => bail!("Gateway returned {}", other),
            }
        }
    }

    Ok(())
}
