use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the API gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check gateway status
    Status,
    /// List middleware in execution order with metrics and health
    Middleware {
        /// Show a single entry
        name: Option<String>,
    },
    /// Unregister a middleware
    Remove { name: String },
    /// Show the snapshot history of a middleware
    Snapshots { name: String },
    /// Capture a snapshot of a middleware's current settings
    Snapshot { name: String },
    /// Roll a middleware back to a snapshot (default: the previous one)
    Rollback {
        name: String,
        #[arg(short, long)]
        timestamp: Option<u64>,
    },
    /// Run a middleware once against a synthetic request
    Test {
        name: String,
        #[arg(short, long, default_value = "GET")]
        method: String,
        #[arg(short, long, default_value = "/")]
        path: String,
        #[arg(short, long, default_value = "")]
        body: String,
    },
    /// List target health
    Targets,
    /// List circuit breaker states
    Breakers,
    /// Show recent alerts
    Alerts,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let client = reqwest::Client::builder().default_headers(headers).build()?;
    let base = cli.url.trim_end_matches('/');

    let request = match cli.command {
        Commands::Status => client.get(format!("{base}/admin/status")),
        Commands::Middleware { name: None } => client.get(format!("{base}/admin/middleware")),
        Commands::Middleware { name: Some(name) } => {
            client.get(format!("{base}/admin/middleware/{name}"))
        }
        Commands::Remove { name } => client.delete(format!("{base}/admin/middleware/{name}")),
        Commands::Snapshots { name } => {
            client.get(format!("{base}/admin/middleware/{name}/snapshots"))
        }
        Commands::Snapshot { name } => {
            client.post(format!("{base}/admin/middleware/{name}/snapshots"))
        }
        Commands::Rollback { name, timestamp } => client
            .post(format!("{base}/admin/middleware/{name}/rollback"))
            .json(&json!({ "timestamp": timestamp })),
        Commands::Test {
            name,
            method,
            path,
            body,
        } => client
            .post(format!("{base}/admin/middleware/{name}/test"))
            .json(&json!({ "method": method, "path": path, "body": body })),
        Commands::Targets => client.get(format!("{base}/admin/targets")),
        Commands::Breakers => client.get(format!("{base}/admin/breakers")),
        Commands::Alerts => client.get(format!("{base}/admin/alerts")),
    };

    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;

    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if !text.is_empty() {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }
    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}
