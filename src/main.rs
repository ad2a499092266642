//! API Gateway
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!         │
//!         ▼
//!   ┌───────────────┐   429   ┌──────────────────────────────────────────┐
//!   │ rate limiter  │───────▶ │                                          │
//!   └──────┬────────┘         │  admin API (separate bind, bearer key)   │
//!          ▼                  │   middleware / snapshots / rollback /    │
//!   ┌───────────────┐   404   │   test / targets / breakers / alerts     │
//!   │  route table  │───────▶ └──────────────────────────────────────────┘
//!   └──────┬────────┘
//!          ▼
//!   ┌───────────────┐  pre-routing     ┌──────────────┐   ┌──────────────┐
//!   │  middleware   │─────────────────▶│ load balancer│──▶│   circuit    │──▶ Backend
//!   │    chain      │                  │ + health chk │   │   breaker    │
//!   └──────┬────────┘                  └──────────────┘   └──────────────┘
//!          │ post-routing, pre-response
//!          ▼
//!     Client Response
//! ```

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "api-gateway")]
#[command(about = "API gateway with a dynamic middleware chain", long_about = None)]
struct Args {
    /// Path to the TOML configuration file (watched for changes).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    api_gateway::lifecycle::startup::run(args.config).await?;
    Ok(())
}
