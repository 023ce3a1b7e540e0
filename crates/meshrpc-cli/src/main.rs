//! # MeshRPC CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # One call, weighted random over two endpoints
//! meshrpc call calc.Math add -e 127.0.0.1:9001 -e 127.0.0.1:9002=300 --args '[1, 2]'
//!
//! # Pin a customer to one endpoint
//! meshrpc call shop/orders.History:1.0 list -e 10.0.0.1:80 -e 10.0.0.2:80 \
//!     --strategy consistentHash --args '["customer-42"]'
//!
//! # Load every option from a file, override one
//! meshrpc call calc.Math add -e 127.0.0.1:9001 --config cluster.json --retries 0
//! ```
//!
//! The result is printed to stdout as JSON; logs go to stderr (`RUST_LOG`).

use anyhow::Result;
use argh::FromArgs;
use meshrpc_client::HttpInvokerFactory;
use meshrpc_cli::{parse_call_args, parse_endpoint, resolve_config, CallOverrides};
use meshrpc_cluster::{ClusterInvoker, Directory, MemoryRegistry};
use meshrpc_common::config::LoadBalanceStrategy;
use meshrpc_common::protocol::ServiceKey;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(FromArgs)]
/// MeshRPC - client-side cluster invocation
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Call(CallArgs),
}

/// Arguments for one RPC call.
///
/// The endpoints are published into an in-memory registry, so the call goes
/// through the same directory, router, load balancer and failover loop as a
/// long-running client.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// make a single RPC call (outputs raw JSON)
struct CallArgs {
    /// service key, "[group/]name[:version]"
    #[argh(positional)]
    service: String,

    /// method to call
    #[argh(positional)]
    method: String,

    /// endpoint as host:port or host:port=weight, repeatable
    #[argh(option, short = 'e', long = "endpoint")]
    endpoints: Vec<String>,

    /// JSON arguments; an array is spread into positional params
    #[argh(option, short = 'a', default = "String::new()")]
    args: String,

    /// load balancing strategy: random, roundRobin, consistentHash, lru, lfu, peakEwma
    #[argh(option, short = 's')]
    strategy: Option<LoadBalanceStrategy>,

    /// retries after the first attempt
    #[argh(option, short = 'r')]
    retries: Option<usize>,

    /// per-attempt timeout in milliseconds
    #[argh(option, long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// admitted calls per second, 0 disables
    #[argh(option, long = "rate-limit")]
    rate_limit: Option<f64>,

    /// JSON cluster configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // stdout carries the result only
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_call(args: CallArgs) -> Result<()> {
    let service: ServiceKey = args.service.parse()?;
    if args.endpoints.is_empty() {
        anyhow::bail!("At least one --endpoint is required");
    }
    let endpoints = args
        .endpoints
        .iter()
        .map(|raw| parse_endpoint(&service, raw))
        .collect::<Result<Vec<_>>>()?;
    let call_args = parse_call_args(&args.args)?;

    let overrides = CallOverrides {
        strategy: args.strategy,
        retries: args.retries,
        timeout_ms: args.timeout_ms,
        rate_limit: args.rate_limit,
    };
    let config = resolve_config(args.config.as_deref(), &overrides)?;
    debug!(?config, "resolved cluster configuration");

    let registry = Arc::new(MemoryRegistry::new());
    registry.publish(&service, endpoints);
    let directory = Arc::new(Directory::subscribed(
        service,
        Arc::new(HttpInvokerFactory::new()),
        registry,
    )?);
    let cluster = ClusterInvoker::new(Arc::clone(&directory), config)?;

    let result = cluster.call(&args.method, call_args).await;
    directory.destroy().await;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
