//! apiguard-sim: exercise a resilience policy against a simulated flaky dependency.
//!
//! Usage:
//!   apiguard-sim run [--config <path>] [--calls <n>] [--failure-rate <0..1>]
//!   apiguard-sim check <path>
//!   apiguard-sim version

use anyhow::{bail, Context};
use apiguard::classify::{classify_status, Classify, ErrorClass};
use apiguard::config::ResilienceConfig;
use apiguard::GuardedClient;
use rand::Rng;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_POLICY: &str = r#"
clients:
  exchange:
    rate_limits:
      requests_per_second: 10
      requests_per_minute: 300
    adaptive: {}
    circuit_breaker:
      failure_threshold: 5
      recovery_timeout: 2
    retry:
      max_retries: 3
      base_delay: 0.05
      max_delay: 1
      strategy: jittered_backoff
  llm:
    token_bucket:
      rate: 5
      capacity: 5
    retry:
      max_retries: 2
      base_delay: 0.1
      strategy: exponential_backoff
"#;

/// HTTP-ish failure produced by the simulated dependency.
#[derive(Debug, thiserror::Error)]
#[error("simulated HTTP {status}")]
struct SimError {
    status: u16,
    retry_after: Option<Duration>,
}

impl Classify for SimError {
    fn classify(&self) -> ErrorClass {
        classify_status(self.status)
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

fn simulated_response(failure_rate: f64) -> Result<u64, SimError> {
    let mut rng = rand::thread_rng();
    if !rng.gen_bool(failure_rate) {
        return Ok(rng.gen_range(60_000..70_000));
    }
    let status = match rng.gen_range(0..10) {
        0..=4 => 503,
        5..=7 => 429,
        8 => 504,
        _ => 400,
    };
    let retry_after = (status == 429).then(|| Duration::from_millis(200));
    Err(SimError {
        status,
        retry_after,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => cmd_run(args.get(1..).unwrap_or_default()).await,
        Some("check") => cmd_check(&args[1..]),
        Some("version") | Some("--version") | Some("-V") => {
            println!("apiguard-sim {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn print_usage() {
    println!(
        r#"apiguard-sim: drive a resilience policy against a flaky fake API

USAGE:
    apiguard-sim run [--config <path>] [--calls <n>] [--failure-rate <0..1>]
    apiguard-sim check <path>
    apiguard-sim version

ENVIRONMENT:
    APIGUARD_CONFIG             Policy file used when --config is absent
    RUST_LOG                    Log filter (default: info)"#
    );
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn load_policy(args: &[String]) -> anyhow::Result<ResilienceConfig> {
    if let Some(path) = flag(args, "--config") {
        return ResilienceConfig::from_file(path).with_context(|| format!("loading {path}"));
    }
    if let Some(config) = ResilienceConfig::from_env().context("loading policy from APIGUARD_CONFIG")? {
        return Ok(config);
    }
    info!("no policy given, using the built-in demo policy");
    Ok(ResilienceConfig::from_yaml_str(DEMO_POLICY)?)
}

fn cmd_check(args: &[String]) -> anyhow::Result<()> {
    let Some(path) = args.first() else {
        bail!("check needs a policy file path");
    };
    let config = ResilienceConfig::from_file(path).with_context(|| format!("loading {path}"))?;
    config.build_clients()?;
    for (name, policy) in &config.clients {
        println!("{name}: {}", serde_json::to_string(policy)?);
    }
    println!("{} client(s) OK", config.clients.len());
    Ok(())
}

async fn cmd_run(args: &[String]) -> anyhow::Result<()> {
    let calls: usize = match flag(args, "--calls") {
        Some(v) => v.parse().with_context(|| format!("invalid --calls {v}"))?,
        None => 25,
    };
    let failure_rate: f64 = match flag(args, "--failure-rate") {
        Some(v) => v.parse().with_context(|| format!("invalid --failure-rate {v}"))?,
        None => 0.3,
    };
    if !(0.0..=1.0).contains(&failure_rate) {
        bail!("--failure-rate must be within 0..1");
    }

    let clients = load_policy(args)?.build_clients()?;
    for (name, client) in &clients {
        run_client(client, calls, failure_rate).await;
        let signals = serde_json::to_string_pretty(&client.signals())?;
        println!("== {name} ==\n{signals}");
    }
    Ok(())
}

async fn run_client(client: &GuardedClient, calls: usize, failure_rate: f64) {
    let mut ok = 0usize;
    for i in 0..calls {
        match client.call(|| async move { simulated_response(failure_rate) }).await {
            Ok(_) => ok += 1,
            Err(err) => info!(client = client.name(), call = i, error = %err, "call failed"),
        }
    }
    info!(client = client.name(), ok, total = calls, "simulation finished");
}
