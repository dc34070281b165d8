//! Health probe CLI.
//!
//! `healthprobe <bucket>` queries the matching health endpoint on the local
//! server and maps the result to an exit code, for container orchestrators
//! and init systems that cannot parse JSON:
//!
//! - 0: Healthy (or Degraded; the endpoint answered 200)
//! - 1: NonHealthy (503 or "Unhealthy" status)
//! - 2: Misconfiguration (unknown bucket, bad port)
//! - 3: Exception (endpoint unreachable)
//! - 4: InvalidArguments (flag parsing failed)

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use taskmill::health::HealthBucket;

const EXIT_HEALTHY: u8 = 0;
const EXIT_NON_HEALTHY: u8 = 1;
const EXIT_MISCONFIGURATION: u8 = 2;
const EXIT_EXCEPTION: u8 = 3;
const EXIT_INVALID_ARGUMENTS: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "healthprobe", about = "Probe the server's health buckets")]
struct Args {
    /// Bucket to probe: live, ready, or dep
    bucket: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Include per-check details in the output
    #[arg(long)]
    include_data: bool,

    /// Print the raw JSON response
    #[arg(long)]
    json: bool,
}

fn endpoint_path(bucket: HealthBucket) -> &'static str {
    match bucket {
        HealthBucket::Live => "/healthz",
        HealthBucket::Ready => "/readyz",
        HealthBucket::Dep => "/health/dep",
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Unknown flags must fail argument parsing, not fall through.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_INVALID_ARGUMENTS);
        }
    };

    let Some(bucket) = HealthBucket::parse(&args.bucket) else {
        eprintln!("unknown bucket {:?}; expected live, ready, or dep", args.bucket);
        return ExitCode::from(EXIT_MISCONFIGURATION);
    };

    let port: u16 = match std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
    {
        Ok(port) => port,
        Err(_) => {
            eprintln!("PORT is not a valid number");
            return ExitCode::from(EXIT_MISCONFIGURATION);
        }
    };

    let url = format!("http://127.0.0.1:{port}{}", endpoint_path(bucket));
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("failed to build http client: {e}");
            return ExitCode::from(EXIT_EXCEPTION);
        }
    };

    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("probe failed: {e}");
            return ExitCode::from(EXIT_EXCEPTION);
        }
    };

    let status = response.status();
    let body: serde_json::Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            eprintln!("unparseable response: {e}");
            return ExitCode::from(EXIT_EXCEPTION);
        }
    };

    if args.json {
        println!("{body}");
    } else {
        let overall = body
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("Unknown");
        println!("{}: {overall}", bucket.as_str());
        if args.include_data {
            if let Some(checks) = body.get("checks").and_then(|c| c.as_array()) {
                for check in checks {
                    let name = check.get("name").and_then(|n| n.as_str()).unwrap_or("?");
                    let check_status = check
                        .get("status")
                        .and_then(|s| s.as_str())
                        .unwrap_or("Unknown");
                    let duration = check
                        .get("durationMs")
                        .and_then(|d| d.as_u64())
                        .unwrap_or(0);
                    println!("  {name}: {check_status} ({duration}ms)");
                }
            }
        }
    }

    if status.is_success() {
        ExitCode::from(EXIT_HEALTHY)
    } else {
        ExitCode::from(EXIT_NON_HEALTHY)
    }
}
