//! # turn-probe
//!
//! Periodically checks TURN relays and exports the results.
//!
//! ## Usage
//!
//! ```bash
//! # One run, non-zero exit if any endpoint failed
//! turn-probe --interval 0 --turn-url turn:relay.example.com
//!
//! # Every 30 seconds, metrics on :9464
//! TURN_USERNAME=probe TURN_PASSWORD=secret \
//!     turn-probe --interval 30 --metrics-port 9464 \
//!     --turn-url turn:relay.example.com --turn-url turns:relay.example.com:443
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use huddle_probe::{Credentials, ProbeConfig, Prober};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// STUN/TURN relay health probe.
#[derive(Parser, Debug)]
#[command(name = "turn-probe", version, about = "STUN/TURN relay health probe")]
struct Args {
    /// Seconds between runs; 0 runs once and exits.
    #[arg(long, default_value = "60", value_parser = parse_seconds)]
    interval: Duration,

    /// Socket timeout per attempt, in seconds.
    #[arg(long, default_value = "5", value_parser = parse_timeout)]
    timeout: Duration,

    /// TURN URL to probe; repeat for several.
    #[arg(long = "turn-url", env = "TURN_URLS", value_delimiter = ',')]
    turn_urls: Vec<String>,

    #[arg(long, env = "TURN_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "TURN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Log filter, e.g. `info` or `huddle_probe=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Serve Prometheus metrics on this port.
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{value}' is not a number of seconds"))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("'{value}' is out of range: {e}"))
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    let timeout = parse_seconds(value)?;
    if timeout.is_zero() {
        return Err("timeout must be greater than zero".to_string());
    }
    Ok(timeout)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .with_context(|| format!("invalid log level '{}'", args.log_level))?,
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.turn_urls.is_empty() {
        bail!("no TURN URLs configured (use --turn-url or TURN_URLS)");
    }

    if let Some(port) = args.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to start metrics exporter")?;
        huddle_probe::metrics::describe();
        info!("Metrics listening on {}", addr);
    }

    let credentials = match (args.username, args.password) {
        (Some(username), Some(password)) => Some(Credentials::new(username, password)),
        (None, None) => None,
        _ => bail!("--username and --password must be given together"),
    };
    let config = ProbeConfig {
        timeout: args.timeout,
        credentials,
    };
    let prober = Prober::new(&args.turn_urls, config).context("invalid TURN configuration")?;
    info!(endpoints = prober.endpoints().len(), "TURN probe configured");

    if args.interval.is_zero() {
        let results = prober.run_once().await;
        let failed = results.iter().any(|r| !r.is_success());
        return Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    prober
        .run(args.interval, shutdown_rx)
        .await;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        let mut argv = vec!["turn-probe", "--turn-url", "turn:relay.example.com"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv)
    }

    #[test]
    fn test_durations_parse() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.interval, Duration::from_secs(60));
        assert_eq!(args.timeout, Duration::from_secs(5));

        let args = parse(&["--interval", "0", "--timeout", "0.25"]).unwrap();
        assert!(args.interval.is_zero());
        assert_eq!(args.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_out_of_range_durations_are_rejected() {
        for bad in [
            &["--timeout", "-1"][..],
            &["--timeout", "0"],
            &["--timeout", "1e30"],
            &["--timeout", "NaN"],
            &["--interval", "-5"],
            &["--interval", "inf"],
            &["--interval", "soon"],
        ] {
            assert!(parse(bad).is_err(), "{bad:?}");
        }
    }
}
