#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use scriptboard_connectivity::{
    CaptureState, CaptureStreamClient, ConnectivityConfig, EventKind, EventSubscriptions,
    HealthMonitor, OrchestratorEvent, RealtimeClient, timeline,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "scriptboard-monitor")]
#[command(about = "Watch Scriptboard backend connectivity")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Probe backend health and print each status transition
    Health,
    /// Print every orchestrator event pushed over the realtime socket
    Events,
    /// Record one capture session and print its reconstructed timeline
    Record {
        /// Stop recording after this many seconds if the backend has not ended the session.
        #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConnectivityConfig::from_env().context("load connectivity config")?;
    match cli.command {
        Command::Health => run_health(config).await,
        Command::Events => run_events(config).await,
        Command::Record { seconds } => run_record(config, Duration::from_secs(seconds)).await,
    }
}

async fn run_health(config: ConnectivityConfig) -> Result<()> {
    let monitor = HealthMonitor::http(&config.endpoints, config.health)?;
    let mut updates = monitor.subscribe();
    monitor.start();

    let mut last = None;
    loop {
        let snapshot = updates.borrow_and_update().clone();
        let key = (snapshot.status, snapshot.circuit, snapshot.consecutive_failures);
        if last != Some(key) {
            println!("{}", serde_json::to_string(&snapshot)?);
            last = Some(key);
        }
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    monitor.stop();
    Ok(())
}

fn print_event(event: &OrchestratorEvent) {
    println!("{} {}", event.kind, event.payload);
}

async fn run_events(config: ConnectivityConfig) -> Result<()> {
    let subscriptions = EventKind::ALL
        .into_iter()
        .fold(EventSubscriptions::new(), |subscriptions, kind| {
            subscriptions.on(kind, print_event)
        })
        .on_connect(|| eprintln!("connected"))
        .on_disconnect(|reason| eprintln!("disconnected: {reason}"));
    let client = RealtimeClient::from_endpoints(&config.endpoints, subscriptions, config.realtime)?;
    eprintln!("listening on {}", client.url());

    tokio::signal::ctrl_c()
        .await
        .context("listen for ctrl-c")?;
    client.close().await;

    let stats = client.stats();
    eprintln!(
        "events={} pings={} dropped={}",
        stats.events_dispatched, stats.pings_answered, stats.frames_dropped
    );
    Ok(())
}

async fn run_record(config: ConnectivityConfig, limit: Duration) -> Result<()> {
    let client = CaptureStreamClient::new(config.endpoints, config.capture)?;
    let mut live = client.subscribe_events();
    let mut status = client.subscribe();
    client.start_recording().await?;
    eprintln!("recording for up to {}s, ctrl-c to stop", limit.as_secs());

    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
                break;
            }
            event = live.recv() => match event {
                Ok(event) => eprintln!("captured {:?} +{}ms", event.kind, event.ts_delta_ms),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "live capture view lagged"),
                Err(RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() || status.borrow().state != CaptureState::Recording {
                    break;
                }
            }
        }
    }

    let snapshot = client.snapshot();
    let events = client.stop_recording().await;
    if snapshot.state == CaptureState::Failed {
        return Err(anyhow!(
            "capture session failed: {}",
            snapshot.last_error.unwrap_or_default()
        ));
    }
    if let Some(reason) = snapshot.done_reason {
        eprintln!("backend ended the session: {reason}");
    }

    for entry in timeline(&events, Utc::now()) {
        println!("{}", serde_json::to_string(&entry)?);
    }
    eprintln!("{} events", events.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::{Result, anyhow};
    use clap::Parser;
    use clap::error::ErrorKind;

    use super::{Cli, Command};

    #[test]
    fn cli_requires_subcommand() -> Result<()> {
        let Err(err) = Cli::try_parse_from(["scriptboard-monitor"]) else {
            return Err(anyhow!("expected missing subcommand parse error"));
        };
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
        Ok(())
    }

    #[test]
    fn record_defaults_to_one_minute_and_rejects_zero() -> Result<()> {
        let cli = Cli::try_parse_from(["scriptboard-monitor", "record"])?;
        assert_eq!(cli.command, Command::Record { seconds: 60 });

        let cli = Cli::try_parse_from(["scriptboard-monitor", "record", "--seconds", "5"])?;
        assert_eq!(cli.command, Command::Record { seconds: 5 });

        assert!(Cli::try_parse_from(["scriptboard-monitor", "record", "--seconds", "0"]).is_err());
        Ok(())
    }
}
