use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokyo_monitor::config::{LogFormat, LoggingConfig, MonitorConfig};
use tokyo_monitor::dashboard::{connection_label, Dashboard};
use tokyo_monitor::gateway::{AnomalyApi, HttpGateway};
use tokyo_monitor::model::Anomaly;
use tokyo_monitor::mutation::CaptureOutcome;
use tokyo_monitor::notify::ChannelSink;

#[derive(Parser)]
#[command(
    name = "tokyo-monitor",
    about = "Tokyo Anomaly Monitoring System: live anomaly dashboard and reference server",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (falls back to $TOKYO_MONITOR_CONFIG, then ./tokyo-monitor.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reference server (REST API + push stream)
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Fetch and print all anomalies
    List {
        /// Server base URL
        #[arg(long)]
        base_url: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Capture an anomaly
    Capture {
        /// Anomaly id
        id: String,

        /// Server base URL
        #[arg(long)]
        base_url: Option<String>,
    },

    /// Live dashboard: print the anomaly table on every change until Ctrl-C
    Watch {
        /// Server base URL
        #[arg(long)]
        base_url: Option<String>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn print_table(anomalies: &[Anomaly]) {
    println!(
        "{:<4} | {:<20} | {:<10} | {:<24} | Status",
        "ID", "Name", "Threat", "Location"
    );
    println!("{:-<4}-|-{:-<20}-|-{:-<10}-|-{:-<24}-|-{:-<8}", "", "", "", "", "");
    for a in anomalies {
        println!(
            "{:<4} | {:<20} | {:<10} | {:<24} | {}",
            a.id,
            a.name,
            a.threat_level.as_str().to_uppercase(),
            a.location,
            a.status
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = MonitorConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.listen_address = bind;
            }
            tracing::info!(bind = %config.server.listen_address, "Starting reference server");
            tokyo_monitor::serve(&config.server).await?;
        }
        Commands::List { base_url, json } => {
            if let Some(url) = base_url {
                config.client.base_url = url;
            }
            let gateway = HttpGateway::new(&config.client.base_url, config.client.request_timeout())?;
            let anomalies = gateway.fetch_all().await.context("failed to fetch anomalies")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&anomalies)?);
            } else if anomalies.is_empty() {
                println!("No anomalies detected.");
            } else {
                print_table(&anomalies);
            }
        }
        Commands::Capture { id, base_url } => {
            if let Some(url) = base_url {
                config.client.base_url = url;
            }
            let (sink, mut toasts) = ChannelSink::new();
            let dashboard = Dashboard::new(&config.client, Arc::new(sink))?;
            dashboard.refresh().await.context("failed to fetch anomalies")?;

            let outcome = dashboard.capture(&id).await;
            while let Ok(toast) = toasts.try_recv() {
                println!("[{}] {}", toast.kind, toast.message);
            }
            if let Some(anomaly) = dashboard.store().find(&id) {
                println!("{} ({}) is now {}", anomaly.name, anomaly.id, anomaly.status);
            }
            if let CaptureOutcome::RolledBack(e) = outcome {
                anyhow::bail!("capture of '{}' failed: {}", id, e);
            }
        }
        Commands::Watch { base_url } => {
            if let Some(url) = base_url {
                config.client.base_url = url;
            }
            let (sink, mut toasts) = ChannelSink::new();
            let dashboard = Dashboard::new(&config.client, Arc::new(sink))?;
            if let Err(e) = dashboard.mount().await {
                tracing::warn!(error = %e, "initial fetch failed, waiting for push updates");
            }

            let mut store_rx = dashboard.store().subscribe();
            let mut status_rx = dashboard.subscriber().watch_status();
            print_table(&store_rx.borrow_and_update().anomalies);

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = store_rx.changed() => {
                        if changed.is_err() { break; }
                        println!();
                        print_table(&store_rx.borrow_and_update().anomalies);
                    }
                    changed = status_rx.changed() => {
                        if changed.is_err() { break; }
                        let status = *status_rx.borrow_and_update();
                        println!("[connection] {}", connection_label(&status));
                    }
                    Some(toast) = toasts.recv() => {
                        println!("[{}] {}", toast.kind, toast.message);
                    }
                }
            }

            dashboard.unmount();
            tracing::info!("dashboard unmounted");
        }
    }

    Ok(())
}
