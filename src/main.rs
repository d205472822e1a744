use clap::Parser;
use leurre::configuration::config::Config;
use leurre::controller::Controller;
use leurre::event_sink::{Delivery, EventSink};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "leurre")]
#[command(version)]
#[command(about = "Low-interaction deception service: fake FTP, shell and web endpoints")]
struct Args {
    /// Path to the TOML configuration file
    config_file: PathBuf,

    /// Default log level, overridden per module by RUST_LOG
    #[arg(long, env = "LEURRE_LOG_LEVEL", default_value = "info")]
    log_level: log::LevelFilter,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

/// Logs every published record at info level.
fn spawn_live_log(sink: &Arc<EventSink>) -> tokio::task::JoinHandle<()> {
    let mut subscription = sink.subscribe();
    tokio::spawn(async move {
        while let Some(delivery) = subscription.recv().await {
            match delivery {
                Delivery::Record { record, .. } => {
                    let summary: Vec<String> = record
                        .summary
                        .iter()
                        .map(|(k, v)| format!("{}={:?}", k, v))
                        .collect();
                    match &record.termination {
                        Some(t) => info!(
                            "#{} {} {}:{} closed ({} by {:?}, {} bytes) {}",
                            record.id,
                            record.source_address,
                            record.protocol,
                            record.port,
                            t.reason,
                            t.closed_by,
                            t.bytes_received,
                            summary.join(" ")
                        ),
                        None => info!(
                            "#{} {} {}:{} {}",
                            record.id,
                            record.source_address,
                            record.protocol,
                            record.port,
                            summary.join(" ")
                        ),
                    }
                }
                Delivery::Gap { missed, resume_seq } => {
                    warn!("Live log fell behind: {} record(s) skipped before #{}", missed, resume_seq)
                }
            }
        }
    })
}

fn spawn_alert_log(sink: &Arc<EventSink>) -> Option<tokio::task::JoinHandle<()>> {
    let mut alerts = sink.take_alerts()?;
    Some(tokio::spawn(async move {
        while let Some(alert) = alerts.recv().await {
            warn!("Sink alert: {}", alert);
        }
    }))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .parse_default_env()
        .format_target(false)
        .init();

    println!(
        "
██╗     ███████╗██╗   ██╗██████╗ ██████╗ ███████╗
██║     ██╔════╝██║   ██║██╔══██╗██╔══██╗██╔════╝
██║     █████╗  ██║   ██║██████╔╝██████╔╝█████╗
██║     ██╔══╝  ██║   ██║██╔══██╗██╔══██╗██╔══╝
███████╗███████╗╚██████╔╝██║  ██║██║  ██║███████╗
╚══════╝╚══════╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝
=================================================
     Low-interaction deception service v{}
=================================================
",
        env!("CARGO_PKG_VERSION")
    );

    info!("Importing configuration");
    let config = match Config::from_file(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration from {}: {}", args.config_file.display(), e);
            std::process::exit(1);
        }
    };
    info!(
        "Configuration imported successfully ({} listener(s))",
        config.listeners.len()
    );

    if args.check {
        info!("Configuration is valid");
        return;
    }

    let mut controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Unable to create a controller instance: {}, exiting...", e);
            std::process::exit(1);
        }
    };

    let sink = controller.sink();
    let live_log = spawn_live_log(&sink);
    let alert_log = spawn_alert_log(&sink);
    drop(sink);

    let result = controller.run().await;

    // the sink is shut down by now, which ends the live subscription
    let _ = live_log.await;
    if let Some(alert_log) = alert_log {
        alert_log.abort();
    }

    if let Err(e) = result {
        error!("Error occurred in the controller process: {}, exiting...", e);
        std::process::exit(1);
    }
}
