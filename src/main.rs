// SPDX-License-Identifier: Apache-2.0 OR MIT
use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use traffic_streams::collaborators::InterfaceRole;
use traffic_streams::control::{handle_stream_command, ControlRequest};
use traffic_streams::directory::StaticDirectory;
use traffic_streams::egress::LoopbackEgress;
use traffic_streams::logging::{AsyncConsumer, Facility, LogRegistry, Logger, Severity};
use traffic_streams::packet::Timestamp;
use traffic_streams::{log_info, log_warning, metrics, Config, StreamEngine};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Write log entries as JSON lines to stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[arg(long, global = true, default_value = "info")]
    log_level: Severity,

    /// Expose Prometheus metrics on this address
    #[arg(long, global = true)]
    prometheus_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug, PartialEq)]
enum Command {
    /// Parse and validate a configuration file
    Validate { config: PathBuf },
    /// Create every stream against the configured topology and print them
    Plan { config: PathBuf },
    /// Send all streams over a loopback egress for a while and report
    Simulate {
        config: PathBuf,
        #[arg(long, default_value_t = 1000)]
        duration_ms: u64,
    },
}

fn load(path: &Path) -> Result<Config> {
    let config = Config::load_from_file(path)?;
    config
        .validate()
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    Ok(config)
}

fn build_engine(config: Config, logger: &Logger) -> Result<StreamEngine> {
    let directory = Arc::new(StaticDirectory::from_config(&config.topology)?);
    let session_ids = directory.session_ids();
    let engine = StreamEngine::setup(config, directory.collaborators(), logger.clone())?;
    for session_id in session_ids {
        engine
            .add_session(session_id)
            .with_context(|| format!("failed to add streams of session {session_id}"))?;
    }
    Ok(engine)
}

fn print_command(engine: &StreamEngine, command: &str) -> Result<()> {
    let request = ControlRequest {
        command: command.to_string(),
        ..ControlRequest::default()
    };
    let response = handle_stream_command(engine, &request);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn simulate(engine: StreamEngine, duration: Duration) -> Result<()> {
    let engine = Arc::new(engine);
    engine.spawn_group_timers();
    let mut channels = engine.take_channels();

    // Upstream frames come back on the first network interface, downstream
    // frames on the first access interface.
    let interfaces = engine.collaborators().interfaces.all();
    let first = |role| interfaces.iter().find(|i| i.role == role);
    let mut egress = LoopbackEgress::new(&engine);
    if let (Some(network), Some(access)) = (first(InterfaceRole::Network), first(InterfaceRole::Access)) {
        for view in &interfaces {
            match view.role {
                InterfaceRole::Access => egress = egress.with_peer(&view.name, &network.name),
                InterfaceRole::Network | InterfaceRole::A10nsp => {
                    egress = egress.with_peer(&view.name, &access.name)
                }
            }
        }
    }

    let ctx = engine.send_context();
    let deadline = Instant::now() + duration;
    let mut ticker = tokio::time::interval(Duration::from_millis(1));
    while Instant::now() < deadline {
        ticker.tick().await;
        let now = Timestamp::now();
        egress.set_now(now);
        for channel in &mut channels {
            channel.poll(now, &mut egress, &ctx);
        }
    }
    engine.teardown();

    let sent: u64 = channels
        .iter()
        .map(|c| c.handle().packets_sent.load(Ordering::Relaxed))
        .sum();
    log_info!(
        engine.logger(),
        Facility::Engine,
        "simulation done: {} frames sent on {} channels, {:?}",
        sent,
        channels.len(),
        egress.verdicts()
    );
    print_command(&engine, "stream-stats")?;
    print_command(&engine, "stream-summary")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut consumer_stop = None;
    let mut consumer_task = None;
    let logger = if args.json_logs {
        Logger::stderr_json()
    } else {
        let registry = LogRegistry::new_mpsc();
        let consumer = AsyncConsumer::stderr(registry.export_mpsc_ringbuffers());
        consumer_stop = Some(consumer.stop_handle());
        consumer_task = Some(tokio::spawn(consumer.run()));
        registry.logger()
    };
    logger.set_global_level(args.log_level);

    if let Some(addr) = args.prometheus_addr {
        if let Err(err) = metrics::install_prometheus_recorder(addr) {
            log_warning!(logger, Facility::Engine, "prometheus exporter on {} failed: {}", addr, err);
        }
    }

    let result = match args.command {
        Command::Validate { config: path } => load(&path).map(|config| {
            println!(
                "{}: valid ({} streams, {} interfaces, {} sessions)",
                path.display(),
                config.streams.len(),
                config.topology.interfaces.len(),
                config.topology.sessions.len()
            );
        }),
        Command::Plan { config } => load(&config)
            .and_then(|config| build_engine(config, &logger))
            .and_then(|engine| print_command(&engine, "stream-summary")),
        Command::Simulate {
            config,
            duration_ms,
        } => match load(&config).and_then(|config| build_engine(config, &logger)) {
            Ok(engine) => simulate(engine, Duration::from_millis(duration_ms)).await,
            Err(err) => Err(err),
        },
    };

    if let Some(stop) = consumer_stop {
        stop.store(false, Ordering::Relaxed);
    }
    if let Some(task) = consumer_task {
        let _ = task.await;
    }
    result
}
