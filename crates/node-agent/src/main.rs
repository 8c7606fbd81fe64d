//! Node agent CLI: standalone LAN discovery, or agent mode connected to a
//! C&C service (§1, §4.F, §4.I).

mod args;
mod error;
mod service;

use anyhow::{Context, Result};
use args::{Args, Command};
use clap::Parser;
use error::exit_codes;
use node_agent_core::{Config, Mode, Telemetry};
use node_agent_store::{HostStore, ScanOrchestrator, ScanSettings};
use node_agent_transport::schema::{OutboundFrame, RegisterMetadata};
use node_agent_transport::CncClient;
use service::AgentService;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn init_tracing(log_level: Option<&str>) {
    let filter = log_level
        .map(str::to_string)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    let env_filter =
        tracing_subscriber::EnvFilter::try_new(&filter).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    if std::env::var("NODE_AGENT_LOG_FORMAT").as_deref() == Ok("json") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn build_register_frame(
    node_id: String,
    location: String,
    public_url: Option<String>,
) -> impl Fn() -> OutboundFrame + Send + Sync {
    move || OutboundFrame::Register {
        node_id: node_id.clone(),
        name: node_id.clone(),
        location: location.clone(),
        public_url: public_url.clone(),
        metadata: RegisterMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            protocol_version: "1".to_string(),
            network_info: node_agent_net::derive_network_info(),
        },
    }
}

fn scan_settings(config: &Config) -> ScanSettings {
    ScanSettings {
        ping_timeout_ms: config.network.ping_timeout_ms,
        ping_concurrency: config.network.ping_concurrency,
        use_ping_validation: config.network.use_ping_validation,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    match run(args).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::from(exit_codes::GENERAL_ERROR as u8)
        }
    }
}

async fn run(args: Args) -> Result<i32> {
    match args.command.unwrap_or(Command::Run { once: false }) {
        Command::ConfigCheck => match Config::from_env() {
            Ok(_) => {
                println!("configuration OK");
                Ok(exit_codes::SUCCESS)
            }
            Err(e) => {
                eprintln!("configuration error: {e}");
                Ok(exit_codes::CONFIG_ERROR)
            }
        },
        Command::Wake { name } => run_wake(name).await,
        Command::Scan => run_scan_once().await,
        Command::ListHosts => run_list_hosts().await,
        Command::Run { once } => run_agent(once).await,
    }
}

async fn open_store(config: &Config) -> Result<HostStore> {
    HostStore::open(&config.database.path, node_agent_core::LifecycleBus::new())
        .await
        .context("opening host store")
}

async fn run_wake(name: String) -> Result<i32> {
    let config = Config::from_env()?;
    let store = open_store(&config).await?;
    let host = store
        .get_by_name(&name)
        .await?
        .with_context(|| format!("no host named {name}"))?;
    node_agent_net::send_magic_packet(&host.mac).await?;
    println!("sent Wake-on-LAN packet to {name} ({})", host.mac);
    Ok(exit_codes::SUCCESS)
}

async fn run_scan_once() -> Result<i32> {
    let config = Config::from_env()?;
    let store = Arc::new(open_store(&config).await?);
    let orchestrator = ScanOrchestrator::new(Arc::clone(&store), scan_settings(&config));
    let outcome = orchestrator.sync_with_network().await;
    println!(
        "scan complete: success={} hosts={} code={:?}",
        outcome.success, outcome.host_count, outcome.code
    );
    Ok(if outcome.success {
        exit_codes::SUCCESS
    } else {
        exit_codes::GENERAL_ERROR
    })
}

async fn run_list_hosts() -> Result<i32> {
    let config = Config::from_env()?;
    let store = open_store(&config).await?;
    let hosts = store.get_all().await?;
    for host in &hosts {
        println!(
            "{:<24} {:<18} {:<15} {:<7} last_seen={:?}",
            host.name, host.mac, host.ip, host.status, host.last_seen
        );
    }
    println!("{} host(s)", hosts.len());
    Ok(exit_codes::SUCCESS)
}

async fn run_agent(once: bool) -> Result<i32> {
    let config = Config::from_env()?;
    let telemetry = Arc::new(Telemetry::new());
    let store = Arc::new(open_store(&config).await?);
    let scan = Arc::new(ScanOrchestrator::new(Arc::clone(&store), scan_settings(&config)));

    info!(
        mode = ?config.mode,
        database = %config.database.path,
        "node agent starting"
    );

    if once {
        let outcome = scan.sync_with_network().await;
        info!(success = outcome.success, hosts = outcome.host_count, "single scan complete");
        store.close().await;
        return Ok(exit_codes::SUCCESS);
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    match config.mode {
        Mode::Standalone => {
            scan.start_periodic(config.network.scan_interval_ms, config.network.scan_delay_ms, true);
            shutdown.cancelled().await;
            scan.stop_periodic();
        }
        Mode::Agent => {
            let agent_config = config
                .agent
                .clone()
                .context("agent mode requires agent.* configuration")?;

            scan.start_periodic(config.network.scan_interval_ms, config.network.scan_delay_ms, false);

            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let lifecycle_rx = store.subscribe();

            let client = Arc::new(CncClient::new(agent_config.clone(), Arc::clone(&telemetry)));
            let register_frame = build_register_frame(
                agent_config.node_id.clone(),
                agent_config.location.clone(),
                agent_config.public_url.clone(),
            );
            let client_task = {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    client.run(register_frame, inbound_tx, outbound_rx, events_tx).await;
                })
            };

            let agent_service = Arc::new(AgentService::new(
                agent_config.node_id.clone(),
                agent_config,
                config.network.clone(),
                Arc::clone(&store),
                Arc::clone(&scan),
                Arc::clone(&telemetry),
            ));
            let service_task = tokio::spawn(agent_service.run(
                lifecycle_rx,
                inbound_rx,
                outbound_tx,
                events_rx,
                shutdown.clone(),
            ));

            shutdown.cancelled().await;
            let _ = service_task.await;
            client_task.abort();
        }
    }

    store.close().await;
    info!("node agent stopped");
    Ok(exit_codes::SUCCESS)
}
