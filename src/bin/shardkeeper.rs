//! shardkeeper node and operator CLI

use clap::{Parser, Subcommand};
use shardkeeper::common::{
    duration_millis, parse_duration, whole_seconds, BackendKind, Config,
};
use shardkeeper::coordinator::{PartitionAssigner, StatusServer, StatusState};
use shardkeeper::ops::{inspect_cluster, plan_assignment, plan_moves};
use shardkeeper::Coordinator;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardkeeper")]
#[command(about = "Partition ownership coordinator")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Serve {
        /// Logical service name
        #[arg(long)]
        service: Option<String>,

        /// Address advertised to peers (host:port)
        #[arg(long)]
        address: Option<String>,

        /// Registry member id (defaults to the address)
        #[arg(long)]
        member_id: Option<String>,

        /// Number of partitions
        #[arg(long)]
        partitions: Option<u32>,

        /// Backend kind: etcd or memory
        #[arg(long)]
        backend: Option<BackendKind>,

        /// Backend endpoints (comma-separated)
        #[arg(long, value_delimiter = ',')]
        endpoints: Vec<String>,

        /// Bind address for the status API
        #[arg(long)]
        status: Option<SocketAddr>,

        /// Lease TTL in whole seconds, e.g. 2s
        #[arg(long, value_parser = parse_duration)]
        lease_ttl: Option<Duration>,

        /// Reconciliation interval, e.g. 500ms
        #[arg(long, value_parser = parse_duration)]
        reconcile_interval: Option<Duration>,

        /// Bound on a single partition lock attempt, e.g. 1s
        #[arg(long, value_parser = parse_duration)]
        lock_timeout: Option<Duration>,

        /// Rejoin with a fresh lease after losing it
        #[arg(long)]
        rejoin: bool,
    },

    /// Show live peers and their partitions
    Inspect {
        /// Logical service name
        #[arg(long)]
        service: Option<String>,

        /// Backend endpoints (comma-separated)
        #[arg(long, value_delimiter = ',')]
        endpoints: Vec<String>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Compute an assignment offline
    Assign {
        /// Number of partitions
        #[arg(long)]
        partitions: Option<u32>,

        /// Also show the partitions that move when this peer joins
        #[arg(long)]
        join: Option<String>,

        /// Peer addresses
        #[arg(required = true)]
        peers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // CLI flags override the file and environment
    let mut config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            service,
            address,
            member_id,
            partitions,
            backend,
            endpoints,
            status,
            lease_ttl,
            reconcile_interval,
            lock_timeout,
            rejoin,
        } => {
            if let Some(service) = service {
                config.service_name = service;
            }
            if let Some(address) = address {
                config.node_address = address;
            }
            if member_id.is_some() {
                config.member_id = member_id;
            }
            if let Some(partitions) = partitions {
                config.num_partitions = partitions;
            }
            if let Some(kind) = backend {
                config.backend.kind = kind;
            }
            if !endpoints.is_empty() {
                config.backend.endpoints = endpoints;
            }
            if status.is_some() {
                config.status_addr = status;
            }
            if let Some(ttl) = lease_ttl {
                config.lease_ttl_secs = whole_seconds(ttl)?;
            }
            if let Some(interval) = reconcile_interval {
                config.reconcile_interval_ms = duration_millis(interval)?;
            }
            if let Some(timeout) = lock_timeout {
                config.lock_timeout_ms = duration_millis(timeout)?;
            }
            config.rejoin_on_lease_loss |= rejoin;
            config.validate()?;

            let backend = shardkeeper::backend::connect(&config).await?;
            let mut node = Coordinator::new(config.clone(), backend);
            if let Some(bind_addr) = config.status_addr {
                let state = StatusState {
                    service_name: config.service_name.clone(),
                    member_id: config.member_id().to_string(),
                    address: config.node_address.clone(),
                    num_partitions: config.num_partitions,
                    started_at: chrono::Utc::now(),
                    ownership: node.ownership(),
                };
                node = node.with_services(vec![Arc::new(StatusServer::new(bind_addr, state))]);
            }

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Interrupted, shutting down");
                    }
                    cancel.cancel();
                }
            });

            node.serve(cancel).await?;
        }
        Commands::Inspect {
            service,
            endpoints,
            json,
        } => {
            if let Some(service) = service {
                config.service_name = service;
            }
            if !endpoints.is_empty() {
                config.backend.endpoints = endpoints;
            }
            config.validate()?;

            let backend = shardkeeper::backend::connect(&config).await?;
            let report = inspect_cluster(
                backend,
                &config.service_name,
                PartitionAssigner::new(config.num_partitions, config.virtual_nodes),
                config.op_timeout(),
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }
        }
        Commands::Assign {
            partitions,
            join,
            peers,
        } => {
            let assigner = PartitionAssigner::new(
                partitions.unwrap_or(config.num_partitions),
                config.virtual_nodes,
            );
            print!("{}", plan_assignment(&config.service_name, &peers, assigner));

            if let Some(joining) = join {
                let mut after = peers.clone();
                after.push(joining.clone());
                let moves = plan_moves(&peers, &after, assigner);
                println!(
                    "\n{} joining moves {} of {} partitions:",
                    joining,
                    moves.len(),
                    assigner.num_partitions()
                );
                for m in moves {
                    println!(
                        "  {:>4}  {} -> {}",
                        m.partition,
                        m.from.as_deref().unwrap_or("-"),
                        m.to.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }

    Ok(())
}
