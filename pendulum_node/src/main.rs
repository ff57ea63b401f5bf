//! Pendulum Node - one swarm instance
//!
//! Serves the instance's state over HTTP, probes higher-indexed neighbors
//! over HTTP, and speaks the HALT/RESTART protocol on a zenoh topic.
//! `--local-cluster` runs the whole swarm in one process over an
//! in-memory bus instead.

mod http;
mod neighbors;
mod zenoh_bus;

use anyhow::{Context, Result};
use clap::Parser;
use pendulum_core::{PendulumAgent, QuorumMode, SimulationConfig};
use pendulum_env::{InstanceId, LocalBusHub, MessageBus, NeighborSource, PendulumContext, TokioContext};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::neighbors::HttpNeighbors;
use crate::zenoh_bus::ZenohBus;

/// Pendulum swarm instance
#[derive(Parser, Debug, Clone)]
#[command(name = "pendulum-node")]
#[command(about = "Run a pendulum instance with collision halt/restart coordination", long_about = None)]
struct Args {
    /// This instance's index (1..=instances)
    #[arg(short, long, env = "PENDULUM_INSTANCE", default_value = "1")]
    instance: u32,

    /// HTTP port (defaults to base_port + instance)
    #[arg(short, long, env = "PENDULUM_PORT")]
    port: Option<u16>,

    /// Port of instance 0; instance i listens on base_port + i
    #[arg(long, env = "BASE_PORT", default_value = "5000")]
    base_port: u16,

    /// Number of instances in the swarm
    #[arg(short = 'n', long, env = "PENDULUM_INSTANCES", default_value = "5")]
    instances: u32,

    /// Tick interval in milliseconds
    #[arg(long, env = "PENDULUM_TICK_MS", default_value = "100")]
    tick_ms: u64,

    /// Seconds spent halted before requesting a restart
    #[arg(long, env = "PENDULUM_HALT_TIMEOUT_SECS", default_value = "5")]
    halt_timeout_secs: u64,

    /// Minimum edge-to-edge gap between neighbors
    #[arg(long, env = "PENDULUM_SAFETY_DISTANCE", default_value = "10")]
    safety_distance: f64,

    /// RESTART counting: distinct or raw
    #[arg(long, env = "PENDULUM_QUORUM", default_value = "distinct")]
    quorum: QuorumMode,

    /// Zenoh endpoint to connect to, e.g. tcp/localhost:7447 (peer discovery if unset)
    #[arg(long, env = "PENDULUM_BROKER")]
    broker: Option<String>,

    /// Safety channel key expression
    #[arg(long, env = "PENDULUM_TOPIC", default_value = "pendulum/swarm/safety")]
    topic: String,

    /// Host where neighbors are reachable
    #[arg(long, env = "PENDULUM_NEIGHBOR_HOST", default_value = "localhost")]
    neighbor_host: String,

    /// Run every instance in this process over an in-memory bus
    #[arg(long)]
    local_cluster: bool,
}

impl Args {
    fn simulation_config(&self, instance: u32) -> SimulationConfig {
        let tick = Duration::from_millis(self.tick_ms);
        SimulationConfig::for_instance(instance, self.instances)
            .with_tick_interval(tick)
            .with_halt_timeout(Duration::from_secs(self.halt_timeout_secs))
            .with_safety_distance(self.safety_distance)
            .with_probe_timeout(tick * 4 / 5)
            .with_quorum_mode(self.quorum)
    }

    fn port_for(&self, instance: u32) -> Result<u16> {
        let port = u32::from(self.base_port) + instance;
        u16::try_from(port).with_context(|| format!("port {port} for instance {instance} out of range"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.local_cluster {
        run_local_cluster(args).await
    } else {
        run_instance(args).await
    }
}

/// One instance per process: zenoh safety channel, HTTP neighbors.
async fn run_instance(args: Args) -> Result<()> {
    let config = args.simulation_config(args.instance);
    let port = match args.port {
        Some(port) => port,
        None => args.port_for(args.instance)?,
    };

    let bus = ZenohBus::connect(InstanceId(args.instance), args.topic.clone(), args.broker.as_deref())
        .await
        .context("failed to join safety channel")?;
    let neighbors = HttpNeighbors::new(&args.neighbor_host, args.base_port, config.probe_timeout)?;

    let agent = PendulumAgent::new(TokioContext::shared(), Arc::new(bus), Arc::new(neighbors), config)?;
    let _subscription = agent.start();
    info!(instance = args.instance, topic = agent.topic(), "subscribed to safety channel");

    serve(agent, port).await
}

/// Every instance in one process, sharing an in-memory safety channel.
async fn run_local_cluster(args: Args) -> Result<()> {
    let hub = LocalBusHub::new(args.topic.clone(), 1024);
    let mut servers = JoinSet::new();

    for instance in 1..=args.instances {
        let config = args.simulation_config(instance);
        let port = args.port_for(instance)?;
        let neighbors = HttpNeighbors::new(&args.neighbor_host, args.base_port, config.probe_timeout)?;
        let agent = PendulumAgent::new(
            Arc::new(TokioContext::labeled(format!("instance {instance}"))),
            Arc::new(hub.join(InstanceId(instance))),
            Arc::new(neighbors),
            config,
        )?;
        agent.start();
        servers.spawn(serve(agent, port));
    }
    info!(instances = args.instances, topic = %args.topic, "local cluster started");

    while let Some(joined) = servers.join_next().await {
        if let Err(err) = joined.context("server task panicked")? {
            error!(error = %err, "instance server stopped");
            return Err(err);
        }
    }
    Ok(())
}

async fn serve<Ctx, Bus, Nbr>(agent: Arc<PendulumAgent<Ctx, Bus, Nbr>>, port: u16) -> Result<()>
where
    Ctx: PendulumContext,
    Bus: MessageBus,
    Nbr: NeighborSource,
{
    let instance = agent.instance_id();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("[server]: Server instance {instance} is running at http://localhost:{port}");
    axum::serve(listener, http::router(agent.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server failed")?;

    agent.shutdown().await;
    info!(%instance, "shut down");
    Ok(())
}
