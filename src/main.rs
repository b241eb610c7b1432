use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use grid_placement::balancer::AffinityRing;
use grid_placement::cluster::Cluster;
use grid_placement::config::{AdaptiveConfig, AffinityConfig, BalancerConfig, NodeConfig};
use grid_placement::node::{Node, NodeStatsSnapshot, Placement};
use grid_placement::scheduler::JobSpec;
use grid_placement::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "grid-placement")]
#[command(version)]
#[command(about = "Work-stealing job placement with adaptive and affinity load balancing")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an in-process cluster and report where jobs ran
    Simulate(SimulateArgs),

    /// Print affinity ring mappings for a set of keys
    Ring(RingArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BalancerKind {
    Adaptive,
    Affinity,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Number of jobs in the task
    #[arg(long, default_value = "100")]
    jobs: usize,

    /// Load balancer used to map jobs (overrides the config file)
    #[arg(long)]
    balancer: Option<BalancerKind>,

    /// Maximum concurrently active jobs per node
    #[arg(long)]
    active_threshold: Option<u32>,

    /// Waiting jobs a node keeps before handing jobs to thieves
    #[arg(long)]
    wait_threshold: Option<u32>,

    /// Simulated work per job in milliseconds
    #[arg(long, default_value = "50")]
    work_ms: u64,

    /// Number of distinct affinity keys spread over the jobs (0 = none)
    #[arg(long, default_value = "0")]
    keys: usize,

    /// Queue every job on the first node and let the others steal
    #[arg(long)]
    pin_to_origin: bool,

    /// Metrics heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Give up waiting for the task after this many seconds
    #[arg(long, default_value = "120")]
    timeout_secs: u64,

    /// Port for the first node's status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// JSON node configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct RingArgs {
    /// Number of nodes on the ring
    #[arg(long, default_value = "3")]
    nodes: u128,

    /// Replicas per node
    #[arg(long, default_value = "1000")]
    replicas: u32,

    /// Seed mixed into every ring position
    #[arg(long, default_value = "")]
    seed: String,

    /// Number of keys to map ("key-0" .. "key-N")
    #[arg(long, default_value = "10")]
    keys: usize,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Serialize)]
struct NodeReport {
    node_id: String,
    #[serde(flatten)]
    stats: NodeStatsSnapshot,
}

#[derive(Serialize)]
struct SimulationOutput {
    balancer: String,
    jobs: usize,
    completed: usize,
    success: bool,
    error: Option<String>,
    elapsed_ms: u64,
    nodes: Vec<NodeReport>,
}

#[derive(Serialize)]
struct RingOutput {
    positions: usize,
    mappings: Vec<KeyMapping>,
    distribution: BTreeMap<String, usize>,
}

#[derive(Serialize)]
struct KeyMapping {
    key: String,
    node_id: String,
}

fn build_config(args: &SimulateArgs) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };

    match args.balancer {
        Some(BalancerKind::Adaptive) => {
            config.balancer = BalancerConfig::Adaptive(AdaptiveConfig::default());
        }
        Some(BalancerKind::Affinity) => {
            config.balancer = BalancerConfig::Affinity(AffinityConfig::default());
        }
        None => {}
    }
    if let Some(threshold) = args.active_threshold {
        config.stealing.active_jobs_threshold = threshold;
    }
    if let Some(threshold) = args.wait_threshold {
        config.stealing.wait_jobs_threshold = threshold;
    }
    if let Some(ms) = args.heartbeat_ms {
        config.heartbeat_interval_ms = ms;
    }

    config.validate()?;
    Ok(config)
}

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.nodes == 0 {
        return Err("--nodes must be at least 1".into());
    }

    let config = build_config(&args)?;
    let cluster = Cluster::new();

    let mut nodes: Vec<Arc<Node>> = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let dashboard_addr: Option<SocketAddr> = match (i, args.dashboard_port) {
            (0, Some(p)) => Some(format!("0.0.0.0:{}", p).parse()?),
            _ => None,
        };
        let (node, inbox) = Node::new(config.clone(), &cluster, dashboard_addr)?;
        node.start(inbox);
        nodes.push(node);
    }

    tracing::info!(
        nodes = args.nodes,
        jobs = args.jobs,
        balancer = nodes[0].balancer.name(),
        pin_to_origin = args.pin_to_origin,
        "Starting simulation"
    );

    // Let every node publish metrics once before mapping.
    tokio::time::sleep(Duration::from_millis(config.heartbeat_interval_ms)).await;

    let jobs: Vec<JobSpec> = (0..args.jobs)
        .map(|i| {
            let spec = JobSpec::new().with_work_ms(args.work_ms);
            if args.keys > 0 {
                spec.with_affinity_key(format!("key-{}", i % args.keys))
            } else {
                spec
            }
        })
        .collect();

    let placement = if args.pin_to_origin {
        Placement::Local
    } else {
        Placement::Balanced
    };

    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone());

    let started = std::time::Instant::now();
    let task = nodes[0]
        .submit_task_with(Uuid::new_v4(), jobs, placement)
        .await?;

    let outcome = tokio::select! {
        outcome = task.wait() => Some(outcome?),
        _ = shutdown.cancelled() => None,
        _ = tokio::time::sleep(Duration::from_secs(args.timeout_secs)) => {
            tracing::warn!(timeout_secs = args.timeout_secs, "Simulation timed out");
            None
        }
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let output = SimulationOutput {
        balancer: nodes[0].balancer.name().to_string(),
        jobs: args.jobs,
        completed: outcome.as_ref().map_or(0, |o| o.results.len()),
        success: outcome.as_ref().is_some_and(|o| o.is_success()),
        error: outcome.as_ref().and_then(|o| o.error.clone()),
        elapsed_ms,
        nodes: nodes
            .iter()
            .map(|n| NodeReport {
                node_id: n.id().to_string(),
                stats: n.stats(),
            })
            .collect(),
    };

    for node in &nodes {
        node.stop();
    }

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Balancer:  {}", output.balancer);
            println!("Completed: {} / {}", output.completed, output.jobs);
            println!("Elapsed:   {} ms", output.elapsed_ms);
            if let Some(error) = &output.error {
                println!("Error:     {}", error);
            }
            println!();
            println!("{:<38} {:>9} {:>9} {:>11}", "NODE", "EXECUTED", "STOLEN", "HANDED OFF");
            println!("{}", "-".repeat(70));
            for node in &output.nodes {
                println!(
                    "{:<38} {:>9} {:>9} {:>11}",
                    node.node_id,
                    node.stats.executed,
                    node.stats.executed_stolen,
                    node.stats.handed_off
                );
            }
        }
    }

    Ok(())
}

fn run_ring(args: RingArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.replicas == 0 {
        return Err("--replicas must be at least 1".into());
    }

    let ring = AffinityRing::with_md5(args.seed.clone());
    // Fixed ids so runs are comparable.
    for i in 1..=args.nodes {
        ring.add_node(Uuid::from_u128(i), args.replicas);
    }

    let mut distribution: BTreeMap<String, usize> = BTreeMap::new();
    let mappings: Vec<KeyMapping> = (0..args.keys)
        .filter_map(|i| {
            let key = format!("key-{}", i);
            let node = ring.lookup(key.as_bytes())?;
            *distribution.entry(node.to_string()).or_default() += 1;
            Some(KeyMapping {
                key,
                node_id: node.to_string(),
            })
        })
        .collect();

    let output = RingOutput {
        positions: ring.len(),
        mappings,
        distribution,
    };

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Ring positions: {}", output.positions);
            println!();
            println!("{:<12} NODE", "KEY");
            println!("{}", "-".repeat(50));
            for m in &output.mappings {
                println!("{:<12} {}", m.key, m.node_id);
            }
            println!();
            println!("{:<38} KEYS", "NODE");
            for (node, count) in &output.distribution {
                println!("{:<38} {}", node, count);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Simulate(sim_args) => run_simulation(sim_args).await?,
        Commands::Ring(ring_args) => run_ring(ring_args)?,
    }

    Ok(())
}
