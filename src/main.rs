use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use raftplus::{LocalPeer, Node, NodeStatus, RaftConfig, RaftError, RaftService};

#[derive(Parser, Debug)]
#[command(name = "raftplus")]
#[command(version)]
#[command(about = "A Raft consensus core with pre-vote, run as an in-process cluster")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an in-process cluster, propose commands, and report every node
    Simulate(SimulateArgs),
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Number of commands to propose through the leader
    #[arg(long, default_value = "10")]
    proposals: u64,

    /// How long to wait for a leader, in milliseconds
    #[arg(long, default_value = "5000")]
    leader_timeout_ms: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Shorthand for `--output json`
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

async fn simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.nodes == 0 {
        return Err("--nodes must be at least 1".into());
    }

    let config = RaftConfig::default();
    let nodes: Vec<Arc<Node>> = (1..=args.nodes)
        .map(|id| Node::in_memory(id, config.clone()))
        .collect();

    for node in &nodes {
        let peers: Vec<Arc<dyn RaftService>> = nodes
            .iter()
            .filter(|peer| peer.id() != node.id())
            .map(|peer| Arc::new(LocalPeer::new(peer)) as Arc<dyn RaftService>)
            .collect();
        node.start(peers, None).await?;
    }

    let leader = wait_for_leader(&nodes, Duration::from_millis(args.leader_timeout_ms)).await?;
    tracing::info!(leader_id = leader.id(), term = leader.term().await, "Leader elected");

    let mut failed = 0;
    for n in 1..=args.proposals {
        match leader.propose(format!("cmd-{}", n)).await {
            Ok(index) => tracing::debug!(index, "Proposal committed"),
            Err(e) => {
                failed += 1;
                tracing::warn!(proposal = n, error = %e, "Proposal failed");
            }
        }
    }

    // Give followers one more heartbeat to catch up on the commit index
    tokio::time::sleep(config.heartbeat_interval() * 2).await;

    let mut statuses = Vec::with_capacity(nodes.len());
    for node in &nodes {
        statuses.push(node.status().await);
    }
    let output = if args.json {
        OutputFormat::Json
    } else {
        args.output
    };
    print_statuses(&statuses, &output)?;
    if failed > 0 {
        println!("\n{} of {} proposals failed", failed, args.proposals);
    }

    for node in &nodes {
        node.stop().await?;
    }
    Ok(())
}

async fn wait_for_leader(nodes: &[Arc<Node>], timeout: Duration) -> Result<Arc<Node>, RaftError> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        for node in nodes {
            if node.is_leading().await {
                return Ok(node.clone());
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(RaftError::Timeout("no leader elected".to_string()))
}

fn print_statuses(
    statuses: &[NodeStatus],
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(statuses)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<6} {:<14} {:<6} {:<8} {:<10} {:<10} LAST LOG",
                "ID", "STATE", "TERM", "LEADER", "COMMITTED", "APPLIED"
            );
            for s in statuses {
                let leader = s
                    .leader_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<6} {:<14} {:<6} {:<8} {:<10} {:<10} {}@{}",
                    s.id,
                    s.state.to_string(),
                    s.term,
                    leader,
                    s.committed_idx,
                    s.applied_idx,
                    s.last_log.1,
                    s.last_log.0
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Simulate(sim_args) => simulate(sim_args).await?,
    }
    Ok(())
}
