// ledger-node
//
//   ledger-node run --config node.toml
//   ledger-node simulate --processes 3 --transfers 5 --initial-balance 100

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lamport_ledger::network::TcpBinding;
use lamport_ledger::{ClientId, LocalNetwork, MutexConfig, Node, NodeConfig, PeerMessenger, ProcessId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ledger-node")]
#[command(version, about = "Replicated ledger serialized by Lamport mutual exclusion", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one process over TCP until Ctrl-C
    Run {
        /// TOML config file. Without it LEDGER_* environment variables are used.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Submit this many random transfers once peers are up
        #[arg(long, default_value = "0")]
        transfers: usize,

        /// Seconds to wait for peers before submitting
        #[arg(long, default_value = "2")]
        startup_delay: u64,
    },

    /// Run N in-process nodes, submit concurrent transfers and check convergence
    Simulate {
        #[arg(short = 'n', long, default_value = "3")]
        processes: usize,

        /// Transfers submitted by every process
        #[arg(short = 'k', long, default_value = "5")]
        transfers: usize,

        #[arg(long, default_value = "100")]
        initial_balance: Decimal,

        /// Per-request timeout in milliseconds
        #[arg(long)]
        request_timeout_ms: Option<u64>,

        /// Random seed. When omitted, a random seed is used.
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Run {
            config,
            transfers,
            startup_delay,
        } => run(config, transfers, Duration::from_secs(startup_delay)).await,
        Command::Simulate {
            processes,
            transfers,
            initial_balance,
            request_timeout_ms,
            seed,
        } => {
            let seed = seed.unwrap_or_else(rand::random);
            simulate(processes, transfers, initial_balance, request_timeout_ms, seed).await
        }
    }
}

async fn run(config_path: Option<PathBuf>, transfers: usize, startup_delay: Duration) -> Result<()> {
    let config = match &config_path {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            NodeConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => {
            info!("Loading config from environment variables");
            NodeConfig::from_env()?
        }
    };

    let registry = config.peer_registry()?;
    let binding = TcpBinding::bind(config.transport_config()).await?;
    let (messenger, inbox) = binding.start(registry)?;
    info!(
        process_id = %config.process_id,
        address = %messenger.local_address(),
        peers = config.peers.len(),
        "Node listening"
    );

    let node = Arc::new(Node::from_config(&config, Arc::new(messenger)));
    let inbox_task = node.spawn_inbox(inbox);

    if transfers > 0 {
        let node = node.clone();
        let clients = client_names(config.peers.len() + 1);
        tokio::spawn(async move {
            tokio::time::sleep(startup_delay).await;
            let mut rng = StdRng::from_entropy();
            let plan = plan_transfers(&mut rng, &clients, transfers, node.ledger().initial_balance());
            submit_all(&node, plan).await;
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let status = node.status();
    info!(
        height = status.height,
        head = ?status.head_hash,
        clock = status.clock,
        "Final state"
    );
    for (client, balance) in node.ledger().balances() {
        info!(%client, %balance, "Balance");
    }

    inbox_task.abort();
    Ok(())
}

async fn simulate(
    processes: usize,
    transfers: usize,
    initial_balance: Decimal,
    request_timeout_ms: Option<u64>,
    seed: u64,
) -> Result<()> {
    if processes == 0 {
        bail!("at least one process is required");
    }
    if initial_balance.is_sign_negative() {
        bail!("initial balance must not be negative");
    }

    info!(processes, transfers, %initial_balance, seed, "Starting simulation");

    let ids: Vec<ProcessId> = (1..=processes).map(|i| ProcessId::new(format!("P{}", i))).collect();
    let mutex_config = match request_timeout_ms {
        Some(ms) => MutexConfig::new().with_request_timeout(Duration::from_millis(ms)),
        None => MutexConfig::new(),
    };

    let network = LocalNetwork::new();
    let mut nodes = Vec::with_capacity(processes);
    for id in &ids {
        let (messenger, inbox) = network.join(id.clone());
        let messenger: Arc<dyn PeerMessenger> = Arc::new(messenger);
        let node = Arc::new(Node::new(
            id.clone(),
            ids.clone(),
            messenger,
            initial_balance,
            mutex_config.clone(),
        ));
        node.spawn_inbox(inbox);
        nodes.push(node);
    }

    let clients = client_names(processes);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tasks = JoinSet::new();
    for node in &nodes {
        let plan = plan_transfers(&mut rng, &clients, transfers, initial_balance);
        let node = node.clone();
        tasks.spawn(async move { submit_all(&node, plan).await });
    }

    let mut committed = 0;
    while let Some(joined) = tasks.join_next().await {
        committed += joined.context("transfer task panicked")?;
    }
    info!(committed, "All transfers submitted");

    wait_for_convergence(&nodes, committed).await?;
    check_convergence(&nodes)?;

    let reference = &nodes[0];
    for (client, balance) in reference.ledger().balances() {
        info!(%client, %balance, "Balance");
    }
    info!(
        height = reference.ledger().height(),
        head = ?reference.ledger().head_hash(),
        "Ledgers converged"
    );
    Ok(())
}

fn client_names(count: usize) -> Vec<ClientId> {
    (1..=count.max(2))
        .map(|i| ClientId::new(format!("client-{}", i)))
        .collect()
}

fn plan_transfers(
    rng: &mut StdRng,
    clients: &[ClientId],
    count: usize,
    initial_balance: Decimal,
) -> Vec<(ClientId, ClientId, Decimal)> {
    let ceiling = initial_balance.trunc().try_into().unwrap_or(1i64).max(1);

    (0..count)
        .map(|_| {
            let sender = rng.gen_range(0..clients.len());
            let mut receiver = rng.gen_range(0..clients.len() - 1);
            if receiver >= sender {
                receiver += 1;
            }
            let amount = Decimal::new(rng.gen_range(1..=ceiling), 0);
            (clients[sender].clone(), clients[receiver].clone(), amount)
        })
        .collect()
}

/// Submit transfers one after another; returns how many committed
async fn submit_all(node: &Node, plan: Vec<(ClientId, ClientId, Decimal)>) -> usize {
    let mut committed = 0;
    for (sender, receiver, amount) in plan {
        match node.submit_transfer(sender.clone(), receiver.clone(), amount).await {
            Ok(receipt) if receipt.is_success() => committed += 1,
            Ok(receipt) => {
                if let Some(reason) = receipt.rejection {
                    info!(process_id = %node.process_id(), %sender, %receiver, %amount, %reason, "Transfer rejected");
                }
            }
            Err(e) => warn!(process_id = %node.process_id(), error = %e, "Transfer failed"),
        }
    }
    committed
}

async fn wait_for_convergence(nodes: &[Arc<Node>], expected_height: usize) -> Result<()> {
    let wait = async {
        while !nodes.iter().all(|node| node.ledger().height() == expected_height) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    if tokio::time::timeout(Duration::from_secs(10), wait).await.is_err() {
        for node in nodes {
            error!(process_id = %node.process_id(), height = node.ledger().height(), "Height after timeout");
        }
        bail!("ledgers did not reach height {}", expected_height);
    }
    Ok(())
}

fn check_convergence(nodes: &[Arc<Node>]) -> Result<()> {
    let reference = &nodes[0];
    let head = reference.ledger().head_hash();
    let balances = reference.ledger().balances();

    for node in nodes {
        node.ledger()
            .verify_chain()
            .with_context(|| format!("chain of {} does not verify", node.process_id()))?;

        if node.ledger().head_hash() != head {
            bail!("{} diverged: head {:?}, expected {:?}", node.process_id(), node.ledger().head_hash(), head);
        }
        if node.ledger().balances() != balances {
            bail!("{} diverged: balances differ", node.process_id());
        }
    }
    Ok(())
}
