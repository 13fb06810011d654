//! Nebula coordinator
//!
//! Usage:
//!   nebula-server --config cluster.yaml --interval 15
//!
//! Loads the cluster document (or the one named by NCONF), then drives the
//! three control loops on a timer: refresh the spec registries, expire
//! stale blocks off the nodes, assign pending specs.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nebula::execution::BlockManager;
use nebula::ingest::SpecRepository;
use nebula::meta::{ClusterConfig, ClusterInfo, NodeInfo};
use nebula::service::{NodeClient, TcpNodeClient};

#[derive(Parser, Debug)]
#[command(name = "nebula-server")]
#[command(about = "Nebula coordinator: spec assignment and cluster state")]
#[command(version)]
struct Args {
    /// Cluster document; falls back to the NCONF environment variable
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between control-loop cycles
    #[arg(short, long, default_value_t = 15)]
    interval: u64,
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ClusterConfig::from_file(path),
        None => ClusterConfig::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cannot load cluster config: {}", e);
            std::process::exit(1);
        }
    };

    let cluster = Arc::new(ClusterInfo::new(config));
    let blocks = BlockManager::global();
    let repo = SpecRepository::new(Arc::clone(&cluster), Arc::clone(&blocks));

    let maker = {
        let blocks = Arc::clone(&blocks);
        move |node: &NodeInfo| -> nebula::Result<Box<dyn NodeClient>> {
            Ok(Box::new(TcpNodeClient::new(
                node.addr.clone(),
                Arc::clone(&blocks),
            )))
        }
    };

    log::info!(
        "coordinator up: {} nodes, cycle every {}s",
        cluster.nodes().len(),
        args.interval
    );

    // the loops share the repository mutex, so a long cycle simply delays
    // the next one instead of interleaving with it
    loop {
        let specs = repo.refresh();
        let expired = repo.expire(&maker);
        let (tasks, nodes) = repo.assign(&maker);
        log::info!(
            "cycle done: {} specs, {} expired, {} tasks over {} nodes",
            specs,
            expired,
            tasks,
            nodes
        );
        std::thread::sleep(Duration::from_secs(args.interval));
    }
}
