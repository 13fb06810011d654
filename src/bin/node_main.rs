//! Nebula worker node
//!
//! Usage:
//!   nebula-node --host 0.0.0.0 --port 9190
//!
//! Serves poll/task/query requests from the coordinator. Table schemas for
//! the ingestion loader come from the cluster document named by NCONF;
//! NSERVER names the coordinator for log context.

use clap::Parser;
use std::net::TcpListener;
use std::sync::Arc;

use nebula::execution::{BlockManager, JsonFileLoader};
use nebula::meta::{ClusterConfig, NSERVER};
use nebula::service::NodeServer;

#[derive(Parser, Debug)]
#[command(name = "nebula-node")]
#[command(about = "Nebula worker node")]
#[command(version)]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 9190)]
    port: u16,
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Ok(server) = std::env::var(NSERVER) {
        log::info!("coordinator expected at {}", server);
    }

    let mut loader = JsonFileLoader::new();
    match ClusterConfig::from_env() {
        Ok(config) => {
            for table in &config.tables {
                match table.schema() {
                    Ok(schema) => loader.register(table.name.clone(), schema),
                    Err(e) => log::warn!("table {} has no usable schema: {}", table.name, e),
                }
            }
        }
        Err(e) => log::warn!("no cluster config, ingestion disabled: {}", e),
    }

    let server = Arc::new(NodeServer::new(BlockManager::global(), Arc::new(loader)));
    let listener = match TcpListener::bind((args.host.as_str(), args.port)) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("cannot bind {}:{}: {}", args.host, args.port, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = server.serve(listener) {
        eprintln!("server error: {}", e);
        std::process::exit(1);
    }
}
