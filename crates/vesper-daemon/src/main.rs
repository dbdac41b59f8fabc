//! vesperd: a single Vesper DHT node.
//!
//! One OS process running a Tokio async runtime around a single UDP
//! receive loop. Takes the UDP port as its only argument; everything else
//! comes from the optional config file.

mod cli;
mod config;
mod server;

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use vesper_dht::kademlia::RoutingTable;
use vesper_dht::store::KeyValueStore;
use vesper_proto::engine::Engine;

use crate::config::DaemonConfig;
use crate::server::Server;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let name = args.next().unwrap_or_else(|| "vesperd".to_string());
    let port = args.next().as_deref().and_then(cli::parse_port);
    let port = match (port, args.next()) {
        (Some(port), None) => port,
        _ => {
            eprintln!("usage: {name} <port>");
            std::process::exit(1);
        }
    };
    run(port)
}

#[tokio::main]
async fn run(port: u16) -> anyhow::Result<()> {
    let config = DaemonConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.advanced.log_level.parse()?),
        )
        .init();

    let self_id = vesper_dht::random_node_id();
    info!(node_id = %hex::encode(self_id), "vesper daemon starting");

    let routing = Arc::new(RwLock::new(RoutingTable::with_config(
        self_id,
        config.node.k,
        config.probe_ttl(),
    )));
    let store = Arc::new(RwLock::new(KeyValueStore::with_default_ttl(
        config.default_record_ttl(),
    )));
    let engine = Engine::new(self_id, routing.clone(), store.clone());

    let server = Server::bind(
        port,
        engine,
        routing,
        store,
        config.maintenance_interval(),
    )
    .await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            Ok(())
        }
    }
}
