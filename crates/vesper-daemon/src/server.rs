//! UDP receive loop and periodic maintenance.
//!
//! The server is strictly reactive: it blocks only on the socket, handles
//! each datagram synchronously through the protocol engine, and sends the
//! response before the engine's liveness probe (when one was produced).
//! A maintenance interval completes timed-out evictions and sweeps
//! expired records so neither depends on inbound traffic.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use vesper_dht::kademlia::RoutingTable;
use vesper_dht::store::KeyValueStore;
use vesper_proto::engine::Engine;
use vesper_proto::wire::RECV_BUFFER;

/// The UDP server: socket plus the shared node state.
pub struct Server {
    socket: UdpSocket,
    engine: Engine,
    routing: Arc<RwLock<RoutingTable>>,
    store: Arc<RwLock<KeyValueStore>>,
    maintenance_interval: Duration,
}

impl Server {
    /// Bind the UDP socket on all IPv4 interfaces at `port`.
    pub async fn bind(
        port: u16,
        engine: Engine,
        routing: Arc<RwLock<RoutingTable>>,
        store: Arc<RwLock<KeyValueStore>>,
        maintenance_interval: Duration,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        info!(port, "listening for datagrams");
        Ok(Self {
            socket,
            engine,
            routing,
            store,
            maintenance_interval,
        })
    }

    /// Run the receive loop until the task is cancelled.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut buf = [0u8; RECV_BUFFER];
        let mut maintenance = tokio::time::interval(self.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!(error = %e, "recv failed");
                            continue;
                        }
                    };
                    let SocketAddr::V4(src) = peer else {
                        debug!(%peer, "dropping non-IPv4 datagram");
                        continue;
                    };
                    self.handle_datagram(&buf[..len], src).await;
                }
                _ = maintenance.tick() => {
                    self.routing.write().await.tick();
                    self.store.write().await.sweep();
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], src: SocketAddrV4) {
        let outcome = self.engine.handle(datagram, src).await;

        // The response must go out before the routing side-effect probe.
        if let Some(reply) = outcome.reply {
            self.send(&reply, src).await;
        }
        if let Some((probe, target)) = outcome.probe {
            self.send(&probe, target).await;
        }
    }

    /// Best-effort send: failures are logged, never retried.
    async fn send(&self, datagram: &[u8], target: SocketAddrV4) {
        if let Err(e) = self.socket.send_to(datagram, SocketAddr::V4(target)).await {
            warn!(%target, error = %e, "send failed");
        }
    }
}
