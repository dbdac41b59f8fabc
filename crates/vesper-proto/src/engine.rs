//! Per-datagram request/response state machine.
//!
//! [`Engine::handle`] takes one inbound datagram and produces at most one
//! response plus, occasionally, one liveness probe:
//!
//! 1. Parse the 49-byte header. Too short: ERROR with an all-zero
//!    transaction id, no routing-table update.
//! 2. Dispatch on opcode. Unknown opcode: ERROR, no routing-table update.
//!    A wrong-length body likewise answers ERROR without marking the
//!    sender seen.
//! 3. After any well-formed dispatch the sender is folded into the
//!    routing table. A full bucket hands back its least-recently-seen
//!    contact, which the engine turns into an outbound PING with a fresh
//!    transaction id. The probed peer's PONG re-enters this same state
//!    machine and rescues it; silence lets the eviction deadline pass.
//!
//! The engine keeps no per-request state: replies echo the inbound
//! transaction id, and probes are fire-and-forget.

use std::net::SocketAddrV4;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use vesper_dht::kademlia::{Contact, NodeId, RoutingTable};
use vesper_dht::store::KeyValueStore;
use vesper_dht::K;

use crate::messages::Opcode;
use crate::wire::{self, Frame, TxId, MAX_SMALL_VALUE, TXID_LEN};
use crate::ProtoError;

/// What the caller must send for one handled datagram.
///
/// When both are present the reply goes out before the probe.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Response datagram for the sender, if the inbound message warrants
    /// one.
    pub reply: Option<Vec<u8>>,
    /// Liveness probe for a bucket's least-recently-seen contact.
    pub probe: Option<(Vec<u8>, SocketAddrV4)>,
}

/// The protocol engine: local identity plus shared routing and storage
/// state.
pub struct Engine {
    self_id: NodeId,
    routing: Arc<RwLock<RoutingTable>>,
    store: Arc<RwLock<KeyValueStore>>,
}

impl Engine {
    /// Create an engine over shared routing table and store handles.
    pub fn new(
        self_id: NodeId,
        routing: Arc<RwLock<RoutingTable>>,
        store: Arc<RwLock<KeyValueStore>>,
    ) -> Self {
        Self {
            self_id,
            routing,
            store,
        }
    }

    /// The local node's id.
    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Handle one inbound datagram from `src`.
    pub async fn handle(&self, datagram: &[u8], src: SocketAddrV4) -> Outcome {
        let frame = match Frame::parse(datagram) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%src, len = datagram.len(), "datagram shorter than header");
                return Outcome {
                    reply: Some(self.error_reply([0u8; TXID_LEN], &err)),
                    probe: None,
                };
            }
        };

        let opcode = match Opcode::try_from(frame.opcode) {
            Ok(opcode) => opcode,
            Err(err) => {
                debug!(%src, opcode = frame.opcode, "unknown opcode");
                return Outcome {
                    reply: Some(self.error_reply(frame.txid, &err)),
                    probe: None,
                };
            }
        };

        let reply = match self.dispatch(opcode, &frame).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(%src, ?opcode, body_len = frame.body.len(), "malformed body");
                return Outcome {
                    reply: Some(self.error_reply(frame.txid, &err)),
                    probe: None,
                };
            }
        };

        // Any well-formed message is proof of life for its sender.
        let contact = Contact::new(frame.sender_id, src);
        let probe = self.routing.write().await.update(contact).map(|victim| {
            let ping = Frame::new(Opcode::Ping, self.self_id, wire::random_txid(), Vec::new());
            (ping.encode(), victim.addr)
        });

        Outcome { reply, probe }
    }

    /// Route a message to its handler. A structurally invalid body yields
    /// an error whose display text becomes the ERROR reply.
    async fn dispatch(&self, opcode: Opcode, frame: &Frame) -> crate::Result<Option<Vec<u8>>> {
        match opcode {
            // Extra body bytes on a ping are tolerated.
            Opcode::Ping => Ok(Some(
                Frame::new(Opcode::Pong, self.self_id, frame.txid, Vec::new()).encode(),
            )),

            Opcode::FindNode => {
                let key = parse_key(&frame.body)?;
                Ok(Some(self.find_node_reply(&key, frame).await))
            }

            Opcode::FindValue => {
                let key = parse_key(&frame.body)?;
                let found = {
                    let store = self.store.read().await;
                    match store.get(&key) {
                        Some(value) if value.len() <= MAX_SMALL_VALUE => Some(Frame::new(
                            Opcode::SmallValueFound,
                            self.self_id,
                            frame.txid,
                            value.to_vec(),
                        )),
                        Some(_) => Some(Frame::new(
                            Opcode::LargeValueFound,
                            self.self_id,
                            frame.txid,
                            Vec::new(),
                        )),
                        None => None,
                    }
                };
                match found {
                    Some(reply) => Ok(Some(reply.encode())),
                    // Unknown key: answer as a find-node instead.
                    None => Ok(Some(self.find_node_reply(&key, frame).await)),
                }
            }

            Opcode::Store => {
                if frame.body.len() < 32 {
                    return Err(ProtoError::WrongKeyLength(frame.body.len()));
                }
                let (key_bytes, value) = frame.body.split_at(32);
                let mut key = [0u8; 32];
                key.copy_from_slice(key_bytes);
                self.store.write().await.put(key, value.to_vec());
                Ok(Some(
                    Frame::new(Opcode::StoreSuccess, self.self_id, frame.txid, Vec::new())
                        .encode(),
                ))
            }

            Opcode::Error => {
                warn!(
                    message = %String::from_utf8_lossy(&frame.body),
                    "peer reported an error"
                );
                Ok(None)
            }

            // Replies and acknowledgements are consumed; their only effect
            // is marking the sender seen.
            Opcode::Pong
            | Opcode::StoreSuccess
            | Opcode::StoreFailure
            | Opcode::FindNodeReply
            | Opcode::SmallValueFound
            | Opcode::LargeValueFound => Ok(None),
        }
    }

    /// Build a find-node reply: up to K contacts closest to `key`,
    /// excluding the requester itself.
    async fn find_node_reply(&self, key: &NodeId, frame: &Frame) -> Vec<u8> {
        let routing = self.routing.read().await;
        let mut contacts = routing.closest(key, K + 1);
        contacts.retain(|c| c.node_id != frame.sender_id);
        contacts.truncate(K);
        Frame::new(
            Opcode::FindNodeReply,
            self.self_id,
            frame.txid,
            wire::encode_contact_list(&contacts),
        )
        .encode()
    }

    /// Build an ERROR reply carrying the error's display text.
    fn error_reply(&self, txid: TxId, err: &ProtoError) -> Vec<u8> {
        let text = err.to_string();
        Frame::new(Opcode::Error, self.self_id, txid, text.into_bytes()).encode()
    }
}

/// Extract the 32-byte key a find-node or find-value body must carry.
fn parse_key(body: &[u8]) -> crate::Result<NodeId> {
    if body.len() != 32 {
        return Err(ProtoError::WrongKeyLength(body.len()));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(body);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use crate::messages::{OP_ERROR, OP_FIND_NODE_REPLY, OP_PONG};
    use crate::wire::{decode_contact_list, CONTACT_WIRE_LEN, HEADER_LEN};

    const SELF_ID: NodeId = [0u8; 32];

    fn engine() -> Engine {
        engine_with_k(K)
    }

    fn engine_with_k(k: usize) -> Engine {
        let routing = Arc::new(RwLock::new(RoutingTable::with_config(
            SELF_ID,
            k,
            Duration::from_secs(10),
        )));
        let store = Arc::new(RwLock::new(KeyValueStore::new()));
        Engine::new(SELF_ID, routing, store)
    }

    fn src(byte: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, byte), 7000 + u16::from(byte))
    }

    fn request(opcode: Opcode, sender_byte: u8, body: &[u8]) -> Vec<u8> {
        Frame::new(opcode, [sender_byte; 32], [0xaau8; 16], body.to_vec()).encode()
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let engine = engine();
        let outcome = engine.handle(&request(Opcode::Ping, 1, &[]), src(1)).await;

        let reply = Frame::parse(&outcome.reply.expect("pong")).expect("parse");
        assert_eq!(reply.opcode, OP_PONG);
        assert_eq!(reply.sender_id, SELF_ID);
        assert_eq!(reply.txid, [0xaau8; 16]);
        assert!(reply.body.is_empty());

        // The sender landed in the routing table.
        assert_eq!(engine.routing.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_short_header_errors_without_update() {
        let engine = engine();
        let outcome = engine.handle(&[0x01u8; 20], src(1)).await;

        let reply = Frame::parse(&outcome.reply.expect("error")).expect("parse");
        assert_eq!(reply.opcode, OP_ERROR);
        assert_eq!(reply.txid, [0u8; 16]);
        assert_eq!(reply.body, b"header is too short");
        assert!(outcome.probe.is_none());
        assert!(engine.routing.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_opcode_errors_without_update() {
        let engine = engine();
        let mut datagram = request(Opcode::Ping, 1, &[]);
        datagram[0] = 0x7f;
        let outcome = engine.handle(&datagram, src(1)).await;

        let reply = Frame::parse(&outcome.reply.expect("error")).expect("parse");
        assert_eq!(reply.opcode, OP_ERROR);
        // The transaction id was parsed, so it is echoed.
        assert_eq!(reply.txid, [0xaau8; 16]);
        assert_eq!(reply.body, b"unknown message type");
        assert!(engine.routing.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_find_node_wrong_key_length() {
        let engine = engine();
        let outcome = engine
            .handle(&request(Opcode::FindNode, 1, &[0u8; 31]), src(1))
            .await;

        let reply = Frame::parse(&outcome.reply.expect("error")).expect("parse");
        assert_eq!(reply.opcode, OP_ERROR);
        assert_eq!(reply.body, b"key is wrong length");
        assert!(engine.routing.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_find_node_reply_sorted_and_excludes_requester() {
        let engine = engine();

        // Six peers introduce themselves.
        for byte in 1..=6u8 {
            engine
                .handle(&request(Opcode::Ping, byte, &[]), src(byte))
                .await;
        }

        let outcome = engine
            .handle(&request(Opcode::FindNode, 2, &[0x02u8; 32]), src(2))
            .await;
        let reply = Frame::parse(&outcome.reply.expect("reply")).expect("parse");
        assert_eq!(reply.opcode, OP_FIND_NODE_REPLY);
        assert_eq!(reply.txid, [0xaau8; 16]);
        assert_eq!(reply.body.len() % CONTACT_WIRE_LEN, 0);

        let contacts = decode_contact_list(&reply.body).expect("contacts");
        let bytes: Vec<u8> = contacts.iter().map(|c| c.node_id[0]).collect();
        // Sorted by XOR distance to the key, requester (0x02...) excluded.
        assert_eq!(bytes, vec![3, 1, 6, 4, 5]);
    }

    #[tokio::test]
    async fn test_store_then_find_value_small() {
        let engine = engine();
        let key = [0x44u8; 32];
        let mut body = key.to_vec();
        body.extend_from_slice(b"forty-four");

        let outcome = engine.handle(&request(Opcode::Store, 1, &body), src(1)).await;
        let reply = Frame::parse(&outcome.reply.expect("ack")).expect("parse");
        assert_eq!(reply.opcode, Opcode::StoreSuccess.code());
        assert!(reply.body.is_empty());

        let outcome = engine
            .handle(&request(Opcode::FindValue, 2, &key), src(2))
            .await;
        let reply = Frame::parse(&outcome.reply.expect("value")).expect("parse");
        assert_eq!(reply.opcode, Opcode::SmallValueFound.code());
        assert_eq!(reply.body, b"forty-four");
    }

    #[tokio::test]
    async fn test_store_empty_value_is_valid() {
        let engine = engine();
        let key = [0x45u8; 32];

        let outcome = engine.handle(&request(Opcode::Store, 1, &key), src(1)).await;
        let reply = Frame::parse(&outcome.reply.expect("ack")).expect("parse");
        assert_eq!(reply.opcode, Opcode::StoreSuccess.code());
        assert_eq!(
            engine.store.read().await.get(&key).map(<[u8]>::len),
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_store_short_body_rejected() {
        let engine = engine();
        let outcome = engine
            .handle(&request(Opcode::Store, 1, &[0u8; 31]), src(1))
            .await;
        let reply = Frame::parse(&outcome.reply.expect("error")).expect("parse");
        assert_eq!(reply.opcode, OP_ERROR);
        assert_eq!(reply.body, b"key is wrong length");
    }

    #[tokio::test]
    async fn test_find_value_large_value() {
        let engine = engine();
        let key = [0x55u8; 32];
        engine
            .store
            .write()
            .await
            .set(key, vec![0xee; MAX_SMALL_VALUE + 1], None);

        let outcome = engine
            .handle(&request(Opcode::FindValue, 1, &key), src(1))
            .await;
        let reply = Frame::parse(&outcome.reply.expect("reply")).expect("parse");
        assert_eq!(reply.opcode, Opcode::LargeValueFound.code());
        assert!(reply.body.is_empty());
    }

    #[tokio::test]
    async fn test_find_value_boundary_fits_inline() {
        let engine = engine();
        let key = [0x56u8; 32];
        engine
            .store
            .write()
            .await
            .set(key, vec![0xee; MAX_SMALL_VALUE], None);

        let outcome = engine
            .handle(&request(Opcode::FindValue, 1, &key), src(1))
            .await;
        let reply = outcome.reply.expect("reply");
        assert_eq!(reply.len(), crate::wire::MAX_DATAGRAM);
        let reply = Frame::parse(&reply).expect("parse");
        assert_eq!(reply.opcode, Opcode::SmallValueFound.code());
    }

    #[tokio::test]
    async fn test_find_value_absent_falls_back_to_find_node() {
        let engine = engine();
        engine.handle(&request(Opcode::Ping, 1, &[]), src(1)).await;

        let outcome = engine
            .handle(&request(Opcode::FindValue, 2, &[0x99u8; 32]), src(2))
            .await;
        let reply = Frame::parse(&outcome.reply.expect("reply")).expect("parse");
        assert_eq!(reply.opcode, OP_FIND_NODE_REPLY);
        let contacts = decode_contact_list(&reply.body).expect("contacts");
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].node_id, [1u8; 32]);
    }

    #[tokio::test]
    async fn test_pong_consumed_but_marks_sender_seen() {
        let engine = engine();
        let outcome = engine.handle(&request(Opcode::Pong, 1, &[]), src(1)).await;
        assert!(outcome.reply.is_none());
        assert_eq!(engine.routing.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_error_never_answered() {
        let engine = engine();
        let outcome = engine
            .handle(&request(Opcode::Error, 1, b"something broke"), src(1))
            .await;
        assert!(outcome.reply.is_none());
    }

    #[tokio::test]
    async fn test_full_bucket_emits_probe() {
        // Capacity 2, three distinct senders in one bucket's range.
        let engine = engine_with_k(2);

        let sender = |byte: u8| {
            let mut id = [0u8; 32];
            id[0] = 0x80;
            id[31] = byte;
            Frame::new(Opcode::Ping, id, [0xaau8; 16], Vec::new()).encode()
        };

        assert!(engine.handle(&sender(1), src(1)).await.probe.is_none());
        assert!(engine.handle(&sender(2), src(2)).await.probe.is_none());

        let outcome = engine.handle(&sender(3), src(3)).await;
        // The reply still goes out; the probe targets the oldest contact.
        assert!(outcome.reply.is_some());
        let (probe, target) = outcome.probe.expect("probe");
        assert_eq!(target, src(1));

        let probe = Frame::parse(&probe).expect("parse");
        assert_eq!(probe.opcode, Opcode::Ping.code());
        assert_eq!(probe.sender_id, SELF_ID);
        // Fresh transaction id, not the inbound one.
        assert_ne!(probe.txid, [0xaau8; 16]);
        assert!(probe.body.is_empty());
    }

    #[tokio::test]
    async fn test_reply_header_is_exactly_49_bytes_plus_body() {
        let engine = engine();
        let outcome = engine.handle(&request(Opcode::Ping, 1, &[]), src(1)).await;
        assert_eq!(outcome.reply.expect("pong").len(), HEADER_LEN);
    }
}
