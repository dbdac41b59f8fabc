//! Frame and contact codecs for the Vesper wire protocol.
//!
//! One UDP datagram carries one frame: a fixed 49-byte header followed by
//! an opcode-specific body. Contacts travel as fixed 38-byte records:
//! 32 bytes of node id, 4 bytes of IPv4 address, 2 bytes of port, all in
//! network byte order.

use std::net::{Ipv4Addr, SocketAddrV4};

use vesper_dht::kademlia::{Contact, NodeId};

use crate::messages::Opcode;
use crate::{ProtoError, Result};

/// Length of the fixed frame header: opcode ‖ sender id ‖ transaction id.
pub const HEADER_LEN: usize = 49;

/// Length of a transaction id.
pub const TXID_LEN: usize = 16;

/// MTU-safe datagram size. A value is "small" (sent inline) iff a frame
/// carrying it stays within this bound.
pub const MAX_DATAGRAM: usize = 512;

/// Receive buffer size. Larger than [`MAX_DATAGRAM`] so that a full
/// 20-contact find-node reply (49 + 760 = 809 bytes) is never truncated.
pub const RECV_BUFFER: usize = 1200;

/// Largest value that still fits inline in a small-value reply.
pub const MAX_SMALL_VALUE: usize = MAX_DATAGRAM - HEADER_LEN;

/// Wire length of one contact record.
pub const CONTACT_WIRE_LEN: usize = 38;

/// An opaque transaction id, echoed verbatim from request to response.
pub type TxId = [u8; TXID_LEN];

/// A parsed or to-be-encoded datagram.
///
/// `opcode` stays a raw byte so that a frame with an unregistered opcode
/// can still be parsed far enough to echo its transaction id in an ERROR
/// reply; dispatch goes through [`Opcode::try_from`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Message type byte.
    pub opcode: u8,
    /// The sender's node id.
    pub sender_id: NodeId,
    /// Client-chosen reply-matching token, opaque to the server.
    pub txid: TxId,
    /// Opcode-specific body.
    pub body: Vec<u8>,
}

impl Frame {
    /// Build a frame for a registered opcode.
    pub fn new(opcode: Opcode, sender_id: NodeId, txid: TxId, body: Vec<u8>) -> Self {
        Self {
            opcode: opcode.code(),
            sender_id,
            txid,
            body,
        }
    }

    /// Parse a datagram. Fails only when the datagram is shorter than the
    /// fixed header; body validation is per-opcode and happens at
    /// dispatch.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(ProtoError::HeaderTooShort);
        }
        let mut sender_id = [0u8; 32];
        sender_id.copy_from_slice(&data[1..33]);
        let mut txid = [0u8; TXID_LEN];
        txid.copy_from_slice(&data[33..HEADER_LEN]);
        Ok(Self {
            opcode: data[0],
            sender_id,
            txid,
            body: data[HEADER_LEN..].to_vec(),
        })
    }

    /// Serialize this frame to datagram bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.push(self.opcode);
        out.extend_from_slice(&self.sender_id);
        out.extend_from_slice(&self.txid);
        out.extend_from_slice(&self.body);
        out
    }
}

/// Generate a random transaction id for a server-originated probe.
pub fn random_txid() -> TxId {
    let mut txid = [0u8; TXID_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut txid);
    txid
}

/// Encode one contact as its 38-byte wire record.
pub fn encode_contact(contact: &Contact) -> [u8; CONTACT_WIRE_LEN] {
    let mut out = [0u8; CONTACT_WIRE_LEN];
    out[..32].copy_from_slice(&contact.node_id);
    out[32..36].copy_from_slice(&contact.addr.ip().octets());
    out[36..38].copy_from_slice(&contact.addr.port().to_be_bytes());
    out
}

/// Decode one 38-byte contact record. Any other length is rejected.
pub fn decode_contact(data: &[u8]) -> Result<Contact> {
    if data.len() != CONTACT_WIRE_LEN {
        return Err(ProtoError::BadContactLength(data.len()));
    }
    let mut node_id = [0u8; 32];
    node_id.copy_from_slice(&data[..32]);
    let ip = Ipv4Addr::new(data[32], data[33], data[34], data[35]);
    let port = u16::from_be_bytes([data[36], data[37]]);
    Ok(Contact::new(node_id, SocketAddrV4::new(ip, port)))
}

/// Concatenate contacts into a find-node reply body.
pub fn encode_contact_list(contacts: &[Contact]) -> Vec<u8> {
    let mut out = Vec::with_capacity(contacts.len() * CONTACT_WIRE_LEN);
    for contact in contacts {
        out.extend_from_slice(&encode_contact(contact));
    }
    out
}

/// Split a find-node reply body back into contacts. The body length must
/// be a whole number of 38-byte records.
pub fn decode_contact_list(body: &[u8]) -> Result<Vec<Contact>> {
    if body.len() % CONTACT_WIRE_LEN != 0 {
        return Err(ProtoError::BadContactLength(body.len()));
    }
    body.chunks_exact(CONTACT_WIRE_LEN)
        .map(decode_contact)
        .collect()
}
