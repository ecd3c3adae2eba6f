//! Fixed-leading-type-byte wire codec for the five request/response message
//! pairs, with versioned ACCEPT forms selected by the caller from the
//! negotiated peer version (see [`crate::versions`]).
//!
//! Container bodies are encoded with the real `ssz`/`ssz_derive` crates, the
//! same ones the Portal Network's `ethportal-api` message types use. The
//! outer sum type, the CONTENT kind union, and the two ACCEPT forms are
//! dispatched by hand: `ssz_derive` has no enum support, and the v0 bitlist
//! has no representation in this workspace's dependency stack (`ssz_types`
//! isn't pulled in, so the bitlist is hand-rolled below following the same
//! sentinel-bit convention the real type uses).

use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};
use thiserror::Error;

const TYPE_PING: u8 = 0x00;
const TYPE_PONG: u8 = 0x01;
const TYPE_FIND_NODES: u8 = 0x02;
const TYPE_NODES: u8 = 0x03;
const TYPE_FIND_CONTENT: u8 = 0x04;
const TYPE_CONTENT: u8 = 0x05;
const TYPE_OFFER: u8 = 0x06;
const TYPE_ACCEPT: u8 = 0x07;

const CONTENT_KIND_CONNECTION_ID: u8 = 0x00;
const CONTENT_KIND_RAW: u8 = 0x01;
const CONTENT_KIND_ENRS: u8 = 0x02;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated frame")]
    Truncated,
    #[error("ssz decode error: {0:?}")]
    Ssz(ssz::DecodeError),
    #[error("unknown message type byte {0:#04x}")]
    UnknownType(u8),
    #[error("unknown CONTENT kind byte {0:#04x}")]
    UnknownContentKind(u8),
    #[error("accept code {0} is out of range")]
    InvalidAcceptCode(u8),
}

pub type WireResult<T> = std::result::Result<T, WireError>;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PingMessage {
    pub enr_seq: u64,
    pub custom_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PongMessage {
    pub enr_seq: u64,
    pub custom_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FindNodesMessage {
    pub distances: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct NodesMessage {
    pub total: u8,
    pub enrs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FindContentMessage {
    pub content_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct OfferMessage {
    pub content_keys: Vec<Vec<u8>>,
}

/// The CONTENT reply's payload union. A peer either forwards closer ENRs, a
/// connection id to pull the value over a stream, or the raw value inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    ConnectionId(u16),
    Raw(Vec<u8>),
    Enrs(Vec<Vec<u8>>),
}

impl Content {
    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Content::ConnectionId(id) => {
                out.push(CONTENT_KIND_CONNECTION_ID);
                out.extend_from_slice(&id.as_ssz_bytes());
            }
            Content::Raw(bytes) => {
                out.push(CONTENT_KIND_RAW);
                out.extend_from_slice(&bytes.as_ssz_bytes());
            }
            Content::Enrs(enrs) => {
                out.push(CONTENT_KIND_ENRS);
                out.extend_from_slice(&enrs.as_ssz_bytes());
            }
        }
        out
    }

    fn decode_body(bytes: &[u8]) -> WireResult<Self> {
        let (&kind, body) = bytes.split_first().ok_or(WireError::Truncated)?;
        Ok(match kind {
            CONTENT_KIND_CONNECTION_ID => Content::ConnectionId(u16::from_ssz_bytes(body).map_err(WireError::Ssz)?),
            CONTENT_KIND_RAW => Content::Raw(Vec::<u8>::from_ssz_bytes(body).map_err(WireError::Ssz)?),
            CONTENT_KIND_ENRS => Content::Enrs(Vec::<Vec<u8>>::from_ssz_bytes(body).map_err(WireError::Ssz)?),
            other => return Err(WireError::UnknownContentKind(other)),
        })
    }
}

/// `AcceptCode`, the v1 per-key rejection reason. v0 can only express
/// accept/reject as a single bit; see [`decode_accept_v0`] for the resulting
/// lossy mapping back from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcceptCode {
    Accepted = 0,
    GenericDeclined = 1,
    AlreadyStored = 2,
    NotWithinRadius = 3,
    RateLimited = 4,
    InboundTransferInProgress = 5,
    Unspecified = 6,
}

impl TryFrom<u8> for AcceptCode {
    type Error = WireError;

    fn try_from(value: u8) -> WireResult<Self> {
        Ok(match value {
            0 => AcceptCode::Accepted,
            1 => AcceptCode::GenericDeclined,
            2 => AcceptCode::AlreadyStored,
            3 => AcceptCode::NotWithinRadius,
            4 => AcceptCode::RateLimited,
            5 => AcceptCode::InboundTransferInProgress,
            6 => AcceptCode::Unspecified,
            other => return Err(WireError::InvalidAcceptCode(other)),
        })
    }
}

/// Version-agnostic internal representation of ACCEPT. Callers work with
/// this regardless of which wire form was negotiated; [`encode_message`] and
/// [`decode_message`] pick the v0 bitlist or v1 code-list form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accept {
    pub connection_id: u16,
    pub codes: Vec<AcceptCode>,
}

/// SSZ bitlist encoding: `ceil((n+1)/8)` bytes, one bit per entry, plus a
/// sentinel bit marking the true length — the convention the real SSZ
/// `Bitlist[N]` type uses. Hand-rolled because `ssz_types` isn't part of
/// this workspace's dependency stack.
fn encode_bitlist(bits: &[bool]) -> Vec<u8> {
    let total_bits = bits.len() + 1;
    let mut out = vec![0u8; total_bits.div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out[bits.len() / 8] |= 1 << (bits.len() % 8);
    out
}

fn decode_bitlist(bytes: &[u8]) -> WireResult<Vec<bool>> {
    let total_bits = bytes.len() * 8;
    let sentinel = (0..total_bits)
        .rev()
        .find(|&i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .ok_or(WireError::Truncated)?;
    Ok((0..sentinel).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect())
}

fn encode_accept_v0(accept: &Accept) -> Vec<u8> {
    let bits: Vec<bool> = accept
        .codes
        .iter()
        .map(|c| matches!(c, AcceptCode::Accepted))
        .collect();
    let mut out = Vec::with_capacity(2 + bits.len().div_ceil(8) + 1);
    out.extend_from_slice(&accept.connection_id.to_le_bytes());
    out.extend_from_slice(&encode_bitlist(&bits));
    out
}

/// v0 has no way to distinguish *why* a key was rejected, so a cleared bit
/// is normalized to `GenericDeclined` rather than any of the more specific
/// v1 codes. This is the documented wire ambiguity, not a bug.
fn decode_accept_v0(bytes: &[u8]) -> WireResult<Accept> {
    if bytes.len() < 2 {
        return Err(WireError::Truncated);
    }
    let connection_id = u16::from_le_bytes([bytes[0], bytes[1]]);
    let bits = decode_bitlist(&bytes[2..])?;
    let codes = bits
        .into_iter()
        .map(|set| if set { AcceptCode::Accepted } else { AcceptCode::GenericDeclined })
        .collect();
    Ok(Accept { connection_id, codes })
}

fn encode_accept_v1(accept: &Accept) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + accept.codes.len() + 4);
    out.extend_from_slice(&accept.connection_id.to_le_bytes());
    let raw: Vec<u8> = accept.codes.iter().map(|c| *c as u8).collect();
    out.extend_from_slice(&raw.as_ssz_bytes());
    out
}

fn decode_accept_v1(bytes: &[u8]) -> WireResult<Accept> {
    if bytes.len() < 2 {
        return Err(WireError::Truncated);
    }
    let connection_id = u16::from_le_bytes([bytes[0], bytes[1]]);
    let raw = Vec::<u8>::from_ssz_bytes(&bytes[2..]).map_err(WireError::Ssz)?;
    let codes = raw
        .into_iter()
        .map(AcceptCode::try_from)
        .collect::<WireResult<Vec<_>>>()?;
    Ok(Accept { connection_id, codes })
}

/// The overlay protocol's request/response sum type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(PingMessage),
    Pong(PongMessage),
    FindNodes(FindNodesMessage),
    Nodes(NodesMessage),
    FindContent(FindContentMessage),
    Content(Content),
    Offer(OfferMessage),
    Accept(Accept),
}

/// Encodes `message` as `[type byte][ssz body]`, choosing the ACCEPT wire
/// form for `version` (0 or >=1).
pub fn encode_message(message: &Message, version: u8) -> Vec<u8> {
    let (ty, body) = match message {
        Message::Ping(m) => (TYPE_PING, m.as_ssz_bytes()),
        Message::Pong(m) => (TYPE_PONG, m.as_ssz_bytes()),
        Message::FindNodes(m) => (TYPE_FIND_NODES, m.as_ssz_bytes()),
        Message::Nodes(m) => (TYPE_NODES, m.as_ssz_bytes()),
        Message::FindContent(m) => (TYPE_FIND_CONTENT, m.as_ssz_bytes()),
        Message::Content(c) => (TYPE_CONTENT, c.encode_body()),
        Message::Offer(m) => (TYPE_OFFER, m.as_ssz_bytes()),
        Message::Accept(a) => (
            TYPE_ACCEPT,
            if version == 0 { encode_accept_v0(a) } else { encode_accept_v1(a) },
        ),
    };
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(ty);
    out.extend_from_slice(&body);
    out
}

/// Decodes a frame produced by [`encode_message`]. Unknown message types,
/// truncated frames, and out-of-range enumerators fail with [`WireError`];
/// none of them are counted against the sending peer here — that judgment
/// belongs to the dispatcher, which knows who sent the frame.
pub fn decode_message(bytes: &[u8], version: u8) -> WireResult<Message> {
    let (&ty, body) = bytes.split_first().ok_or(WireError::Truncated)?;
    Ok(match ty {
        TYPE_PING => Message::Ping(PingMessage::from_ssz_bytes(body).map_err(WireError::Ssz)?),
        TYPE_PONG => Message::Pong(PongMessage::from_ssz_bytes(body).map_err(WireError::Ssz)?),
        TYPE_FIND_NODES => Message::FindNodes(FindNodesMessage::from_ssz_bytes(body).map_err(WireError::Ssz)?),
        TYPE_NODES => Message::Nodes(NodesMessage::from_ssz_bytes(body).map_err(WireError::Ssz)?),
        TYPE_FIND_CONTENT => {
            Message::FindContent(FindContentMessage::from_ssz_bytes(body).map_err(WireError::Ssz)?)
        }
        TYPE_CONTENT => Message::Content(Content::decode_body(body)?),
        TYPE_OFFER => Message::Offer(OfferMessage::from_ssz_bytes(body).map_err(WireError::Ssz)?),
        TYPE_ACCEPT => Message::Accept(if version == 0 {
            decode_accept_v0(body)?
        } else {
            decode_accept_v1(body)?
        }),
        other => return Err(WireError::UnknownType(other)),
    })
}
