use enr::NodeId;
use thiserror::Error;

/// Taxonomy of errors the core surfaces, per the wire/control-flow design.
/// Variant names, not external type identities, are what callers are meant
/// to match on.
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("malformed wire frame from {peer}: {reason}")]
    Malformed { peer: NodeId, reason: String },

    #[error("no protocol version in common with {peer}")]
    UnsupportedVersion { peer: NodeId },

    #[error("content-key mapping returned no content id")]
    NilContentKey,

    #[error("call to {peer} timed out")]
    Timeout { peer: NodeId },

    #[error("transport error talking to {peer}: {reason}")]
    Transport { peer: NodeId, reason: String },

    #[error("content not found locally")]
    ContentNotFound,

    #[error("stream framing broken: {0}")]
    LengthMismatch(String),

    #[error("lookup produced no result")]
    NotFound,

    #[error("peer {peer} not known to the routing table")]
    UnknownPeer { peer: NodeId },

    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),
}

pub type Result<T> = std::result::Result<T, OverlayError>;
