//! The discovery-layer transport collaborator: delivers authenticated,
//! size-limited request/response frames to an ENR-identified peer, and
//! opens the reliable streams used to move payloads larger than one frame.
//! Both are out of scope for this crate (§1) — only the trait boundary and
//! the inbound-frame shape live here.

use async_trait::async_trait;
use bytes::Bytes;
use enr::Enr;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(String),
    #[error("stream open failed: {0}")]
    Stream(String),
}

/// A bidirectional reliable stream, addressed by `connection-id` at the
/// OFFER/ACCEPT layer. Boxed because different transports back it with
/// different concrete types (QUIC stream, uTP socket, in-memory duplex...).
pub trait ReliableStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<S: AsyncRead + AsyncWrite + Send + Unpin> ReliableStream for S {}

pub type BoxedStream = Pin<Box<dyn ReliableStream>>;

/// External collaborator interface (§6): the core never opens a socket
/// itself, it only calls through this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request frame, tagged with a dispatcher-assigned
    /// `request_id` the transport is expected to echo back on the matching
    /// reply (e.g. as a discv5 TALKREQ/TALKRESP request id).
    async fn send_request(&self, peer: &Enr, request_id: u64, bytes: Bytes) -> Result<(), TransportError>;

    /// Sends a reply frame correlated to an inbound `request_id`.
    async fn send_response(&self, peer: &Enr, request_id: u64, bytes: Bytes) -> Result<(), TransportError>;

    /// Opens a stream to `peer` addressed by a connection id previously
    /// handed out in an ACCEPT.
    async fn open_stream(&self, peer: &Enr, connection_id: u16) -> Result<BoxedStream, TransportError>;

    /// Accepts an inbound stream for a connection id this node reserved
    /// when it sent an ACCEPT.
    async fn accept_stream(&self, connection_id: u16) -> Result<BoxedStream, TransportError>;
}

/// One frame off the transport's lazy, infinite `recv()` sequence. Producing
/// this stream is the transport's job; the dispatcher only consumes it
/// (see [`crate::dispatcher::Dispatcher::run`]).
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub peer: Enr,
    pub request_id: u64,
    pub is_response: bool,
    pub bytes: Bytes,
}
