//! Strict request/reply transport to the authoritative simulator.
//!
//! The protocol is synchronous: one outstanding request, reply required
//! before anything else is sent. [`Transport`] owns that discipline plus the
//! timeout policy; the byte shuttling underneath is abstracted behind the
//! [`Link`] trait so the same engine runs over an in-process channel pair
//! (tests, scenario harness) or a ZeroMQ REQ socket (live bridge).
//!
//! Timeout policy: every exchange family carries a multiplier, and the
//! effective receive timeout is `max(floor, base × multiplier)`. The floor
//! keeps slow authoritative startups from being misread as a dead peer.

use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use crate::config::TransportConfig;
use crate::error::BridgeError;
use crate::messages::{self, ExchangeKind, Reply, Request};

// ============================================================================
// LINK ABSTRACTION
// ============================================================================

/// Raw link failures, mapped onto [`BridgeError`] with exchange context by
/// [`Transport`].
#[derive(Debug, Error)]
pub enum LinkError {
    /// Nothing arrived within the allotted time.
    #[error("receive timed out")]
    Timeout,
    /// The peer end is gone.
    #[error("link closed")]
    Closed,
    /// Anything else the underlying socket reported.
    #[error("{0}")]
    Io(String),
}

/// One frame out, one frame in. Implementations carry no protocol knowledge.
pub trait Link: Send {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError>;
}

// ============================================================================
// IN-PROCESS LINK
// ============================================================================

/// Bidirectional in-process link over a pair of crossbeam channels.
///
/// Deterministic and dependency-free, so unit tests and the scenario harness
/// can exercise the full protocol without sockets.
pub struct MemoryLink {
    tx: crossbeam::channel::Sender<Vec<u8>>,
    rx: crossbeam::channel::Receiver<Vec<u8>>,
}

impl MemoryLink {
    /// Creates two connected ends; frames sent on one arrive on the other.
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let (a_tx, a_rx) = crossbeam::channel::unbounded();
        let (b_tx, b_rx) = crossbeam::channel::unbounded();
        (
            MemoryLink { tx: a_tx, rx: b_rx },
            MemoryLink { tx: b_tx, rx: a_rx },
        )
    }
}

impl Link for MemoryLink {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        self.tx.send(frame.to_vec()).map_err(|_| LinkError::Closed)
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        use crossbeam::channel::RecvTimeoutError;
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(LinkError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(LinkError::Closed),
        }
    }
}

// ============================================================================
// ZEROMQ LINK
// ============================================================================

/// ZeroMQ REQ link to a live authoritative simulator.
///
/// A timed-out REQ socket is left mid-state-machine and cannot send again;
/// that matches the bridge contract, where any transport failure is fatal and
/// the link is never reopened.
#[cfg(feature = "zeromq")]
pub struct ZmqLink {
    socket: zmq::Socket,
    // Keeps the IO threads alive for the lifetime of the socket.
    _context: zmq::Context,
}

#[cfg(feature = "zeromq")]
impl ZmqLink {
    /// Connects a REQ socket to the configured endpoint.
    pub fn connect(config: &TransportConfig) -> Result<Self, LinkError> {
        use tracing::debug;

        let context = zmq::Context::new();
        let socket = context
            .socket(zmq::REQ)
            .map_err(|e| LinkError::Io(e.to_string()))?;
        socket
            .set_sndtimeo(timeout_millis(config.timeout))
            .map_err(|e| LinkError::Io(e.to_string()))?;
        let endpoint = config.endpoint();
        socket
            .connect(&endpoint)
            .map_err(|e| LinkError::Io(e.to_string()))?;
        debug!(endpoint = %endpoint, "authoritative link connected");
        Ok(Self {
            socket,
            _context: context,
        })
    }
}

#[cfg(feature = "zeromq")]
impl Link for ZmqLink {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        match self.socket.send(frame, 0) {
            Ok(()) => Ok(()),
            Err(zmq::Error::EAGAIN) => Err(LinkError::Timeout),
            Err(e) => Err(LinkError::Io(e.to_string())),
        }
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        self.socket
            .set_rcvtimeo(timeout_millis(timeout))
            .map_err(|e| LinkError::Io(e.to_string()))?;
        match self.socket.recv_bytes(0) {
            Ok(frame) => Ok(frame),
            Err(zmq::Error::EAGAIN) => Err(LinkError::Timeout),
            Err(e) => Err(LinkError::Io(e.to_string())),
        }
    }
}

#[cfg(feature = "zeromq")]
fn timeout_millis(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Protocol-aware request/reply channel.
///
/// Exclusive `&mut self` access per exchange enforces the one-outstanding-call
/// discipline at the type level.
pub struct Transport {
    link: Box<dyn Link>,
    base_timeout: Duration,
    floor_timeout: Duration,
}

impl Transport {
    pub fn new(link: Box<dyn Link>, config: &TransportConfig) -> Self {
        Self {
            link,
            base_timeout: config.timeout,
            floor_timeout: config.floor_timeout,
        }
    }

    /// Connects over ZeroMQ and wraps the socket.
    #[cfg(feature = "zeromq")]
    pub fn connect(config: &TransportConfig) -> Result<Self, LinkError> {
        let link = ZmqLink::connect(config)?;
        Ok(Self::new(Box::new(link), config))
    }

    /// Receive timeout for an exchange: `max(floor, base × multiplier)`.
    ///
    /// Negative or non-finite multipliers clamp to the floor rather than
    /// panicking on a bad `Duration`.
    pub fn effective_timeout(&self, multiplier: f64) -> Duration {
        let scaled = Duration::try_from_secs_f64(self.base_timeout.as_secs_f64() * multiplier.max(0.0))
            .unwrap_or(Duration::MAX);
        scaled.max(self.floor_timeout)
    }

    /// Runs one full exchange: encode, send, await the reply within the
    /// effective timeout, decode, and check that the reply closes the same
    /// exchange family the request opened.
    pub fn exchange(&mut self, request: &Request, multiplier: f64) -> Result<Reply, BridgeError> {
        let exchange = request.kind();

        let frame = messages::encode_request(request).map_err(|e| BridgeError::ProtocolError {
            exchange,
            reason: format!("request encoding failed: {e}"),
        })?;
        trace!(%exchange, bytes = frame.len(), "request out");
        self.link
            .send(&frame)
            .map_err(|e| link_failure(exchange, e))?;

        let timeout = self.effective_timeout(multiplier);
        let reply_frame = self
            .link
            .recv_timeout(timeout)
            .map_err(|e| link_failure(exchange, e))?;
        trace!(%exchange, bytes = reply_frame.len(), "reply in");

        let reply = messages::decode_reply(&reply_frame).map_err(|e| BridgeError::ProtocolError {
            exchange,
            reason: format!("malformed reply: {e}"),
        })?;
        if reply.kind() != exchange {
            return Err(BridgeError::ProtocolError {
                exchange,
                reason: format!("reply closes the {} exchange instead", reply.kind()),
            });
        }
        Ok(reply)
    }
}

fn link_failure(exchange: ExchangeKind, err: LinkError) -> BridgeError {
    match err {
        LinkError::Timeout => BridgeError::TransportTimeout { exchange },
        other => BridgeError::TransportError {
            exchange,
            reason: other.to_string(),
        },
    }
}
