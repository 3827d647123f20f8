use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub mod pair;

pub use pair::{listener, pair, PairConnector, PairListener, TransportPair};

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport setup failed: {0}")]
    Setup(String),
}

/// One duplex, message-oriented channel to a single remote peer.
///
/// Implementations must deliver frames in the order sent and never
/// duplicate them; a medium that cannot guarantee this has to buffer and
/// sequence below this trait. Frames queue from the moment the transport
/// exists, so a runtime that attaches its receive pump after construction
/// loses nothing.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue one text frame to the peer.
    async fn send(&self, frame: String) -> TransportResult<()>;

    /// Receive the next frame, or `ChannelClosed` once the link is gone.
    async fn recv(&self) -> TransportResult<String>;

    fn is_open(&self) -> bool;

    /// Close both directions. Idempotent.
    fn close(&self);
}

/// Host-side listener: yields one [`Transport`] per inbound connection.
#[async_trait]
pub trait TransportAcceptor: Send + Sync {
    /// Wait for the next inbound connection, or `ChannelClosed` once the
    /// listener is shut down.
    async fn accept(&self) -> TransportResult<Arc<dyn Transport>>;

    /// Stop accepting. Idempotent; already-accepted transports are
    /// unaffected.
    fn close(&self);
}
