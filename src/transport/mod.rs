//! Wire adapters between a peer connection and a session.
//!
//! A session only sees [`TransportReceiver`] and [`TransportSender`]; the raw
//! socket and telephony bridge implementations are interchangeable behind them.

pub mod raw;
pub mod telephony;

use crate::protocol::{ControlMessage, OutboundMessage};
use async_trait::async_trait;
use thiserror::Error;

/// Session-fatal transport failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Bad or unexpected inbound frames. Logged and dropped, never fatal.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown message type: {0}")]
    UnknownMessage(String),

    #[error("Invalid audio payload: {0}")]
    InvalidAudio(String),

    #[error("Unexpected {0} frame")]
    UnexpectedFrame(&'static str),
}

/// What a session gets from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Audio(Vec<u8>),
    Control(ControlMessage),
}

#[async_trait]
pub trait TransportReceiver: Send {
    /// Suspend until the next frame. `Ok(None)` means the peer closed the
    /// connection. Malformed frames are skipped internally.
    async fn receive(&mut self) -> Result<Option<InboundFrame>, TransportError>;
}

#[async_trait]
pub trait TransportSender: Send + Sync {
    async fn send_audio(&self, audio: &[u8]) -> Result<(), TransportError>;

    async fn send_control(&self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Ask the peer to drop audio it has buffered but not yet played.
    async fn clear_audio(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A tungstenite error that only means the peer went away.
pub(crate) fn is_disconnect(error: &tokio_tungstenite::tungstenite::Error) -> bool {
    use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
    use tokio_tungstenite::tungstenite::Error;

    matches!(
        error,
        Error::ConnectionClosed
            | Error::AlreadyClosed
            | Error::Protocol(WsProtocolError::ResetWithoutClosingHandshake)
    )
}
