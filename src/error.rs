use thiserror::Error;

/// One variant per row of spec.md §7's error-kind table.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("transport I/O error: {0}")]
    TransportIo(#[from] std::io::Error),

    #[error("peer gone: {0}")]
    TransportPeerGone(String),

    #[error("framing error: {0}")]
    FramingError(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("TLS record error: {0}")]
    TlsRecordError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("backpressure drop on {queue} queue")]
    BackpressureDrop { queue: &'static str },

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// spec.md §7: fatal kinds drive a single transition to `Closing`; the
    /// rest are logged and swallowed in place.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::TransportUnavailable(_)
                | EngineError::TransportIo(_)
                | EngineError::TransportPeerGone(_)
                | EngineError::TlsHandshakeFailed(_)
                | EngineError::TlsRecordError(_)
        ) || matches!(self, EngineError::FramingError(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
