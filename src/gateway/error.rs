use thiserror::Error;

/// Failures surfaced by the gateway core.
///
/// Per-packet failures (`MalformedPacket`, `UnknownPortKind`, `UnresolvedNode`) are
/// logged and dropped by the dispatcher; the rest are returned to the caller of
/// the operation that raised them.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// A payload could not be parsed for its declared port kind.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Port kind this gateway does not handle (newer firmware, private apps).
    #[error("unknown port kind: {0}")]
    UnknownPortKind(String),

    /// An ack is already outstanding for this packet id.
    #[error("duplicate packet id 0x{0:08x}")]
    DuplicatePacketId(u32),

    /// No device link is attached.
    #[error("not connected to a device")]
    NotConnected,

    /// The device link failed to read or write.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A client send was rejected before touching any state.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A node reference could not be mapped to a node number.
    #[error("unresolved node reference: {0}")]
    UnresolvedNode(String),
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::TransportFailure(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
