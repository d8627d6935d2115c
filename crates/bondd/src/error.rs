use crate::device::Address;

/// Errors surfaced by the transport seam and the pairing core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An optional property query was refused. Callers treat the field as absent.
    #[error("property {property} unavailable for {address}")]
    PropertyUnavailable { address: Address, property: String },

    /// The transport refused to bond. The device is kept.
    #[error("bonding with {0} failed")]
    BondFailure(Address),

    /// The device is no longer resolvable by the transport.
    #[error("device {0} not found")]
    NotFound(Address),

    /// The change-notification stream ended.
    #[error("transport change stream disconnected")]
    TransportDisconnected,

    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn transport(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Transport(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
