use thiserror::Error;

use crate::transport::HandleId;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Create/restore could not produce a live engine context.
    #[error("setup failed: {0}")]
    Setup(String),

    /// The engine failed without producing a well-formed result payload.
    ///
    /// Guest-program failures are never reported here; they travel as an
    /// [`ErrorDescriptor`](crate::ErrorDescriptor) inside a completed
    /// [`Outcome`](crate::Outcome).
    #[error("engine fault: {0}")]
    Engine(#[source] BoxError),

    /// Operation attempted outside its valid lifecycle state. Raised
    /// synchronously, before any transport round trip.
    #[error("{operation} is not valid while the instance is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Operation not offered by the active transport.
    #[error("unsupported by this transport: {operation}")]
    Unsupported { operation: &'static str },

    /// The message channel shut down while a round trip was outstanding.
    #[error("transport channel closed")]
    ChannelClosed,

    /// A transport was asked to operate on a handle with no live context.
    #[error("no live context for {0:?}")]
    StaleHandle(HandleId),

    /// Futures resolution supplied an id never observed on a pending call.
    #[error("unknown future call id: {0}")]
    UnknownCallId(u32),
}
