pub mod channel;
pub mod engine;
pub mod error;
pub mod in_process;
pub mod instance;
pub mod session;
pub mod transport;
pub mod types;
pub mod wire;

/// Tracing target for protocol-level spans and events.
pub const TRACE_TARGET: &str = "tether::protocol";

pub use channel::ChannelTransport;
pub use engine::{CreateSpec, Engine};
pub use error::{BoxError, Error, Result};
pub use in_process::InProcessTransport;
pub use instance::Instance;
pub use session::Session;
pub use transport::{FuturesTransport, HandleId, SnapshotTransport, Transport};
pub use types::{
    Call, ErrorDescriptor, ExecOptions, Frame, Lifecycle, Limits, Outcome, Progress, ResourceUsage,
};
