//! The uniform async contract both adapters plug into.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::engine::CreateSpec;
use crate::error::Result;
use crate::types::Limits;
use crate::wire::{WireOutcome, WireProgress};

/// Opaque identity for one live engine context issued by a transport.
///
/// A handle is freed exactly once; asking a transport to free it again is a
/// no-op, while any other operation on a freed handle fails fast with
/// [`Error::StaleHandle`](crate::Error::StaleHandle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) u64);

/// Base contract of an engine transport.
///
/// Capabilities beyond the base set are probed at runtime via
/// [`snapshots`](Transport::snapshots) and [`futures`](Transport::futures);
/// a `None` probe means the protocol layer fails fast with a distinct
/// unsupported-capability error instead of degrading silently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Spawn a context. Failures raise; no handle is produced.
    async fn create(&self, spec: CreateSpec) -> Result<HandleId>;

    /// Run the context to completion.
    async fn run(&self, handle: HandleId) -> Result<WireOutcome>;

    /// Begin iterative execution.
    async fn start(&self, handle: HandleId) -> Result<WireProgress>;

    async fn resume(&self, handle: HandleId, value: Value) -> Result<WireProgress>;

    async fn resume_with_error(&self, handle: HandleId, message: String) -> Result<WireProgress>;

    /// Apply advisory limits. Must happen before the first advancing call.
    async fn set_limits(&self, handle: HandleId, limits: &Limits) -> Result<()>;

    /// Release the context behind `handle`. Idempotent.
    async fn free(&self, handle: HandleId);

    /// Whether [`CreateSpec::inputs`] reach the engine.
    fn supports_input_bindings(&self) -> bool {
        false
    }

    fn snapshots(&self) -> Option<&dyn SnapshotTransport> {
        None
    }

    fn futures(&self) -> Option<&dyn FuturesTransport> {
        None
    }
}

/// Optional capability: binary snapshot/restore of a paused context.
///
/// Snapshot bytes are portable only within the producing transport family;
/// feeding them to another family is undefined by contract.
#[async_trait]
pub trait SnapshotTransport: Send + Sync {
    async fn snapshot(&self, handle: HandleId) -> Result<Bytes>;

    /// Rebuild a paused context; the returned handle behaves exactly like
    /// one obtained from `start` that yielded a pending call.
    async fn restore(&self, bytes: &[u8]) -> Result<HandleId>;
}

/// Optional capability: batched resolution of concurrently-pending calls.
#[async_trait]
pub trait FuturesTransport: Send + Sync {
    async fn resume_as_future(&self, handle: HandleId) -> Result<WireProgress>;

    async fn resolve_futures(
        &self,
        handle: HandleId,
        results: HashMap<u32, Value>,
        errors: HashMap<u32, String>,
    ) -> Result<WireProgress>;
}
