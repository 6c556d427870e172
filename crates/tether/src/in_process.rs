//! Sync engine adapter: a handle-based, blocking call set presented through
//! the uniform async contract.
//!
//! Every operation blocks its caller for the duration of the engine call;
//! suspension happens inside the engine, not here. Independent handles run
//! concurrently — only the handle table itself is shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;

use crate::engine::{CreateSpec, Engine};
use crate::error::{Error, Result};
use crate::transport::{FuturesTransport, HandleId, SnapshotTransport, Transport};
use crate::types::Limits;
use crate::wire::{WireOutcome, WireProgress};

type Slot<C> = Arc<Mutex<Option<C>>>;

pub struct InProcessTransport<E: Engine> {
    engine: E,
    contexts: Mutex<HashMap<u64, Slot<E::Context>>>,
    next_id: AtomicU64,
}

impl<E: Engine> InProcessTransport<E> {
    #[must_use]
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            contexts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn insert(&self, context: E::Context) -> HandleId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.contexts
            .lock()
            .insert(id, Arc::new(Mutex::new(Some(context))));
        HandleId(id)
    }

    fn slot(&self, handle: HandleId) -> Result<Slot<E::Context>> {
        self.contexts
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or(Error::StaleHandle(handle))
    }

    /// Run `op` against the live context behind `handle`, failing fast when
    /// the context was already freed.
    fn with_context<T>(
        &self,
        handle: HandleId,
        op: impl FnOnce(&E, &mut E::Context) -> Result<T, crate::BoxError>,
    ) -> Result<T> {
        let slot = self.slot(handle)?;
        let mut guard = slot.lock();
        let context = guard.as_mut().ok_or(Error::StaleHandle(handle))?;
        op(&self.engine, context).map_err(Error::Engine)
    }
}

#[async_trait]
impl<E: Engine> Transport for InProcessTransport<E> {
    async fn create(&self, spec: CreateSpec) -> Result<HandleId> {
        let context = self
            .engine
            .create(&spec)
            .map_err(|e| Error::Setup(e.to_string()))?;
        Ok(self.insert(context))
    }

    async fn run(&self, handle: HandleId) -> Result<WireOutcome> {
        self.with_context(handle, |engine, cx| engine.run(cx))
    }

    async fn start(&self, handle: HandleId) -> Result<WireProgress> {
        self.with_context(handle, |engine, cx| engine.start(cx))
    }

    async fn resume(&self, handle: HandleId, value: Value) -> Result<WireProgress> {
        self.with_context(handle, |engine, cx| engine.resume(cx, value))
    }

    async fn resume_with_error(&self, handle: HandleId, message: String) -> Result<WireProgress> {
        self.with_context(handle, |engine, cx| engine.resume_with_error(cx, &message))
    }

    async fn set_limits(&self, handle: HandleId, limits: &Limits) -> Result<()> {
        self.with_context(handle, |engine, cx| {
            if let Some(bytes) = limits.memory_bytes {
                engine.set_memory_limit(cx, bytes);
            }
            if let Some(timeout) = limits.timeout {
                engine.set_time_limit(cx, timeout);
            }
            if let Some(depth) = limits.stack_depth {
                engine.set_stack_limit(cx, depth);
            }
            Ok(())
        })
    }

    async fn free(&self, handle: HandleId) {
        let slot = self.contexts.lock().remove(&handle.0);
        if let Some(slot) = slot {
            // A caller still blocked inside an engine call keeps the slot
            // alive until it returns; the context is dropped afterwards.
            *slot.lock() = None;
        }
    }

    fn supports_input_bindings(&self) -> bool {
        self.engine.supports_input_bindings()
    }

    fn snapshots(&self) -> Option<&dyn SnapshotTransport> {
        Some(self)
    }

    fn futures(&self) -> Option<&dyn FuturesTransport> {
        Some(self)
    }
}

#[async_trait]
impl<E: Engine> SnapshotTransport for InProcessTransport<E> {
    async fn snapshot(&self, handle: HandleId) -> Result<Bytes> {
        let slot = self.slot(handle)?;
        let guard = slot.lock();
        let context = guard.as_ref().ok_or(Error::StaleHandle(handle))?;
        self.engine
            .snapshot(context)
            .map(Bytes::from)
            .map_err(Error::Engine)
    }

    async fn restore(&self, bytes: &[u8]) -> Result<HandleId> {
        let context = self
            .engine
            .restore(bytes)
            .map_err(|e| Error::Setup(e.to_string()))?;
        Ok(self.insert(context))
    }
}

#[async_trait]
impl<E: Engine> FuturesTransport for InProcessTransport<E> {
    async fn resume_as_future(&self, handle: HandleId) -> Result<WireProgress> {
        self.with_context(handle, |engine, cx| engine.resume_as_future(cx))
    }

    async fn resolve_futures(
        &self,
        handle: HandleId,
        results: std::collections::HashMap<u32, Value>,
        errors: std::collections::HashMap<u32, String>,
    ) -> Result<WireProgress> {
        self.with_context(handle, |engine, cx| {
            engine.resolve_futures(cx, &results, &errors)
        })
    }
}
