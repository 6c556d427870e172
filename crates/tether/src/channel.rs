//! Async engine adapter: a single-tenant remote execution context driven
//! over a pair of serializable message streams.
//!
//! Nothing crosses the channel except the plain-data [`Envelope`]/[`Reply`]
//! messages, so the two sides share no memory. The remote side retains at
//! most one paused context; the adapter models it as a single-slot liveness
//! token rather than a real handle, but the token obeys the same
//! exactly-once, fail-fast-if-absent discipline as the in-process table.
//!
//! The remote reports no resource usage; the adapter synthesizes wall-clock
//! timing locally and reports zero for memory and stack. Futures batching is
//! deliberately not offered — the capability probe returns `None` so callers
//! fail fast instead of getting a degraded emulation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::engine::{CreateSpec, Engine};
use crate::error::{Error, Result};
use crate::transport::{HandleId, SnapshotTransport, Transport};
use crate::types::Limits;
use crate::wire::{WireOutcome, WireProgress, WireUsage};

/// One request on the wire, correlated with its [`Reply`] by `seq`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub request: Request,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Reply {
    pub seq: u64,
    pub response: Response,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    Create(CreateSpec),
    Run,
    Start,
    Resume { value: Value },
    ResumeWithError { message: String },
    SetLimits { limits: Limits },
    Snapshot,
    Restore { snapshot: Vec<u8> },
    Free,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Created,
    Outcome(WireOutcome),
    Progress(WireProgress),
    Snapshot(Vec<u8>),
    Unit,
    Failed { message: String },
}

/// Replies not yet claimed by a round trip. `None` once the channel closed;
/// dropping the senders fails every outstanding completer.
type PendingReplies = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Response>>>>>;

#[derive(Default)]
struct Slot {
    /// Generation of the single live remote context.
    live: Option<u64>,
    next_generation: u64,
    /// Wall-clock time accumulated across advancing round trips.
    elapsed: Duration,
}

pub struct ChannelTransport {
    tx: mpsc::Sender<Envelope>,
    pending: PendingReplies,
    next_seq: AtomicU64,
    slot: Mutex<Slot>,
    reader: tokio::task::JoinHandle<()>,
}

impl ChannelTransport {
    /// Wire the adapter to an already-running remote side.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Envelope>, mut rx: mpsc::Receiver<Reply>) -> Self {
        let pending: PendingReplies = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(reply) = rx.recv().await {
                let sender = reader_pending
                    .lock()
                    .as_mut()
                    .and_then(|map| map.remove(&reply.seq));
                if let Some(sender) = sender {
                    let _ = sender.send(reply.response);
                } else {
                    debug!(target: crate::TRACE_TARGET, seq = reply.seq, "discarding late reply");
                }
            }
            // Remote hung up: fail every outstanding completer.
            reader_pending.lock().take();
        });

        Self {
            tx,
            pending,
            next_seq: AtomicU64::new(0),
            slot: Mutex::new(Slot::default()),
            reader,
        }
    }

    /// Spawn a [`serve`] loop for `engine` on the current runtime and wire a
    /// transport to it.
    #[must_use]
    pub fn spawn<E: Engine>(engine: E) -> Self {
        let (request_tx, request_rx) = mpsc::channel(16);
        let (reply_tx, reply_rx) = mpsc::channel(16);
        tokio::spawn(serve(engine, request_rx, reply_tx));
        Self::new(request_tx, reply_rx)
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            let Some(map) = pending.as_mut() else {
                return Err(Error::ChannelClosed);
            };
            map.insert(seq, reply_tx);
        }

        if self.tx.send(Envelope { seq, request }).await.is_err() {
            if let Some(map) = self.pending.lock().as_mut() {
                map.remove(&seq);
            }
            return Err(Error::ChannelClosed);
        }

        reply_rx.await.map_err(|_| Error::ChannelClosed)
    }

    fn check(&self, handle: HandleId) -> Result<()> {
        if self.slot.lock().live == Some(handle.0) {
            Ok(())
        } else {
            Err(Error::StaleHandle(handle))
        }
    }

    fn claim_slot(&self) -> Result<()> {
        if self.slot.lock().live.is_some() {
            return Err(Error::Setup(
                "remote context already live; the channel adapter is single-tenant".into(),
            ));
        }
        Ok(())
    }

    fn occupy_slot(&self) -> HandleId {
        let mut slot = self.slot.lock();
        let generation = slot.next_generation;
        slot.next_generation += 1;
        slot.live = Some(generation);
        slot.elapsed = Duration::ZERO;
        HandleId(generation)
    }

    /// One advancing round trip, timed for synthesized usage.
    async fn advancing(&self, handle: HandleId, request: Request) -> Result<WireProgress> {
        self.check(handle)?;
        let started = Instant::now();
        let response = self.call(request).await?;
        let elapsed = {
            let mut slot = self.slot.lock();
            slot.elapsed += started.elapsed();
            slot.elapsed
        };
        match response {
            Response::Progress(mut progress) => {
                if let WireProgress::Complete(outcome) = &mut progress {
                    outcome.usage = Some(synthesize_usage(elapsed));
                }
                Ok(progress)
            }
            Response::Failed { message } => Err(Error::Engine(message.into())),
            other => Err(unexpected(&other)),
        }
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.pending.lock().take();
    }
}

const fn synthesize_usage(elapsed: Duration) -> WireUsage {
    WireUsage {
        memory_bytes_used: 0,
        time_elapsed_ms: elapsed.as_millis() as u64,
        stack_depth_used: 0,
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Engine(format!("unexpected response from remote: {response:?}").into())
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn create(&self, spec: CreateSpec) -> Result<HandleId> {
        self.claim_slot()?;
        match self.call(Request::Create(spec)).await? {
            Response::Created => Ok(self.occupy_slot()),
            Response::Failed { message } => Err(Error::Setup(message)),
            other => Err(unexpected(&other)),
        }
    }

    async fn run(&self, handle: HandleId) -> Result<WireOutcome> {
        self.check(handle)?;
        let started = Instant::now();
        let response = self.call(Request::Run).await?;
        let elapsed = {
            let mut slot = self.slot.lock();
            slot.elapsed += started.elapsed();
            slot.elapsed
        };
        match response {
            Response::Outcome(mut outcome) => {
                outcome.usage = Some(synthesize_usage(elapsed));
                Ok(outcome)
            }
            Response::Failed { message } => Err(Error::Engine(message.into())),
            other => Err(unexpected(&other)),
        }
    }

    async fn start(&self, handle: HandleId) -> Result<WireProgress> {
        self.advancing(handle, Request::Start).await
    }

    async fn resume(&self, handle: HandleId, value: Value) -> Result<WireProgress> {
        self.advancing(handle, Request::Resume { value }).await
    }

    async fn resume_with_error(&self, handle: HandleId, message: String) -> Result<WireProgress> {
        self.advancing(handle, Request::ResumeWithError { message })
            .await
    }

    async fn set_limits(&self, handle: HandleId, limits: &Limits) -> Result<()> {
        self.check(handle)?;
        match self
            .call(Request::SetLimits {
                limits: limits.clone(),
            })
            .await?
        {
            Response::Unit => Ok(()),
            Response::Failed { message } => Err(Error::Engine(message.into())),
            other => Err(unexpected(&other)),
        }
    }

    async fn free(&self, handle: HandleId) {
        {
            let mut slot = self.slot.lock();
            if slot.live != Some(handle.0) {
                return;
            }
            slot.live = None;
        }
        // Best effort: the remote free is idempotent, and a closed channel
        // means the context is gone anyway.
        let _ = self.call(Request::Free).await;
    }

    fn snapshots(&self) -> Option<&dyn SnapshotTransport> {
        Some(self)
    }
}

#[async_trait]
impl SnapshotTransport for ChannelTransport {
    async fn snapshot(&self, handle: HandleId) -> Result<Bytes> {
        self.check(handle)?;
        match self.call(Request::Snapshot).await? {
            Response::Snapshot(bytes) => Ok(Bytes::from(bytes)),
            Response::Failed { message } => Err(Error::Engine(message.into())),
            other => Err(unexpected(&other)),
        }
    }

    async fn restore(&self, bytes: &[u8]) -> Result<HandleId> {
        self.claim_slot()?;
        match self
            .call(Request::Restore {
                snapshot: bytes.to_vec(),
            })
            .await?
        {
            Response::Created => Ok(self.occupy_slot()),
            Response::Failed { message } => Err(Error::Setup(message)),
            other => Err(unexpected(&other)),
        }
    }
}

/// Drive an [`Engine`] as the remote side of the message protocol.
///
/// The remote retains at most one live context; `Create`/`Restore` while one
/// is live are refused rather than queued. Engine calls block this task for
/// their duration.
pub async fn serve<E: Engine>(
    engine: E,
    mut rx: mpsc::Receiver<Envelope>,
    tx: mpsc::Sender<Reply>,
) {
    let mut context: Option<E::Context> = None;
    while let Some(Envelope { seq, request }) = rx.recv().await {
        let response = handle_request(&engine, &mut context, request);
        if tx.send(Reply { seq, response }).await.is_err() {
            break;
        }
    }
}

fn handle_request<E: Engine>(
    engine: &E,
    context: &mut Option<E::Context>,
    request: Request,
) -> Response {
    match request {
        Request::Create(spec) => {
            if context.is_some() {
                return Response::Failed {
                    message: "remote context already live".into(),
                };
            }
            match engine.create(&spec) {
                Ok(created) => {
                    *context = Some(created);
                    Response::Created
                }
                Err(e) => Response::Failed {
                    message: e.to_string(),
                },
            }
        }
        Request::Restore { snapshot } => {
            if context.is_some() {
                return Response::Failed {
                    message: "remote context already live".into(),
                };
            }
            match engine.restore(&snapshot) {
                Ok(restored) => {
                    *context = Some(restored);
                    Response::Created
                }
                Err(e) => Response::Failed {
                    message: e.to_string(),
                },
            }
        }
        Request::Run => with_context(context, |cx| engine.run(cx).map(Response::Outcome)),
        Request::Start => with_context(context, |cx| engine.start(cx).map(Response::Progress)),
        Request::Resume { value } => with_context(context, |cx| {
            engine.resume(cx, value).map(Response::Progress)
        }),
        Request::ResumeWithError { message } => with_context(context, |cx| {
            engine.resume_with_error(cx, &message).map(Response::Progress)
        }),
        Request::SetLimits { limits } => with_context(context, |cx| {
            if let Some(bytes) = limits.memory_bytes {
                engine.set_memory_limit(cx, bytes);
            }
            if let Some(timeout) = limits.timeout {
                engine.set_time_limit(cx, timeout);
            }
            if let Some(depth) = limits.stack_depth {
                engine.set_stack_limit(cx, depth);
            }
            Ok(Response::Unit)
        }),
        Request::Snapshot => {
            with_context(context, |cx| engine.snapshot(cx).map(Response::Snapshot))
        }
        Request::Free => {
            *context = None;
            Response::Unit
        }
    }
}

fn with_context<C>(
    context: &mut Option<C>,
    op: impl FnOnce(&mut C) -> Result<Response, crate::BoxError>,
) -> Response {
    match context.as_mut() {
        Some(cx) => op(cx).unwrap_or_else(|e| Response::Failed {
            message: e.to_string(),
        }),
        None => Response::Failed {
            message: "no live context".into(),
        },
    }
}
