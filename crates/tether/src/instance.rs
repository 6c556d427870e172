//! Core control protocol: the lifecycle state machine both adapters plug
//! into.
//!
//! An [`Instance`] owns at most one engine handle. Lifecycle guards fire
//! synchronously, before any transport round trip, and every terminal
//! transition releases the handle exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{Instrument, info_span};

use crate::engine::CreateSpec;
use crate::error::{Error, Result};
use crate::transport::{HandleId, Transport};
use crate::types::{Call, ExecOptions, Lifecycle, Outcome, Progress};
use crate::wire::{self, WireProgress};

enum State {
    Idle,
    Active(Active),
    Disposed,
}

struct Active {
    handle: HandleId,
    awaiting: Awaiting,
}

enum Awaiting {
    /// Paused at a host call. Metadata is unknown right after a restore.
    HostCall(Option<Call>),
    /// Paused awaiting batched resolution of the listed call ids.
    Futures(Vec<u32>),
}

pub struct Instance {
    transport: Arc<dyn Transport>,
    state: State,
}

impl Instance {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: State::Idle,
        }
    }

    #[must_use]
    pub const fn lifecycle(&self) -> Lifecycle {
        match self.state {
            State::Idle => Lifecycle::Idle,
            State::Active(_) => Lifecycle::Active,
            State::Disposed => Lifecycle::Disposed,
        }
    }

    /// Call metadata of the current pause point, when known.
    #[must_use]
    pub fn pending_call(&self) -> Option<&Call> {
        match &self.state {
            State::Active(Active {
                awaiting: Awaiting::HostCall(call),
                ..
            }) => call.as_ref(),
            _ => None,
        }
    }

    /// Ids awaiting batched resolution, when the instance is paused there.
    #[must_use]
    pub fn pending_future_ids(&self) -> Option<&[u32]> {
        match &self.state {
            State::Active(Active {
                awaiting: Awaiting::Futures(ids),
                ..
            }) => Some(ids),
            _ => None,
        }
    }

    /// Run `code` to completion. Guest failures are encoded in the returned
    /// [`Outcome`], never raised.
    ///
    /// # Errors
    /// Returns an error when the instance is not idle, setup fails, or the
    /// engine cannot produce a well-formed result.
    pub async fn run(&mut self, code: impl Into<String>, options: &ExecOptions) -> Result<Outcome> {
        self.guard_idle("run")?;
        let span = info_span!(target: crate::TRACE_TARGET, "instance.run");
        async {
            let handle = self.spawn_context(code.into(), options).await?;
            let result = self.transport.run(handle).await;
            self.transport.free(handle).await;
            result.map(wire::decode_outcome)
        }
        .instrument(span)
        .await
    }

    /// Begin iterative execution, pausing at host calls.
    ///
    /// # Errors
    /// Returns an error when the instance is not idle, setup fails, or the
    /// engine cannot produce a well-formed result.
    pub async fn start(
        &mut self,
        code: impl Into<String>,
        options: &ExecOptions,
    ) -> Result<Progress> {
        self.guard_idle("start")?;
        let span = info_span!(target: crate::TRACE_TARGET, "instance.start");
        async {
            let handle = self.spawn_context(code.into(), options).await?;
            let progress = self.transport.start(handle).await;
            self.absorb(handle, progress).await
        }
        .instrument(span)
        .await
    }

    /// Supply the pending host call's return value.
    ///
    /// # Errors
    /// Returns an error when the instance is not paused at a host call or
    /// the engine cannot produce a well-formed result.
    pub async fn resume(&mut self, value: Value) -> Result<Progress> {
        let handle = self.guard_host_call("resume")?;
        let span = info_span!(target: crate::TRACE_TARGET, "instance.resume");
        async {
            let progress = self.transport.resume(handle, value).await;
            self.absorb(handle, progress).await
        }
        .instrument(span)
        .await
    }

    /// Raise an error at the pending host-call site instead of returning a
    /// value. The guest may catch it.
    ///
    /// # Errors
    /// Returns an error when the instance is not paused at a host call or
    /// the engine cannot produce a well-formed result.
    pub async fn resume_with_error(&mut self, message: impl Into<String>) -> Result<Progress> {
        let handle = self.guard_host_call("resume_with_error")?;
        let span = info_span!(target: crate::TRACE_TARGET, "instance.resume_with_error");
        async {
            let progress = self.transport.resume_with_error(handle, message.into()).await;
            self.absorb(handle, progress).await
        }
        .instrument(span)
        .await
    }

    /// Convert the pending host call into a deferred await point.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] when the transport has no futures
    /// capability, a state error when not paused at a host call, or an
    /// engine fault.
    pub async fn resume_as_future(&mut self) -> Result<Progress> {
        if self.transport.futures().is_none() {
            return Err(Error::Unsupported {
                operation: "resume_as_future",
            });
        }
        let handle = self.guard_host_call("resume_as_future")?;
        let span = info_span!(target: crate::TRACE_TARGET, "instance.resume_as_future");
        async {
            let progress = {
                let transport = Arc::clone(&self.transport);
                let futures = transport.futures().expect("capability probed above");
                futures.resume_as_future(handle).await
            };
            self.absorb(handle, progress).await
        }
        .instrument(span)
        .await
    }

    /// Resolve some or all deferred calls in one round trip. Successes and
    /// injected errors may be mixed; ids never observed on a pending call
    /// are a caller error.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] when the transport has no futures
    /// capability, a state error when not awaiting futures resolution,
    /// [`Error::UnknownCallId`] for an unobserved id, or an engine fault.
    pub async fn resolve_futures(
        &mut self,
        results: HashMap<u32, Value>,
        errors: HashMap<u32, String>,
    ) -> Result<Progress> {
        if self.transport.futures().is_none() {
            return Err(Error::Unsupported {
                operation: "resolve_futures",
            });
        }
        let handle = match &self.state {
            State::Active(Active {
                handle,
                awaiting: Awaiting::Futures(pending),
            }) => {
                if let Some(id) = results
                    .keys()
                    .chain(errors.keys())
                    .copied()
                    .find(|id| !pending.contains(id))
                {
                    return Err(Error::UnknownCallId(id));
                }
                *handle
            }
            State::Active(_) => {
                return Err(Error::InvalidState {
                    operation: "resolve_futures",
                    state: "awaiting a host call",
                });
            }
            State::Idle => {
                return Err(Error::InvalidState {
                    operation: "resolve_futures",
                    state: "idle",
                });
            }
            State::Disposed => {
                return Err(Error::InvalidState {
                    operation: "resolve_futures",
                    state: "disposed",
                });
            }
        };
        let span = info_span!(target: crate::TRACE_TARGET, "instance.resolve_futures");
        async {
            let progress = {
                let transport = Arc::clone(&self.transport);
                let futures = transport.futures().expect("capability probed above");
                futures.resolve_futures(handle, results, errors).await
            };
            self.absorb(handle, progress).await
        }
        .instrument(span)
        .await
    }

    /// Serialize the paused execution to opaque bytes. Portable only within
    /// the producing transport family.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] when the transport cannot snapshot, a
    /// state error when the instance is not active, or an engine fault.
    pub async fn snapshot(&self) -> Result<Bytes> {
        let Some(snapshots) = self.transport.snapshots() else {
            return Err(Error::Unsupported {
                operation: "snapshot",
            });
        };
        let handle = match &self.state {
            State::Active(active) => active.handle,
            State::Idle => {
                return Err(Error::InvalidState {
                    operation: "snapshot",
                    state: "idle",
                });
            }
            State::Disposed => {
                return Err(Error::InvalidState {
                    operation: "snapshot",
                    state: "disposed",
                });
            }
        };
        snapshots.snapshot(handle).await
    }

    /// Rebuild an instance from snapshot bytes. The result is already
    /// active — indistinguishable from one that just yielded a pending
    /// call — so it accepts the resume family and rejects `run`/`start`.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] when the transport cannot restore, or
    /// [`Error::Setup`] when the bytes do not decode to a context.
    pub async fn restore(transport: Arc<dyn Transport>, bytes: &[u8]) -> Result<Self> {
        let handle = {
            let Some(snapshots) = transport.snapshots() else {
                return Err(Error::Unsupported {
                    operation: "restore",
                });
            };
            snapshots.restore(bytes).await?
        };
        Ok(Self {
            transport,
            state: State::Active(Active {
                handle,
                awaiting: Awaiting::HostCall(None),
            }),
        })
    }

    /// Abandon the instance. Frees the engine context when one is live;
    /// terminal and idempotent.
    pub async fn dispose(&mut self) {
        if let State::Active(active) = &self.state {
            let handle = active.handle;
            let span = info_span!(target: crate::TRACE_TARGET, "instance.dispose");
            self.transport.free(handle).instrument(span).await;
        }
        self.state = State::Disposed;
    }

    /// Reject input bindings the transport cannot honor, spawn a context,
    /// and apply limits before the first advancing call.
    async fn spawn_context(&self, code: String, options: &ExecOptions) -> Result<HandleId> {
        if options.inputs.is_some() && !self.transport.supports_input_bindings() {
            return Err(Error::Unsupported {
                operation: "input bindings",
            });
        }
        let spec = CreateSpec {
            code,
            external_functions: options.external_functions.clone(),
            script_name: options.script_name.clone(),
            inputs: options.inputs.clone(),
        };
        let handle = self.transport.create(spec).await?;
        if !options.limits.is_empty() {
            if let Err(e) = self.transport.set_limits(handle, &options.limits).await {
                self.transport.free(handle).await;
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Fold a transport reply into the state machine, releasing the handle
    /// on terminal progress or on a fault.
    async fn absorb(
        &mut self,
        handle: HandleId,
        progress: Result<WireProgress>,
    ) -> Result<Progress> {
        match progress {
            Ok(payload) => {
                let progress = wire::decode_progress(payload);
                match &progress {
                    Progress::Complete(_) => {
                        self.transport.free(handle).await;
                        self.state = State::Idle;
                    }
                    Progress::Pending(call) => {
                        self.state = State::Active(Active {
                            handle,
                            awaiting: Awaiting::HostCall(Some(call.clone())),
                        });
                    }
                    Progress::ResolveFutures(ids) => {
                        self.state = State::Active(Active {
                            handle,
                            awaiting: Awaiting::Futures(ids.clone()),
                        });
                    }
                }
                Ok(progress)
            }
            Err(e) => {
                // No well-formed payload; the context cannot be trusted to
                // resume.
                self.transport.free(handle).await;
                self.state = State::Idle;
                Err(e)
            }
        }
    }

    fn guard_idle(&self, operation: &'static str) -> Result<()> {
        match &self.state {
            State::Idle => Ok(()),
            State::Active(_) => Err(Error::InvalidState {
                operation,
                state: "active",
            }),
            State::Disposed => Err(Error::InvalidState {
                operation,
                state: "disposed",
            }),
        }
    }

    fn guard_host_call(&self, operation: &'static str) -> Result<HandleId> {
        match &self.state {
            State::Active(Active {
                handle,
                awaiting: Awaiting::HostCall(_),
            }) => Ok(*handle),
            State::Active(_) => Err(Error::InvalidState {
                operation,
                state: "awaiting futures resolution",
            }),
            State::Idle => Err(Error::InvalidState {
                operation,
                state: "idle",
            }),
            State::Disposed => Err(Error::InvalidState {
                operation,
                state: "disposed",
            }),
        }
    }
}
