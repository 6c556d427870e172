//! Consumed interface of the external script engine.
//!
//! The engine is an opaque collaborator: this crate never interprets guest
//! code, it only drives the operation set below. An [`Err`] from any
//! operation means the engine could not produce a well-formed payload at
//! all; guest-program failures travel inside the returned wire payloads.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BoxError;
use crate::wire::{WireOutcome, WireProgress};

/// Everything a transport needs to spawn one execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSpec {
    pub code: String,
    /// Host-callable names the guest may suspend on.
    pub external_functions: Vec<String>,
    pub script_name: Option<String>,
    /// Initial top-level bindings, for engines that accept them.
    pub inputs: Option<Map<String, Value>>,
}

/// Blocking operation set of an in-process engine module.
///
/// Every call blocks its caller for the duration. `Context` is one live
/// execution; it is created by `create`/`restore` and owned by exactly one
/// transport slot until freed.
pub trait Engine: Send + Sync + 'static {
    type Context: Send + 'static;

    /// Compile `spec.code` into a fresh context. Raises on e.g. syntax
    /// errors; nothing is created on failure.
    fn create(&self, spec: &CreateSpec) -> Result<Self::Context, BoxError>;

    /// Run to completion without pausing at host calls.
    fn run(&self, cx: &mut Self::Context) -> Result<WireOutcome, BoxError>;

    /// Begin iterative execution, pausing at the first host call.
    fn start(&self, cx: &mut Self::Context) -> Result<WireProgress, BoxError>;

    /// Supply the paused host call's return value and continue.
    fn resume(&self, cx: &mut Self::Context, value: Value) -> Result<WireProgress, BoxError>;

    /// Raise an error at the paused host-call site and continue.
    fn resume_with_error(
        &self,
        cx: &mut Self::Context,
        message: &str,
    ) -> Result<WireProgress, BoxError>;

    /// Convert the paused host call into a deferred await point.
    fn resume_as_future(&self, cx: &mut Self::Context) -> Result<WireProgress, BoxError>;

    /// Resolve some or all deferred calls in one step.
    fn resolve_futures(
        &self,
        cx: &mut Self::Context,
        results: &HashMap<u32, Value>,
        errors: &HashMap<u32, String>,
    ) -> Result<WireProgress, BoxError>;

    /// Serialize the paused context. Bytes are only portable within the
    /// producing engine.
    fn snapshot(&self, cx: &Self::Context) -> Result<Vec<u8>, BoxError>;

    /// Rebuild a paused context from `snapshot` bytes.
    fn restore(&self, bytes: &[u8]) -> Result<Self::Context, BoxError>;

    fn set_memory_limit(&self, cx: &mut Self::Context, bytes: u64);
    fn set_time_limit(&self, cx: &mut Self::Context, limit: Duration);
    fn set_stack_limit(&self, cx: &mut Self::Context, depth: u32);

    /// Whether `create` honors [`CreateSpec::inputs`].
    fn supports_input_bindings(&self) -> bool {
        false
    }
}
