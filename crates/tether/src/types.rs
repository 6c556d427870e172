//! Canonical shapes of the control protocol.
//!
//! These are the types hosts program against. They are deliberately free of
//! serde derives: wire payloads live in [`crate::wire`], and only that
//! module's translation step may build the types below from engine data.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How far an execution advanced after one protocol call.
#[derive(Debug, Clone)]
pub enum Progress {
    /// Execution finished; the context is gone and the instance is idle.
    Complete(Outcome),
    /// Execution suspended awaiting a host-supplied value for `Call`.
    Pending(Call),
    /// Execution suspended awaiting batched resolution of the listed call ids.
    ResolveFutures(Vec<u32>),
}

/// A suspended host-call site inside the guest program.
#[derive(Debug, Clone)]
pub struct Call {
    pub function_name: String,
    /// Positional arguments, in call order.
    pub args: Vec<Value>,
    /// Keyword arguments; `None` when the call site passed none.
    pub kwargs: Option<Map<String, Value>>,
    /// Unique and monotonically increasing within one instance.
    pub call_id: u32,
    /// `true` for `obj.method()` syntax, `false` for `func()`.
    pub method_call: bool,
}

/// Final result of one execution.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Value of the program; null when the run failed.
    pub value: Value,
    /// Guest-program failure, if any. Never doubles as a host-level error.
    pub error: Option<ErrorDescriptor>,
    pub usage: ResourceUsage,
    /// Collected guest print output; `None` when nothing was printed.
    pub print_output: Option<String>,
}

impl Outcome {
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Structured description of a guest-program failure.
#[derive(Debug, Clone)]
pub struct ErrorDescriptor {
    pub message: String,
    /// Exception type name, e.g. `"ZeroDivisionError"`. Hosts branch on this
    /// rather than string-matching `message`.
    pub exc_type: String,
    /// Outermost frame first.
    pub traceback: Vec<Frame>,
    /// Mirrors of the last traceback frame.
    pub filename: Option<String>,
    pub line_number: Option<u32>,
    pub column_number: Option<u32>,
    pub source_snippet: Option<String>,
}

/// One traceback frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub filename: String,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
    pub frame_name: Option<String>,
    pub preview_line: Option<String>,
}

/// Resources consumed by an execution. Zero-filled where the transport
/// cannot measure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub time_elapsed_ms: u64,
    pub stack_depth: u32,
}

/// Advisory resource limits, applied before the first advancing call.
///
/// The engine enforces these and reports violations as an
/// [`ErrorDescriptor`] on completion; this layer cannot preempt a running
/// context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    pub memory_bytes: Option<u64>,
    pub timeout: Option<Duration>,
    pub stack_depth: Option<u32>,
    pub max_allocations: Option<u64>,
    pub gc_interval: Option<u32>,
}

impl Limits {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            memory_bytes: None,
            timeout: None,
            stack_depth: None,
            max_allocations: None,
            gc_interval: None,
        }
    }

    #[must_use]
    pub const fn memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn stack_depth(mut self, depth: u32) -> Self {
        self.stack_depth = Some(depth);
        self
    }

    #[must_use]
    pub const fn max_allocations(mut self, count: u64) -> Self {
        self.max_allocations = Some(count);
        self
    }

    #[must_use]
    pub const fn gc_interval(mut self, interval: u32) -> Self {
        self.gc_interval = Some(interval);
        self
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.memory_bytes.is_none()
            && self.timeout.is_none()
            && self.stack_depth.is_none()
            && self.max_allocations.is_none()
            && self.gc_interval.is_none()
    }
}

/// Options for [`Instance::run`](crate::Instance::run) and
/// [`Instance::start`](crate::Instance::start).
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Host-callable function names the guest may suspend on.
    pub external_functions: Vec<String>,
    pub limits: Limits,
    /// Filename used in tracebacks; the engine picks its own default when
    /// absent.
    pub script_name: Option<String>,
    /// Initial top-level bindings. Rejected fail-fast on transports that do
    /// not support them.
    pub inputs: Option<Map<String, Value>>,
}

impl ExecOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn external_functions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.external_functions = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = Some(inputs);
        self
    }
}

/// Host-visible lifecycle of an [`Instance`](crate::Instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Holds no engine context; `run`/`start` are valid.
    Idle,
    /// Holds exactly one paused context; the resume family and `snapshot`
    /// are valid.
    Active,
    /// Terminal; every operation is rejected.
    Disposed,
}
