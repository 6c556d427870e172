//! A simulated script engine for exercising the control protocol without a
//! real interpreter deployment.
//!
//! [`SimEngine`] implements the full blocking operation set: iterative
//! execution pausing at external calls, futures placeholders, serde-backed
//! snapshots, print capture, and engine-enforced time/memory limits that
//! surface as error descriptors. It exists for tests and local experiments;
//! nothing in the protocol crate depends on it.

mod interp;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether::wire::{WireCall, WireError, WireFrame, WireOutcome, WireProgress, WireUsage};
use tether::{BoxError, CreateSpec, Engine};

use interp::{Eval, FutureState, Interrupt, ResumeSlot, SimValue, Stmt, StmtKind, parse_program};

const DEFAULT_SCRIPT_NAME: &str = "<input>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Phase {
    Ready,
    Paused,
    Blocked,
    Done,
}

/// One live simulated execution.
#[derive(Debug, Serialize, Deserialize)]
pub struct SimContext {
    script_name: String,
    external_functions: Vec<String>,
    stmts: Vec<Stmt>,
    phase: Phase,
    pc: usize,
    namespace: BTreeMap<String, SimValue>,
    /// Answers for external calls the current statement already made, in
    /// encounter order; the statement replays against them on resume.
    resolved: Vec<ResumeSlot>,
    futures: BTreeMap<u32, FutureState>,
    next_call_id: u32,
    last_call_id: u32,
    result: Value,
    print_output: String,
    elapsed_ms: u64,
    memory_limit: Option<u64>,
    time_limit: Option<Duration>,
    stack_limit: Option<u32>,
}

impl SimContext {
    fn compile(spec: &CreateSpec) -> Result<Self, String> {
        let stmts = parse_program(&spec.code)?;
        let mut namespace = BTreeMap::new();
        if let Some(inputs) = &spec.inputs {
            for (name, value) in inputs {
                namespace.insert(name.clone(), SimValue::Data(value.clone()));
            }
        }
        Ok(Self {
            script_name: spec
                .script_name
                .clone()
                .unwrap_or_else(|| DEFAULT_SCRIPT_NAME.to_owned()),
            external_functions: spec.external_functions.clone(),
            stmts,
            phase: Phase::Ready,
            pc: 0,
            namespace,
            resolved: Vec::new(),
            futures: BTreeMap::new(),
            next_call_id: 0,
            last_call_id: 0,
            result: Value::Null,
            print_output: String::new(),
            elapsed_ms: 0,
            memory_limit: None,
            time_limit: None,
            stack_limit: None,
        })
    }

    /// Execute statements until completion, suspension, or failure.
    fn step(&mut self, allow_suspend: bool) -> WireProgress {
        let started = Instant::now();
        loop {
            if let Some(limit) = self.time_limit {
                if Duration::from_millis(self.elapsed_ms) + started.elapsed() > limit {
                    return self.fail(
                        started,
                        "TimeoutError",
                        format!("execution exceeded {}ms time limit", limit.as_millis()),
                    );
                }
            }
            if let Some(limit) = self.memory_limit {
                if self.approximate_memory() > limit {
                    return self.fail(started, "MemoryError", "memory limit exceeded".into());
                }
            }
            if self.pc >= self.stmts.len() {
                self.phase = Phase::Done;
                self.settle(started);
                return WireProgress::Complete(self.outcome(None));
            }

            let stmt = self.stmts[self.pc].clone();
            let mut prints = String::new();
            let mut eval = Eval {
                namespace: &self.namespace,
                external: &self.external_functions,
                resolved: &self.resolved,
                futures: &self.futures,
                prints: &mut prints,
                consumed: 0,
            };
            let step = match &stmt.kind {
                StmtKind::Assign { name, expr } => {
                    eval.expr(expr).map(|value| (Some(name.clone()), value))
                }
                StmtKind::Expr(expr) => {
                    let value = eval.expr(expr).and_then(|v| eval.materialize(v));
                    value.map(|v| (None, SimValue::Data(v)))
                }
            };

            match step {
                Ok((target, value)) => {
                    self.print_output.push_str(&prints);
                    match target {
                        Some(name) => {
                            self.namespace.insert(name, value);
                            self.result = Value::Null;
                        }
                        None => {
                            if let SimValue::Data(data) = value {
                                self.result = data;
                            }
                        }
                    }
                    self.pc += 1;
                    self.resolved.clear();
                }
                Err(Interrupt::Suspend {
                    name,
                    args,
                    kwargs,
                    method_call,
                }) => {
                    if !allow_suspend {
                        return self.fail(
                            started,
                            "RuntimeError",
                            format!("external function '{name}' called in run-to-completion mode"),
                        );
                    }
                    let call_id = self.next_call_id;
                    self.next_call_id += 1;
                    self.last_call_id = call_id;
                    self.phase = Phase::Paused;
                    self.settle(started);
                    return WireProgress::Pending {
                        call: WireCall {
                            function_name: name,
                            args,
                            kwargs,
                            call_id,
                            method_call,
                        },
                    };
                }
                Err(Interrupt::Blocked) => {
                    self.phase = Phase::Blocked;
                    self.settle(started);
                    let call_ids = self
                        .futures
                        .iter()
                        .filter(|(_, state)| matches!(state, FutureState::Pending))
                        .map(|(id, _)| *id)
                        .collect();
                    return WireProgress::ResolveFutures { call_ids };
                }
                Err(Interrupt::Raise { exc_type, message }) => {
                    self.print_output.push_str(&prints);
                    return self.fail(started, exc_type, message);
                }
            }
        }
    }

    fn settle(&mut self, started: Instant) {
        self.elapsed_ms = self
            .elapsed_ms
            .saturating_add(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
    }

    fn fail(&mut self, started: Instant, exc_type: &str, message: String) -> WireProgress {
        self.phase = Phase::Done;
        self.settle(started);
        let stmt = self.stmts.get(self.pc);
        let line = stmt.map_or(1, |s| s.line);
        let text = stmt.map(|s| s.text.clone());
        let end_column = text
            .as_ref()
            .map_or(1, |t| u32::try_from(t.len()).unwrap_or(u32::MAX) + 1);
        let error = WireError {
            message: format!("{exc_type}: {message}"),
            exc_type: exc_type.to_owned(),
            traceback: vec![WireFrame {
                filename: self.script_name.clone(),
                start_line: line,
                start_column: 1,
                end_line: line,
                end_column,
                frame_name: None,
                preview_line: text.clone(),
            }],
            filename: Some(self.script_name.clone()),
            line_number: Some(line),
            column_number: Some(1),
            source_code: text,
        };
        WireProgress::Complete(self.outcome(Some(error)))
    }

    fn outcome(&self, error: Option<WireError>) -> WireOutcome {
        WireOutcome {
            value: if error.is_some() {
                Value::Null
            } else {
                self.result.clone()
            },
            error,
            usage: Some(WireUsage {
                memory_bytes_used: self.approximate_memory(),
                time_elapsed_ms: self.elapsed_ms,
                stack_depth_used: 1,
            }),
            print_output: if self.print_output.is_empty() {
                None
            } else {
                Some(self.print_output.clone())
            },
        }
    }

    /// Rough namespace footprint, enough for limit tests.
    fn approximate_memory(&self) -> u64 {
        self.namespace
            .iter()
            .map(|(name, value)| {
                let payload = match value {
                    SimValue::Data(data) => {
                        serde_json::to_string(data).map_or(0, |s| s.len() as u64)
                    }
                    _ => 0,
                };
                name.len() as u64 + payload + 16
            })
            .sum()
    }

    fn expect_phase(&self, wanted: Phase, operation: &str) -> Result<(), BoxError> {
        if self.phase == wanted {
            Ok(())
        } else {
            Err(format!("{operation}: context is {:?}, not {wanted:?}", self.phase).into())
        }
    }
}

/// The simulated engine. Stateless; every context is self-contained.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimEngine;

impl SimEngine {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Engine for SimEngine {
    type Context = SimContext;

    fn create(&self, spec: &CreateSpec) -> Result<Self::Context, BoxError> {
        SimContext::compile(spec).map_err(Into::into)
    }

    fn run(&self, cx: &mut Self::Context) -> Result<WireOutcome, BoxError> {
        cx.expect_phase(Phase::Ready, "run")?;
        match cx.step(false) {
            WireProgress::Complete(outcome) => Ok(outcome),
            _ => Err("run cannot suspend".into()),
        }
    }

    fn start(&self, cx: &mut Self::Context) -> Result<WireProgress, BoxError> {
        cx.expect_phase(Phase::Ready, "start")?;
        Ok(cx.step(true))
    }

    fn resume(&self, cx: &mut Self::Context, value: Value) -> Result<WireProgress, BoxError> {
        cx.expect_phase(Phase::Paused, "resume")?;
        cx.resolved.push(ResumeSlot::Value(SimValue::Data(value)));
        Ok(cx.step(true))
    }

    fn resume_with_error(
        &self,
        cx: &mut Self::Context,
        message: &str,
    ) -> Result<WireProgress, BoxError> {
        cx.expect_phase(Phase::Paused, "resume_with_error")?;
        cx.resolved.push(ResumeSlot::Error(message.to_owned()));
        Ok(cx.step(true))
    }

    fn resume_as_future(&self, cx: &mut Self::Context) -> Result<WireProgress, BoxError> {
        cx.expect_phase(Phase::Paused, "resume_as_future")?;
        let id = cx.last_call_id;
        cx.futures.insert(id, FutureState::Pending);
        cx.resolved.push(ResumeSlot::Value(SimValue::Future(id)));
        Ok(cx.step(true))
    }

    fn resolve_futures(
        &self,
        cx: &mut Self::Context,
        results: &HashMap<u32, Value>,
        errors: &HashMap<u32, String>,
    ) -> Result<WireProgress, BoxError> {
        cx.expect_phase(Phase::Blocked, "resolve_futures")?;
        for (id, value) in results {
            match cx.futures.get(id) {
                Some(FutureState::Pending) => {
                    cx.futures.insert(*id, FutureState::Resolved(value.clone()));
                }
                _ => return Err(format!("unknown or settled call id: {id}").into()),
            }
        }
        for (id, message) in errors {
            match cx.futures.get(id) {
                Some(FutureState::Pending) => {
                    cx.futures.insert(*id, FutureState::Failed(message.clone()));
                }
                _ => return Err(format!("unknown or settled call id: {id}").into()),
            }
        }
        Ok(cx.step(true))
    }

    fn snapshot(&self, cx: &Self::Context) -> Result<Vec<u8>, BoxError> {
        if cx.phase == Phase::Done {
            return Err("cannot snapshot a finished context".into());
        }
        serde_json::to_vec(cx).map_err(Into::into)
    }

    fn restore(&self, bytes: &[u8]) -> Result<Self::Context, BoxError> {
        serde_json::from_slice(bytes).map_err(|e| format!("restore failed: {e}").into())
    }

    fn set_memory_limit(&self, cx: &mut Self::Context, bytes: u64) {
        cx.memory_limit = Some(bytes);
    }

    fn set_time_limit(&self, cx: &mut Self::Context, limit: Duration) {
        cx.time_limit = Some(limit);
    }

    fn set_stack_limit(&self, cx: &mut Self::Context, depth: u32) {
        cx.stack_limit = Some(depth);
    }

    fn supports_input_bindings(&self) -> bool {
        true
    }
}
