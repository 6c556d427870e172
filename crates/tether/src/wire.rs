//! Structural payloads as engines report them, and the one translation seam
//! that turns them into the canonical [`crate::types`] shapes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Call, ErrorDescriptor, Frame, Outcome, Progress, ResourceUsage};

/// Resource usage as reported by an engine. Absent fields zero-fill.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub memory_bytes_used: u64,
    #[serde(default)]
    pub time_elapsed_ms: u64,
    #[serde(default)]
    pub stack_depth_used: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub filename: String,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_line: Option<String>,
}

/// Guest failure payload. The single-frame fields mirror the last traceback
/// frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    pub exc_type: String,
    #[serde(default)]
    pub traceback: Vec<WireFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireOutcome {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<WireUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireCall {
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Map<String, Value>>,
    pub call_id: u32,
    #[serde(default)]
    pub method_call: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireProgress {
    Complete(WireOutcome),
    Pending { call: WireCall },
    ResolveFutures { call_ids: Vec<u32> },
}

pub(crate) fn decode_progress(wire: WireProgress) -> Progress {
    match wire {
        WireProgress::Complete(outcome) => Progress::Complete(decode_outcome(outcome)),
        WireProgress::Pending { call } => Progress::Pending(decode_call(call)),
        WireProgress::ResolveFutures { call_ids } => Progress::ResolveFutures(call_ids),
    }
}

pub(crate) fn decode_outcome(wire: WireOutcome) -> Outcome {
    Outcome {
        value: wire.value,
        error: wire.error.map(decode_error),
        usage: decode_usage(wire.usage),
        print_output: wire.print_output.filter(|output| !output.is_empty()),
    }
}

pub(crate) fn decode_call(wire: WireCall) -> Call {
    Call {
        function_name: wire.function_name,
        args: wire.args,
        kwargs: wire.kwargs,
        call_id: wire.call_id,
        method_call: wire.method_call,
    }
}

fn decode_error(wire: WireError) -> ErrorDescriptor {
    ErrorDescriptor {
        message: wire.message,
        exc_type: wire.exc_type,
        traceback: wire.traceback.into_iter().map(decode_frame).collect(),
        filename: wire.filename,
        line_number: wire.line_number,
        column_number: wire.column_number,
        source_snippet: wire.source_code,
    }
}

fn decode_frame(wire: WireFrame) -> Frame {
    Frame {
        filename: wire.filename,
        start_line: wire.start_line,
        start_column: wire.start_column,
        end_line: wire.end_line,
        end_column: wire.end_column,
        frame_name: wire.frame_name,
        preview_line: wire.preview_line,
    }
}

const fn decode_usage(wire: Option<WireUsage>) -> ResourceUsage {
    match wire {
        Some(usage) => ResourceUsage {
            memory_bytes: usage.memory_bytes_used,
            time_elapsed_ms: usage.time_elapsed_ms,
            stack_depth: usage.stack_depth_used,
        },
        None => ResourceUsage {
            memory_bytes: 0,
            time_elapsed_ms: 0,
            stack_depth: 0,
        },
    }
}
