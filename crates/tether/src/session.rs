//! Session layer: a persistent variable namespace across independent runs.
//!
//! The wrapped protocol never persists anything itself. Each `run` injects a
//! hidden restore host-call before the user code and a hidden persist
//! host-call after it; both are intercepted inside the session's own resume
//! loop, so callers only ever see pending calls for functions they
//! registered themselves.

use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info_span};

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::types::{ExecOptions, Progress};

const RESTORE_HOOK: &str = "__session_restore__";
const PERSIST_HOOK: &str = "__session_persist__";
const STATE_BINDING: &str = "__session_state__";
const RESULT_BINDING: &str = "__session_result__";

/// Names with this prefix never persist between runs.
const PRIVATE_PREFIX: char = '_';

enum Hook {
    Restore,
    Persist,
}

impl Hook {
    /// The single dispatch point deciding whether a pending call belongs to
    /// the session or to its caller.
    fn lookup(function_name: &str) -> Option<Self> {
        match function_name {
            RESTORE_HOOK => Some(Self::Restore),
            PERSIST_HOOK => Some(Self::Persist),
            _ => None,
        }
    }
}

pub struct Session {
    instance: Arc<Mutex<Instance>>,
    state: Map<String, Value>,
    /// Persist payload captured mid-run; committed only on clean completion.
    staged: Option<Map<String, Value>>,
    disposed: bool,
}

impl Session {
    /// Wrap a shared instance. The session never disposes it.
    #[must_use]
    pub fn new(instance: Arc<Mutex<Instance>>) -> Self {
        Self {
            instance,
            state: Map::new(),
            staged: None,
            disposed: false,
        }
    }

    /// Execute `code` against the session namespace.
    ///
    /// Returns `Pending` for host calls the caller registered, which are
    /// answered through [`resume`](Self::resume)/
    /// [`resume_with_error`](Self::resume_with_error). On clean completion
    /// the captured namespace becomes the new session state; a guest error
    /// rolls back to the last successful commit.
    ///
    /// # Errors
    /// Returns an error when the session is disposed or the underlying
    /// instance fails.
    pub async fn run(&mut self, code: &str, options: &ExecOptions) -> Result<Progress> {
        self.guard("run")?;
        let span = info_span!(target: crate::TRACE_TARGET, "session.run");
        async {
            let wrapped = wrap_code(code, &self.state);
            let mut exec_options = options.clone();
            exec_options.external_functions.push(RESTORE_HOOK.into());
            exec_options.external_functions.push(PERSIST_HOOK.into());
            self.staged = None;
            let progress = {
                let mut instance = self.instance.lock().await;
                instance.start(wrapped, &exec_options).await?
            };
            self.advance(progress).await
        }
        .instrument(span)
        .await
    }

    /// Answer the caller-visible pending call with a value.
    ///
    /// # Errors
    /// Returns an error when the session is disposed or the underlying
    /// instance fails.
    pub async fn resume(&mut self, value: Value) -> Result<Progress> {
        self.guard("resume")?;
        let progress = self.instance.lock().await.resume(value).await?;
        self.advance(progress).await
    }

    /// Answer the caller-visible pending call with an injected error.
    ///
    /// # Errors
    /// Returns an error when the session is disposed or the underlying
    /// instance fails.
    pub async fn resume_with_error(&mut self, message: impl Into<String>) -> Result<Progress> {
        self.guard("resume_with_error")?;
        let progress = self
            .instance
            .lock()
            .await
            .resume_with_error(message.into())
            .await?;
        self.advance(progress).await
    }

    /// The committed session namespace.
    #[must_use]
    pub const fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    /// Reset the namespace without touching the wrapped instance.
    pub fn clear_state(&mut self) {
        self.state = Map::new();
    }

    /// Drop local state and refuse further runs. The wrapped instance is
    /// shared and stays untouched.
    pub fn dispose(&mut self) {
        self.state = Map::new();
        self.staged = None;
        self.disposed = true;
    }

    /// Drive the wrapped instance until it completes or yields a pending
    /// call that is not ours.
    async fn advance(&mut self, mut progress: Progress) -> Result<Progress> {
        loop {
            match progress {
                Progress::Pending(call) => match Hook::lookup(&call.function_name) {
                    Some(Hook::Restore) => {
                        let state = Value::Object(self.state.clone());
                        progress = self.instance.lock().await.resume(state).await?;
                    }
                    Some(Hook::Persist) => {
                        self.staged = Some(stage_bindings(call.args.first()));
                        progress = self.instance.lock().await.resume(Value::Null).await?;
                    }
                    None => return Ok(Progress::Pending(call)),
                },
                Progress::Complete(outcome) => {
                    let staged = self.staged.take();
                    if outcome.error.is_none() {
                        if let Some(staged) = staged {
                            self.state = staged;
                        }
                    } else {
                        debug!(
                            target: crate::TRACE_TARGET,
                            "run failed; session state rolls back to last commit"
                        );
                    }
                    return Ok(Progress::Complete(outcome));
                }
                Progress::ResolveFutures(ids) => return Ok(Progress::ResolveFutures(ids)),
            }
        }
    }

    fn guard(&self, operation: &'static str) -> Result<()> {
        if self.disposed {
            return Err(Error::InvalidState {
                operation,
                state: "disposed",
            });
        }
        Ok(())
    }
}

/// Filter a persist payload down to the bindings worth keeping: public
/// names whose values are plain wire data. A single bad value is dropped,
/// never the whole commit.
fn stage_bindings(payload: Option<&Value>) -> Map<String, Value> {
    let mut staged = Map::new();
    let Some(Value::Object(bindings)) = payload else {
        return staged;
    };
    for (name, value) in bindings {
        if name.starts_with(PRIVATE_PREFIX) || !is_identifier(name) {
            continue;
        }
        staged.insert(name.clone(), value.clone());
    }
    staged
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Build the wrapped program: restore prologue, user body, result capture,
/// persist epilogue.
fn wrap_code(code: &str, state: &Map<String, Value>) -> String {
    let mut wrapped = String::new();
    let _ = writeln!(wrapped, "{STATE_BINDING} = {RESTORE_HOOK}()");
    for name in state.keys() {
        if !is_identifier(name) {
            continue;
        }
        let key = Value::String(name.clone());
        let _ = writeln!(wrapped, "{name} = {STATE_BINDING}[{key}]");
    }

    let (body, trailing) = split_trailing_expression(code);
    wrapped.push_str(body);
    if !wrapped.ends_with('\n') {
        wrapped.push('\n');
    }
    match trailing {
        Some(expression) => {
            let _ = writeln!(wrapped, "{RESULT_BINDING} = ({expression})");
        }
        None => {
            let _ = writeln!(wrapped, "{RESULT_BINDING} = None");
        }
    }
    let _ = writeln!(wrapped, "{PERSIST_HOOK}(vars())");
    let _ = writeln!(wrapped, "{RESULT_BINDING}");
    wrapped
}

const STATEMENT_KEYWORDS: &[&str] = &[
    "assert", "break", "class", "continue", "def", "del", "elif", "else", "except", "finally",
    "for", "from", "global", "if", "import", "nonlocal", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

/// Split a trailing bare expression off the user code, so the wrapped
/// program can evaluate to it. Statements inside blocks, keyword statements
/// and assignments are left alone.
fn split_trailing_expression(code: &str) -> (&str, Option<&str>) {
    let mut last_start: Option<usize> = None;
    let mut offset = 0;
    let mut depth = 0i32;
    let mut logical_start = 0;
    for line in code.split_inclusive('\n') {
        if depth == 0 {
            logical_start = offset;
        }
        depth += bracket_delta(line);
        offset += line.len();
        if depth > 0 {
            continue;
        }
        let logical = &code[logical_start..offset];
        if !logical.trim().is_empty() && !logical.trim_start().starts_with('#') {
            last_start = Some(logical_start);
        }
    }

    let Some(start) = last_start else {
        return (code, None);
    };
    let candidate = code[start..].trim_end();
    if candidate.starts_with(char::is_whitespace) {
        // Indented: part of a block, not a top-level statement.
        return (code, None);
    }
    let first_word = candidate
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .next()
        .unwrap_or("");
    if STATEMENT_KEYWORDS.contains(&first_word) {
        return (code, None);
    }
    if contains_top_level_assignment(candidate) {
        return (code, None);
    }
    (&code[..start], Some(candidate))
}

/// Net bracket depth of one line, ignoring brackets inside string literals.
fn bracket_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in line.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => delta += 1,
            ')' | ']' | '}' => delta -= 1,
            '#' => break,
            _ => {}
        }
    }
    delta
}

/// Detect `name = ...` (including augmented forms) at bracket depth zero.
fn contains_top_level_assignment(line: &str) -> bool {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let bytes = line.as_bytes();
    for (i, c) in line.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            '=' if depth == 0 => {
                let next = bytes.get(i + 1).copied();
                if next == Some(b'=') {
                    continue;
                }
                let prev = i.checked_sub(1).and_then(|p| bytes.get(p)).copied();
                // Comparison and walrus operators are expressions.
                if matches!(prev, Some(b'=' | b'!' | b'<' | b'>' | b':')) {
                    continue;
                }
                return true;
            }
            _ => {}
        }
    }
    false
}
