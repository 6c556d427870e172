//! A deliberately tiny statement interpreter backing [`SimEngine`].
//!
//! It covers just enough guest language for the protocol tests: assignments,
//! arithmetic, string/dict/list values, subscripts, calls with keyword
//! arguments, and a handful of builtins. External calls suspend; suspended
//! statements are re-executed on resume with previously-answered calls
//! replayed from a slot list, so a statement may contain several host calls.
//!
//! [`SimEngine`]: crate::SimEngine

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum SimValue {
    /// Plain wire data.
    Data(Value),
    /// A value the engine cannot represent on the wire.
    Opaque,
    /// An unresolved deferred host call.
    Future(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum FutureState {
    Pending,
    Resolved(Value),
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum ResumeSlot {
    Value(SimValue),
    Error(String),
}

// ---------------------------------------------------------------------------
// Syntax
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Stmt {
    pub line: u32,
    pub text: String,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum StmtKind {
    Assign { name: String, expr: Expr },
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Expr {
    Literal(Value),
    Name(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        /// Final segment of the called name.
        name: String,
        /// Full dotted path as written, for diagnostics.
        path: String,
        method: bool,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Subscript {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    List(Vec<Expr>),
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(char),
}

fn tokenize(source: &str) -> Result<Vec<Tok>, String> {
    let mut toks = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '#' => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        break;
                    }
                }
            }
            '\'' | '"' => {
                chars.next();
                let quote = c;
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => return Err("unterminated string escape".into()),
                        },
                        Some(done) if done == quote => break,
                        Some(other) => text.push(other),
                        None => return Err("unterminated string literal".into()),
                    }
                }
                toks.push(Tok::Str(text));
            }
            '0'..='9' => {
                let mut number = String::new();
                let mut float = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        number.push(d);
                        chars.next();
                    } else if d == '.' && !float {
                        float = true;
                        number.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if float {
                    let parsed: f64 = number
                        .parse()
                        .map_err(|_| format!("invalid number: {number}"))?;
                    toks.push(Tok::Float(parsed));
                } else {
                    let parsed: i64 = number
                        .parse()
                        .map_err(|_| format!("invalid number: {number}"))?;
                    toks.push(Tok::Int(parsed));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        name.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Name(name));
            }
            '+' | '-' | '*' | '/' | '%' | '(' | ')' | '[' | ']' | ',' | '=' | '.' => {
                chars.next();
                toks.push(Tok::Sym(c));
            }
            other => return Err(format!("unexpected character: {other:?}")),
        }
    }
    Ok(toks)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat_sym(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Tok::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: char) -> Result<(), String> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(format!("expected '{sym}'"))
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Sym('+')) => BinOp::Add,
                Some(Tok::Sym('-')) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Sym('*')) => BinOp::Mul,
                Some(Tok::Sym('/')) => BinOp::Div,
                Some(Tok::Sym('%')) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat_sym('-') {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_sym('(') {
                let (name, path, method) = match &expr {
                    Expr::Name(name) => (last_segment(name).to_owned(), name.clone(), name.contains('.')),
                    _ => return Err("only named functions can be called".into()),
                };
                let (args, kwargs) = self.arguments()?;
                expr = Expr::Call {
                    name,
                    path,
                    method,
                    args,
                    kwargs,
                };
            } else if self.eat_sym('[') {
                let index = self.expr()?;
                self.expect_sym(']')?;
                expr = Expr::Subscript {
                    base: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), String> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        if self.eat_sym(')') {
            return Ok((args, kwargs));
        }
        loop {
            if let (Some(Tok::Name(key)), Some(Tok::Sym('='))) =
                (self.toks.get(self.pos), self.toks.get(self.pos + 1))
            {
                let key = key.clone();
                self.pos += 2;
                kwargs.push((key, self.expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err("positional argument after keyword argument".into());
                }
                args.push(self.expr()?);
            }
            if self.eat_sym(')') {
                break;
            }
            self.expect_sym(',')?;
        }
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Tok::Int(n)) => Ok(Expr::Literal(Value::Number(n.into()))),
            Some(Tok::Float(f)) => Ok(Expr::Literal(
                Number::from_f64(f).map_or(Value::Null, Value::Number),
            )),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::Name(name)) => match name.as_str() {
                "None" => Ok(Expr::Literal(Value::Null)),
                "True" => Ok(Expr::Literal(Value::Bool(true))),
                "False" => Ok(Expr::Literal(Value::Bool(false))),
                _ => {
                    let mut path = name;
                    while self.eat_sym('.') {
                        match self.next() {
                            Some(Tok::Name(segment)) => {
                                path.push('.');
                                path.push_str(&segment);
                            }
                            _ => return Err("expected name after '.'".into()),
                        }
                    }
                    Ok(Expr::Name(path))
                }
            },
            Some(Tok::Sym('(')) => {
                let inner = self.expr()?;
                self.expect_sym(')')?;
                Ok(inner)
            }
            Some(Tok::Sym('[')) => {
                let mut items = Vec::new();
                if !self.eat_sym(']') {
                    loop {
                        items.push(self.expr()?);
                        if self.eat_sym(']') {
                            break;
                        }
                        self.expect_sym(',')?;
                    }
                }
                Ok(Expr::List(items))
            }
            other => Err(format!("unexpected token: {other:?}")),
        }
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

fn parse_statement(source: &str) -> Result<StmtKind, String> {
    let toks = tokenize(source)?;
    if toks.is_empty() {
        return Err("empty statement".into());
    }
    if let (Some(Tok::Name(name)), Some(Tok::Sym('='))) = (toks.first(), toks.get(1)) {
        // `a == b` would need a comparison grammar this interpreter does not
        // have; reject it instead of misparsing.
        if toks.get(2) == Some(&Tok::Sym('=')) {
            return Err("comparison operators are not supported".into());
        }
        let name = name.clone();
        let mut parser = Parser { toks, pos: 2 };
        let expr = parser.expr()?;
        if parser.peek().is_some() {
            return Err("trailing tokens after expression".into());
        }
        return Ok(StmtKind::Assign { name, expr });
    }
    let mut parser = Parser { toks, pos: 0 };
    let expr = parser.expr()?;
    if parser.peek().is_some() {
        return Err("trailing tokens after expression".into());
    }
    Ok(StmtKind::Expr(expr))
}

/// Split source into logical lines (joining bracket continuations) and parse
/// each into a statement.
pub(crate) fn parse_program(code: &str) -> Result<Vec<Stmt>, String> {
    let mut stmts = Vec::new();
    let mut pending = String::new();
    let mut pending_line = 0u32;
    let mut depth = 0i32;
    for (index, line) in code.lines().enumerate() {
        let number = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
        if pending.is_empty() {
            pending_line = number;
        } else {
            pending.push('\n');
        }
        pending.push_str(line);
        depth += line_bracket_delta(line);
        if depth > 0 {
            continue;
        }
        depth = 0;
        let text = pending.trim().to_owned();
        pending.clear();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let kind = parse_statement(&text)
            .map_err(|e| format!("line {pending_line}: {e}: {text}"))?;
        stmts.push(Stmt {
            line: pending_line,
            text,
            kind,
        });
    }
    if depth > 0 {
        return Err("unbalanced brackets at end of input".into());
    }
    Ok(stmts)
}

fn line_bracket_delta(line: &str) -> i32 {
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
            '(' | '[' => delta += 1,
            ')' | ']' => delta -= 1,
            '#' => break,
            _ => {}
        }
    }
    delta
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Why expression evaluation stopped early.
pub(crate) enum Interrupt {
    /// Hit an unanswered external call.
    Suspend {
        name: String,
        args: Vec<Value>,
        kwargs: Option<Map<String, Value>>,
        method_call: bool,
    },
    /// Touched one or more unresolved futures.
    Blocked,
    Raise {
        exc_type: &'static str,
        message: String,
    },
}

pub(crate) struct Eval<'a> {
    pub namespace: &'a BTreeMap<String, SimValue>,
    pub external: &'a [String],
    pub resolved: &'a [ResumeSlot],
    pub futures: &'a BTreeMap<u32, FutureState>,
    /// Print output of this evaluation attempt; committed by the caller only
    /// when the statement completes, so replays do not duplicate it.
    pub prints: &'a mut String,
    pub consumed: usize,
}

type EvalResult<T> = Result<T, Interrupt>;

fn raise<T>(exc_type: &'static str, message: impl Into<String>) -> EvalResult<T> {
    Err(Interrupt::Raise {
        exc_type,
        message: message.into(),
    })
}

impl Eval<'_> {
    pub fn expr(&mut self, expr: &Expr) -> EvalResult<SimValue> {
        match expr {
            Expr::Literal(value) => Ok(SimValue::Data(value.clone())),
            Expr::Name(name) => self.lookup(name),
            Expr::Neg(inner) => {
                let value = self.data(inner)?;
                match value {
                    Value::Number(n) => {
                        let negated = n.as_i64().map_or_else(
                            || Number::from_f64(-n.as_f64().unwrap_or(0.0)).map_or(Value::Null, Value::Number),
                            |i| Value::Number((-i).into()),
                        );
                        Ok(SimValue::Data(negated))
                    }
                    other => raise(
                        "TypeError",
                        format!("bad operand type for unary -: {}", value_type_name(&other)),
                    ),
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.data(left)?;
                let right = self.data(right)?;
                self.binary(*op, left, right)
            }
            Expr::Call {
                name,
                path,
                method,
                args,
                kwargs,
            } => self.call(name, path, *method, args, kwargs),
            Expr::Subscript { base, index } => {
                let base = self.data(base)?;
                let index = self.data(index)?;
                self.subscript(&base, &index)
            }
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.data(item)?);
                }
                Ok(SimValue::Data(Value::Array(values)))
            }
        }
    }

    /// Evaluate and force a wire-representable value.
    pub fn data(&mut self, expr: &Expr) -> EvalResult<Value> {
        let value = self.expr(expr)?;
        self.materialize(value)
    }

    pub fn materialize(&self, value: SimValue) -> EvalResult<Value> {
        match value {
            SimValue::Data(value) => Ok(value),
            SimValue::Opaque => raise("TypeError", "opaque value is not representable"),
            SimValue::Future(id) => match self.futures.get(&id) {
                Some(FutureState::Resolved(value)) => Ok(value.clone()),
                Some(FutureState::Failed(message)) => raise("RuntimeError", message.clone()),
                _ => Err(Interrupt::Blocked),
            },
        }
    }

    fn lookup(&self, name: &str) -> EvalResult<SimValue> {
        self.namespace.get(name).cloned().map_or_else(
            || raise("NameError", format!("name '{name}' is not defined")),
            Ok,
        )
    }

    fn binary(&self, op: BinOp, left: Value, right: Value) -> EvalResult<SimValue> {
        match (op, &left, &right) {
            (BinOp::Add, Value::String(a), Value::String(b)) => {
                Ok(SimValue::Data(Value::String(format!("{a}{b}"))))
            }
            (BinOp::Mul, Value::String(s), Value::Number(n)) => {
                let count = usize::try_from(n.as_i64().unwrap_or(0).max(0)).unwrap_or(0);
                Ok(SimValue::Data(Value::String(s.repeat(count))))
            }
            (_, Value::Number(a), Value::Number(b)) => self.arith(op, a, b),
            _ => raise(
                "TypeError",
                format!(
                    "unsupported operand type(s): {} and {}",
                    value_type_name(&left),
                    value_type_name(&right)
                ),
            ),
        }
    }

    fn arith(&self, op: BinOp, a: &Number, b: &Number) -> EvalResult<SimValue> {
        if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
            let result = match op {
                BinOp::Add => Value::Number((x + y).into()),
                BinOp::Sub => Value::Number((x - y).into()),
                BinOp::Mul => Value::Number((x * y).into()),
                BinOp::Div => {
                    if y == 0 {
                        return raise("ZeroDivisionError", "division by zero");
                    }
                    #[allow(clippy::cast_precision_loss)]
                    let quotient = x as f64 / y as f64;
                    Number::from_f64(quotient).map_or(Value::Null, Value::Number)
                }
                BinOp::Mod => {
                    if y == 0 {
                        return raise("ZeroDivisionError", "modulo by zero");
                    }
                    Value::Number((x % y).into())
                }
            };
            return Ok(SimValue::Data(result));
        }
        let x = a.as_f64().unwrap_or(0.0);
        let y = b.as_f64().unwrap_or(0.0);
        let result = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => {
                if y == 0.0 {
                    return raise("ZeroDivisionError", "float division by zero");
                }
                x / y
            }
            BinOp::Mod => {
                if y == 0.0 {
                    return raise("ZeroDivisionError", "float modulo by zero");
                }
                x % y
            }
        };
        Ok(SimValue::Data(
            Number::from_f64(result).map_or(Value::Null, Value::Number),
        ))
    }

    fn subscript(&self, base: &Value, index: &Value) -> EvalResult<SimValue> {
        match (base, index) {
            (Value::Object(map), Value::String(key)) => map.get(key).map_or_else(
                || raise("KeyError", format!("'{key}'")),
                |v| Ok(SimValue::Data(v.clone())),
            ),
            (Value::Array(items), Value::Number(n)) => {
                let index = usize::try_from(n.as_i64().unwrap_or(-1))
                    .ok()
                    .and_then(|i| items.get(i));
                index.map_or_else(
                    || raise("IndexError", "list index out of range"),
                    |v| Ok(SimValue::Data(v.clone())),
                )
            }
            _ => raise(
                "TypeError",
                format!("{} is not subscriptable", value_type_name(base)),
            ),
        }
    }

    fn call(
        &mut self,
        name: &str,
        path: &str,
        method: bool,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> EvalResult<SimValue> {
        if self.external.iter().any(|f| f.as_str() == name) {
            // Replay: calls already answered this statement consume their
            // recorded slot instead of suspending again.
            if self.consumed < self.resolved.len() {
                let slot = self.resolved[self.consumed].clone();
                self.consumed += 1;
                return match slot {
                    ResumeSlot::Value(value) => Ok(value),
                    ResumeSlot::Error(message) => raise("RuntimeError", message),
                };
            }
            let mut wire_args = Vec::with_capacity(args.len());
            for arg in args {
                wire_args.push(self.data(arg)?);
            }
            let wire_kwargs = if kwargs.is_empty() {
                None
            } else {
                let mut map = Map::new();
                for (key, expr) in kwargs {
                    map.insert(key.clone(), self.data(expr)?);
                }
                Some(map)
            };
            return Err(Interrupt::Suspend {
                name: name.to_owned(),
                args: wire_args,
                kwargs: wire_kwargs,
                method_call: method,
            });
        }
        if method {
            return raise("NameError", format!("name '{path}' is not defined"));
        }
        self.builtin(name, args)
    }

    fn builtin(&mut self, name: &str, args: &[Expr]) -> EvalResult<SimValue> {
        match name {
            "vars" => {
                let mut map = Map::new();
                for (key, value) in self.namespace {
                    match value {
                        SimValue::Data(data) => {
                            map.insert(key.clone(), data.clone());
                        }
                        SimValue::Future(id) => {
                            // Unresolved futures cannot be encoded; drop them.
                            if let Some(FutureState::Resolved(data)) = self.futures.get(id) {
                                map.insert(key.clone(), data.clone());
                            }
                        }
                        SimValue::Opaque => {}
                    }
                }
                Ok(SimValue::Data(Value::Object(map)))
            }
            "print" => {
                let mut parts = Vec::with_capacity(args.len());
                for arg in args {
                    parts.push(display(&self.data(arg)?));
                }
                let _ = writeln!(self.prints, "{}", parts.join(" "));
                Ok(SimValue::Data(Value::Null))
            }
            "opaque" => Ok(SimValue::Opaque),
            "sleep_ms" => {
                let millis = match args.first() {
                    Some(arg) => self.data(arg)?.as_u64().unwrap_or(0),
                    None => 0,
                };
                std::thread::sleep(std::time::Duration::from_millis(millis));
                Ok(SimValue::Data(Value::Null))
            }
            "len" => match args.first().map(|a| self.data(a)).transpose()? {
                Some(Value::String(s)) => {
                    Ok(SimValue::Data(Value::Number((s.chars().count() as u64).into())))
                }
                Some(Value::Array(items)) => {
                    Ok(SimValue::Data(Value::Number((items.len() as u64).into())))
                }
                Some(Value::Object(map)) => {
                    Ok(SimValue::Data(Value::Number((map.len() as u64).into())))
                }
                other => raise(
                    "TypeError",
                    format!(
                        "object of type '{}' has no len()",
                        other.as_ref().map_or("NoneType", value_type_name)
                    ),
                ),
            },
            _ => raise("NameError", format!("name '{name}' is not defined")),
        }
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => "None".into(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

const fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NoneType",
        Value::Bool(_) => "bool",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}
