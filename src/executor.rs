//! Bytecode executor for hogtail programs
//!
//! An [`Executor`] owns one compiled [`Object`] and the store metrics it
//! declares. Every input line runs on a fresh [`Thread`] from pc 0 to the
//! end of the program; nothing but datums outlives the line.

use crate::logline::LogLine;
use crate::observability::PROG_RUNTIME_ERRORS;
use crate::opcodes::{Instr, Opcode, Operand};
use crate::program::Object;
use crate::store::{Datum, Metric, Store, StoreError};
use crate::value::Value;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::{NoExpand, Regex};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure while executing a single instruction
#[derive(Debug, Error)]
pub enum VmError {
    #[error("stack underflow")]
    StackUnderflow,

    #[error("type mismatch: expected {expected}, found {found}")]
    Type {
        expected: &'static str,
        found: &'static str,
    },

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("negative exponent {0}")]
    NegativeExponent(i64),

    #[error("invalid radix {0}")]
    Radix(i64),

    #[error("bad operand `{operand}` for {opcode}")]
    BadOperand {
        opcode: &'static str,
        operand: String,
    },

    #[error("capture group {group} of regex {regex} did not match")]
    NoCapture { regex: usize, group: usize },

    #[error("can not parse time {value:?} with layout {layout:?}")]
    Time { value: String, layout: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A [`VmError`] attributed to the program and source line that raised it
#[derive(Debug, Error)]
#[error("{program}:{line}: {opcode}: {error}")]
pub struct RuntimeError {
    pub program: String,
    /// One-based source line
    pub line: u32,
    pub opcode: Opcode,
    #[source]
    pub error: VmError,
}

/// Settings shared by every executor of a runtime
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Zone for timestamps that carry no offset
    pub timezone: Tz,
    /// Fill in the current year for layouts without one
    pub syslog_use_current_year: bool,
    pub log_runtime_errors: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions {
            timezone: Tz::UTC,
            syslog_use_current_year: true,
            log_runtime_errors: true,
        }
    }
}

/// Runs one compiled program against log lines
pub struct Executor {
    object: Arc<Object>,
    /// Store metrics, indexed like `object.metrics`
    metrics: Vec<Arc<Metric>>,
    options: ExecutorOptions,
}

impl Executor {
    /// Register the program's metrics in `store` and build its executor
    pub fn new(object: Arc<Object>, store: &Store, options: ExecutorOptions) -> Result<Self, StoreError> {
        let metrics = object
            .metrics
            .iter()
            .map(|desc| {
                let metric = Metric::new(
                    desc.exported_name.clone(),
                    object.name.clone(),
                    desc.kind,
                    desc.value_type,
                    desc.keys.clone(),
                )
                .with_buckets(desc.buckets.clone())
                .with_limit(desc.limit)
                .hidden(desc.hidden);
                store.add(metric)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(program = %object.name, metrics = metrics.len(), "executor ready");
        Ok(Executor {
            object,
            metrics,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.object.name
    }

    pub fn object(&self) -> &Arc<Object> {
        &self.object
    }

    pub fn metrics(&self) -> &[Arc<Metric>] {
        &self.metrics
    }

    /// Run the program over one line
    pub fn execute(&self, line: &LogLine) -> Result<(), RuntimeError> {
        let mut thread = Thread::new(self, line);
        thread.run().map_err(|(instr, error)| RuntimeError {
            program: self.object.name.clone(),
            line: instr.source_line + 1,
            opcode: instr.opcode,
            error,
        })
    }

    /// Run the program over one line, logging and counting any failure.
    ///
    /// Returns false when the line's execution was terminated by an error.
    pub fn process_line(&self, line: &LogLine) -> bool {
        match self.execute(line) {
            Ok(()) => true,
            Err(err) => {
                metrics::counter!(PROG_RUNTIME_ERRORS, "prog" => self.object.name.clone())
                    .increment(1);
                if self.options.log_runtime_errors {
                    warn!(
                        program = %err.program,
                        line = err.line,
                        opcode = err.opcode.name(),
                        error = %err.error,
                        input = %line.line,
                        "runtime error"
                    );
                }
                false
            }
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Execution state for one (program, line) pair
struct Thread<'a> {
    exec: &'a Executor,
    line: &'a LogLine,
    pc: usize,
    stack: Vec<Value>,
    /// Capture groups of the last successful match, by regex index
    matches: HashMap<usize, Vec<Option<String>>>,
    /// Time set by `strptime` or `settime`
    time: Option<DateTime<Utc>>,
    matched: bool,
}

impl<'a> Thread<'a> {
    fn new(exec: &'a Executor, line: &'a LogLine) -> Self {
        Thread {
            exec,
            line,
            pc: 0,
            stack: Vec::with_capacity(16),
            matches: HashMap::new(),
            time: None,
            matched: false,
        }
    }

    fn run(&mut self) -> Result<(), (Instr, VmError)> {
        let exec: &'a Executor = self.exec;
        let program = &exec.object.program;
        while let Some(instr) = program.get(self.pc).copied() {
            self.pc += 1;
            match self.step(instr) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(error) => return Err((instr, error)),
            }
        }
        Ok(())
    }

    fn step(&mut self, instr: Instr) -> Result<Flow, VmError> {
        match instr.opcode {
            // ===== Control =====
            Opcode::Stop => return Ok(Flow::Stop),

            Opcode::Match => {
                let index = regex_operand(&instr)?;
                let line: &'a LogLine = self.line;
                let matched = self.record_match(index, &line.line)?;
                self.push(matched);
            }

            Opcode::Smatch => {
                let index = regex_operand(&instr)?;
                let text = self.pop()?.to_label();
                let matched = self.record_match(index, &text)?;
                self.push(matched);
            }

            Opcode::Jm => {
                let target = jump_target(&instr)?;
                if self.pop()?.as_bool()? {
                    self.pc = target;
                }
            }

            Opcode::Jnm => {
                let target = jump_target(&instr)?;
                if !self.pop()?.as_bool()? {
                    self.pc = target;
                }
            }

            Opcode::Jmp => self.pc = jump_target(&instr)?,

            Opcode::Setmatched => match instr.operand {
                Operand::Bool(b) => self.matched = b,
                _ => return Err(bad_operand(&instr)),
            },

            Opcode::Otherwise => {
                let fire = !self.matched;
                self.push(fire);
            }

            // ===== Comparison =====
            Opcode::Cmp | Opcode::Icmp | Opcode::Fcmp | Opcode::Scmp => self.compare(&instr)?,

            // ===== Stack and metrics =====
            Opcode::Push => {
                let value = match instr.operand {
                    Operand::Int(n) => Value::Int(n),
                    Operand::Float(n) => Value::Float(n),
                    Operand::Bool(b) => Value::Bool(b),
                    Operand::Duration(d) => Value::Duration(d),
                    Operand::Regex(i) => Value::Pattern(i),
                    Operand::Str(i) => Value::String(self.string(&instr, i)?.to_string()),
                    Operand::None => return Err(bad_operand(&instr)),
                };
                self.push(value);
            }

            Opcode::Str => match instr.operand {
                Operand::Str(i) => {
                    let s = self.string(&instr, i)?.to_string();
                    self.push(s);
                }
                _ => return Err(bad_operand(&instr)),
            },

            Opcode::Capref => {
                let group = usize::try_from(int_operand(&instr)?).map_err(|_| bad_operand(&instr))?;
                let regex = self.pop_pattern()?;
                let text = self
                    .matches
                    .get(&regex)
                    .and_then(|groups| groups.get(group))
                    .ok_or(VmError::NoCapture { regex, group })?
                    .clone()
                    .unwrap_or_default();
                self.push(text);
            }

            Opcode::Mload => {
                let index = usize::try_from(int_operand(&instr)?).map_err(|_| bad_operand(&instr))?;
                if index >= self.exec.metrics.len() {
                    return Err(bad_operand(&instr));
                }
                self.push(Value::Metric(index));
            }

            Opcode::Dload => {
                let keys = count_operand(&instr)?;
                let (metric, labels) = self.pop_metric_labels(keys)?;
                let datum = metric.get_datum(&labels)?;
                self.push(Value::Datum(datum));
            }

            Opcode::Iget => {
                let d = self.pop_datum()?;
                self.push(d.get_int());
            }

            Opcode::Fget => {
                let d = self.pop_datum()?;
                self.push(d.get_float());
            }

            Opcode::Sget => {
                let d = self.pop_datum()?;
                self.push(d.get_string());
            }

            Opcode::Inc | Opcode::Dec => {
                let delta = match instr.operand {
                    Operand::None => 1,
                    _ => self.pop()?.as_int()?,
                };
                let delta = if instr.opcode == Opcode::Dec {
                    delta.wrapping_neg()
                } else {
                    delta
                };
                let d = self.pop_datum()?;
                d.inc_by(delta, self.now());
            }

            Opcode::Iset => {
                let value = self.pop()?.as_int()?;
                let d = self.pop_datum()?;
                d.set_int(value, self.now());
            }

            Opcode::Fset => {
                let value = self.pop()?.as_float()?;
                let d = self.pop_datum()?;
                d.set_float(value, self.now());
            }

            Opcode::Sset => {
                let value = self.pop()?.to_label();
                let d = self.pop_datum()?;
                d.set_string(&value, self.now());
            }

            Opcode::Expire => {
                let keys = count_operand(&instr)?;
                let (metric, labels) = self.pop_metric_labels(keys)?;
                let expiry = match self.pop()? {
                    Value::Duration(d) => d,
                    other => return Err(other.type_error("duration")),
                };
                metric.expire_datum(expiry, &labels)?;
            }

            Opcode::Del => {
                let keys = count_operand(&instr)?;
                let (metric, labels) = self.pop_metric_labels(keys)?;
                metric.remove_datum(&labels)?;
            }

            // ===== Arithmetic =====
            Opcode::Iadd
            | Opcode::Isub
            | Opcode::Imul
            | Opcode::Idiv
            | Opcode::Imod
            | Opcode::Ipow
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr => self.int_arith(&instr)?,

            Opcode::Fadd | Opcode::Fsub | Opcode::Fmul | Opcode::Fdiv | Opcode::Fmod | Opcode::Fpow => {
                self.float_arith(&instr)?
            }

            Opcode::Neg => {
                let a = self.pop()?.as_int()?;
                self.push(!a);
            }

            Opcode::Not => {
                let a = self.pop()?.as_bool()?;
                self.push(!a);
            }

            // ===== Strings =====
            Opcode::Cat => {
                let b = self.pop()?.to_label();
                let mut a = self.pop()?.to_label();
                a.push_str(&b);
                self.push(a);
            }

            Opcode::Tolower => {
                let s = self.pop()?.to_label();
                self.push(s.to_lowercase());
            }

            Opcode::Length => {
                let s = self.pop()?.to_label();
                self.push(s.len() as i64);
            }

            Opcode::Subst => {
                let value = self.pop()?.to_label();
                let new = self.pop()?.to_label();
                let old = self.pop()?.to_label();
                self.push(value.replace(&old, &new));
            }

            Opcode::Rsubst => {
                let value = self.pop()?.to_label();
                let new = self.pop()?.to_label();
                let index = self.pop_pattern()?;
                let re = self.regex(index)?;
                let replaced = re.replace_all(&value, NoExpand(&new)).into_owned();
                self.push(replaced);
            }

            // ===== Conversions =====
            Opcode::S2i => {
                let value = match instr.operand {
                    Operand::None => self.pop()?.as_int()?,
                    _ => {
                        let base = self.pop()?.as_int()?;
                        let s = self.pop()?.to_label();
                        parse_radix(&s, base)?
                    }
                };
                self.push(value);
            }

            Opcode::S2f => {
                let value = self.pop()?.as_float()?;
                self.push(value);
            }

            Opcode::I2f => {
                let value = self.pop()?.as_int()?;
                self.push(value as f64);
            }

            Opcode::I2s => {
                let value = self.pop()?.as_int()?;
                self.push(value.to_string());
            }

            Opcode::F2s => {
                let value = self.pop()?.as_float()?;
                self.push(value.to_string());
            }

            Opcode::F2i => {
                let value = self.pop()?.as_float()?;
                self.push(value as i64);
            }

            // ===== Time and environment =====
            Opcode::Strptime => {
                let layout = self.pop()?.to_label();
                let value = self.pop()?.to_label();
                self.time = Some(strptime(&value, &layout, &self.exec.options)?);
            }

            Opcode::Settime => {
                let secs = self.pop()?.as_int()?;
                let time = Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| VmError::Conversion(format!("{} is not a valid timestamp", secs)))?;
                self.time = Some(time);
            }

            Opcode::Timestamp => {
                let secs = self.now().timestamp();
                self.push(secs);
            }

            Opcode::Getfilename => {
                let name = self.line.filename.to_string();
                self.push(name);
            }
        }
        Ok(Flow::Continue)
    }

    // ===== Helpers =====

    fn push(&mut self, value: impl Into<Value>) {
        self.stack.push(value.into());
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn pop_datum(&mut self) -> Result<Arc<Datum>, VmError> {
        match self.pop()? {
            Value::Datum(d) => Ok(d),
            other => Err(other.type_error("datum")),
        }
    }

    fn pop_pattern(&mut self) -> Result<usize, VmError> {
        match self.pop()? {
            Value::Pattern(i) => Ok(i),
            other => Err(other.type_error("pattern")),
        }
    }

    /// Pop a metric and then `keys` label values
    fn pop_metric_labels(&mut self, keys: usize) -> Result<(Arc<Metric>, Vec<String>), VmError> {
        let index = match self.pop()? {
            Value::Metric(i) => i,
            other => return Err(other.type_error("metric")),
        };
        let metric = self
            .exec
            .metrics
            .get(index)
            .cloned()
            .ok_or(VmError::Type {
                expected: "metric",
                found: "int",
            })?;
        if self.stack.len() < keys {
            return Err(VmError::StackUnderflow);
        }
        let labels = self
            .stack
            .split_off(self.stack.len() - keys)
            .iter()
            .map(Value::to_label)
            .collect();
        Ok((metric, labels))
    }

    fn now(&self) -> DateTime<Utc> {
        self.time.unwrap_or_else(Utc::now)
    }

    fn regex(&self, index: usize) -> Result<&'a Regex, VmError> {
        let exec: &'a Executor = self.exec;
        exec.object.regexps.get(index).ok_or(VmError::BadOperand {
            opcode: "regex",
            operand: index.to_string(),
        })
    }

    fn string(&self, instr: &Instr, index: usize) -> Result<&'a str, VmError> {
        let exec: &'a Executor = self.exec;
        exec.object
            .strings
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| bad_operand(instr))
    }

    /// Match `text`, saving capture groups on success
    fn record_match(&mut self, index: usize, text: &str) -> Result<bool, VmError> {
        let re = self.regex(index)?;
        match re.captures(text) {
            Some(caps) => {
                let groups = caps.iter().map(|m| m.map(|m| m.as_str().to_string())).collect();
                self.matches.insert(index, groups);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn compare(&mut self, instr: &Instr) -> Result<(), VmError> {
        let want = int_operand(instr)?;
        let b = self.pop()?;
        let a = self.pop()?;
        let ordering = match instr.opcode {
            Opcode::Icmp => Some(a.as_int()?.cmp(&b.as_int()?)),
            Opcode::Fcmp => a.as_float()?.partial_cmp(&b.as_float()?),
            Opcode::Scmp => Some(a.to_label().cmp(&b.to_label())),
            _ => match (a.as_float(), b.as_float()) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y),
                _ => Some(a.to_label().cmp(&b.to_label())),
            },
        };
        let result = ordering.is_some_and(|o| ordering_value(o) == want);
        self.push(result);
        Ok(())
    }

    fn int_arith(&mut self, instr: &Instr) -> Result<(), VmError> {
        let b = self.pop()?.as_int()?;
        let a = self.pop()?.as_int()?;
        let result = match instr.opcode {
            Opcode::Iadd => a.wrapping_add(b),
            Opcode::Isub => a.wrapping_sub(b),
            Opcode::Imul => a.wrapping_mul(b),
            Opcode::Idiv if b == 0 => return Err(VmError::DivisionByZero),
            Opcode::Idiv => a.wrapping_div(b),
            Opcode::Imod if b == 0 => return Err(VmError::DivisionByZero),
            Opcode::Imod => a.wrapping_rem(b),
            Opcode::Ipow => {
                let exp = u32::try_from(b).map_err(|_| VmError::NegativeExponent(b))?;
                a.wrapping_pow(exp)
            }
            Opcode::And => a & b,
            Opcode::Or => a | b,
            Opcode::Xor => a ^ b,
            Opcode::Shl => a.wrapping_shl(b as u32),
            Opcode::Shr => a.wrapping_shr(b as u32),
            _ => return Err(bad_operand(instr)),
        };
        self.push(result);
        Ok(())
    }

    fn float_arith(&mut self, instr: &Instr) -> Result<(), VmError> {
        let b = self.pop()?.as_float()?;
        let a = self.pop()?.as_float()?;
        let result = match instr.opcode {
            Opcode::Fadd => a + b,
            Opcode::Fsub => a - b,
            Opcode::Fmul => a * b,
            Opcode::Fdiv | Opcode::Fmod if b == 0.0 => return Err(VmError::DivisionByZero),
            Opcode::Fdiv => a / b,
            Opcode::Fmod => a % b,
            Opcode::Fpow => a.powf(b),
            _ => return Err(bad_operand(instr)),
        };
        self.push(result);
        Ok(())
    }
}

fn ordering_value(ordering: Ordering) -> i64 {
    match ordering {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

fn bad_operand(instr: &Instr) -> VmError {
    VmError::BadOperand {
        opcode: instr.opcode.name(),
        operand: format!("{:?}", instr.operand),
    }
}

fn int_operand(instr: &Instr) -> Result<i64, VmError> {
    instr.int_operand().ok_or_else(|| bad_operand(instr))
}

fn count_operand(instr: &Instr) -> Result<usize, VmError> {
    usize::try_from(int_operand(instr)?).map_err(|_| bad_operand(instr))
}

fn jump_target(instr: &Instr) -> Result<usize, VmError> {
    count_operand(instr)
}

fn regex_operand(instr: &Instr) -> Result<usize, VmError> {
    match instr.operand {
        Operand::Regex(i) => Ok(i),
        _ => Err(bad_operand(instr)),
    }
}

fn parse_radix(s: &str, base: i64) -> Result<i64, VmError> {
    let radix = match u32::try_from(base) {
        Ok(radix @ 2..=36) => radix,
        _ => return Err(VmError::Radix(base)),
    };
    i64::from_str_radix(s.trim(), radix)
        .map_err(|_| VmError::Conversion(format!("{:?} is not a base {} integer", s, radix)))
}

// ===== Time parsing =====

/// Reference layout elements and their strftime equivalents, longest first
const GO_LAYOUT: &[(&str, &str)] = &[
    ("January", "%B"),
    ("Monday", "%A"),
    ("2006", "%Y"),
    ("Z07:00", "%:z"),
    ("-07:00", "%:z"),
    ("-0700", "%z"),
    (".000000000", "%.9f"),
    (".000000", "%.6f"),
    (".000", "%.3f"),
    ("Jan", "%b"),
    ("Mon", "%a"),
    ("MST", "%Z"),
    ("_2", "%e"),
    ("01", "%m"),
    ("02", "%d"),
    ("03", "%I"),
    ("04", "%M"),
    ("05", "%S"),
    ("06", "%y"),
    ("15", "%H"),
    ("PM", "%p"),
];

/// Translate a reference-time layout (`2006-01-02T15:04:05Z07:00`) to strftime
fn go_layout_to_strftime(layout: &str) -> String {
    let mut out = String::with_capacity(layout.len() * 2);
    let mut rest = layout;
    'outer: while !rest.is_empty() {
        for (element, directive) in GO_LAYOUT {
            if let Some(tail) = rest.strip_prefix(element) {
                out.push_str(directive);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }
    out
}

fn has_year(format: &str) -> bool {
    ["%Y", "%y", "%G", "%g", "%C", "%s", "%c", "%+", "%D", "%F", "%x"]
        .iter()
        .any(|d| format.contains(d))
}

fn has_offset(format: &str) -> bool {
    format.contains("%z") || format.contains("%:z") || format.contains("%#z") || format.contains("%+")
}

/// Parse `value` with a strftime or reference-time layout
fn strptime(value: &str, layout: &str, options: &ExecutorOptions) -> Result<DateTime<Utc>, VmError> {
    let error = || VmError::Time {
        value: value.to_string(),
        layout: layout.to_string(),
    };

    let mut format = if layout.contains('%') {
        layout.to_string()
    } else {
        go_layout_to_strftime(layout)
    };
    let mut text = value.trim().to_string();

    if has_offset(&format) {
        if format.contains("%:z") && text.ends_with('Z') {
            text.pop();
            text.push_str("+00:00");
        }
        return DateTime::parse_from_str(&text, &format)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| error());
    }

    if !has_year(&format) && options.syslog_use_current_year {
        let year = Utc::now().with_timezone(&options.timezone).year();
        text = format!("{} {}", year, text);
        format = format!("%Y {}", format);
    }

    let naive = match NaiveDateTime::parse_from_str(&text, &format) {
        Ok(naive) => naive,
        Err(_) => NaiveDate::parse_from_str(&text, &format)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(error)?,
    };
    options
        .timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{CompileOptions, compile};
    use crate::program::MetricDesc;
    use crate::store::{Kind, ValueType};
    use proptest::prelude::*;

    fn load(source: &str) -> (Executor, Arc<Store>) {
        let object = compile("test.mtail", source, &CompileOptions::default()).unwrap();
        let store = Arc::new(Store::new());
        let exec = Executor::new(Arc::new(object), &store, ExecutorOptions::default()).unwrap();
        (exec, store)
    }

    fn feed(exec: &Executor, lines: &[&str]) -> Vec<bool> {
        lines
            .iter()
            .map(|l| exec.process_line(&LogLine::new("/var/log/test.log", *l)))
            .collect()
    }

    fn datum(exec: &Executor, metric: usize, labels: &[&str]) -> Arc<Datum> {
        let labels: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        exec.metrics()[metric].get_datum(&labels).unwrap()
    }

    fn raw_object(program: Vec<Instr>, metrics: Vec<MetricDesc>) -> Object {
        Object {
            name: "raw".to_string(),
            program,
            strings: vec![],
            regexps: vec![],
            metrics,
        }
    }

    fn gauge_desc(value_type: ValueType) -> MetricDesc {
        MetricDesc {
            name: "g".to_string(),
            exported_name: "g".to_string(),
            kind: Kind::Gauge,
            value_type,
            keys: vec![],
            buckets: vec![],
            limit: None,
            hidden: false,
        }
    }

    fn run_raw(object: Object) -> Result<Vec<Value>, VmError> {
        let store = Store::new();
        let exec = Executor::new(Arc::new(object), &store, ExecutorOptions::default()).unwrap();
        let line = LogLine::new("raw", "");
        let mut thread = Thread::new(&exec, &line);
        thread.run().map_err(|(_, e)| e)?;
        Ok(thread.stack)
    }

    fn ins(opcode: Opcode, operand: Operand) -> Instr {
        Instr::new(opcode, operand, 0)
    }

    #[test]
    fn test_line_counter() {
        let (exec, store) = load("counter lines_total\n/$/ {\n  lines_total++\n}\n");
        assert_eq!(feed(&exec, &["1", "2", "3"]), vec![true, true, true]);
        assert_eq!(datum(&exec, 0, &[]).get_int(), 3);
        assert!(store.find("lines_total", "test.mtail").is_some());
    }

    #[test]
    fn test_labelled_capture_sum() {
        let (exec, _) = load("counter bytes by host\n/^(\\w+) (\\d+)$/ {\n  bytes[$1] += $2\n}\n");
        feed(&exec, &["a 10", "b 5", "a 7", "no match here"]);
        assert_eq!(datum(&exec, 0, &["a"]).get_int(), 17);
        assert_eq!(datum(&exec, 0, &["b"]).get_int(), 5);
        assert_eq!(exec.metrics()[0].len(), 2);
    }

    #[test]
    fn test_otherwise_fires_only_without_match() {
        let (exec, _) = load("counter a\ncounter b\n/foo/ {\n  a++\n}\notherwise {\n  b++\n}\n");
        feed(&exec, &["foo", "bar", "baz"]);
        assert_eq!(datum(&exec, 0, &[]).get_int(), 1);
        assert_eq!(datum(&exec, 1, &[]).get_int(), 2);
    }

    #[test]
    fn test_else_branch() {
        let (exec, _) = load("counter a\ncounter b\n/x/ {\n  a++\n} else {\n  b++\n}\n");
        feed(&exec, &["x", "y", "y"]);
        assert_eq!(datum(&exec, 0, &[]).get_int(), 1);
        assert_eq!(datum(&exec, 1, &[]).get_int(), 2);
    }

    #[test]
    fn test_stop_ends_the_line() {
        let (exec, _) = load("counter a\n/x/ {\n  stop\n}\n/$/ {\n  a++\n}\n");
        feed(&exec, &["x", "y"]);
        assert_eq!(datum(&exec, 0, &[]).get_int(), 1);
    }

    #[test]
    fn test_numeric_comparison_on_capture() {
        let (exec, _) = load("counter errors\n/(?P<code>\\d+)/ {\n  $code >= 500 {\n    errors++\n  }\n}\n");
        feed(&exec, &["200", "503", "500", "404"]);
        assert_eq!(datum(&exec, 0, &[]).get_int(), 2);
    }

    #[test]
    fn test_string_capture_against_metric_compares_as_strings() {
        let (exec, _) = load(
            "counter hits\ngauge thresh\n/^(?P<v>[a-z0-9]+)$/ {\n  thresh = 9\n  $v > thresh {\n    hits++\n  }\n}\n",
        );
        feed(&exec, &["10"]);
        assert_eq!(datum(&exec, 0, &[]).get_int(), 0);
        feed(&exec, &["a"]);
        assert_eq!(datum(&exec, 0, &[]).get_int(), 1);
    }

    #[test]
    fn test_string_concatenation() {
        let (exec, _) = load("text last\n/(?P<a>\\w+) (?P<b>\\w+)/ {\n  last = $a + \"-\" + $b\n}\n");
        feed(&exec, &["foo bar"]);
        assert_eq!(datum(&exec, 0, &[]).get_string(), "foo-bar");
    }

    #[test]
    fn test_float_arithmetic() {
        let (exec, _) = load("gauge g\n/(\\d+\\.\\d+)/ {\n  g = $1 * 2.0\n}\n");
        feed(&exec, &["1.25"]);
        assert_eq!(datum(&exec, 0, &[]).get_float(), 2.5);
    }

    #[test]
    fn test_histogram_observes() {
        let (exec, _) = load("histogram h buckets 1, 2, 4\n/(\\d+)/ {\n  h = $1\n}\n");
        feed(&exec, &["0", "1", "3", "5"]);
        let buckets = datum(&exec, 0, &[]).buckets().unwrap();
        assert_eq!(buckets.counts, vec![1, 1, 1, 1]);
        assert_eq!(buckets.count, 4);
        assert_eq!(buckets.sum, 9.0);
    }

    #[test]
    fn test_del_removes_labels() {
        let source = "counter c by k\n\
                      /add (\\w+)/ {\n  c[$1]++\n}\n\
                      /del (\\w+)/ {\n  del c[$1]\n}\n";
        let (exec, _) = load(source);
        feed(&exec, &["add x", "add y", "del x"]);
        let sets = exec.metrics()[0].label_sets();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].labels.get("k").map(String::as_str), Some("y"));
    }

    #[test]
    fn test_expire_sets_expiry() {
        let source = "counter c by k\n/(\\w+)/ {\n  c[$1]++\n  del c[$1] after 1h\n}\n";
        let (exec, store) = load(source);
        feed(&exec, &["x"]);
        assert_eq!(store.gc(), 0);
        assert_eq!(exec.metrics()[0].len(), 1);
        let far_future = Utc::now() + chrono::TimeDelta::hours(2);
        assert_eq!(exec.metrics()[0].gc(far_future), 1);
    }

    #[test]
    fn test_builtins() {
        let source = "text f\ngauge n\ngauge hex\ntext s\n\
                      /(\\w+)/ {\n  f = tolower(getfilename())\n  n = len($1)\n  hex = strtol($1, 16)\n  s = subst(\"f\", \"F\", $1)\n}\n";
        let (exec, _) = load(source);
        let line = LogLine::new("/LOG/A.log", "ff");
        assert!(exec.process_line(&line));
        assert_eq!(datum(&exec, 0, &[]).get_string(), "/log/a.log");
        assert_eq!(datum(&exec, 1, &[]).get_int(), 2);
        assert_eq!(datum(&exec, 2, &[]).get_int(), 255);
        assert_eq!(datum(&exec, 3, &[]).get_string(), "FF");
    }

    #[test]
    fn test_regex_subst() {
        let (exec, _) = load("text t\n/(.*)/ {\n  t = subst(/\\s+/, \"_\", $1)\n}\n");
        feed(&exec, &["a  b   c"]);
        assert_eq!(datum(&exec, 0, &[]).get_string(), "a_b_c");
    }

    #[test]
    fn test_strptime_sets_thread_time() {
        let source = "gauge t\n/^(\\S+ \\S+) / {\n  strptime($1, \"%Y-%m-%d %H:%M:%S\")\n  t = timestamp()\n}\n";
        let (exec, _) = load(source);
        assert!(exec.process_line(&LogLine::new("log", "2024-03-01 10:00:00 hello")));
        let d = datum(&exec, 0, &[]);
        assert_eq!(d.get_int(), 1709287200);
        assert_eq!(d.time().timestamp(), 1709287200);
    }

    #[test]
    fn test_settime() {
        let (exec, _) = load("gauge t\n/(\\d+)/ {\n  settime($1)\n  t = timestamp()\n}\n");
        feed(&exec, &["1343124840"]);
        assert_eq!(datum(&exec, 0, &[]).get_int(), 1343124840);
    }

    #[test]
    fn test_conversion_failure_terminates_only_that_line() {
        let (exec, _) = load("gauge g\n/(?P<v>\\S+)/ {\n  g = int($v)\n}\n");
        assert_eq!(feed(&exec, &["abc", "42"]), vec![false, true]);
        assert_eq!(datum(&exec, 0, &[]).get_int(), 42);
    }

    #[test]
    fn test_runtime_error_carries_source_line() {
        let (exec, _) = load("gauge g\n/(?P<v>\\S+)/ {\n  g = int($v)\n}\n");
        let err = exec.execute(&LogLine::new("log", "abc")).unwrap_err();
        assert_eq!(err.program, "test.mtail");
        assert_eq!(err.line, 3);
        assert_eq!(err.opcode, Opcode::S2i);
        assert!(matches!(err.error, VmError::Conversion(_)));
    }

    #[test]
    fn test_stack_underflow() {
        let result = run_raw(raw_object(vec![ins(Opcode::Iadd, Operand::None)], vec![]));
        assert!(matches!(result, Err(VmError::StackUnderflow)));
    }

    #[test]
    fn test_integer_division_by_zero() {
        let program = vec![
            ins(Opcode::Push, Operand::Int(1)),
            ins(Opcode::Push, Operand::Int(0)),
            ins(Opcode::Idiv, Operand::None),
        ];
        let result = run_raw(raw_object(program, vec![]));
        assert!(matches!(result, Err(VmError::DivisionByZero)));
    }

    #[test]
    fn test_dynamic_compare() {
        let cases = [
            (Value::from("10"), Value::Int(9), 1, true),
            (Value::from("abc"), Value::from("abd"), -1, true),
            (Value::from("2"), Value::Float(2.0), 0, true),
            (Value::from("x"), Value::Int(1), 0, false),
        ];
        for (a, b, op, expected) in cases {
            let store = Store::new();
            let exec =
                Executor::new(Arc::new(raw_object(vec![], vec![])), &store, ExecutorOptions::default())
                    .unwrap();
            let line = LogLine::new("raw", "");
            let mut thread = Thread::new(&exec, &line);
            thread.stack = vec![a, b];
            thread.compare(&ins(Opcode::Cmp, Operand::Int(op))).unwrap();
            assert_eq!(thread.stack.pop().unwrap().as_bool().unwrap(), expected);
        }
    }

    #[test]
    fn test_go_layout_translation() {
        assert_eq!(
            go_layout_to_strftime("2006-01-02T15:04:05Z07:00"),
            "%Y-%m-%dT%H:%M:%S%:z"
        );
        assert_eq!(go_layout_to_strftime("Jan _2 15:04:05"), "%b %e %H:%M:%S");
        assert_eq!(go_layout_to_strftime("02/Jan/2006:15:04:05 -0700"), "%d/%b/%Y:%H:%M:%S %z");
    }

    #[test]
    fn test_strptime_layouts() {
        let options = ExecutorOptions::default();
        let t = strptime("2012-07-24T10:14:00Z", "2006-01-02T15:04:05Z07:00", &options).unwrap();
        assert_eq!(t.timestamp(), 1343124840);

        let t = strptime("24/Jul/2012:12:14:00 +0200", "02/Jan/2006:15:04:05 -0700", &options).unwrap();
        assert_eq!(t.timestamp(), 1343124840);

        let t = strptime("2012-07-24", "%Y-%m-%d", &options).unwrap();
        assert_eq!(t.timestamp(), 1343088000);

        assert!(strptime("yesterday", "%Y-%m-%d", &options).is_err());
    }

    #[test]
    fn test_strptime_timezone() {
        let options = ExecutorOptions {
            timezone: chrono_tz::Europe::Berlin,
            ..Default::default()
        };
        let t = strptime("2012-07-24 12:14:00", "%Y-%m-%d %H:%M:%S", &options).unwrap();
        assert_eq!(t.timestamp(), 1343124840);
    }

    #[test]
    fn test_strptime_current_year() {
        let options = ExecutorOptions::default();
        let t = strptime("Jul 24 10:14:00", "Jan _2 15:04:05", &options).unwrap();
        assert_eq!(t.year(), Utc::now().year());

        let options = ExecutorOptions {
            syslog_use_current_year: false,
            ..Default::default()
        };
        assert!(strptime("Jul 24 10:14:00", "Jan _2 15:04:05", &options).is_err());
    }

    proptest! {
        #[test]
        fn prop_int_float_int_round_trip(n in -(1i64 << 53)..(1i64 << 53)) {
            let program = vec![
                ins(Opcode::Push, Operand::Int(n)),
                ins(Opcode::I2f, Operand::None),
                ins(Opcode::F2i, Operand::None),
            ];
            let stack = run_raw(raw_object(program, vec![])).unwrap();
            prop_assert_eq!(stack[0].as_int().unwrap(), n);
        }

        #[test]
        fn prop_iset_iget_round_trip(n in any::<i64>()) {
            let program = vec![
                ins(Opcode::Mload, Operand::Int(0)),
                ins(Opcode::Dload, Operand::Int(0)),
                ins(Opcode::Push, Operand::Int(n)),
                ins(Opcode::Iset, Operand::None),
                ins(Opcode::Mload, Operand::Int(0)),
                ins(Opcode::Dload, Operand::Int(0)),
                ins(Opcode::Iget, Operand::None),
            ];
            let stack = run_raw(raw_object(program, vec![gauge_desc(ValueType::Int)])).unwrap();
            prop_assert_eq!(stack.len(), 1);
            prop_assert_eq!(stack[0].as_int().unwrap(), n);
        }
    }
}
