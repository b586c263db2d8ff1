use crate::executor::VmError;
use crate::store::Datum;
use chrono::TimeDelta;
use std::fmt;
use std::sync::Arc;

/// Runtime value on the hogtail VM stack
#[derive(Clone)]
pub enum Value {
    /// Boolean value
    Bool(bool),

    /// 64-bit signed integer
    Int(i64),

    /// 64-bit floating point number
    Float(f64),

    /// UTF-8 string
    String(String),

    /// Index into the program's regex table
    Pattern(usize),

    Duration(TimeDelta),

    /// Index into the program's metric table, pushed by `Mload`
    Metric(usize),

    /// A resolved label tuple, pushed by `Dload`
    Datum(Arc<Datum>),
}

impl Value {
    /// Integer view; numeric strings are parsed
    pub fn as_int(&self) -> Result<i64, VmError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Float(f) => Ok(*f as i64),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| VmError::Conversion(format!("{:?} is not an integer", s))),
            _ => Err(self.type_error("int")),
        }
    }

    /// Float view; numeric strings are parsed
    pub fn as_float(&self) -> Result<f64, VmError> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| VmError::Conversion(format!("{:?} is not a number", s))),
            _ => Err(self.type_error("float")),
        }
    }

    pub fn as_str(&self) -> Result<&str, VmError> {
        match self {
            Value::String(s) => Ok(s),
            _ => Err(self.type_error("string")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, VmError> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(self.type_error("bool")),
        }
    }

    /// Text used for label values and string conversions
    pub fn to_label(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Get the type name of this value for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Pattern(_) => "pattern",
            Value::Duration(_) => "duration",
            Value::Metric(_) => "metric",
            Value::Datum(_) => "datum",
        }
    }

    pub fn type_error(&self, expected: &'static str) -> VmError {
        VmError::Type {
            expected,
            found: self.type_name(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(fl) => write!(f, "Float({})", fl),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Pattern(i) => write!(f, "Pattern({})", i),
            Value::Duration(d) => write!(f, "Duration({})", d),
            Value::Metric(i) => write!(f, "Metric({})", i),
            Value::Datum(d) => write!(f, "Datum({})", d.value_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "{}", s),
            Value::Pattern(i) => write!(f, "<pattern {}>", i),
            Value::Duration(d) => write!(f, "{}", d),
            Value::Metric(i) => write!(f, "<metric {}>", i),
            Value::Datum(d) => write!(f, "{}", d.value_string()),
        }
    }
}

// Implement From for easy construction
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
