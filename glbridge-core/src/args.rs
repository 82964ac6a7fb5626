//! Named argument maps passed by script code to host operations.
//!
//! Script numbers arrive as doubles, so integer accessors accept any
//! integral float and float accessors accept integers.

use std::collections::BTreeMap;

use crate::buffer::ScriptBuffer;
use crate::error::{BridgeError, BridgeResult};

/// One argument value.
#[derive(Debug, Clone)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Buffer(ScriptBuffer),
}

impl ArgValue {
    fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Null => "null",
            ArgValue::Bool(_) => "boolean",
            ArgValue::Int(_) | ArgValue::Float(_) => "number",
            ArgValue::Str(_) => "string",
            ArgValue::Buffer(_) => "buffer",
        }
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        ArgValue::Int(v.into())
    }
}

impl From<u32> for ArgValue {
    fn from(v: u32) -> Self {
        ArgValue::Int(v.into())
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<f32> for ArgValue {
    fn from(v: f32) -> Self {
        ArgValue::Float(v.into())
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl From<ScriptBuffer> for ArgValue {
    fn from(v: ScriptBuffer) -> Self {
        ArgValue::Buffer(v)
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(ArgValue::Null, Into::into)
    }
}

/// Argument map for one host call.
#[derive(Debug, Clone, Default)]
pub struct Args(BTreeMap<String, ArgValue>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ArgValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Build from a JSON object of primitives (buffers cannot travel as JSON).
    pub fn from_json(value: &serde_json::Value) -> BridgeResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| BridgeError::invalid_argument("arguments must be a JSON object"))?;
        let mut args = Args::new();
        for (name, v) in object {
            let arg = match v {
                serde_json::Value::Null => ArgValue::Null,
                serde_json::Value::Bool(b) => ArgValue::Bool(*b),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => ArgValue::Int(i),
                    None => ArgValue::Float(n.as_f64().unwrap_or(f64::NAN)),
                },
                serde_json::Value::String(s) => ArgValue::Str(s.clone()),
                other => {
                    return Err(BridgeError::invalid_argument(format!(
                        "argument `{name}` has unsupported JSON type: {other}"
                    )))
                }
            };
            args.0.insert(name.clone(), arg);
        }
        Ok(args)
    }

    fn required(&self, name: &str) -> BridgeResult<&ArgValue> {
        match self.0.get(name) {
            Some(ArgValue::Null) | None => Err(BridgeError::invalid_argument(format!(
                "missing argument `{name}`"
            ))),
            Some(v) => Ok(v),
        }
    }

    fn mismatch(name: &str, expected: &str, got: &ArgValue) -> BridgeError {
        BridgeError::invalid_argument(format!(
            "argument `{name}` must be {expected}, got {}",
            got.type_name()
        ))
    }

    pub fn int(&self, name: &str) -> BridgeResult<i64> {
        match self.required(name)? {
            ArgValue::Int(i) => Ok(*i),
            ArgValue::Float(f) if f.is_finite() && f.fract() == 0.0 => Ok(*f as i64),
            other => Err(Self::mismatch(name, "an integer", other)),
        }
    }

    pub fn opt_int(&self, name: &str) -> BridgeResult<Option<i64>> {
        match self.0.get(name) {
            Some(ArgValue::Null) | None => Ok(None),
            Some(_) => self.int(name).map(Some),
        }
    }

    /// Integer in `0..=u32::MAX`.
    pub fn uint(&self, name: &str) -> BridgeResult<u32> {
        let value = self.int(name)?;
        u32::try_from(value).map_err(|_| {
            BridgeError::invalid_argument(format!("argument `{name}` out of range: {value}"))
        })
    }

    pub fn opt_uint(&self, name: &str) -> BridgeResult<Option<u32>> {
        match self.0.get(name) {
            Some(ArgValue::Null) | None => Ok(None),
            Some(_) => self.uint(name).map(Some),
        }
    }

    /// Signed integer that must fit `i32`.
    pub fn int32(&self, name: &str) -> BridgeResult<i32> {
        let value = self.int(name)?;
        i32::try_from(value).map_err(|_| {
            BridgeError::invalid_argument(format!("argument `{name}` out of range: {value}"))
        })
    }

    pub fn float(&self, name: &str) -> BridgeResult<f64> {
        match self.required(name)? {
            ArgValue::Float(f) if !f.is_nan() => Ok(*f),
            ArgValue::Int(i) => Ok(*i as f64),
            other => Err(Self::mismatch(name, "a number", other)),
        }
    }

    pub fn bool(&self, name: &str) -> BridgeResult<bool> {
        match self.required(name)? {
            ArgValue::Bool(b) => Ok(*b),
            other => Err(Self::mismatch(name, "a boolean", other)),
        }
    }

    pub fn str(&self, name: &str) -> BridgeResult<&str> {
        match self.required(name)? {
            ArgValue::Str(s) => Ok(s),
            other => Err(Self::mismatch(name, "a string", other)),
        }
    }

    pub fn buffer(&self, name: &str) -> BridgeResult<&ScriptBuffer> {
        match self.required(name)? {
            ArgValue::Buffer(b) => Ok(b),
            other => Err(Self::mismatch(name, "a typed array", other)),
        }
    }

    pub fn opt_buffer(&self, name: &str) -> BridgeResult<Option<&ScriptBuffer>> {
        match self.0.get(name) {
            Some(ArgValue::Null) | None => Ok(None),
            Some(_) => self.buffer(name).map(Some),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        !matches!(self.0.get(name), Some(ArgValue::Null) | None)
    }
}
