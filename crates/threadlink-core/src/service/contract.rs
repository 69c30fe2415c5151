//! Optional method signatures a Service validates calls against.

use crate::error::{Result, ThreadsError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Dynamic type of a call argument.
///
/// Arrays and `null` count as `object`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    String,
    Number,
    Boolean,
    Object,
    Undefined,
}

impl ArgType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => ArgType::String,
            Value::Number(_) => ArgType::Number,
            Value::Bool(_) => ArgType::Boolean,
            Value::Null | Value::Array(_) | Value::Object(_) => ArgType::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArgType::String => "string",
            ArgType::Number => "number",
            ArgType::Boolean => "boolean",
            ArgType::Object => "object",
            ArgType::Undefined => "undefined",
        }
    }
}

/// Method name to positional argument types.
///
/// Serialized as `{ "methods": { "add": ["number", "number"] } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    #[serde(default)]
    pub methods: HashMap<String, Vec<ArgType>>,
}

impl Contract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, name: impl Into<String>, signature: impl Into<Vec<ArgType>>) -> Self {
        self.methods.insert(name.into(), signature.into());
        self
    }

    /// Validate a call before it runs.
    pub fn check(&self, name: &str, args: &[Value]) -> Result<()> {
        let signature = self
            .methods
            .get(name)
            .ok_or_else(|| ThreadsError::MethodNotInContract {
                name: name.to_string(),
            })?;

        if args.len() != signature.len() {
            return Err(ThreadsError::ArityMismatch {
                name: name.to_string(),
                expected: signature.len(),
                actual: args.len(),
            });
        }

        for (position, (arg, expected)) in args.iter().zip(signature).enumerate() {
            let actual = ArgType::of(arg);
            if actual != *expected {
                return Err(ThreadsError::ArgumentTypeMismatch {
                    name: name.to_string(),
                    position,
                    expected: expected.as_str().to_string(),
                    actual: actual.as_str().to_string(),
                });
            }
        }
        Ok(())
    }
}
