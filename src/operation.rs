// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operations and their read/write classification.
//!
//! An [`Operation`] is a command name plus positional arguments. For the
//! key-value dialect the name is the command (`SET`, `HGETALL`, ...); for the
//! relational dialect it is the SQL text and the arguments are bind parameters.
//!
//! On disk an operation is written as `{"Args":[name, arg, ...]}`.
//!
//! ```
//! use replica_router::{Operation, Classification, Dialect};
//! use serde_json::json;
//!
//! let op = Operation::new("SET", vec![json!("k"), json!("v")]);
//! assert_eq!(serde_json::to_string(&op).unwrap(), r#"{"Args":["SET","k","v"]}"#);
//!
//! let class = Classification::infer(&op, Dialect::KeyValue);
//! assert!(class.is_write());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::replication::classify;

/// One command against a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireOp", try_from = "WireOp")]
pub struct Operation {
    pub name: String,
    pub args: Vec<Value>,
}

impl Operation {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self { name: name.into(), args }
    }

    /// Operation without arguments.
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Upper-cased command name, used by classification.
    #[must_use]
    pub fn command(&self) -> String {
        self.name.trim().to_ascii_uppercase()
    }

    /// Argument rendered the way a text protocol would send it.
    #[must_use]
    pub fn arg_str(&self, idx: usize) -> Option<String> {
        self.args.get(idx).map(value_to_arg)
    }
}

/// Render a JSON value as a protocol argument.
pub fn value_to_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Serialize, Deserialize)]
struct WireOp {
    #[serde(rename = "Args")]
    args: Vec<Value>,
}

impl From<Operation> for WireOp {
    fn from(op: Operation) -> Self {
        let mut args = Vec::with_capacity(op.args.len() + 1);
        args.push(Value::String(op.name));
        args.extend(op.args);
        Self { args }
    }
}

impl TryFrom<WireOp> for Operation {
    type Error = String;

    fn try_from(wire: WireOp) -> Result<Self, Self::Error> {
        let mut args = wire.args.into_iter();
        match args.next() {
            Some(Value::String(name)) if !name.is_empty() => Ok(Self {
                name,
                args: args.collect(),
            }),
            Some(other) => Err(format!("command name must be a non-empty string, got {other}")),
            None => Err("empty Args array".to_string()),
        }
    }
}

/// Which backend language an operation is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    KeyValue,
    Relational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Routing-relevant facts about one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub access: Access,
    pub in_transaction: bool,
    pub read_only_transaction: bool,
    /// Groups calls belonging to one logical request or connection.
    pub correlation_id: i64,
}

impl Classification {
    pub fn read(correlation_id: i64) -> Self {
        Self {
            access: Access::Read,
            in_transaction: false,
            read_only_transaction: false,
            correlation_id,
        }
    }

    pub fn write(correlation_id: i64) -> Self {
        Self {
            access: Access::Write,
            ..Self::read(correlation_id)
        }
    }

    /// Classify using the dialect's write rules.
    pub fn infer(op: &Operation, dialect: Dialect) -> Self {
        if classify::is_write(op, dialect) {
            Self::write(0)
        } else {
            Self::read(0)
        }
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: i64) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    #[must_use]
    pub fn in_transaction(mut self, read_only: bool) -> Self {
        self.in_transaction = true;
        self.read_only_transaction = read_only;
        self
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.access == Access::Write
    }

    /// True when the call must stay on a group's primary.
    #[must_use]
    pub fn pins_primary(&self) -> bool {
        self.is_write() || (self.in_transaction && !self.read_only_transaction)
    }
}
