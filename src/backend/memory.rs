//! In-process backend: a tiny key-value interpreter with fault injection.
//!
//! Used as the secondary target in demos and as the test double for the
//! routing and replication paths. Every endpoint descriptor gets its own key
//! space so tests can tell which endpoint served a call.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::traits::{Backend, BackendError};
use crate::operation::{value_to_arg, Operation};

pub struct InMemoryBackend {
    data: DashMap<(String, String), Value>,
    /// Ordered log of operations that succeeded, per descriptor
    applied: Mutex<Vec<(String, Operation)>>,
    calls: DashMap<String, u64>,
    faults: DashMap<String, BackendError>,
    evictions: DashMap<String, u64>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            applied: Mutex::new(Vec::new()),
            calls: DashMap::new(),
            faults: DashMap::new(),
            evictions: DashMap::new(),
        }
    }

    /// Make every call against `descriptor` fail with `error` until healed.
    pub fn fail(&self, descriptor: &str, error: BackendError) {
        self.faults.insert(descriptor.to_string(), error);
    }

    pub fn heal(&self, descriptor: &str) {
        self.faults.remove(descriptor);
    }

    /// Calls received for `descriptor`, failed ones included.
    #[must_use]
    pub fn calls(&self, descriptor: &str) -> u64 {
        self.calls.get(descriptor).map(|c| *c).unwrap_or(0)
    }

    #[must_use]
    pub fn evictions(&self, descriptor: &str) -> u64 {
        self.evictions.get(descriptor).map(|c| *c).unwrap_or(0)
    }

    /// Operations that succeeded against `descriptor`, in order.
    #[must_use]
    pub fn applied_on(&self, descriptor: &str) -> Vec<Operation> {
        self.applied
            .lock()
            .iter()
            .filter(|(d, _)| d == descriptor)
            .map(|(_, op)| op.clone())
            .collect()
    }

    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.applied.lock().len()
    }

    /// Read a key directly, bypassing the call log.
    pub fn value(&self, descriptor: &str, key: &str) -> Option<Value> {
        self.data
            .get(&(descriptor.to_string(), key.to_string()))
            .map(|v| v.value().clone())
    }

    fn interpret(&self, descriptor: &str, op: &Operation) -> Result<Value, BackendError> {
        let key = |idx: usize| -> Result<(String, String), BackendError> {
            op.arg_str(idx)
                .map(|k| (descriptor.to_string(), k))
                .ok_or_else(|| BackendError::NonRecoverable(format!("ERR wrong number of arguments for '{}'", op.name)))
        };

        match op.command().as_str() {
            "PING" => Ok(json!("PONG")),
            "GET" => Ok(self.data.get(&key(0)?).map(|v| v.value().clone()).unwrap_or(Value::Null)),
            "SET" => {
                let value = op
                    .args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| BackendError::NonRecoverable("ERR wrong number of arguments for 'SET'".into()))?;
                self.data.insert(key(0)?, value);
                Ok(json!("OK"))
            }
            "DEL" => {
                let removed = op
                    .args
                    .iter()
                    .filter(|k| self.data.remove(&(descriptor.to_string(), value_to_arg(k))).is_some())
                    .count();
                Ok(json!(removed))
            }
            "EXISTS" => Ok(json!(u8::from(self.data.contains_key(&key(0)?)))),
            "INCR" => {
                let k = key(0)?;
                let mut entry = self.data.entry(k).or_insert(json!(0));
                let current = entry
                    .value()
                    .as_i64()
                    .or_else(|| entry.value().as_str().and_then(|s| s.parse().ok()))
                    .ok_or_else(|| BackendError::NonRecoverable("ERR value is not an integer".into()))?;
                *entry.value_mut() = json!(current + 1);
                Ok(json!(current + 1))
            }
            // Everything else is accepted and only recorded.
            _ => Ok(Value::Null),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn execute(&self, descriptor: &str, op: &Operation) -> Result<Value, BackendError> {
        *self.calls.entry(descriptor.to_string()).or_insert(0) += 1;

        if let Some(fault) = self.faults.get(descriptor) {
            return Err(fault.value().clone());
        }

        let result = self.interpret(descriptor, op)?;
        self.applied.lock().push((descriptor.to_string(), op.clone()));
        Ok(result)
    }

    fn evict(&self, descriptor: &str) {
        *self.evictions.entry(descriptor.to_string()).or_insert(0) += 1;
    }
}
