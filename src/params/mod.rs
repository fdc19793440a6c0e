//! Per-quantity value state machines for the conductor.
//!
//! Every controllable quantity owns a [`ParameterValue`]: the value it takes
//! this shot plus the queue of values future shots will iterate through. The
//! [`ValueType`] policy decides how reads and advances treat the stored JSON
//! value. Queues are ordinary JSON arrays, so experiment clients can hand the
//! conductor either a scalar or a scan list without any schema change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Read/advance policy for a parameter's stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// A scalar quantity. A stored array is a queue of scalars; an exhausted
    /// queue leaves its last value in place (the sticky tail).
    #[default]
    Single,
    /// A quantity whose value is itself a list (e.g. a sequence-name list).
    /// A stored array-of-arrays is a queue; same sticky-tail behavior.
    List,
    /// One-shot commands: read once, then cleared to null by `advance`.
    Once,
    /// Measurement/logging outputs: read-only passthrough, no queue.
    Data,
}

/// A parameter's stored value under its [`ValueType`] policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    value_type: ValueType,
    stored: Value,
}

impl ParameterValue {
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            stored: Value::Null,
        }
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// The raw stored value, queue and all.
    pub fn raw(&self) -> &Value {
        &self.stored
    }

    pub fn set(&mut self, value: Value) {
        self.stored = value;
    }

    /// The value for the current shot.
    pub fn current(&self) -> Value {
        match self.value_type {
            ValueType::Single => match &self.stored {
                Value::Array(queue) => queue.first().cloned().unwrap_or(Value::Null),
                other => other.clone(),
            },
            ValueType::List => match &self.stored {
                Value::Array(queue) if queue.first().is_some_and(Value::is_array) => {
                    queue[0].clone()
                }
                other => other.clone(),
            },
            ValueType::Once | ValueType::Data => self.stored.clone(),
        }
    }

    /// Step to the next shot's value. Popping the head of a queue that then
    /// holds a single entry keeps that entry queued; popping the last entry
    /// makes it the steady (sticky) value.
    pub fn advance(&mut self) {
        match self.value_type {
            ValueType::Single => {
                if let Value::Array(queue) = &mut self.stored {
                    if queue.is_empty() {
                        return;
                    }
                    let old = queue.remove(0);
                    if queue.is_empty() {
                        self.stored = old;
                    }
                }
            }
            ValueType::List => {
                if let Value::Array(queue) = &mut self.stored {
                    if !queue.first().is_some_and(Value::is_array) {
                        return;
                    }
                    let old = queue.remove(0);
                    if queue.is_empty() {
                        self.stored = old;
                    }
                }
            }
            ValueType::Once => self.stored = Value::Null,
            ValueType::Data => {}
        }
    }

    /// Queue depth minus one, or `None` when the stored value is not
    /// queue-shaped for this policy.
    pub fn remaining(&self) -> Option<usize> {
        match self.value_type {
            ValueType::Single => match &self.stored {
                Value::Array(queue) if !queue.is_empty() => Some(queue.len() - 1),
                _ => None,
            },
            ValueType::List => match &self.stored {
                Value::Array(queue) if queue.first().is_some_and(Value::is_array) => {
                    Some(queue.len().saturating_sub(1))
                }
                _ => None,
            },
            ValueType::Once | ValueType::Data => None,
        }
    }

    /// Shots left to run from this value, counting the current head.
    pub fn pending_runs(&self) -> usize {
        self.remaining().map_or(0, |r| r + 1)
    }

    /// Collapse a queue to its current value, used when an experiment is
    /// stopped mid-scan.
    pub fn collapse(&mut self) {
        self.stored = self.current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single(value: Value) -> ParameterValue {
        let mut p = ParameterValue::new(ValueType::Single);
        p.set(value);
        p
    }

    #[test]
    fn single_queue_iterates_then_sticks() {
        let mut p = single(json!([1, 2, 3]));
        assert_eq!(p.current(), json!(1));
        p.advance();
        assert_eq!(p.current(), json!(2));
        p.advance();
        p.advance();
        // queue exhausted; the last value sticks
        assert_eq!(p.current(), json!(3));
        assert_eq!(p.raw(), &json!(3));
        p.advance();
        assert_eq!(p.current(), json!(3));
    }

    #[test]
    fn single_scalar_passes_through() {
        let mut p = single(json!(2.5));
        assert_eq!(p.current(), json!(2.5));
        p.advance();
        assert_eq!(p.current(), json!(2.5));
        assert_eq!(p.remaining(), None);
    }

    #[test]
    fn list_queue_is_one_level_deeper() {
        let mut p = ParameterValue::new(ValueType::List);
        p.set(json!([["a", "b"], ["c"]]));
        assert_eq!(p.current(), json!(["a", "b"]));
        p.advance();
        assert_eq!(p.current(), json!(["c"]));
        p.advance();
        // sticky: the final list keeps returning
        assert_eq!(p.current(), json!(["c"]));
    }

    #[test]
    fn flat_list_value_is_not_a_queue() {
        let mut p = ParameterValue::new(ValueType::List);
        p.set(json!(["a", "b"]));
        assert_eq!(p.current(), json!(["a", "b"]));
        p.advance();
        assert_eq!(p.current(), json!(["a", "b"]));
        assert_eq!(p.remaining(), None);
    }

    #[test]
    fn once_clears_after_advance() {
        let mut p = ParameterValue::new(ValueType::Once);
        p.set(json!("fire"));
        assert_eq!(p.current(), json!("fire"));
        p.advance();
        assert_eq!(p.current(), Value::Null);
    }

    #[test]
    fn data_is_readonly_passthrough() {
        let mut p = ParameterValue::new(ValueType::Data);
        p.set(json!(17.2));
        p.advance();
        assert_eq!(p.current(), json!(17.2));
        assert_eq!(p.remaining(), None);
    }

    #[test]
    fn remaining_counts_the_queue_tail() {
        assert_eq!(single(json!([1, 2, 3])).remaining(), Some(2));
        assert_eq!(single(json!([1])).remaining(), Some(0));
        assert_eq!(single(json!(1)).remaining(), None);
    }

    #[test]
    fn pending_runs_counts_the_head() {
        assert_eq!(single(json!([1, 2, 3])).pending_runs(), 3);
        assert_eq!(single(json!([1])).pending_runs(), 1);
        assert_eq!(single(json!(1)).pending_runs(), 0);
    }

    #[test]
    fn collapse_freezes_the_current_value() {
        let mut p = single(json!([1, 2, 3]));
        p.collapse();
        assert_eq!(p.raw(), &json!(1));
        assert_eq!(p.remaining(), None);
    }
}
