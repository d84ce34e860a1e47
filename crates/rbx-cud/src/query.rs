//! Conditions used by selectors and `ifContains` guards.
//!
//! A [`Query`] is a JSON condition document:
//!
//! - a literal matches an equal value: `5`, `"abc"`
//! - an object whose keys start with `$` applies operators, all of which
//!   must hold: `{"$gte": 10, "$lt": 20}`
//! - any other object applies a condition per field of an object value:
//!   `{"age": {"$gt": 18}, "name": "Ann"}`
//!
//! Supported operators: `$eq $ne $gt $gte $lt $lte $in $nin $contains
//! $startsWith $endsWith $exists $not $and $or`. An unknown operator never
//! matches.

use rbx_core::compare_values;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A single condition document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(pub Value);

impl Query {
    pub fn new(condition: Value) -> Self {
        Self(condition)
    }

    /// Check the condition against a value.
    pub fn matches(&self, target: &Value) -> bool {
        eval(&self.0, Some(target))
    }
}

/// A condition on the key and/or the value of a component entry.
///
/// A missing part always matches, so `{}` matches every entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Query>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Query>,
}

impl DbQuery {
    /// Match on the entry key only.
    pub fn key(condition: Value) -> Self {
        Self {
            key: Some(Query(condition)),
            value: None,
        }
    }

    /// Match on the entry value only.
    pub fn value(condition: Value) -> Self {
        Self {
            key: None,
            value: Some(Query(condition)),
        }
    }

    pub fn matches(&self, key: &str, value: &Value) -> bool {
        let key_ok = match &self.key {
            Some(query) => query.matches(&Value::String(key.to_owned())),
            None => true,
        };
        key_ok && self.value.as_ref().map_or(true, |query| query.matches(value))
    }
}

fn is_operator_doc(condition: &serde_json::Map<String, Value>) -> bool {
    condition.keys().any(|k| k.starts_with('$'))
}

fn eval(condition: &Value, target: Option<&Value>) -> bool {
    match condition {
        Value::Object(ops) if is_operator_doc(ops) => {
            ops.iter().all(|(op, arg)| eval_operator(op, arg, target))
        }
        Value::Object(fields) => match target {
            Some(Value::Object(obj)) => fields
                .iter()
                .all(|(field, condition)| eval(condition, obj.get(field))),
            _ => false,
        },
        literal => target == Some(literal),
    }
}

/// Ordering between two values of the same scalar kind.
fn ordered(target: Option<&Value>, arg: &Value) -> Option<Ordering> {
    let target = target?;
    let comparable = matches!(
        (target, arg),
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_))
    );
    comparable.then(|| compare_values(target, arg))
}

fn eval_operator(op: &str, arg: &Value, target: Option<&Value>) -> bool {
    match op {
        "$eq" => target == Some(arg),
        "$ne" => target != Some(arg),
        "$gt" => ordered(target, arg) == Some(Ordering::Greater),
        "$gte" => matches!(ordered(target, arg), Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => ordered(target, arg) == Some(Ordering::Less),
        "$lte" => matches!(ordered(target, arg), Some(Ordering::Less | Ordering::Equal)),
        "$in" => match (arg, target) {
            (Value::Array(options), Some(value)) => options.contains(value),
            _ => false,
        },
        "$nin" => match (arg, target) {
            (Value::Array(options), Some(value)) => !options.contains(value),
            (Value::Array(_), None) => true,
            _ => false,
        },
        "$contains" => match (target, arg) {
            (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
            (Some(Value::Array(items)), needle) => items.contains(needle),
            _ => false,
        },
        "$startsWith" => match (target, arg) {
            (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        "$endsWith" => match (target, arg) {
            (Some(Value::String(s)), Value::String(suffix)) => s.ends_with(suffix.as_str()),
            _ => false,
        },
        "$exists" => arg.as_bool().map_or(false, |exists| exists == target.is_some()),
        "$not" => !eval(arg, target),
        "$and" => match arg {
            Value::Array(conditions) => conditions.iter().all(|c| eval(c, target)),
            _ => false,
        },
        "$or" => match arg {
            Value::Array(conditions) => conditions.iter().any(|c| eval(c, target)),
            _ => false,
        },
        _ => false,
    }
}
