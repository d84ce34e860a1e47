//! Runtime-configurable behaviour of keyed components: the comparator that
//! keeps a keyed array sorted and the value merger used when two snapshots
//! carry a value for the same key.

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

type CompareFn = dyn Fn(&Value, &Value) -> Ordering + Send + Sync;
type MergeFn = dyn Fn(&Value, &Value) -> Value + Send + Sync;

/// Total order over plain JSON values used by the built-in comparators.
///
/// Numbers compare numerically, strings lexicographically, booleans with
/// `false < true`. Values of different kinds are ordered by kind:
/// null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(a, b)| compare_values(a, b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Ordering applied to the plain data of keyed-array elements.
#[derive(Clone)]
pub struct Comparator(Arc<CompareFn>);

impl Comparator {
    /// Wrap a comparison function.
    pub fn new<F>(compare: F) -> Self
    where
        F: Fn(&Value, &Value) -> Ordering + Send + Sync + 'static,
    {
        Self(Arc::new(compare))
    }

    /// Ascending order of the whole element value.
    pub fn ascending() -> Self {
        Self::new(compare_values)
    }

    /// Descending order of the whole element value.
    pub fn descending() -> Self {
        Self::new(|a, b| compare_values(b, a))
    }

    /// Ascending order of one field of object elements.
    ///
    /// Elements missing the field sort as `null`.
    pub fn by_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(move |a, b| {
            compare_values(
                a.get(&field).unwrap_or(&Value::Null),
                b.get(&field).unwrap_or(&Value::Null),
            )
        })
    }

    /// Compare two element values.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        (self.0)(a, b)
    }

    /// Check if both handles point at the same comparison function.
    pub fn same_as(&self, other: &Comparator) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Comparator(..)")
    }
}

/// Resolution applied when two writers touch the same leaf.
///
/// Called with `(current, incoming)` and returns the value to keep.
#[derive(Clone)]
pub struct ValueMerger(Arc<MergeFn>);

impl ValueMerger {
    /// Wrap a merge function.
    pub fn new<F>(merge: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        Self(Arc::new(merge))
    }

    /// Always keep the incoming value. This is the default.
    pub fn incoming() -> Self {
        Self::new(|_, incoming| incoming.clone())
    }

    /// Keep the numerically greater value; non-numbers fall back to incoming.
    pub fn numeric_max() -> Self {
        Self::new(|current, incoming| match (current.as_f64(), incoming.as_f64()) {
            (Some(c), Some(i)) if c > i => current.clone(),
            _ => incoming.clone(),
        })
    }

    /// Resolve two values.
    pub fn merge(&self, current: &Value, incoming: &Value) -> Value {
        (self.0)(current, incoming)
    }

    /// Check if both handles point at the same merge function.
    pub fn same_as(&self, other: &ValueMerger) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for ValueMerger {
    fn default() -> Self {
        Self::incoming()
    }
}

impl fmt::Debug for ValueMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueMerger(..)")
    }
}

/// Tree-wide configuration held by a [`Head`](crate::head::Head) and pushed
/// down to every keyed component it contains.
#[derive(Clone, Debug, Default)]
pub struct ComponentOptions {
    pub comparator: Option<Comparator>,
    pub value_merger: Option<ValueMerger>,
}

impl ComponentOptions {
    pub fn with_comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn with_value_merger(mut self, merger: ValueMerger) -> Self {
        self.value_merger = Some(merger);
        self
    }
}
