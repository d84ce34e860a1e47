//! Nodes of the replica tree and the operations shared by keyed components.
//!
//! A node is one of exactly three kinds: a keyed object, a keyed array or an
//! opaque leaf. The plain data view (`to_value`) is always derived from the
//! single node tree, so there is no second structure that could drift.

use crate::key_array::KeyedArray;
use crate::object::KeyedObject;
use crate::options::{Comparator, ValueMerger};
use crate::timestamp::Timestamp;
use serde_json::{Map, Value};
use std::borrow::Cow;

/// Marker key of a raw keyed array: `{"___a___": [..], "k": "id", "v": "value"}`.
pub const KEY_ARRAY_MARKER: &str = "___a___";
/// Field of a raw keyed array naming the item key field.
pub const KEY_ARRAY_KEY_FIELD: &str = "k";
/// Optional field of a raw keyed array naming the item value field.
pub const KEY_ARRAY_VALUE_FIELD: &str = "v";
/// Marker key of a raw keyed object: `{"___o___": {..}}`.
pub const OBJECT_MARKER: &str = "___o___";

/// How much an update changed a component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ModifyLevel {
    /// Rejected: missing key or stale timestamp.
    #[default]
    Nothing,
    /// Written, but the data is identical (or the caller skipped the check).
    DataTouched,
    /// Written and the data differs from before.
    DataChanged,
}

impl ModifyLevel {
    /// Map an insert/delete result onto a level.
    pub fn from_applied(applied: bool) -> Self {
        if applied {
            ModifyLevel::DataChanged
        } else {
            ModifyLevel::Nothing
        }
    }

    /// Check if the write was accepted at all.
    pub fn is_applied(self) -> bool {
        self != ModifyLevel::Nothing
    }
}

/// Operations every keyed component supports.
///
/// Rejections are ordinary results, never errors: out-of-order and
/// duplicated delivery is the normal case for a replica.
pub trait Component {
    /// Insert a new key. Rejected if the key exists, if `if_contains` names a
    /// missing key, or if the timestamp is not newer than the stored one.
    fn insert(
        &mut self,
        key: &str,
        value: Value,
        timestamp: Timestamp,
        if_contains: Option<&str>,
    ) -> bool;

    /// Replace the value of an existing key.
    fn update(
        &mut self,
        key: &str,
        value: Value,
        timestamp: Timestamp,
        check_data_change: bool,
    ) -> ModifyLevel;

    /// Remove an existing key.
    fn delete(&mut self, key: &str, timestamp: Timestamp) -> bool;

    fn contains_key(&self, key: &str) -> bool;

    fn get(&self, key: &str) -> Option<&Node>;

    fn get_mut(&mut self, key: &str) -> Option<&mut Node>;

    /// Entries in iteration order.
    fn entries(&self) -> Vec<(&str, &Node)>;

    /// Highest accepted timestamp for `key`.
    fn timestamp(&self, key: &str) -> Option<Timestamp>;

    /// Replace the value merger; `None` restores the default.
    fn set_value_merger(&mut self, merger: Option<ValueMerger>);

    /// Replace the comparator; `None` removes it.
    ///
    /// Returns true if installing the comparator reordered the data.
    fn set_comparator(&mut self, comparator: Option<Comparator>) -> bool;

    /// Plain data view.
    fn to_value(&self) -> Value;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A node in the replica tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Object(KeyedObject),
    Array(KeyedArray),
    Leaf(Value),
}

impl Node {
    /// Parse raw wire data into a node.
    ///
    /// Only explicitly marked objects become components; everything else,
    /// including plain objects and arrays, is kept as an opaque leaf. A marker
    /// with an unusable shape also yields a leaf.
    pub fn from_raw(raw: Value) -> Node {
        match raw {
            Value::Object(map) => Self::from_raw_object(map),
            other => Node::Leaf(other),
        }
    }

    fn from_raw_object(mut map: Map<String, Value>) -> Node {
        if map.len() == 1 && matches!(map.get(OBJECT_MARKER), Some(Value::Object(_))) {
            if let Some(Value::Object(entries)) = map.remove(OBJECT_MARKER) {
                return Node::Object(KeyedObject::from_raw(entries));
            }
        }

        let is_key_array = matches!(map.get(KEY_ARRAY_MARKER), Some(Value::Array(_)))
            && matches!(map.get(KEY_ARRAY_KEY_FIELD), Some(Value::String(_)));
        if is_key_array {
            let items = map.remove(KEY_ARRAY_MARKER);
            let key_field = map.remove(KEY_ARRAY_KEY_FIELD);
            let value_field = match map.remove(KEY_ARRAY_VALUE_FIELD) {
                Some(Value::String(field)) => Some(field),
                _ => None,
            };
            if let (Some(Value::Array(items)), Some(Value::String(key_field))) = (items, key_field)
            {
                return Node::Array(KeyedArray::from_raw(
                    items,
                    &key_field,
                    value_field.as_deref(),
                ));
            }
        }

        Node::Leaf(Value::Object(map))
    }

    /// Plain data view of this node.
    pub fn to_value(&self) -> Value {
        match self {
            Node::Object(obj) => obj.to_value(),
            Node::Array(arr) => arr.to_value(),
            Node::Leaf(value) => value.clone(),
        }
    }

    /// Plain data view, borrowed for leaves.
    pub fn data(&self) -> Cow<'_, Value> {
        match self {
            Node::Leaf(value) => Cow::Borrowed(value),
            other => Cow::Owned(other.to_value()),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn as_leaf(&self) -> Option<&Value> {
        match self {
            Node::Leaf(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_component(&self) -> Option<&dyn Component> {
        match self {
            Node::Object(obj) => Some(obj),
            Node::Array(arr) => Some(arr),
            Node::Leaf(_) => None,
        }
    }

    pub fn as_component_mut(&mut self) -> Option<&mut dyn Component> {
        match self {
            Node::Object(obj) => Some(obj),
            Node::Array(arr) => Some(arr),
            Node::Leaf(_) => None,
        }
    }

    /// Merge a newer snapshot of the same logical value into this node.
    ///
    /// Same-kind components merge key by key; two leaves are resolved by
    /// `merger`; a kind mismatch is an authoritative overwrite.
    /// Returns true if the data changed.
    pub fn merge_with_new(&mut self, incoming: Node, merger: &ValueMerger) -> bool {
        match (self, incoming) {
            (Node::Object(current), Node::Object(incoming)) => current.merge_with_new(incoming),
            (Node::Array(current), Node::Array(incoming)) => current.merge_with_new(incoming),
            (Node::Leaf(current), Node::Leaf(incoming)) => {
                let merged = merger.merge(current, &incoming);
                let changed = merged != *current;
                *current = merged;
                changed
            }
            (current, incoming) => {
                *current = incoming;
                true
            }
        }
    }

    /// Visit this node (if it is a component) and every nested component.
    pub fn for_each_component(&mut self, f: &mut dyn FnMut(&mut dyn Component)) {
        match self {
            Node::Object(obj) => obj.for_each_component(f),
            Node::Array(arr) => arr.for_each_component(f),
            Node::Leaf(_) => {}
        }
    }
}

impl From<Value> for Node {
    fn from(raw: Value) -> Self {
        Node::from_raw(raw)
    }
}

/// Builders for the raw wire encoding of components.
pub mod raw {
    use super::*;

    /// Encode a keyed object.
    pub fn keyed_object(entries: Map<String, Value>) -> Value {
        let mut map = Map::new();
        map.insert(OBJECT_MARKER.to_owned(), Value::Object(entries));
        Value::Object(map)
    }

    /// Encode a keyed array whose items carry their key in `key_field`.
    pub fn key_array(items: Vec<Value>, key_field: &str, value_field: Option<&str>) -> Value {
        let mut map = Map::new();
        map.insert(KEY_ARRAY_MARKER.to_owned(), Value::Array(items));
        map.insert(
            KEY_ARRAY_KEY_FIELD.to_owned(),
            Value::String(key_field.to_owned()),
        );
        if let Some(field) = value_field {
            map.insert(
                KEY_ARRAY_VALUE_FIELD.to_owned(),
                Value::String(field.to_owned()),
            );
        }
        Value::Object(map)
    }
}
