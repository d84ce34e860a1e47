//! Keyed object component.
//!
//! Maps string keys to nodes. Iteration follows insertion order, but two
//! objects with the same entries and timestamps are equal regardless of it.

use crate::node::{Component, ModifyLevel, Node};
use crate::options::{Comparator, ValueMerger};
use crate::timestamp::{Timestamp, TimestampFence};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Clone, Debug, Default)]
pub struct KeyedObject {
    entries: HashMap<String, Node>,
    /// Iteration order of `entries`.
    order: Vec<String>,
    timestamps: TimestampFence,
    value_merger: ValueMerger,
}

impl KeyedObject {
    /// Create an empty keyed object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the entries of a raw `{"___o___": {..}}` object.
    pub fn from_raw(raw: Map<String, Value>) -> Self {
        let mut obj = Self::new();
        for (key, value) in raw {
            obj.order.push(key.clone());
            obj.entries.insert(key, Node::from_raw(value));
        }
        obj
    }

    /// Keys in iteration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Visit every `(key, node, timestamp)` triple in iteration order.
    pub fn for_each_pair(&self, mut f: impl FnMut(&str, &Node, Option<Timestamp>)) {
        for key in &self.order {
            if let Some(node) = self.entries.get(key) {
                f(key, node, self.timestamps.get(key));
            }
        }
    }

    /// Visit this object and every nested component.
    pub fn for_each_component(&mut self, f: &mut dyn FnMut(&mut dyn Component)) {
        f(&mut *self);
        for node in self.entries.values_mut() {
            node.for_each_component(f);
        }
    }

    /// Merge another snapshot of the same object into this one.
    ///
    /// Existing keys merge recursively through the value merger, absent keys
    /// are adopted, and each key keeps the greater of both timestamps.
    /// Returns true if the data changed.
    pub fn merge_with_new(&mut self, incoming: KeyedObject) -> bool {
        let mut changed = false;
        let KeyedObject {
            mut entries,
            order,
            timestamps,
            ..
        } = incoming;

        for key in order {
            let Some(node) = entries.remove(&key) else {
                continue;
            };
            match self.entries.get_mut(&key) {
                Some(current) => {
                    changed |= current.merge_with_new(node, &self.value_merger);
                }
                None => {
                    self.entries.insert(key.clone(), node);
                    self.order.push(key.clone());
                    changed = true;
                }
            }
            if let Some(timestamp) = timestamps.get(&key) {
                self.timestamps.raise(&key, timestamp);
            }
        }
        changed
    }

    fn remove_entry(&mut self, key: &str) -> Option<Node> {
        let node = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(node)
    }
}

impl Component for KeyedObject {
    fn insert(
        &mut self,
        key: &str,
        value: Value,
        timestamp: Timestamp,
        if_contains: Option<&str>,
    ) -> bool {
        if let Some(anchor) = if_contains {
            if !self.contains_key(anchor) {
                return false;
            }
        }
        if self.contains_key(key) || !self.timestamps.accepts(key, timestamp) {
            return false;
        }

        self.entries.insert(key.to_owned(), Node::from_raw(value));
        self.order.push(key.to_owned());
        self.timestamps.record(key, timestamp);
        true
    }

    fn update(
        &mut self,
        key: &str,
        value: Value,
        timestamp: Timestamp,
        check_data_change: bool,
    ) -> ModifyLevel {
        if !self.timestamps.accepts(key, timestamp) {
            return ModifyLevel::Nothing;
        }
        let Some(slot) = self.entries.get_mut(key) else {
            return ModifyLevel::Nothing;
        };

        let node = Node::from_raw(value);
        let level = if check_data_change && *slot.data() != *node.data() {
            ModifyLevel::DataChanged
        } else {
            ModifyLevel::DataTouched
        };
        *slot = node;
        self.timestamps.record(key, timestamp);
        level
    }

    fn delete(&mut self, key: &str, timestamp: Timestamp) -> bool {
        if !self.contains_key(key) || !self.timestamps.accepts(key, timestamp) {
            return false;
        }
        self.remove_entry(key);
        self.timestamps.record(key, timestamp);
        true
    }

    fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<&Node> {
        self.entries.get(key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.entries.get_mut(key)
    }

    fn entries(&self) -> Vec<(&str, &Node)> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(k).map(|n| (k.as_str(), n)))
            .collect()
    }

    fn timestamp(&self, key: &str) -> Option<Timestamp> {
        self.timestamps.get(key)
    }

    fn set_value_merger(&mut self, merger: Option<ValueMerger>) {
        self.value_merger = merger.unwrap_or_default();
    }

    fn set_comparator(&mut self, _comparator: Option<Comparator>) -> bool {
        // Objects have no meaningful order.
        false
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        for key in &self.order {
            if let Some(node) = self.entries.get(key) {
                map.insert(key.clone(), node.to_value());
            }
        }
        Value::Object(map)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl PartialEq for KeyedObject {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries && self.timestamps == other.timestamps
    }
}
