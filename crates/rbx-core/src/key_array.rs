//! Keyed array component.
//!
//! An ordered sequence of `(key, node)` pairs with a key → position index.
//! With a comparator installed the sequence is kept sorted: inserts and
//! updates place the element at its sorted position instead of appending.
//!
//! Positions are kept in a plain `Vec`, so an insert or delete in the middle
//! shifts and reindexes the tail in O(n).

use crate::node::{Component, ModifyLevel, Node};
use crate::options::{Comparator, ValueMerger};
use crate::timestamp::{Timestamp, TimestampFence};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Clone, Debug, Default)]
pub struct KeyedArray {
    items: Vec<(String, Node)>,
    index: HashMap<String, usize>,
    timestamps: TimestampFence,
    value_merger: ValueMerger,
    comparator: Option<Comparator>,
}

/// String form of an item key; objects, arrays and null cannot be keys.
fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl KeyedArray {
    /// Create an empty keyed array.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw items.
    ///
    /// Each object item is keyed by `item[key_field]`; with a `value_field`
    /// only `item[value_field]` is stored. Non-object items and items without
    /// a usable key are skipped, and a repeated key overwrites the earlier
    /// element in place.
    pub fn from_raw(items: Vec<Value>, key_field: &str, value_field: Option<&str>) -> Self {
        let mut arr = Self::new();
        for item in items {
            let Value::Object(mut item) = item else {
                continue;
            };
            let Some(key) = item.get(key_field).and_then(key_string) else {
                continue;
            };
            let raw = match value_field {
                Some(field) => item.remove(field).unwrap_or(Value::Null),
                None => Value::Object(item),
            };
            let node = Node::from_raw(raw);
            match arr.index.get(&key) {
                Some(&pos) => arr.items[pos].1 = node,
                None => {
                    arr.index.insert(key.clone(), arr.items.len());
                    arr.items.push((key, node));
                }
            }
        }
        arr
    }

    /// Keys in array order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|(k, _)| k.as_str())
    }

    /// Position of `key`, if present.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// The active comparator.
    pub fn comparator(&self) -> Option<&Comparator> {
        self.comparator.as_ref()
    }

    /// Visit every `(key, node, timestamp)` triple in array order.
    pub fn for_each_pair(&self, mut f: impl FnMut(&str, &Node, Option<Timestamp>)) {
        for (key, node) in &self.items {
            f(key, node, self.timestamps.get(key));
        }
    }

    /// Visit this array and every nested component.
    pub fn for_each_component(&mut self, f: &mut dyn FnMut(&mut dyn Component)) {
        f(&mut *self);
        for (_, node) in self.items.iter_mut() {
            node.for_each_component(f);
        }
    }

    /// Reorder all elements by the active comparator.
    ///
    /// The sort is stable. Returns true if any element changed position.
    pub fn sort(&mut self) -> bool {
        let Some(comparator) = self.comparator.clone() else {
            return false;
        };

        let views: Vec<Value> = self.items.iter().map(|(_, n)| n.to_value()).collect();
        let mut order: Vec<usize> = (0..self.items.len()).collect();
        order.sort_by(|&a, &b| comparator.compare(&views[a], &views[b]));

        let moved = order.iter().enumerate().any(|(pos, &from)| pos != from);
        if moved {
            let mut old: Vec<Option<(String, Node)>> =
                std::mem::take(&mut self.items).into_iter().map(Some).collect();
            self.items = order.iter().filter_map(|&from| old[from].take()).collect();
            self.reindex_from(0);
        }
        moved
    }

    /// Check that the sequence is non-decreasing under the comparator.
    pub fn is_sorted(&self) -> bool {
        let Some(comparator) = &self.comparator else {
            return true;
        };
        self.items.windows(2).all(|pair| {
            comparator.compare(&pair[0].1.data(), &pair[1].1.data()) != Ordering::Greater
        })
    }

    /// Merge another snapshot of the same array into this one.
    ///
    /// Existing keys merge recursively through the value merger, absent keys
    /// are added (sorted in when a comparator is active), and each key keeps
    /// the greater of both timestamps. Returns true if the data changed.
    pub fn merge_with_new(&mut self, incoming: KeyedArray) -> bool {
        let mut changed = false;
        let KeyedArray {
            items, timestamps, ..
        } = incoming;

        for (key, node) in items {
            match self.index.get(&key).copied() {
                Some(pos) => {
                    let merged = self.items[pos].1.merge_with_new(node, &self.value_merger);
                    if merged && self.comparator.is_some() {
                        let (key, node) = self.remove_at(pos);
                        self.push_sorted(key, node);
                    }
                    changed |= merged;
                }
                None => {
                    self.push_sorted(key.clone(), node);
                    changed = true;
                }
            }
            if let Some(timestamp) = timestamps.get(&key) {
                self.timestamps.raise(&key, timestamp);
            }
        }
        changed
    }

    /// Append, or place at the sorted position when a comparator is active.
    fn push_sorted(&mut self, key: String, node: Node) {
        let pos = match &self.comparator {
            Some(comparator) => {
                let value = node.data();
                // First element the new value sorts before or alongside.
                self.items.partition_point(|(_, item)| {
                    comparator.compare(&value, &item.data()) == Ordering::Greater
                })
            }
            None => self.items.len(),
        };
        self.insert_at(pos, key, node);
    }

    fn insert_at(&mut self, pos: usize, key: String, node: Node) {
        self.index.insert(key.clone(), pos);
        self.items.insert(pos, (key, node));
        self.reindex_from(pos + 1);
    }

    fn remove_at(&mut self, pos: usize) -> (String, Node) {
        let (key, node) = self.items.remove(pos);
        self.index.remove(&key);
        self.reindex_from(pos);
        (key, node)
    }

    fn reindex_from(&mut self, start: usize) {
        for (pos, (key, _)) in self.items.iter().enumerate().skip(start) {
            if let Some(slot) = self.index.get_mut(key) {
                *slot = pos;
            } else {
                self.index.insert(key.clone(), pos);
            }
        }
    }
}

impl Component for KeyedArray {
    fn insert(
        &mut self,
        key: &str,
        value: Value,
        timestamp: Timestamp,
        if_contains: Option<&str>,
    ) -> bool {
        if self.contains_key(key) || !self.timestamps.accepts(key, timestamp) {
            return false;
        }

        let node = Node::from_raw(value);
        match if_contains {
            Some(anchor) => {
                let Some(anchor_pos) = self.position(anchor) else {
                    return false;
                };
                if self.comparator.is_some() {
                    self.push_sorted(key.to_owned(), node);
                } else {
                    self.insert_at(anchor_pos, key.to_owned(), node);
                }
            }
            None => self.push_sorted(key.to_owned(), node),
        }
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
        let Some(pos) = self.position(key) else {
            return ModifyLevel::Nothing;
        };
        if !self.timestamps.accepts(key, timestamp) {
            return ModifyLevel::Nothing;
        }

        let node = Node::from_raw(value);
        let level = if check_data_change && *self.items[pos].1.data() != *node.data() {
            ModifyLevel::DataChanged
        } else {
            ModifyLevel::DataTouched
        };

        if self.comparator.is_some() {
            let (key, _) = self.remove_at(pos);
            self.push_sorted(key, node);
        } else {
            self.items[pos].1 = node;
        }
        self.timestamps.record(key, timestamp);
        level
    }

    fn delete(&mut self, key: &str, timestamp: Timestamp) -> bool {
        let Some(pos) = self.position(key) else {
            return false;
        };
        if !self.timestamps.accepts(key, timestamp) {
            return false;
        }
        self.remove_at(pos);
        self.timestamps.record(key, timestamp);
        true
    }

    fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<&Node> {
        self.position(key).map(|pos| &self.items[pos].1)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        let pos = self.position(key)?;
        Some(&mut self.items[pos].1)
    }

    fn entries(&self) -> Vec<(&str, &Node)> {
        self.items.iter().map(|(k, n)| (k.as_str(), n)).collect()
    }

    fn timestamp(&self, key: &str) -> Option<Timestamp> {
        self.timestamps.get(key)
    }

    fn set_value_merger(&mut self, merger: Option<ValueMerger>) {
        self.value_merger = merger.unwrap_or_default();
    }

    fn set_comparator(&mut self, comparator: Option<Comparator>) -> bool {
        match comparator {
            Some(comparator) => {
                if self
                    .comparator
                    .as_ref()
                    .is_some_and(|current| current.same_as(&comparator))
                {
                    return false;
                }
                self.comparator = Some(comparator);
                self.sort()
            }
            None => {
                self.comparator = None;
                false
            }
        }
    }

    fn to_value(&self) -> Value {
        Value::Array(self.items.iter().map(|(_, n)| n.to_value()).collect())
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

impl PartialEq for KeyedArray {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items && self.timestamps == other.timestamps
    }
}
