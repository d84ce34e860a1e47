//! Root holder of a replica tree.

use crate::node::{Component, ModifyLevel, Node};
use crate::options::{Comparator, ComponentOptions, ValueMerger};
use crate::timestamp::{is_newer, Timestamp};
use serde_json::Value;

/// The root of a databox replica.
///
/// Owns an optional root node and a timestamp of its own, so that operations
/// addressed at the whole replica (an empty selector) are fenced the same way
/// per-key writes are. Also carries the tree-wide [`ComponentOptions`].
#[derive(Clone, Debug, Default)]
pub struct Head {
    root: Option<Node>,
    timestamp: Option<Timestamp>,
    options: ComponentOptions,
}

impl Head {
    /// Create an empty head with the given options.
    pub fn new(options: ComponentOptions) -> Self {
        Self {
            root: None,
            timestamp: None,
            options,
        }
    }

    /// Create a head holding parsed raw data.
    pub fn from_raw(raw: Value, options: ComponentOptions) -> Self {
        let mut head = Self::new(options);
        head.root = Some(Node::from_raw(raw));
        head.apply_options();
        head
    }

    pub fn root(&self) -> Option<&Node> {
        self.root.as_ref()
    }

    pub fn root_mut(&mut self) -> Option<&mut Node> {
        self.root.as_mut()
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    pub fn options(&self) -> &ComponentOptions {
        &self.options
    }

    /// Plain data view; `null` while the head is empty.
    pub fn data(&self) -> Value {
        self.root.as_ref().map_or(Value::Null, Node::to_value)
    }

    /// Check if the head holds no data.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Navigate to a direct child of the root component.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.root.as_ref()?.as_component()?.get(key)
    }

    /// Navigate along a path of keys starting at the root.
    pub fn get_path<'a, I>(&self, path: I) -> Option<&Node>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut node = self.root.as_ref()?;
        for key in path {
            node = node.as_component()?.get(key)?;
        }
        Some(node)
    }

    /// Set the root value if the head is empty and the timestamp passes.
    pub fn insert(&mut self, value: Value, timestamp: Timestamp) -> bool {
        if self.root.is_some() || !is_newer(self.timestamp, timestamp) {
            return false;
        }
        self.root = Some(Node::from_raw(value));
        self.timestamp = Some(timestamp);
        true
    }

    /// Replace the root value.
    pub fn update(&mut self, value: Value, timestamp: Timestamp, check_data_change: bool) -> ModifyLevel {
        if !is_newer(self.timestamp, timestamp) {
            return ModifyLevel::Nothing;
        }
        let Some(root) = self.root.as_mut() else {
            return ModifyLevel::Nothing;
        };

        let node = Node::from_raw(value);
        let level = if check_data_change && *root.data() != *node.data() {
            ModifyLevel::DataChanged
        } else {
            ModifyLevel::DataTouched
        };
        *root = node;
        self.timestamp = Some(timestamp);
        level
    }

    /// Clear the root value.
    pub fn delete(&mut self, timestamp: Timestamp) -> bool {
        if self.root.is_none() || !is_newer(self.timestamp, timestamp) {
            return false;
        }
        self.root = None;
        self.timestamp = Some(timestamp);
        true
    }

    /// Merge a freshly fetched snapshot into the current data.
    ///
    /// An empty head adopts the incoming node. Returns true if the data
    /// changed.
    pub fn merge_with_new(&mut self, incoming: Node) -> bool {
        let merger = self.options.value_merger.clone().unwrap_or_default();
        let changed = match self.root.as_mut() {
            Some(root) => root.merge_with_new(incoming, &merger),
            None => {
                self.root = Some(incoming);
                true
            }
        };
        self.apply_options();
        changed
    }

    /// Replace the whole tree, keeping options and the head timestamp.
    pub fn replace(&mut self, root: Option<Node>) {
        self.root = root;
        self.apply_options();
    }

    /// Drop all data and timestamps.
    pub fn clear(&mut self) {
        self.root = None;
        self.timestamp = None;
    }

    /// Install a comparator on every keyed component of the tree.
    ///
    /// Returns true if any component was reordered.
    pub fn set_comparator(&mut self, comparator: Option<Comparator>) -> bool {
        self.options.comparator = comparator;
        self.apply_options()
    }

    /// Install a value merger on every keyed component of the tree.
    pub fn set_value_merger(&mut self, merger: Option<ValueMerger>) {
        self.options.value_merger = merger;
        self.apply_options();
    }

    /// Push the tree-wide options down to every component.
    ///
    /// Components created since the last call (by inserts or fetches) pick
    /// up the options here. Returns true if any component was reordered.
    pub fn apply_options(&mut self) -> bool {
        let ComponentOptions {
            comparator,
            value_merger,
        } = self.options.clone();
        let mut reordered = false;
        self.for_each_component(&mut |component| {
            component.set_value_merger(value_merger.clone());
            reordered |= component.set_comparator(comparator.clone());
        });
        reordered
    }

    /// Visit every keyed component of the tree, root first.
    pub fn for_each_component(&mut self, f: &mut dyn FnMut(&mut dyn Component)) {
        if let Some(root) = self.root.as_mut() {
            root.for_each_component(f);
        }
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.timestamp == other.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_head_lifecycle() {
        let mut head = Head::default();
        assert_eq!(head.data(), Value::Null);

        assert!(head.insert(json!({"___o___": {"a": 1}}), 2));
        assert!(!head.insert(json!(5), 3));
        assert_eq!(head.data(), json!({"a": 1}));

        assert_eq!(head.update(json!(5), 1, true), ModifyLevel::Nothing);
        assert_eq!(head.update(json!(5), 3, true), ModifyLevel::DataChanged);
        assert_eq!(head.data(), json!(5));

        assert!(!head.delete(3));
        assert!(head.delete(4));
        assert!(head.is_empty());
    }

    #[test]
    fn test_navigate_path() {
        let head = Head::from_raw(
            json!({"___o___": {"users": {"___a___": [{"id": "u1", "name": "Ann"}], "k": "id"}}}),
            ComponentOptions::default(),
        );
        let user = head.get_path(["users", "u1"]).map(Node::to_value);
        assert_eq!(user, Some(json!({"id": "u1", "name": "Ann"})));
        assert!(head.get_path(["users", "u2"]).is_none());
    }

    #[test]
    fn test_options_reach_new_components() {
        let options = ComponentOptions::default().with_comparator(Comparator::ascending());
        let mut head = Head::from_raw(json!({"___o___": {}}), options);

        if let Some(root) = head.root_mut().and_then(Node::as_component_mut) {
            root.insert(
                "list",
                json!({"___a___": [{"k": "b", "v": 2}, {"k": "a", "v": 1}], "k": "k", "v": "v"}),
                1,
                None,
            );
        }
        assert!(head.apply_options());
        assert_eq!(head.data(), json!({"list": [1, 2]}));
    }

    #[test]
    fn test_merge_into_empty_head() {
        let mut head = Head::default();
        assert!(head.merge_with_new(Node::from_raw(json!({"___o___": {"a": 1}}))));
        assert!(!head.merge_with_new(Node::from_raw(json!({"___o___": {"a": 1}}))));
        assert_eq!(head.data(), json!({"a": 1}));
    }
}
