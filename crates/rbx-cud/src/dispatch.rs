//! Applying cud packages to a replica tree.
//!
//! Operations run strictly in package order. Every operation resolves its
//! selector independently: a selector that matches nothing, a failed guard or
//! a stale timestamp turns that one operation into a no-op and the rest of
//! the package still applies.

use crate::operation::{CudId, CudOperation, CudPackage, CudType, SelectorItem};
use crate::query::DbQuery;
use rbx_core::{Component, Head, ModifyLevel, Node, Timestamp};
use serde_json::Value;

/// One operation that changed the tree.
#[derive(Clone, Debug, PartialEq)]
pub struct CudApplied {
    /// Effective type after `potential` widening.
    pub cud_type: CudType,
    /// Concrete key path of the written entry; empty for the head.
    pub path: Vec<String>,
    pub value: Option<Value>,
    pub timestamp: Timestamp,
    pub level: ModifyLevel,
    pub code: Option<Value>,
    pub extra_data: Option<Value>,
}

/// Outcome of applying a package.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplyReport {
    pub cud_id: CudId,
    pub applied: Vec<CudApplied>,
    /// True if the plain data view may differ from before.
    pub data_changed: bool,
}

impl ApplyReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Apply every operation of `package` to `head`, in order.
///
/// With `check_data_change` updates compare old and new data, so writes of
/// identical data do not count as a change.
pub fn apply_package(head: &mut Head, package: &CudPackage, check_data_change: bool) -> ApplyReport {
    let mut report = ApplyReport {
        cud_id: package.id,
        ..ApplyReport::default()
    };
    for operation in &package.operations {
        let timestamp = operation.timestamp.unwrap_or(package.timestamp);
        apply_operation(head, operation, timestamp, check_data_change, &mut report.applied);
    }

    // Components created by this package inherit the tree-wide options here.
    let reordered = head.apply_options();
    report.data_changed = reordered
        || report.applied.iter().any(|applied| {
            applied.level == ModifyLevel::DataChanged
                || (!check_data_change && applied.level.is_applied())
        });
    report
}

/// Apply a single operation at `timestamp`, recording what changed.
pub fn apply_operation(
    head: &mut Head,
    operation: &CudOperation,
    timestamp: Timestamp,
    check_data_change: bool,
    applied: &mut Vec<CudApplied>,
) {
    let Some((last, parents)) = operation.selector.split_last() else {
        apply_to_head(head, operation, timestamp, check_data_change, applied);
        return;
    };

    let mut targets = Vec::new();
    if let Some(root) = head.root() {
        resolve(root, parents, Vec::new(), &mut targets);
    }

    for parent_path in targets {
        let Some(component) = navigate_mut(head, &parent_path) else {
            continue;
        };
        let keys = match last {
            SelectorItem::Key(key) => vec![key.clone()],
            // Inserting needs a concrete key.
            SelectorItem::Query(_) if operation.cud_type == CudType::Insert => continue,
            SelectorItem::Query(query) => matching_keys(component, query),
        };
        let key_is_concrete = matches!(last, SelectorItem::Key(_));

        for key in keys {
            let (cud_type, level) = apply_to_key(
                component,
                operation,
                &key,
                timestamp,
                check_data_change,
                key_is_concrete,
            );
            if level.is_applied() {
                let mut path = parent_path.clone();
                path.push(key);
                applied.push(record(operation, cud_type, path, timestamp, level));
            }
        }
    }
}

fn record(
    operation: &CudOperation,
    cud_type: CudType,
    path: Vec<String>,
    timestamp: Timestamp,
    level: ModifyLevel,
) -> CudApplied {
    CudApplied {
        cud_type,
        path,
        value: operation.value.clone(),
        timestamp,
        level,
        code: operation.code.clone(),
        extra_data: operation.extra_data.clone(),
    }
}

fn apply_to_head(
    head: &mut Head,
    operation: &CudOperation,
    timestamp: Timestamp,
    check_data_change: bool,
    applied: &mut Vec<CudApplied>,
) {
    let value = operation.value.clone().unwrap_or_default();
    let (cud_type, level) = match operation.cud_type {
        CudType::Insert if operation.potential && !head.is_empty() => (
            CudType::Update,
            head.update(value, timestamp, check_data_change),
        ),
        CudType::Insert => (
            CudType::Insert,
            ModifyLevel::from_applied(head.insert(value, timestamp)),
        ),
        CudType::Update if operation.potential && head.is_empty() => (
            CudType::Insert,
            ModifyLevel::from_applied(head.insert(value, timestamp)),
        ),
        CudType::Update => (
            CudType::Update,
            head.update(value, timestamp, check_data_change),
        ),
        CudType::Delete => (
            CudType::Delete,
            ModifyLevel::from_applied(head.delete(timestamp)),
        ),
    };
    if level.is_applied() {
        applied.push(record(operation, cud_type, Vec::new(), timestamp, level));
    }
}

/// Collect the key paths of every component the parent selector reaches.
fn resolve(node: &Node, items: &[SelectorItem], prefix: Vec<String>, out: &mut Vec<Vec<String>>) {
    let Some(component) = node.as_component() else {
        return;
    };
    let Some((first, rest)) = items.split_first() else {
        out.push(prefix);
        return;
    };

    match first {
        SelectorItem::Key(key) => {
            if let Some(child) = component.get(key) {
                let mut path = prefix;
                path.push(key.clone());
                resolve(child, rest, path, out);
            }
        }
        SelectorItem::Query(query) => {
            for (key, child) in component.entries() {
                if query.matches(key, &child.data()) {
                    let mut path = prefix.clone();
                    path.push(key.to_owned());
                    resolve(child, rest, path, out);
                }
            }
        }
    }
}

fn navigate_mut<'a>(head: &'a mut Head, path: &[String]) -> Option<&'a mut dyn Component> {
    let mut node = head.root_mut()?;
    for key in path {
        node = node.as_component_mut()?.get_mut(key)?;
    }
    node.as_component_mut()
}

fn matching_keys(component: &dyn Component, query: &DbQuery) -> Vec<String> {
    component
        .entries()
        .into_iter()
        .filter(|(key, node)| query.matches(key, &node.data()))
        .map(|(key, _)| key.to_owned())
        .collect()
}

fn first_match(component: &dyn Component, query: &DbQuery) -> Option<String> {
    component
        .entries()
        .into_iter()
        .find(|(key, node)| query.matches(key, &node.data()))
        .map(|(key, _)| key.to_owned())
}

fn apply_to_key(
    component: &mut dyn Component,
    operation: &CudOperation,
    key: &str,
    timestamp: Timestamp,
    check_data_change: bool,
    key_is_concrete: bool,
) -> (CudType, ModifyLevel) {
    let anchor = match &operation.if_contains {
        Some(query) => match first_match(component, query) {
            Some(anchor) => Some(anchor),
            None => return (operation.cud_type, ModifyLevel::Nothing),
        },
        None => None,
    };
    let value = || operation.value.clone().unwrap_or_default();

    match operation.cud_type {
        CudType::Insert if operation.potential && component.contains_key(key) => (
            CudType::Update,
            component.update(key, value(), timestamp, check_data_change),
        ),
        CudType::Insert => (
            CudType::Insert,
            ModifyLevel::from_applied(component.insert(key, value(), timestamp, anchor.as_deref())),
        ),
        CudType::Update if operation.potential && key_is_concrete && !component.contains_key(key) => (
            CudType::Insert,
            ModifyLevel::from_applied(component.insert(key, value(), timestamp, None)),
        ),
        CudType::Update => (
            CudType::Update,
            component.update(key, value(), timestamp, check_data_change),
        ),
        CudType::Delete => (
            CudType::Delete,
            ModifyLevel::from_applied(component.delete(key, timestamp)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbx_core::ComponentOptions;
    use serde_json::json;

    fn head(raw: Value) -> Head {
        Head::from_raw(raw, ComponentOptions::default())
    }

    #[test]
    fn test_ops_apply_in_order() {
        let mut head = head(json!({"___o___": {"a": 1}}));
        let package = CudPackage::new(
            CudId(1),
            10,
            vec![
                CudOperation::insert(["b"], json!(2)),
                CudOperation::update(["b"], json!(3)).with_timestamp(11),
                CudOperation::delete(["a"]),
            ],
        );

        let report = apply_package(&mut head, &package, true);
        assert_eq!(report.applied.len(), 3);
        assert!(report.data_changed);
        assert_eq!(head.data(), json!({"b": 3}));
    }

    #[test]
    fn test_failed_op_does_not_block_package() {
        let mut head = head(json!({"___o___": {"a": 1}}));
        let package = CudPackage::new(
            CudId(1),
            10,
            vec![
                CudOperation::update(["missing", "deep"], json!(1)),
                CudOperation::insert(["a"], json!(5)),
                CudOperation::insert(["b"], json!(2)),
            ],
        );

        let report = apply_package(&mut head, &package, true);
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].path, vec!["b".to_owned()]);
        assert_eq!(head.data(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_query_selector_updates_all_matches() {
        let mut head = head(json!({"___o___": {
            "x": {"age": 10},
            "y": {"age": 40},
            "z": {"age": 50}
        }}));
        let query = DbQuery::value(json!({"age": {"$gt": 30}}));
        let package = CudPackage::new(
            CudId(1),
            1,
            vec![CudOperation::update([SelectorItem::Query(query)], json!({"age": 0}))],
        );

        let report = apply_package(&mut head, &package, true);
        assert_eq!(report.applied.len(), 2);
        assert_eq!(
            head.data(),
            json!({"x": {"age": 10}, "y": {"age": 0}, "z": {"age": 0}})
        );
    }

    #[test]
    fn test_potential_widening() {
        let mut head = head(json!({"___o___": {"a": 1}}));
        let package = CudPackage::new(
            CudId(1),
            1,
            vec![
                CudOperation::insert(["a"], json!(2)).potential(),
                CudOperation::update(["b"], json!(3)).potential(),
            ],
        );

        let report = apply_package(&mut head, &package, true);
        let types: Vec<CudType> = report.applied.iter().map(|a| a.cud_type).collect();
        assert_eq!(types, vec![CudType::Update, CudType::Insert]);
        assert_eq!(head.data(), json!({"a": 2, "b": 3}));
    }

    #[test]
    fn test_if_contains_anchor() {
        let mut head = head(json!({"___a___": [{"id": "a"}, {"id": "c"}], "k": "id"}));
        let guard = DbQuery::key(json!("c"));
        let package = CudPackage::new(
            CudId(1),
            1,
            vec![
                CudOperation::insert(["b"], json!({"id": "b"})).with_if_contains(guard),
                CudOperation::insert(["d"], json!({"id": "d"}))
                    .with_if_contains(DbQuery::key(json!("nope"))),
            ],
        );

        apply_package(&mut head, &package, true);
        assert_eq!(head.data(), json!([{"id": "a"}, {"id": "b"}, {"id": "c"}]));
    }

    #[test]
    fn test_head_operations() {
        let mut head = Head::default();
        let package = CudPackage::new(
            CudId(1),
            1,
            vec![CudOperation::insert(Vec::<&str>::new(), json!({"___o___": {"a": 1}}))],
        );
        let report = apply_package(&mut head, &package, true);
        assert_eq!(report.applied[0].path, Vec::<String>::new());
        assert_eq!(head.data(), json!({"a": 1}));

        let package = CudPackage::new(CudId(2), 2, vec![CudOperation::delete(Vec::<&str>::new())]);
        apply_package(&mut head, &package, true);
        assert!(head.is_empty());
    }

    #[test]
    fn test_code_and_extra_data_forwarded() {
        let mut head = head(json!({"___o___": {}}));
        let package = CudPackage::new(
            CudId(4),
            1,
            vec![CudOperation::insert(["a"], json!(1))
                .with_code(json!("created"))
                .with_extra_data(json!({"by": "u1"}))],
        );

        let report = apply_package(&mut head, &package, true);
        assert_eq!(report.cud_id, CudId(4));
        assert_eq!(report.applied[0].code, Some(json!("created")));
        assert_eq!(report.applied[0].extra_data, Some(json!({"by": "u1"})));
    }
}
