//! Property-based tests for the replica tree
//!
//! These tests verify the laws that make replicas converge:
//!  - Idempotence: replaying a batch changes nothing
//!  - Order independence: writes to different keys commute
//!  - Last writer wins: the newest write to a key survives any delivery order
//!  - Merge idempotence: merging the same snapshot twice equals merging once
//!  - Sorted invariant: a keyed array with a comparator stays sorted

use proptest::prelude::*;
use rbx_core::{Comparator, Component, KeyedArray, KeyedObject};
use serde_json::{json, Value};

#[derive(Clone, Debug)]
enum Op {
    Insert(String, i64),
    Update(String, i64),
    Delete(String),
}

fn key_strategy() -> impl Strategy<Value = String> {
    "[a-e]"
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (key_strategy(), -50i64..50).prop_map(|(k, v)| Op::Insert(k, v)),
        (key_strategy(), -50i64..50).prop_map(|(k, v)| Op::Update(k, v)),
        key_strategy().prop_map(Op::Delete),
    ]
}

/// Operations stamped with strictly increasing timestamps, the way one
/// writer emits them.
fn batch_strategy() -> impl Strategy<Value = Vec<(Op, u64)>> {
    prop::collection::vec(op_strategy(), 0..30).prop_map(|ops| {
        ops.into_iter()
            .enumerate()
            .map(|(i, op)| (op, i as u64 + 1))
            .collect()
    })
}

fn apply(component: &mut dyn Component, op: &Op, timestamp: u64) {
    match op {
        Op::Insert(key, value) => {
            component.insert(key, json!(value), timestamp, None);
        }
        Op::Update(key, value) => {
            component.update(key, json!(value), timestamp, true);
        }
        Op::Delete(key) => {
            component.delete(key, timestamp);
        }
    }
}

fn object_strategy() -> impl Strategy<Value = KeyedObject> {
    prop::collection::vec((key_strategy(), -50i64..50, 1u64..100), 0..10).prop_map(|entries| {
        let mut obj = KeyedObject::new();
        for (key, value, timestamp) in entries {
            obj.insert(&key, json!(value), timestamp, None);
        }
        obj
    })
}

fn array_strategy() -> impl Strategy<Value = KeyedArray> {
    prop::collection::vec((key_strategy(), -50i64..50), 0..10).prop_map(|items| {
        let items: Vec<Value> = items
            .into_iter()
            .map(|(key, value)| json!({"id": key, "n": value}))
            .collect();
        KeyedArray::from_raw(items, "id", Some("n"))
    })
}

// ============================================================================
// Fencing Property Tests
// ============================================================================

proptest! {
    #[test]
    fn replaying_a_batch_is_idempotent(batch in batch_strategy()) {
        let mut once = KeyedObject::new();
        for (op, ts) in &batch {
            apply(&mut once, op, *ts);
        }

        let mut twice = once.clone();
        for (op, ts) in &batch {
            apply(&mut twice, op, *ts);
        }

        prop_assert_eq!(once, twice);
    }

    #[test]
    fn writes_to_different_keys_commute(
        base in object_strategy(),
        first in op_strategy(),
        second in op_strategy(),
        t1 in 100u64..200,
        t2 in 100u64..200,
    ) {
        let second = match second {
            Op::Insert(_, v) => Op::Insert("other".into(), v),
            Op::Update(_, v) => Op::Update("other".into(), v),
            Op::Delete(_) => Op::Delete("other".into()),
        };

        let mut a = base.clone();
        apply(&mut a, &first, t1);
        apply(&mut a, &second, t2);

        let mut b = base;
        apply(&mut b, &second, t2);
        apply(&mut b, &first, t1);

        prop_assert_eq!(a, b);
    }

    #[test]
    fn last_writer_wins(
        key in key_strategy(),
        v1 in -50i64..50,
        v2 in -50i64..50,
        t1 in 10u64..100,
        gap in 1u64..100,
    ) {
        let t2 = t1 + gap;
        let mut forward = KeyedObject::new();
        forward.insert(&key, json!(0), 1, None);
        let mut backward = forward.clone();

        forward.update(&key, json!(v1), t1, false);
        forward.update(&key, json!(v2), t2, false);
        backward.update(&key, json!(v2), t2, false);
        backward.update(&key, json!(v1), t1, false);

        prop_assert_eq!(forward.get(&key).map(|n| n.to_value()), Some(json!(v2)));
        prop_assert_eq!(forward, backward);
    }
}

// ============================================================================
// Merge Property Tests
// ============================================================================

proptest! {
    #[test]
    fn object_merge_is_idempotent(x in object_strategy(), y in object_strategy()) {
        let mut once = x;
        once.merge_with_new(y.clone());

        let mut twice = once.clone();
        let changed = twice.merge_with_new(y);

        prop_assert!(!changed);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn array_merge_is_idempotent(x in array_strategy(), y in array_strategy()) {
        let mut once = x;
        once.merge_with_new(y.clone());

        let mut twice = once.clone();
        let changed = twice.merge_with_new(y);

        prop_assert!(!changed);
        prop_assert_eq!(once.to_value(), twice.to_value());
    }
}

// ============================================================================
// Sorted Keyed Array Property Tests
// ============================================================================

proptest! {
    #[test]
    fn comparator_keeps_array_sorted(initial in array_strategy(), batch in batch_strategy()) {
        let mut arr = initial;
        arr.set_comparator(Some(Comparator::ascending()));
        prop_assert!(arr.is_sorted());

        for (op, ts) in &batch {
            apply(&mut arr, op, *ts);
            prop_assert!(arr.is_sorted());
        }
    }

    #[test]
    fn sorted_merge_stays_sorted(x in array_strategy(), y in array_strategy()) {
        let mut arr = x;
        arr.set_comparator(Some(Comparator::descending()));
        arr.merge_with_new(y);
        prop_assert!(arr.is_sorted());
    }
}

#[test]
fn scenario_sorted_insert_between_neighbours() {
    let mut arr = KeyedArray::from_raw(
        vec![json!({"k": "x", "v": 1}), json!({"k": "z", "v": 3})],
        "k",
        Some("v"),
    );
    arr.set_comparator(Some(Comparator::ascending()));

    assert!(arr.insert("y", json!(2), 1, None));
    assert_eq!(arr.keys().collect::<Vec<_>>(), vec!["x", "y", "z"]);
}
