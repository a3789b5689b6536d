use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    thread,
    time::Duration,
};

use super::support::{FaultyStorage, GatedStorage, PlainStorage, finishes_within};
use crate::{MemoryStorage, RowLockedStorage, Storage, Value};

const BLOCKED: Duration = Duration::from_millis(150);
const PROMPT: Duration = Duration::from_secs(5);

fn hold_row_a(storage: &Arc<RowLockedStorage<GatedStorage>>) -> thread::JoinHandle<()> {
    let holder = storage.clone();
    thread::spawn(move || holder.set("a", Value::Integer(1)).unwrap())
}

#[test]
fn disjoint_keys_do_not_block_each_other() {
    let (inner, gate) = GatedStorage::new("a");
    let storage = Arc::new(RowLockedStorage::new(inner));

    let holder = hold_row_a(&storage);
    gate.entered.recv().unwrap();

    let other = storage.clone();
    let (finished, handle) = finishes_within(PROMPT, move || {
        other.set("b", Value::Integer(2)).unwrap();
        other.incr("c", 1, 0).unwrap();
        other
            .mset(&[("d", Value::Integer(4)), ("b", Value::Integer(5))])
            .unwrap();
        other.mget(&["b", "d"], None, true).unwrap();
    });
    assert!(finished, "operations on other keys waited for row \"a\"");

    gate.release.send(()).unwrap();
    holder.join().expect("thread panicked");
    handle.join().expect("thread panicked");
}

#[test]
fn operations_sharing_a_key_are_serialized() {
    let (inner, gate) = GatedStorage::new("a");
    let storage = Arc::new(RowLockedStorage::new(inner));

    let holder = hold_row_a(&storage);
    gate.entered.recv().unwrap();

    let incr = storage.clone();
    let (incr_finished, incr_handle) = finishes_within(BLOCKED, move || {
        incr.incr("a", 1, 0).unwrap();
    });
    let mget = storage.clone();
    let (mget_finished, mget_handle) = finishes_within(BLOCKED, move || {
        mget.mget(&["z", "a"], None, true).unwrap();
    });

    assert!(!incr_finished, "incr on row \"a\" ran while it was held");
    assert!(!mget_finished, "coherent read of row \"a\" ran while it was held");

    // incr writes "a" through the gate too.
    gate.release.send(()).unwrap();
    gate.release.send(()).unwrap();
    holder.join().expect("thread panicked");
    incr_handle.join().expect("thread panicked");
    mget_handle.join().expect("thread panicked");

    assert_eq!(storage.get("a", None).unwrap(), Some(Value::Integer(2)));
}

#[test]
fn overlapping_key_sets_in_opposite_orders_do_not_deadlock() {
    let inner = PlainStorage::slow(Duration::from_micros(20));
    let storage = Arc::new(RowLockedStorage::new(inner));
    storage
        .mset(&[("x", Value::Integer(0)), ("y", Value::Integer(0))])
        .unwrap();

    let forward = {
        let storage = storage.clone();
        thread::spawn(move || {
            for i in 0..200 {
                storage
                    .mset(&[("x", Value::Integer(i)), ("y", Value::Integer(i))])
                    .unwrap();
            }
        })
    };

    let backward = {
        let storage = storage.clone();
        thread::spawn(move || {
            for i in 0..200 {
                storage
                    .mset(&[("y", Value::Integer(-i)), ("x", Value::Integer(-i))])
                    .unwrap();
            }
        })
    };

    let reader = {
        let storage = storage.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                let values = storage.mget(&["y", "x"], None, true).unwrap();
                assert_eq!(values[0], values[1]);
            }
        })
    };

    forward.join().expect("thread panicked");
    backward.join().expect("thread panicked");
    reader.join().expect("reader observed a torn write");

    assert_eq!(storage.lock_count(), 0);
}

#[test]
fn incr_is_atomic_per_key() {
    let inner = PlainStorage::slow(Duration::from_micros(50));
    let storage = Arc::new(RowLockedStorage::new(inner));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let storage = storage.clone();
            thread::spawn(move || {
                let own = format!("own-{i}");
                for _ in 0..50 {
                    storage.incr("shared", 1, 0).unwrap();
                    storage.incr(&own, 1, 0).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread panicked");
    }

    assert_eq!(
        storage.get("shared", None).unwrap(),
        Some(Value::Integer(400))
    );
    assert_eq!(storage.get("own-3", None).unwrap(), Some(Value::Integer(50)));
}

#[test]
fn lock_table_only_holds_keys_in_use() {
    let (inner, gate) = GatedStorage::new("a");
    let storage = Arc::new(RowLockedStorage::new(inner));

    for i in 0..100 {
        storage.set(&format!("user-{i}"), Value::Integer(i)).unwrap();
    }
    assert_eq!(storage.lock_count(), 0);

    let holder = hold_row_a(&storage);
    gate.entered.recv().unwrap();
    assert_eq!(storage.lock_count(), 1);

    gate.release.send(()).unwrap();
    holder.join().expect("thread panicked");
    assert_eq!(storage.lock_count(), 0);
}

#[test]
fn duplicate_keys_in_one_mset_do_not_self_deadlock() {
    let storage = RowLockedStorage::new(MemoryStorage::new());

    storage
        .mset(&[("a", Value::Integer(1)), ("a", Value::Integer(2))])
        .unwrap();
    storage.mget(&["a", "a"], None, true).unwrap();

    assert_eq!(storage.get("a", None).unwrap(), Some(Value::Integer(2)));
}

#[test]
fn rows_are_released_when_inner_storage_fails() {
    let storage = RowLockedStorage::new(FaultyStorage::default());

    assert!(storage.set("boom", Value::Integer(1)).is_err());
    assert!(storage.incr("boom", 1, 0).is_err());
    assert!(storage.mget(&["ok", "boom"], None, true).is_err());
    assert_eq!(storage.lock_count(), 0);

    storage.set("boom-free", Value::Integer(1)).unwrap();
    storage
        .mset(&[("ok", Value::Integer(1)), ("other", Value::Integer(1))])
        .unwrap();
}

#[test]
fn rows_are_released_when_inner_storage_panics() {
    let storage = RowLockedStorage::new(FaultyStorage::default());

    let result = catch_unwind(AssertUnwindSafe(|| {
        let _ = storage.mset(&[("panic", Value::Integer(1)), ("a", Value::Integer(1))]);
    }));
    assert!(result.is_err());
    assert_eq!(storage.lock_count(), 0);

    storage.set("a", Value::Integer(1)).unwrap();
}

#[test]
fn debug_names_the_inner_storage() {
    let storage = RowLockedStorage::new(MemoryStorage::new());

    assert!(format!("{storage:?}").starts_with("RowLockedStorage(MemoryStorage"));
}
