//! Transaction semantics: atomic commit, rollback as exact inverse,
//! nested scopes, ghost visibility, and lock conflicts.

use std::time::Duration;

use burldb::error::{LockFailure, LockFailureKind};
use burldb::{Database, LockMode, Options};
use tempfile::tempdir;

fn open_db(dir: &tempfile::TempDir) -> Database {
    Database::open(Options::new(dir.path().join("data.burl")).page_size(4096)).unwrap()
}

#[test]
fn commit_makes_writes_visible() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"t").unwrap();

    let mut txn = db.begin().unwrap();
    tree.store(Some(&mut txn), b"k1", b"v1").unwrap();
    tree.store(Some(&mut txn), b"k2", b"v2").unwrap();

    txn.commit().unwrap();
    assert_eq!(tree.load(None, b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(tree.load(None, b"k2").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn rollback_restores_previous_state() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"t").unwrap();

    tree.store(None, b"existing", b"before").unwrap();

    let mut txn = db.begin().unwrap();
    tree.store(Some(&mut txn), b"existing", b"changed").unwrap();
    tree.store(Some(&mut txn), b"inserted", b"new").unwrap();
    tree.delete(Some(&mut txn), b"existing").unwrap();
    txn.exit().unwrap();

    assert_eq!(
        tree.load(None, b"existing").unwrap(),
        Some(b"before".to_vec()),
        "update and delete must both unwind",
    );
    assert_eq!(tree.load(None, b"inserted").unwrap(), None);
    db.verify_tree(b"t").unwrap();
}

#[test]
fn dropping_a_transaction_rolls_back() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"t").unwrap();

    {
        let mut txn = db.begin().unwrap();
        tree.store(Some(&mut txn), b"k", b"v").unwrap();
        // No commit.
    }
    assert_eq!(tree.load(None, b"k").unwrap(), None);
}

#[test]
fn rollback_of_many_operations_is_exact() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"t").unwrap();

    for i in 0..100u32 {
        tree.store(None, format!("base{:03}", i).as_bytes(), &i.to_be_bytes())
            .unwrap();
    }

    let mut txn = db.begin().unwrap();
    for i in 0..100u32 {
        let key = format!("base{:03}", i);
        match i % 3 {
            0 => {
                tree.store(Some(&mut txn), key.as_bytes(), b"overwritten").unwrap();
            }
            1 => {
                tree.delete(Some(&mut txn), key.as_bytes()).unwrap();
            }
            _ => {
                tree.store(Some(&mut txn), format!("extra{:03}", i).as_bytes(), b"x")
                    .unwrap();
            }
        }
    }
    txn.exit().unwrap();

    for i in 0..100u32 {
        assert_eq!(
            tree.load(None, format!("base{:03}", i).as_bytes()).unwrap(),
            Some(i.to_be_bytes().to_vec()),
            "base{:03} not restored",
            i,
        );
        assert_eq!(
            tree.load(None, format!("extra{:03}", i).as_bytes()).unwrap(),
            None,
        );
    }
    db.verify_tree(b"t").unwrap();
}

#[test]
fn nested_scope_commit_and_rollback() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"t").unwrap();

    let mut txn = db.begin().unwrap();
    tree.store(Some(&mut txn), b"outer", b"1").unwrap();

    txn.enter().unwrap();
    tree.store(Some(&mut txn), b"inner-kept", b"2").unwrap();
    txn.commit().unwrap(); // nested commit promotes to the parent

    txn.enter().unwrap();
    tree.store(Some(&mut txn), b"inner-dropped", b"3").unwrap();
    txn.exit().unwrap(); // nested rollback

    txn.commit().unwrap();

    assert_eq!(tree.load(None, b"outer").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.load(None, b"inner-kept").unwrap(), Some(b"2".to_vec()));
    assert_eq!(tree.load(None, b"inner-dropped").unwrap(), None);
}

#[test]
fn ghost_hides_delete_until_commit() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"t").unwrap();
    tree.store(None, b"victim", b"alive").unwrap();

    let mut txn = db.begin().unwrap();
    tree.delete(Some(&mut txn), b"victim").unwrap();

    // The deleting transaction sees its own delete.
    assert_eq!(tree.load(Some(&mut txn), b"victim").unwrap(), None);

    txn.commit().unwrap();
    assert_eq!(tree.load(None, b"victim").unwrap(), None);
    db.verify_tree(b"t").unwrap();
}

#[test]
fn conflicting_lock_times_out_then_succeeds() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"t").unwrap();
    tree.store(None, b"contested", b"v0").unwrap();

    // A holds the exclusive lock.
    let mut a = db.begin().unwrap();
    tree.store(Some(&mut a), b"contested", b"from-a").unwrap();

    // B wants a shared lock with a 50ms budget.
    let mut b = db.begin().unwrap();
    b.set_lock_mode(LockMode::RepeatableRead);
    b.set_lock_timeout(Duration::from_millis(50));
    let err = tree.load(Some(&mut b), b"contested").unwrap_err();
    let failure = err
        .downcast_ref::<LockFailure>()
        .expect("timeout surfaces as LockFailure");
    assert_eq!(failure.kind, LockFailureKind::TimedOut);

    // After A commits, B's retry is granted and sees A's value.
    a.commit().unwrap();
    assert_eq!(
        tree.load(Some(&mut b), b"contested").unwrap(),
        Some(b"from-a".to_vec()),
    );
    b.commit().unwrap();
}

#[test]
fn shared_to_exclusive_upgrade_is_illegal() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"t").unwrap();
    tree.store(None, b"k", b"v").unwrap();

    let mut txn = db.begin().unwrap();
    txn.set_lock_mode(LockMode::RepeatableRead);
    tree.load(Some(&mut txn), b"k").unwrap();

    // The shared hold cannot be upgraded by a store.
    let err = tree.store(Some(&mut txn), b"k", b"v2").unwrap_err();
    let failure = err
        .downcast_ref::<LockFailure>()
        .expect("illegal upgrade surfaces as LockFailure");
    assert_eq!(failure.kind, LockFailureKind::IllegalUpgrade);
}

#[test]
fn upgradable_read_then_store_succeeds() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"t").unwrap();
    tree.store(None, b"k", b"v").unwrap();

    let mut txn = db.begin().unwrap();
    assert_eq!(txn.lock_mode(), LockMode::Upgradable);
    tree.load(Some(&mut txn), b"k").unwrap();
    tree.store(Some(&mut txn), b"k", b"v2").unwrap();
    txn.commit().unwrap();

    assert_eq!(tree.load(None, b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn bogus_transaction_passes_through() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"t").unwrap();

    let mut bogus = db.bogus_transaction();
    tree.store(Some(&mut bogus), b"k", b"v").unwrap();
    // Visible immediately; commit and exit are no-ops.
    assert_eq!(tree.load(None, b"k").unwrap(), Some(b"v".to_vec()));
    bogus.commit().unwrap();
    bogus.exit().unwrap();
}
