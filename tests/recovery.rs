//! Crash recovery: committed-and-synced transactions survive a crash,
//! unflushed ones vanish, and reopening is idempotent.

use burldb::{Database, DurabilityMode, Options};
use tempfile::tempdir;

fn options(dir: &tempfile::TempDir) -> Options {
    Options::new(dir.path().join("data.burl")).page_size(4096)
}

#[test]
fn synced_commit_survives_crash_unsynced_does_not() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(options(&dir)).unwrap();
        let tree = db.open_tree(b"t").unwrap();

        let mut t1 = db.begin_with(DurabilityMode::Sync).unwrap();
        tree.store(Some(&mut t1), b"k1", b"v1").unwrap();
        t1.commit().unwrap();

        let mut t2 = db.begin_with(DurabilityMode::NoFlush).unwrap();
        tree.store(Some(&mut t2), b"k2", b"v2").unwrap();
        t2.commit().unwrap();

        // Crash: no checkpoint, no close. The dirty nodes never reach
        // the page file; only the synced redo survives.
        drop(db);
    }

    let db = Database::open(options(&dir)).unwrap();
    let tree = db.open_tree(b"t").unwrap();
    assert_eq!(tree.load(None, b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(tree.load(None, b"k2").unwrap(), None);
}

#[test]
fn uncommitted_transaction_never_survives() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(options(&dir)).unwrap();
        let tree = db.open_tree(b"t").unwrap();

        let mut committed = db.begin_with(DurabilityMode::Sync).unwrap();
        tree.store(Some(&mut committed), b"committed", b"yes").unwrap();
        committed.commit().unwrap();

        let mut open_txn = db.begin_with(DurabilityMode::Sync).unwrap();
        tree.store(Some(&mut open_txn), b"uncommitted", b"no").unwrap();
        // Force the record out without a commit: even a synced store
        // must not surface without its COMMIT_FINAL.
        db.sync().unwrap();
        std::mem::forget(open_txn);
        drop(db);
    }

    let db = Database::open(options(&dir)).unwrap();
    let tree = db.open_tree(b"t").unwrap();
    assert_eq!(tree.load(None, b"committed").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(tree.load(None, b"uncommitted").unwrap(), None);
}

#[test]
fn committed_deletes_replay_too() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(options(&dir)).unwrap();
        let tree = db.open_tree(b"t").unwrap();
        tree.store(None, b"kept", b"1").unwrap();
        tree.store(None, b"gone", b"2").unwrap();
        db.checkpoint().unwrap();

        let mut txn = db.begin_with(DurabilityMode::Sync).unwrap();
        tree.delete(Some(&mut txn), b"gone").unwrap();
        txn.commit().unwrap();
        drop(db);
    }

    let db = Database::open(options(&dir)).unwrap();
    let tree = db.open_tree(b"t").unwrap();
    assert_eq!(tree.load(None, b"kept").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.load(None, b"gone").unwrap(), None);
    db.verify_tree(b"t").unwrap();
}

#[test]
fn clean_close_and_reopen_round_trips() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(options(&dir)).unwrap();
        let tree = db.open_tree(b"t").unwrap();
        for i in 0..500u32 {
            tree.store(None, format!("key{:04}", i).as_bytes(), &i.to_le_bytes())
                .unwrap();
        }
        db.close().unwrap();
    }

    let db = Database::open(options(&dir).create(false)).unwrap();
    let tree = db.open_tree(b"t").unwrap();
    for i in 0..500u32 {
        assert_eq!(
            tree.load(None, format!("key{:04}", i).as_bytes()).unwrap(),
            Some(i.to_le_bytes().to_vec()),
        );
    }
    db.verify_tree(b"t").unwrap();
}

#[test]
fn repeated_recovery_is_idempotent() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(options(&dir)).unwrap();
        let tree = db.open_tree(b"t").unwrap();
        let mut txn = db.begin_with(DurabilityMode::Sync).unwrap();
        tree.store(Some(&mut txn), b"k", b"v").unwrap();
        txn.commit().unwrap();
        drop(db);
    }

    // Recover twice; the second pass must find a clean slate.
    for _ in 0..2 {
        let db = Database::open(options(&dir)).unwrap();
        let tree = db.open_tree(b"t").unwrap();
        assert_eq!(tree.load(None, b"k").unwrap(), Some(b"v".to_vec()));
        drop(db);
    }
}

#[test]
fn trees_created_after_checkpoint_recover() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(options(&dir)).unwrap();
        let tree = db.open_tree(b"late").unwrap();
        let mut txn = db.begin_with(DurabilityMode::Sync).unwrap();
        tree.store(Some(&mut txn), b"k", b"v").unwrap();
        txn.commit().unwrap();
        drop(db);
    }

    let db = Database::open(options(&dir)).unwrap();
    let tree = db.open_tree(b"late").unwrap();
    assert_eq!(tree.load(None, b"k").unwrap(), Some(b"v".to_vec()));
}
