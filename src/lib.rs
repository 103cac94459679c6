//! # BurlDB - Embedded Transactional Key/Value Storage
//!
//! BurlDB is an embedded, transactional, ordered key/value storage engine
//! backed by a paged on-disk file. It maps variable-length byte keys to
//! variable-length byte values, supports range scans via cursors, and
//! provides ACID transactions with configurable durability.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burldb::{Database, Options};
//!
//! let db = Database::open(Options::new("./data.burl"))?;
//! let tree = db.open_tree(b"people")?;
//!
//! let mut txn = db.begin()?;
//! tree.store(Some(&mut txn), b"alice", b"engineer")?;
//! tree.store(Some(&mut txn), b"bob", b"surgeon")?;
//! txn.commit()?;
//!
//! let mut cursor = tree.cursor();
//! cursor.first()?;
//! while let Some(key) = cursor.key() {
//!     println!("{:?} = {:?}", key, cursor.load()?);
//!     cursor.next()?;
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │       Public API (Database, Tree)        │
//! ├──────────────────────────────────────────┤
//! │ Transactions │ Lock Manager │ Undo/Redo  │
//! ├──────────────────────────────────────────┤
//! │      B-Tree Nodes (slotted pages)        │
//! ├──────────────────────────────────────────┤
//! │  Node Arena / Usage LRU / Page Cache     │
//! ├──────────────────────────────────────────┤
//! │        Page Array (memory-mapped)        │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Every tree node mirrors one page. Nodes live in a fixed arena sized
//! from the cache budget; eviction spills through a raw page cache down
//! to the file. Short-lived latches guard node bytes; long-lived per-key
//! locks serialize transactions; the undo log rolls uncommitted work
//! back, and the redo log makes committed work durable.
//!
//! ## Concurrency Model
//!
//! Parallel threads, no async runtime. Readers descend with shared
//! latches hand over hand; writers latch exclusively and hold only the
//! spine a structural change could touch. Per-key locks support shared,
//! upgradable, and exclusive modes with timeout-bounded waits and
//! wait-for-graph deadlock detection.
//!
//! ## Durability
//!
//! Commits write redo records whose flushing is governed by
//! [`DurabilityMode`]: fsync before returning, flush without fsync,
//! buffer only, or nothing at all for temporary data. Checkpoints flush
//! dirty pages and truncate the redo stream; recovery replays committed
//! transactions from the surviving stream.
//!
//! ## Module Overview
//!
//! - [`storage`]: page array, raw page cache, spare page pool
//! - `node`: slotted-page nodes, arena, usage LRU, split/merge
//! - `tree`: descent orchestration and cursors
//! - [`lock`]: lock manager and lockers
//! - `txn`: transactions and the undo log
//! - [`redo`]: redo log writer and decoder
//! - [`sync`]: latch, latch condition, commit lock
//! - [`fragment`]: external large-entry hooks

#[macro_use]
mod macros;

mod db;
mod node;
mod tree;
mod txn;

pub mod config;
pub mod encoding;
pub mod error;
pub mod fragment;
pub mod lock;
pub mod redo;
pub mod storage;
pub mod sync;

pub use config::{DurabilityMode, LockMode, Options};
pub use db::Database;
pub use lock::{LockResult, Locker};
pub use tree::{Tree, TreeCursor};
pub use txn::Transaction;
