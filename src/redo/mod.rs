//! # Redo Log
//!
//! Append-only operation stream backing durability. Mutations write their
//! redo record before the transaction reports commit; recovery replays
//! committed records after a crash.
//!
//! ## Record shape
//!
//! ```text
//! <op:u8> [operands] <terminator:u32>
//! ```
//!
//! Transaction ids are delta-encoded as signed varints against the
//! previously emitted id, index ids are LE u64, and lengths are unsigned
//! varints. The terminator is the next value of a per-file xorshift
//! stream seeded in the file header; a record whose terminator does not
//! match the expected stream value marks the end of the decodable log —
//! torn writes are detected, not repaired.
//!
//! ## Durability modes
//!
//! - `Sync`: flush and fsync before the commit returns.
//! - `NoSync`: flush to the OS; the commit position joins a pending queue
//!   that the next explicit sync drains.
//! - `NoFlush`: records sit in the writer buffer until something flushes.
//! - `NoRedo`: nothing is recorded (temporary trees).
//!
//! Writes funnel through a fixed buffer guarded by the writer's own
//! mutex, separate from any latch.

mod decoder;

pub use decoder::{RedoDecoder, RedoRecord};

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Context, Result};
use parking_lot::Mutex;

use crate::config::{DurabilityMode, REDO_BUFFER_SIZE};
use crate::encoding::{encode_signed_varint, encode_varint};
use crate::error::UnmodifiableReplica;

pub(crate) const REDO_MAGIC: &[u8; 8] = b"BurlRedo";
pub(crate) const REDO_VERSION: u32 = 1;
pub(crate) const REDO_HEADER_SIZE: usize = 8 + 4 + 4 + 8;

pub(crate) const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

// Operation codes. Values with the transaction bit (0x40) delta-encode a
// transaction id as their first operand.
pub(crate) const OP_RESET: u8 = 1;
pub(crate) const OP_TIMESTAMP: u8 = 2;
pub(crate) const OP_SHUTDOWN: u8 = 3;
pub(crate) const OP_CLOSE: u8 = 4;
pub(crate) const OP_END_FILE: u8 = 5;
pub(crate) const OP_NOP_RANDOM: u8 = 6;
pub(crate) const OP_STORE: u8 = 16;
pub(crate) const OP_DELETE: u8 = 17;
pub(crate) const OP_RENAME_INDEX: u8 = 0x40 | 8;
pub(crate) const OP_DELETE_INDEX: u8 = 0x40 | 9;
pub(crate) const OP_TXN_ENTER: u8 = 0x40 | 1;
pub(crate) const OP_TXN_ROLLBACK: u8 = 0x40 | 2;
pub(crate) const OP_TXN_ROLLBACK_FINAL: u8 = 0x40 | 3;
pub(crate) const OP_TXN_COMMIT: u8 = 0x40 | 4;
pub(crate) const OP_TXN_COMMIT_FINAL: u8 = 0x40 | 5;
pub(crate) const OP_TXN_STORE: u8 = 0x40 | 16;
pub(crate) const OP_TXN_STORE_COMMIT_FINAL: u8 = 0x40 | 17;
pub(crate) const OP_TXN_DELETE: u8 = 0x40 | 18;
pub(crate) const OP_TXN_DELETE_COMMIT_FINAL: u8 = 0x40 | 19;
pub(crate) const OP_TXN_CUSTOM: u8 = 0x40 | 24;

#[inline]
pub(crate) fn op_has_txn(op: u8) -> bool {
    op & 0x40 != 0
}

/// Per-file terminator stream: xorshift32 over the header seed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TermStream(pub u32);

impl TermStream {
    pub(crate) fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

struct RedoState {
    buffer: Vec<u8>,
    file: Option<File>,
    last_txn_id: u64,
    term: TermStream,
    /// Bytes accepted, including those still buffered.
    position: u64,
    /// Bytes confirmed on durable storage.
    synced_position: u64,
    /// NoSync commit positions awaiting durability.
    pending: VecDeque<u64>,
}

impl RedoState {
    fn write_op(&mut self, op: u8) {
        self.buffer.push(op);
    }

    fn write_txn_op(&mut self, op: u8, txn_id: u64) {
        self.buffer.push(op);
        encode_signed_varint(txn_id as i64 - self.last_txn_id as i64, &mut self.buffer);
        self.last_txn_id = txn_id;
    }

    fn write_index_id(&mut self, index_id: u64) {
        self.buffer.extend_from_slice(&index_id.to_le_bytes());
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        encode_varint(bytes.len() as u64, &mut self.buffer);
        self.buffer.extend_from_slice(bytes);
    }

    fn write_terminator(&mut self) {
        let term = self.term.next();
        self.buffer.extend_from_slice(&term.to_le_bytes());
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(&self.buffer)
                .wrap_err("failed to write redo log")?;
        }
        self.position += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.flush()?;
        if let Some(file) = self.file.as_ref() {
            file.sync_data().wrap_err("failed to sync redo log")?;
        }
        self.synced_position = self.position;
        self.pending.clear();
        Ok(())
    }

    /// Flush ladder shared by all committing operations. Returns the
    /// position a Sync caller must consider durable.
    fn commit_flush(&mut self, mode: DurabilityMode) -> Result<u64> {
        match mode {
            DurabilityMode::NoRedo | DurabilityMode::NoFlush => Ok(0),
            DurabilityMode::NoSync => {
                self.flush()?;
                let position = self.position;
                self.pending.push_back(position);
                Ok(0)
            }
            DurabilityMode::Sync => {
                self.flush()?;
                Ok(self.position)
            }
        }
    }
}

/// Buffered, append-only redo writer.
pub struct RedoLog {
    state: Mutex<RedoState>,
    /// When set, op writes are refused with UnmodifiableReplica.
    replica: AtomicBool,
    /// True when nothing is ever recorded (NoRedo database).
    disabled: bool,
}

impl RedoLog {
    /// Creates or truncates the redo file, writing a fresh header.
    pub fn create(path: &Path, seed: u32) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create redo log at {:?}", path))?;

        let mut header = Vec::with_capacity(REDO_HEADER_SIZE);
        header.extend_from_slice(REDO_MAGIC);
        header.extend_from_slice(&REDO_VERSION.to_le_bytes());
        header.extend_from_slice(&seed.to_le_bytes());
        header.extend_from_slice(&CRC64.checksum(&header).to_le_bytes());
        file.write_all(&header).wrap_err("failed to write redo header")?;
        file.sync_data().wrap_err("failed to sync redo header")?;

        Ok(Self {
            state: Mutex::new(RedoState {
                buffer: Vec::with_capacity(REDO_BUFFER_SIZE),
                file: Some(file),
                last_txn_id: 0,
                term: TermStream(seed),
                position: REDO_HEADER_SIZE as u64,
                synced_position: REDO_HEADER_SIZE as u64,
                pending: VecDeque::new(),
            }),
            replica: AtomicBool::new(false),
            disabled: false,
        })
    }

    /// A writer that records nothing, for NoRedo databases and temporary
    /// trees.
    pub fn disabled() -> Self {
        Self {
            state: Mutex::new(RedoState {
                buffer: Vec::new(),
                file: None,
                last_txn_id: 0,
                term: TermStream(0),
                position: 0,
                synced_position: 0,
                pending: VecDeque::new(),
            }),
            replica: AtomicBool::new(false),
            disabled: true,
        }
    }

    pub(crate) fn set_replica(&self, replica: bool) {
        self.replica.store(replica, Ordering::Release);
    }

    fn op_write_check(&self) -> Result<()> {
        ensure!(!self.replica.load(Ordering::Acquire), UnmodifiableReplica);
        Ok(())
    }

    /// Auto-commit store or delete (no transaction). A `None` value is a
    /// delete. Returns the position to sync when the mode demands it.
    pub fn store(
        &self,
        index_id: u64,
        key: &[u8],
        value: Option<&[u8]>,
        mode: DurabilityMode,
    ) -> Result<u64> {
        if self.disabled || mode == DurabilityMode::NoRedo {
            return Ok(0);
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        match value {
            Some(value) => {
                state.write_op(OP_STORE);
                state.write_index_id(index_id);
                state.write_bytes(key);
                state.write_bytes(value);
            }
            None => {
                state.write_op(OP_DELETE);
                state.write_index_id(index_id);
                state.write_bytes(key);
            }
        }
        state.write_terminator();
        state.commit_flush(mode)
    }

    pub fn txn_enter(&self, txn_id: u64) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_txn_op(OP_TXN_ENTER, txn_id);
        state.write_terminator();
        Ok(())
    }

    pub fn txn_store(&self, txn_id: u64, index_id: u64, key: &[u8], value: &[u8]) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_txn_op(OP_TXN_STORE, txn_id);
        state.write_index_id(index_id);
        state.write_bytes(key);
        state.write_bytes(value);
        state.write_terminator();
        Ok(())
    }

    pub fn txn_delete(&self, txn_id: u64, index_id: u64, key: &[u8]) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_txn_op(OP_TXN_DELETE, txn_id);
        state.write_index_id(index_id);
        state.write_bytes(key);
        state.write_terminator();
        Ok(())
    }

    pub fn txn_custom(&self, txn_id: u64, message: &[u8]) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_txn_op(OP_TXN_CUSTOM, txn_id);
        state.write_bytes(message);
        state.write_terminator();
        Ok(())
    }

    /// Scoped (nested) commit marker.
    pub fn txn_commit(&self, txn_id: u64) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_txn_op(OP_TXN_COMMIT, txn_id);
        state.write_terminator();
        Ok(())
    }

    /// Final commit of the top scope. Returns the sync position for Sync
    /// mode callers.
    pub fn txn_commit_final(&self, txn_id: u64, mode: DurabilityMode) -> Result<u64> {
        if self.disabled || mode == DurabilityMode::NoRedo {
            return Ok(0);
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_txn_op(OP_TXN_COMMIT_FINAL, txn_id);
        state.write_terminator();
        state.commit_flush(mode)
    }

    pub fn txn_rollback(&self, txn_id: u64) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_txn_op(OP_TXN_ROLLBACK, txn_id);
        state.write_terminator();
        Ok(())
    }

    pub fn txn_rollback_final(&self, txn_id: u64) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_txn_op(OP_TXN_ROLLBACK_FINAL, txn_id);
        state.write_terminator();
        Ok(())
    }

    pub fn rename_index(&self, txn_id: u64, index_id: u64, new_name: &[u8]) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_txn_op(OP_RENAME_INDEX, txn_id);
        state.write_index_id(index_id);
        state.write_bytes(new_name);
        state.write_terminator();
        Ok(())
    }

    pub fn delete_index(&self, txn_id: u64, index_id: u64) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_txn_op(OP_DELETE_INDEX, txn_id);
        state.write_index_id(index_id);
        state.write_terminator();
        Ok(())
    }

    pub fn timestamp(&self, millis: u64) -> Result<()> {
        self.plain_op_with_operand(OP_TIMESTAMP, millis)
    }

    pub fn reset(&self) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_op(OP_RESET);
        state.last_txn_id = 0;
        state.write_terminator();
        Ok(())
    }

    pub fn shutdown(&self, millis: u64) -> Result<()> {
        self.plain_op_with_operand(OP_SHUTDOWN, millis)?;
        self.sync()
    }

    pub fn close(&self, millis: u64) -> Result<()> {
        self.plain_op_with_operand(OP_CLOSE, millis)?;
        let mut state = self.state.lock();
        state.sync()?;
        state.file = None;
        Ok(())
    }

    pub fn end_file(&self, millis: u64) -> Result<()> {
        self.plain_op_with_operand(OP_END_FILE, millis)?;
        let mut state = self.state.lock();
        state.flush()
    }

    pub fn nop_random(&self, nonce: u64) -> Result<()> {
        self.plain_op_with_operand(OP_NOP_RANDOM, nonce)
    }

    fn plain_op_with_operand(&self, op: u8, operand: u64) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.op_write_check()?;
        let mut state = self.state.lock();
        state.write_op(op);
        state.buffer.extend_from_slice(&operand.to_le_bytes());
        state.write_terminator();
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.state.lock().flush()
    }

    /// Checkpoint switch: syncs the current file and starts a fresh one
    /// at `path`. Called with the commit lock held exclusively, so no
    /// record straddles the boundary. No-op for a disabled writer.
    pub fn rotate(&self, path: &Path, seed: u32) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.sync()?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create redo log at {:?}", path))?;
        let mut header = Vec::with_capacity(REDO_HEADER_SIZE);
        header.extend_from_slice(REDO_MAGIC);
        header.extend_from_slice(&REDO_VERSION.to_le_bytes());
        header.extend_from_slice(&seed.to_le_bytes());
        header.extend_from_slice(&CRC64.checksum(&header).to_le_bytes());
        file.write_all(&header).wrap_err("failed to write redo header")?;
        file.sync_data().wrap_err("failed to sync redo header")?;

        state.file = Some(file);
        state.term = TermStream(seed);
        state.last_txn_id = 0;
        state.position = REDO_HEADER_SIZE as u64;
        state.synced_position = REDO_HEADER_SIZE as u64;
        state.pending.clear();
        Ok(())
    }

    /// Forces everything buffered to durable storage, reporting pending
    /// NoSync commits durable as a side effect.
    pub fn sync(&self) -> Result<()> {
        self.state.lock().sync()
    }

    /// Syncs if the captured position is not yet durable.
    pub fn commit_sync(&self, position: u64) -> Result<()> {
        let mut state = self.state.lock();
        if position > state.synced_position {
            state.sync()?;
        }
        Ok(())
    }

    /// Commits pending durability: positions enqueued by NoSync commits.
    pub fn pending_commits(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Current end position (including buffered bytes).
    pub fn position(&self) -> u64 {
        let state = self.state.lock();
        state.position + state.buffer.len() as u64
    }

    /// Uncheckpointed bytes past the given mark.
    pub fn bytes_since(&self, mark: u64) -> u64 {
        self.position().saturating_sub(mark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_survive_flush_and_decode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let redo = RedoLog::create(&path, 0x1234).unwrap();

        redo.txn_store(7, 2, b"key", b"value").unwrap();
        redo.txn_commit_final(7, DurabilityMode::Sync).unwrap();
        redo.sync().unwrap();

        let records = RedoDecoder::open(&path).unwrap().collect_all().unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            RedoRecord::TxnStore {
                txn_id,
                index_id,
                key,
                value,
            } => {
                assert_eq!(*txn_id, 7);
                assert_eq!(*index_id, 2);
                assert_eq!(key, b"key");
                assert_eq!(value, b"value");
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert!(matches!(
            records[1],
            RedoRecord::TxnCommitFinal { txn_id: 7 }
        ));
    }

    #[test]
    fn torn_tail_is_silently_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let redo = RedoLog::create(&path, 99).unwrap();
        redo.txn_store(1, 1, b"a", b"1").unwrap();
        redo.txn_commit_final(1, DurabilityMode::Sync).unwrap();
        redo.txn_store(2, 1, b"b", b"2").unwrap();
        redo.sync().unwrap();

        // Corrupt the tail record's terminator.
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let records = RedoDecoder::open(&path).unwrap().collect_all().unwrap();
        assert_eq!(records.len(), 2, "torn third record dropped");
    }

    #[test]
    fn replica_refuses_writes() {
        let dir = tempdir().unwrap();
        let redo = RedoLog::create(&dir.path().join("redo.log"), 1).unwrap();
        redo.set_replica(true);
        let err = redo.txn_store(1, 1, b"k", b"v").unwrap_err();
        assert!(err.downcast_ref::<UnmodifiableReplica>().is_some());
    }

    #[test]
    fn no_sync_commits_queue_until_sync() {
        let dir = tempdir().unwrap();
        let redo = RedoLog::create(&dir.path().join("redo.log"), 5).unwrap();
        redo.txn_store(1, 1, b"k", b"v").unwrap();
        redo.txn_commit_final(1, DurabilityMode::NoSync).unwrap();
        assert_eq!(redo.pending_commits(), 1);
        redo.sync().unwrap();
        assert_eq!(redo.pending_commits(), 0);
    }

    #[test]
    fn disabled_log_accepts_everything_silently() {
        let redo = RedoLog::disabled();
        redo.txn_store(1, 1, b"k", b"v").unwrap();
        assert_eq!(
            redo.txn_commit_final(1, DurabilityMode::Sync).unwrap(),
            0
        );
        assert_eq!(redo.position(), 0);
    }

    #[test]
    fn txn_ids_are_delta_encoded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let redo = RedoLog::create(&path, 3).unwrap();
        // Consecutive ids differ by one; each op should spend a single
        // byte on the id delta.
        redo.txn_enter(100).unwrap();
        redo.txn_enter(101).unwrap();
        redo.txn_enter(102).unwrap();
        redo.sync().unwrap();

        let records = RedoDecoder::open(&path).unwrap().collect_all().unwrap();
        let ids: Vec<u64> = records
            .iter()
            .map(|r| match r {
                RedoRecord::TxnEnter { txn_id } => *txn_id,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![100, 101, 102]);

        let size = std::fs::metadata(&path).unwrap().len();
        // header + enter(1 op + 2-byte delta for 100) + 2 * (1 + 1) + 3
        // terminators
        assert!(size < REDO_HEADER_SIZE as u64 + 3 * 8);
    }
}
