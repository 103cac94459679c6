//! Redo log decoder.
//!
//! Walks a redo file record by record, verifying each terminator against
//! the expected xorshift stream. A record whose terminator mismatches —
//! or that runs past the end of the file — is treated as the log's end,
//! which is exactly what a torn final write looks like.

use std::path::Path;

use eyre::{bail, ensure, Context, Result};

use super::{
    op_has_txn, TermStream, CRC64, OP_CLOSE, OP_DELETE, OP_DELETE_INDEX, OP_END_FILE,
    OP_NOP_RANDOM, OP_RENAME_INDEX, OP_RESET, OP_SHUTDOWN, OP_STORE, OP_TIMESTAMP, OP_TXN_COMMIT,
    OP_TXN_COMMIT_FINAL, OP_TXN_CUSTOM, OP_TXN_DELETE, OP_TXN_DELETE_COMMIT_FINAL, OP_TXN_ENTER,
    OP_TXN_ROLLBACK, OP_TXN_ROLLBACK_FINAL, OP_TXN_STORE, OP_TXN_STORE_COMMIT_FINAL, REDO_HEADER_SIZE,
    REDO_MAGIC, REDO_VERSION,
};
use crate::encoding::{decode_signed_varint, decode_varint};
use crate::error::CorruptDatabase;

/// A decoded redo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoRecord {
    Reset,
    Timestamp { millis: u64 },
    Shutdown { millis: u64 },
    Close { millis: u64 },
    EndFile { millis: u64 },
    NopRandom { nonce: u64 },
    Store { index_id: u64, key: Vec<u8>, value: Vec<u8> },
    Delete { index_id: u64, key: Vec<u8> },
    RenameIndex { txn_id: u64, index_id: u64, new_name: Vec<u8> },
    DeleteIndex { txn_id: u64, index_id: u64 },
    TxnEnter { txn_id: u64 },
    TxnRollback { txn_id: u64 },
    TxnRollbackFinal { txn_id: u64 },
    TxnCommit { txn_id: u64 },
    TxnCommitFinal { txn_id: u64 },
    TxnStore { txn_id: u64, index_id: u64, key: Vec<u8>, value: Vec<u8> },
    TxnDelete { txn_id: u64, index_id: u64, key: Vec<u8> },
    TxnCustom { txn_id: u64, message: Vec<u8> },
}

pub struct RedoDecoder {
    bytes: Vec<u8>,
    at: usize,
    term: TermStream,
    last_txn_id: u64,
}

impl RedoDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read redo log at {:?}", path))?;
        ensure!(
            bytes.len() >= REDO_HEADER_SIZE,
            CorruptDatabase("redo log shorter than its header".into())
        );
        ensure!(
            &bytes[..8] == REDO_MAGIC,
            CorruptDatabase("redo log magic mismatch".into())
        );
        let version = u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes"));
        ensure!(
            version == REDO_VERSION,
            CorruptDatabase(format!("unsupported redo version {}", version))
        );
        let seed = u32::from_le_bytes(bytes[12..16].try_into().expect("4 bytes"));
        let stored_crc = u64::from_le_bytes(bytes[16..24].try_into().expect("8 bytes"));
        ensure!(
            CRC64.checksum(&bytes[..16]) == stored_crc,
            CorruptDatabase("redo header checksum mismatch".into())
        );

        Ok(Self {
            bytes,
            at: REDO_HEADER_SIZE,
            term: TermStream(seed),
            last_txn_id: 0,
        })
    }

    fn remaining(&self) -> &[u8] {
        &self.bytes[self.at..]
    }

    fn take_u64(&mut self) -> Result<u64> {
        ensure!(self.remaining().len() >= 8, "truncated operand");
        let value = u64::from_le_bytes(self.remaining()[..8].try_into().expect("8 bytes"));
        self.at += 8;
        Ok(value)
    }

    fn take_varint(&mut self) -> Result<u64> {
        let (value, used) = decode_varint(self.remaining())?;
        self.at += used;
        Ok(value)
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.take_varint()? as usize;
        ensure!(self.remaining().len() >= len, "truncated byte field");
        let bytes = self.remaining()[..len].to_vec();
        self.at += len;
        Ok(bytes)
    }

    fn take_txn_id(&mut self) -> Result<u64> {
        let (delta, used) = decode_signed_varint(self.remaining())?;
        self.at += used;
        let id = (self.last_txn_id as i64).wrapping_add(delta) as u64;
        self.last_txn_id = id;
        Ok(id)
    }

    /// Decodes the next record, or `None` at a clean or torn end.
    pub fn next_record(&mut self) -> Result<Option<RedoRecord>> {
        let start = self.at;
        let start_txn = self.last_txn_id;
        let start_term = self.term;
        match self.decode_one() {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) | Err(_) => {
                // Malformed tail: rewind and report end-of-log.
                self.at = start;
                self.last_txn_id = start_txn;
                self.term = start_term;
                Ok(None)
            }
        }
    }

    fn decode_one(&mut self) -> Result<Option<RedoRecord>> {
        if self.remaining().is_empty() {
            return Ok(None);
        }
        let op = self.remaining()[0];
        self.at += 1;

        let txn_id = if op_has_txn(op) { self.take_txn_id()? } else { 0 };

        let record = match op {
            OP_RESET => {
                self.last_txn_id = 0;
                RedoRecord::Reset
            }
            OP_TIMESTAMP => RedoRecord::Timestamp { millis: self.take_u64()? },
            OP_SHUTDOWN => RedoRecord::Shutdown { millis: self.take_u64()? },
            OP_CLOSE => RedoRecord::Close { millis: self.take_u64()? },
            OP_END_FILE => RedoRecord::EndFile { millis: self.take_u64()? },
            OP_NOP_RANDOM => RedoRecord::NopRandom { nonce: self.take_u64()? },
            OP_STORE => {
                let index_id = self.take_u64()?;
                let key = self.take_bytes()?;
                let value = self.take_bytes()?;
                RedoRecord::Store { index_id, key, value }
            }
            OP_DELETE => {
                let index_id = self.take_u64()?;
                let key = self.take_bytes()?;
                RedoRecord::Delete { index_id, key }
            }
            OP_RENAME_INDEX => {
                let index_id = self.take_u64()?;
                let new_name = self.take_bytes()?;
                RedoRecord::RenameIndex { txn_id, index_id, new_name }
            }
            OP_DELETE_INDEX => {
                let index_id = self.take_u64()?;
                RedoRecord::DeleteIndex { txn_id, index_id }
            }
            OP_TXN_ENTER => RedoRecord::TxnEnter { txn_id },
            OP_TXN_ROLLBACK => RedoRecord::TxnRollback { txn_id },
            OP_TXN_ROLLBACK_FINAL => RedoRecord::TxnRollbackFinal { txn_id },
            OP_TXN_COMMIT => RedoRecord::TxnCommit { txn_id },
            OP_TXN_COMMIT_FINAL => RedoRecord::TxnCommitFinal { txn_id },
            OP_TXN_STORE | OP_TXN_STORE_COMMIT_FINAL => {
                let index_id = self.take_u64()?;
                let key = self.take_bytes()?;
                let value = self.take_bytes()?;
                RedoRecord::TxnStore { txn_id, index_id, key, value }
            }
            OP_TXN_DELETE | OP_TXN_DELETE_COMMIT_FINAL => {
                let index_id = self.take_u64()?;
                let key = self.take_bytes()?;
                RedoRecord::TxnDelete { txn_id, index_id, key }
            }
            OP_TXN_CUSTOM => {
                let message = self.take_bytes()?;
                RedoRecord::TxnCustom { txn_id, message }
            }
            _ => bail!("unknown redo op {:#x}", op),
        };

        // Terminator check: a mismatch means a torn write.
        ensure!(self.remaining().len() >= 4, "truncated terminator");
        let stored = u32::from_le_bytes(self.remaining()[..4].try_into().expect("4 bytes"));
        let expected = self.term.next();
        ensure!(stored == expected, "terminator mismatch");
        self.at += 4;

        Ok(Some(record))
    }

    /// Decodes every record up to the log's (possibly torn) end.
    pub fn collect_all(mut self) -> Result<Vec<RedoRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }
}
