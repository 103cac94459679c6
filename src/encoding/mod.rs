//! # Encoding Utilities
//!
//! Wire-level integer encodings shared by the undo and redo logs. The
//! slotted-page entry headers have their own codec in the node module;
//! this one is for log records.

pub mod varint;

pub use varint::{
    decode_signed_varint, decode_varint, encode_signed_varint, encode_varint, varint_len,
};
