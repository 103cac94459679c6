//! # Configuration
//!
//! Numeric constants live in [`constants`]; runtime knobs live on
//! [`Options`], which validates itself before the database opens. The two
//! are split so layout constants can be used in const contexts while the
//! runtime surface stays a plain builder.

pub mod constants;
mod options;

pub use constants::*;
pub use options::{DurabilityMode, LockMode, Options};
