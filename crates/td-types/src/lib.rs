//! # td-types
//!
//! Shared records and the error taxonomy for Tandem: study and trial ids,
//! trial snapshots, parameter distributions, and the `TdError` family used by
//! the ledger and the coordination layer.

pub mod distribution;
pub mod errors;
pub mod trial;

pub use distribution::*;
pub use errors::*;
pub use trial::*;
