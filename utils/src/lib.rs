pub mod bytes;
/// Utilities for storing integer-like data in a fixed byteorder.
pub mod endian;
/// The crate-wide error taxonomy.
pub mod error;
