pub mod rangeset;
pub mod ring;
pub mod samples;
/// Wrap-aware sequence, message, and timestamp counters.
pub mod seq;
