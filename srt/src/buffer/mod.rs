//! `SndBuffer` / `RcvBuffer` (§4.4, §4.5): the payload-unit ring buffers that sit
//! between the application and the wire.

pub mod rcv;
pub mod snd;

pub use rcv::{AddResult, RcvBuffer};
pub use snd::{ReadResult, SndBuffer};
