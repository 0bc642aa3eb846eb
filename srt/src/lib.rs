//! SRT (Secure Reliable Transport): a connection-oriented, reliable, UDP-based
//! transport with selective retransmission and time-based packet delivery
//! (TSBPD). This crate implements the core protocol engine and a small
//! socket-style public API on top.

pub mod buffer;
pub mod channel;
pub mod clock;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod loss;
pub mod multiplexer;
pub mod packet;
pub mod queue;
pub mod registry;
pub mod socket;
pub mod window;

pub use config::Config;
pub use connection::{Delivered, StatsSnapshot};
pub use socket::{Listener, Socket};
