//! The crate-wide error taxonomy. Every public operation returns either `Ok(value)` or
//! `Err(SrtError)` — protocol-layer code never panics across an API boundary;
//! malformed-packet and similar per-datagram faults are logged and the packet is
//! dropped instead of surfacing an error at all (see `drop_packet!` below).

use std::fmt;

#[doc(hidden)]
pub trait Ext<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T>;
}

impl<T, E> Ext<T, E> for Result<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T> {
		match self {
			Ok(v) => Some(v),
			Err(e) => {
				f(e);
				None
			}
		}
	}
}

/// The kind of failure, independent of the specific situation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// Invalid argument, unsupported option, address already in use.
	Setup,
	/// Refused, timed out, or broken connection.
	Connection,
	/// Allocation failure or other resource exhaustion.
	SystemResources,
	/// The operation would block and the handle is in non-blocking mode.
	AsyncFail,
	/// The send buffer is full, or there is no room to schedule a packet.
	NoBuf,
	/// Key material could not be established, or decryption failed persistently.
	Security,
	/// The operation is not legal in the handle's current state.
	NotSupported,
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ErrorKind::Setup => "setup",
			ErrorKind::Connection => "connection",
			ErrorKind::SystemResources => "system resources",
			ErrorKind::AsyncFail => "would block",
			ErrorKind::NoBuf => "no buffer space",
			ErrorKind::Security => "security",
			ErrorKind::NotSupported => "not supported",
		};

		f.write_str(s)
	}
}

/// A crate-wide error. `subcode` narrows `kind` for callers that want to match on a
/// specific situation (e.g. `ErrorKind::Connection` with `subcode: "timeout"` vs.
/// `subcode: "broken"`) without growing an enum variant per situation.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SrtError {
	pub kind: ErrorKind,
	pub subcode: &'static str,
	pub message: String,
}

impl SrtError {
	pub fn new(kind: ErrorKind, subcode: &'static str, message: impl Into<String>) -> Self {
		Self { kind, subcode, message: message.into() }
	}
}

macro_rules! ctor {
	($name:ident, $kind:ident) => {
		pub fn $name(subcode: &'static str, message: impl Into<String>) -> Self {
			Self::new(ErrorKind::$kind, subcode, message)
		}
	};
}

impl SrtError {
	ctor!(setup, Setup);
	ctor!(connection, Connection);
	ctor!(system_resources, SystemResources);
	ctor!(async_fail, AsyncFail);
	ctor!(no_buf, NoBuf);
	ctor!(security, Security);
	ctor!(not_supported, NotSupported);
}

pub type Result<T = ()> = std::result::Result<T, SrtError>;

pub use Ext as _;

/// Log `err` at `warn` level and fold it into `Ok(())` — the propagation policy for
/// per-packet faults that must never tear down a connection.
#[macro_export]
macro_rules! drop_packet {
	($expr:expr) => {
		if let Err(e) = $expr {
			log::warn!("{e}");
		}
	};
}
