//! `Channel` (§2, §5): the UDP socket one `Multiplexer` owns. A thin wrapper over
//! `std::net::UdpSocket` — the multi-writer-but-single-syscall-atomic-per-datagram
//! property §5 relies on ("Shared-resource policy") is just the OS socket's own
//! guarantee, so there's no user-level send lock here.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use utils::error::{Result, SrtError};

/// One received datagram and the address it arrived from.
pub struct Datagram {
	pub bytes: Vec<u8>,
	pub from: SocketAddr,
}

pub struct Channel {
	socket: UdpSocket,
}

impl Channel {
	pub fn bind(addr: SocketAddr) -> Result<Self> {
		let socket = UdpSocket::bind(addr).map_err(|e| SrtError::setup("bind", e.to_string()))?;
		Ok(Self { socket })
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.socket.local_addr().map_err(|e| SrtError::setup("local_addr", e.to_string()))
	}

	/// Block for up to `timeout` waiting for a datagram. `None` means the read timed
	/// out, not that the channel is closed — callers use this to interleave periodic
	/// timer work with blocking receives (`RcvQueue`'s dispatch loop, §4.7).
	pub fn recv(&self, timeout: Option<Duration>) -> Result<Option<Datagram>> {
		self.socket.set_read_timeout(timeout).map_err(|e| SrtError::system_resources("set_read_timeout", e.to_string()))?;

		let mut buf = vec![0u8; 1500];
		match self.socket.recv_from(&mut buf) {
			Ok((n, from)) => {
				buf.truncate(n);
				Ok(Some(Datagram { bytes: buf, from }))
			}
			Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => Ok(None),
			Err(e) => Err(SrtError::connection("recv", e.to_string())),
		}
	}

	pub fn send(&self, bytes: &[u8], to: SocketAddr) -> Result<()> {
		let n = self.socket.send_to(bytes, to).map_err(|e| SrtError::connection("send", e.to_string()))?;

		if n != bytes.len() {
			return Err(SrtError::connection("send", format!("short send: {n}/{}", bytes.len())));
		}

		Ok(())
	}

	pub fn try_clone(&self) -> Result<Self> {
		Ok(Self { socket: self.socket.try_clone().map_err(|e| SrtError::system_resources("try_clone", e.to_string()))? })
	}
}
