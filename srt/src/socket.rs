//! The public socket-style API (§1 "what it is not": no raw CUDT handles
//! exposed). `Socket` wraps one connected `Connection`; `Listener` wraps a
//! `Multiplexer` bound in listening mode and hands out accepted `Socket`s.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use utils::error::Result;

use crate::config::Config;
use crate::connection::{ConnState, Connection, Delivered, StatsSnapshot};
use crate::multiplexer::Multiplexer;

/// One connected SRT endpoint, either dialed via `Socket::connect` or handed out by
/// `Listener::accept`.
pub struct Socket {
	mux: Arc<Multiplexer>,
	conn: Arc<Connection>,
}

impl Socket {
	/// Dial `peer`, completing the full handshake before returning (§4.7).
	pub fn connect(local: SocketAddr, peer: SocketAddr, config: Config) -> Result<Self> {
		let mux = Multiplexer::bind(local)?;
		mux.acquire();
		match mux.connect(peer, config) {
			Ok(conn) => Ok(Self { mux, conn }),
			Err(e) => {
				mux.release();
				Err(e)
			}
		}
	}

	/// Send one message. Blocks if the send buffer is full until space frees up or
	/// the connection closes.
	pub fn send(&self, data: &[u8]) -> Result<()> {
		self.conn.send(data, true)
	}

	/// Send one message without requiring in-order delivery at the peer (§4.3's
	/// `inOrder` flag).
	pub fn send_unordered(&self, data: &[u8]) -> Result<()> {
		self.conn.send(data, false)
	}

	/// Receive the next message whose TSBPD deadline has passed, blocking until one
	/// is available or the connection ends.
	pub fn recv(&self) -> Result<Delivered> {
		self.conn.recv()
	}

	pub fn local_socket_id(&self) -> u32 {
		self.conn.local_socket_id
	}

	pub fn peer_socket_id(&self) -> u32 {
		self.conn.peer_socket_id()
	}

	pub fn is_connected(&self) -> bool {
		self.conn.state() == ConnState::Connected
	}

	pub fn config(&self) -> &Config {
		self.conn.config()
	}

	/// Snapshot the connection's sent/recv/lost/retrans/dropped/undecryptable totals
	/// (§3's Statistics group).
	pub fn stats(&self) -> StatsSnapshot {
		self.conn.stats()
	}

	/// Close the connection, waiting up to `linger` for the send buffer to drain
	/// (SPEC_FULL supplemented feature 3).
	pub fn close(&self, linger: Duration) {
		self.conn.close(linger);
	}
}

impl Drop for Socket {
	fn drop(&mut self) {
		self.mux.release();
	}
}

/// A bound, listening multiplexer handing out accepted connections.
pub struct Listener {
	mux: Arc<Multiplexer>,
}

impl Listener {
	pub fn bind(local: SocketAddr, config: Config) -> Result<Self> {
		let mux = Multiplexer::bind(local)?;
		mux.acquire();
		if let Err(e) = mux.listen(config) {
			mux.release();
			return Err(e);
		}
		Ok(Self { mux })
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.mux.local_addr()
	}

	/// Block until a peer completes the handshake, or `timeout` elapses.
	pub fn accept(&self, timeout: Option<Duration>) -> Result<Socket> {
		let conn = self.mux.accept(timeout)?;
		self.mux.acquire();
		Ok(Socket { mux: Arc::clone(&self.mux), conn })
	}
}

impl Drop for Listener {
	fn drop(&mut self) {
		self.mux.release();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread;

	#[test]
	fn connect_and_exchange_one_message() {
		let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), Config::default()).unwrap();
		let server_addr = listener.local_addr().unwrap();

		let client_thread = thread::spawn(move || {
			let config = Config::default().with_conn_timeout(Duration::from_secs(2));
			let sock = Socket::connect("127.0.0.1:0".parse().unwrap(), server_addr, config).unwrap();
			sock.send(b"hello from client").unwrap();
			sock
		});

		let server_sock = listener.accept(Some(Duration::from_secs(2))).unwrap();
		let delivered = server_sock.recv().unwrap();
		assert_eq!(delivered.data, b"hello from client");

		let client_sock = client_thread.join().unwrap();
		assert!(client_sock.is_connected());
		assert!(server_sock.is_connected());
	}
}
