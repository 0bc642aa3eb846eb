//! `Multiplexer` (§4.8): one UDP endpoint, its `ConnectionRegistry`, the listener's
//! accept queue, and the four long-running threads from §5 (`SndQueue`, `RcvQueue`,
//! timer, GC) plus one per-connection TSBPD thread per accepted/dialed `Connection`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crypto::{CryptoProvider, RustCrypto};
use rand::Rng;
use utils::error::{Result, SrtError};

use crate::channel::Channel;
use crate::clock::Clock;
use crate::config::Config;
use crate::connection::{run_tsbpd, ConnState, Connection};
use crate::handshake::{Handshake, HandshakeType, RejectReason};
use crate::packet::{Header, Packet};
use crate::queue::{run_gc, run_rcv_queue, run_snd_queue, run_timer};
use crate::registry::{random_isn, ConnectionRegistry, PeerKey};

pub struct Multiplexer {
	channel: Arc<Channel>,
	registry: Arc<ConnectionRegistry>,
	provider: Arc<dyn CryptoProvider>,
	clock: Clock,
	cookie_secret: [u8; 16],

	listening: AtomicBool,
	listen_config: Mutex<Option<Config>>,
	accept_queue: Mutex<VecDeque<Arc<Connection>>>,
	accept_cond: Condvar,

	shutdown: AtomicBool,
	refcount: AtomicUsize,
	threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Multiplexer {
	pub fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
		let channel = Arc::new(Channel::bind(addr)?);
		let mut secret = [0u8; 16];
		rand::thread_rng().fill(&mut secret);

		let mux = Arc::new(Self {
			channel,
			registry: Arc::new(ConnectionRegistry::new()),
			provider: Arc::new(RustCrypto),
			clock: Clock::new(),
			cookie_secret: secret,
			listening: AtomicBool::new(false),
			listen_config: Mutex::new(None),
			accept_queue: Mutex::new(VecDeque::new()),
			accept_cond: Condvar::new(),
			shutdown: AtomicBool::new(false),
			refcount: AtomicUsize::new(0),
			threads: Mutex::new(Vec::new()),
		});

		mux.spawn_workers();
		Ok(mux)
	}

	fn spawn_workers(self: &Arc<Self>) {
		let mut threads = self.threads.lock().unwrap();
		for (name, f) in [("srt-sndq", run_snd_queue as fn(Arc<Multiplexer>)), ("srt-timer", run_timer), ("srt-gc", run_gc)] {
			let mux = Arc::clone(self);
			threads.push(std::thread::Builder::new().name(name.into()).spawn(move || f(mux)).expect("spawn worker thread"));
		}

		let mux = Arc::clone(self);
		threads.push(std::thread::Builder::new().name("srt-rcvq".into()).spawn(move || run_rcv_queue(mux)).expect("spawn worker thread"));
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.channel.local_addr()
	}

	pub fn channel(&self) -> &Arc<Channel> {
		&self.channel
	}

	pub fn registry(&self) -> &Arc<ConnectionRegistry> {
		&self.registry
	}

	pub fn provider(&self) -> Arc<dyn CryptoProvider> {
		Arc::clone(&self.provider)
	}

	pub fn shutting_down(&self) -> bool {
		self.shutdown.load(Ordering::Acquire)
	}

	pub fn refcount(&self) -> &AtomicUsize {
		&self.refcount
	}

	pub fn acquire(self: &Arc<Self>) {
		self.refcount.fetch_add(1, Ordering::AcqRel);
	}

	/// Release one reference; tears the multiplexer down (stopping its threads) once
	/// the last owning socket drops (§4.8: "A multiplexer with refcount 0 is torn
	/// down").
	pub fn release(self: &Arc<Self>) {
		if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.shutdown.store(true, Ordering::Release);
		}
	}

	// ---- Outbound connect ----

	pub fn connect(self: &Arc<Self>, peer: SocketAddr, config: Config) -> Result<Arc<Connection>> {
		config.validate()?;

		let id = self.registry.allocate_id();
		let isn = random_isn();
		let conn = Arc::new(Connection::new(id, config.clone(), Arc::clone(&self.channel), self.provider(), self.clock, isn));
		self.registry.insert(id, Arc::clone(&conn));
		spawn_tsbpd(&conn);

		conn.begin_connect(peer)?;

		let deadline = std::time::Instant::now() + config.conn_timeout;
		let mut last_retry = std::time::Instant::now();

		loop {
			let remaining = deadline.saturating_duration_since(std::time::Instant::now());
			if remaining.is_zero() {
				self.registry.remove(id);
				return Err(SrtError::connection("timeout", "connect timed out"));
			}

			match conn.wait_connected(remaining.min(Duration::from_millis(250))) {
				Ok(()) => return Ok(conn),
				Err(e) if conn.state() == ConnState::Broken => {
					self.registry.remove(id);
					return Err(e);
				}
				Err(_) => {
					if last_retry.elapsed() >= Duration::from_millis(250) {
						let _ = conn.begin_connect(peer);
						last_retry = std::time::Instant::now();
					}
				}
			}
		}
	}

	// ---- Inbound listen/accept ----

	pub fn listen(&self, config: Config) -> Result<()> {
		config.validate()?;
		*self.listen_config.lock().unwrap() = Some(config);
		self.listening.store(true, Ordering::Release);
		Ok(())
	}

	pub fn accept(&self, timeout: Option<Duration>) -> Result<Arc<Connection>> {
		let mut guard = self.accept_queue.lock().unwrap();

		match timeout {
			Some(t) => {
				let (g, _) = self.accept_cond.wait_timeout_while(guard, t, |q| q.is_empty()).map_err(|_| SrtError::system_resources("accept", "poisoned lock"))?;
				guard = g;
			}
			None => {
				while guard.is_empty() {
					guard = self.accept_cond.wait(guard).map_err(|_| SrtError::system_resources("accept", "poisoned lock"))?;
				}
			}
		}

		guard.pop_front().ok_or_else(|| SrtError::async_fail("accept", "no pending connection"))
	}

	/// Handle a handshake control packet addressed to socket id 0 — either the
	/// listener's stateless induction/conclusion path, or a rendezvous peer's
	/// `Waveahand`/`Conclusion` routed to an already-`Connecting` local connection.
	pub fn handle_listener_handshake(self: &Arc<Self>, packet: Packet, from: SocketAddr) {
		let Header::Control { .. } = packet.header else { return };
		let Ok(hs) = Handshake::unpack(&packet.payload) else { return };

		if let Some(conn) = self.registry.all().into_iter().find(|c| *c.peer_addr.lock().unwrap() == Some(from) && c.state() == ConnState::Connecting) {
			conn.on_handshake_ctrl(&packet, from);
			return;
		}

		if !self.listening.load(Ordering::Acquire) {
			return;
		}

		match hs.req_type {
			HandshakeType::Induction | HandshakeType::Waveahand => {
				let local = self.local_addr().unwrap_or(from);
				let reply = Connection::listener_induction_reply(&self.cookie_secret, local, from, &hs);
				let _ = self.channel.send(&reply.pack(), from);
			}
			HandshakeType::Conclusion => self.handle_conclusion(&hs, from),
			HandshakeType::Rejection(_) => {}
		}
	}

	fn handle_conclusion(self: &Arc<Self>, hs: &Handshake, from: SocketAddr) {
		let local = self.local_addr().unwrap_or(from);
		if !Connection::listener_cookie_is_valid(&self.cookie_secret, from, local, hs) {
			let reply = Connection::reject_reply(RejectReason::BadCookie, hs, from);
			let _ = self.channel.send(&reply.pack(), from);
			return;
		}

		let key = PeerKey { peer_addr: from, peer_socket_id: hs.socket_id, peer_isn: hs.isn.value() };

		if let Some(existing) = self.registry.lookup_peer(&key) {
			if existing.state() == ConnState::Connected {
				let reply = existing.accepted_reply(hs, from);
				let _ = self.channel.send(&reply.pack(), from);
			}
			return;
		}

		let config = self.listen_config.lock().unwrap().clone().unwrap_or_default();
		if config.validate().is_err() {
			let reply = Connection::reject_reply(RejectReason::VersionMismatch, hs, from);
			let _ = self.channel.send(&reply.pack(), from);
			return;
		}

		let id = self.registry.allocate_id();
		let isn = random_isn();
		let conn = Arc::new(Connection::new(id, config, Arc::clone(&self.channel), self.provider(), self.clock, isn));
		self.registry.insert(id, Arc::clone(&conn));
		self.registry.index_peer(key, id);
		spawn_tsbpd(&conn);

		let reply = conn.accepted_reply(hs, from);
		let _ = self.channel.send(&reply.pack(), from);

		self.accept_queue.lock().unwrap().push_back(conn);
		self.accept_cond.notify_all();
	}
}

/// Spawn the per-connection TSBPD thread (§5). Not tracked in `Multiplexer::threads`
/// since it's scoped to the connection, not the multiplexer; it exits on its own once
/// `conn` reaches `Broken`/`Closed`.
fn spawn_tsbpd(conn: &Arc<Connection>) {
	let conn = Arc::clone(conn);
	let _ = std::thread::Builder::new().name("srt-tsbpd".into()).spawn(move || run_tsbpd(conn));
}

/// Close every still-live connection and stop the worker threads. Called when the
/// last `Socket`/`Listener` handle referencing this multiplexer drops (see `release`);
/// not `Drop` itself because threads need an `Arc<Self>` to join cleanly, which a
/// `&mut self` destructor can't provide.
pub fn shutdown_and_join(mux: &Arc<Multiplexer>) {
	mux.shutdown.store(true, Ordering::Release);
	for conn in mux.registry.all() {
		conn.close(Duration::from_millis(0));
	}
	for handle in mux.threads.lock().unwrap().drain(..) {
		let _ = handle.join();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bind_assigns_a_local_address() {
		let mux = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		let addr = mux.local_addr().unwrap();
		assert_ne!(addr.port(), 0);
		shutdown_and_join(&mux);
	}
}
