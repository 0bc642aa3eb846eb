//! `Connection` (§4.7): the per-socket state machine, from `Opened` through
//! `Connected` to `Closed`. Owns the send/receive buffers and loss lists, the RTT/
//! rate/drift estimators, the crypto control block, and the periodic-action and
//! TSBPD timers that the multiplexer's worker threads drive.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bilge::prelude::u27;
use collections::seq::{seqcmp, MsgNo, SeqNo, Timestamp, Wrapping};
use crypto::{Cipher, CryptoControl, CryptoProvider, KeySpec, KmState};
use utils::error::{ErrorKind, Result, SrtError};

use crate::buffer::{AddResult, RcvBuffer, ReadResult, SndBuffer};
use crate::channel::Channel;
use crate::clock::{Clock, Dewrap};
use crate::config::Config;
use crate::handshake::{cookie_is_valid, current_epoch, make_cookie, Handshake, HandshakeType, RejectReason, SrtFlags, SrtHsReq};
use crate::loss::{RcvLossList, SndLossList};
use crate::packet::{body_from_words, words_from_body, Boundary, EncFlags, ExtType, Header, MessageType, Packet};
use crate::window::{DriftEstimator, RateEstimator, RttEstimator};

/// The core's SRT protocol version (we always advertise 5). §4.7's HSv4
/// compatibility path is implemented via `accepted_reply`/`on_handshake_ctrl`: an
/// HSv4-only peer gets a plain v4 conclusion with no extension blocks, and SRT
/// feature negotiation (TSBPD/TLPktDrop/NAKReport/REXMIT flags) is carried
/// afterward in post-handshake `Extension(HsReq/HsRsp)` control packets, retried by
/// the HSv5 side on `on_tick`'s cadence up to `HSV4_MAX_RETRIES` times.
const SRT_VERSION: u32 = 5;
const SRT_LIB_VERSION: u32 = 0x0001_0501;
const HSV4_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const HSV4_MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
	Init,
	Opened,
	Connecting,
	Listening,
	Connected,
	Closing,
	Broken,
	Closed,
}

const ACK_INTERVAL: Duration = Duration::from_millis(10);
const ACK_EVERY_N_PACKETS: u32 = 64;
const MIN_NAK_INTERVAL: Duration = Duration::from_millis(20);
const MIN_EXP_INTERVAL: Duration = Duration::from_millis(100);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const EXP_MAX_COUNT: u32 = 16;
const EXP_MAX_ELAPSED: Duration = Duration::from_secs(5);

/// One payload delivered to the application, with the bonding metadata a group/
/// bonding policy layered on top would need (§9's open question, SPEC_FULL feature 5).
pub struct Delivered {
	pub data: Vec<u8>,
	pub seq: SeqNo,
	pub msg_no: MsgNo,
	pub timestamp: Timestamp,
}

/// The connection statistics group (§3): sent/recv totals, loss/retransmit/drop/
/// undecryptable counters. Kept as plain atomics rather than behind the state mutex
/// since every counter is independently updated from whichever path touches it.
#[derive(Default)]
struct Stats {
	sent_packets: AtomicU64,
	sent_bytes: AtomicU64,
	recv_packets: AtomicU64,
	recv_bytes: AtomicU64,
	lost_packets: AtomicU64,
	retrans_packets: AtomicU64,
	dropped_packets: AtomicU64,
	undecryptable_packets: AtomicU64,
}

/// A point-in-time copy of `Stats`, returned to the application by `Socket::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
	pub sent_packets: u64,
	pub sent_bytes: u64,
	pub recv_packets: u64,
	pub recv_bytes: u64,
	pub lost_packets: u64,
	pub retrans_packets: u64,
	pub dropped_packets: u64,
	pub undecryptable_packets: u64,
}

struct Timers {
	next_ack: Instant,
	next_nak: Instant,
	next_exp: Instant,
	next_hsv4_retry: Instant,
	last_snd: Instant,
	last_rsp: Instant,
	exp_count: u32,
	hsv4_retry_count: u32,
}

struct AckBook {
	snd_last_ack: SeqNo,
	ack_seq_no: u32,
	/// `ackSeqNo -> rcvLastAck` at the time that ACK was sent, so the matching ACKACK
	/// can be correlated even though ACKACK only carries the 32-bit ack sequence.
	pending: VecDeque<(u32, SeqNo)>,
}

pub struct Connection {
	pub local_socket_id: u32,
	peer_socket_id: AtomicU32,
	pub peer_addr: Mutex<Option<SocketAddr>>,
	state: Mutex<ConnState>,
	state_cond: Condvar,

	config: Config,
	clock: Clock,
	origin_us: u64,
	isn: SeqNo,
	peer_isn: Mutex<SeqNo>,
	peer_mss: Mutex<u32>,
	peer_tsbpd_delay_ms: Mutex<u32>,
	cookie: Mutex<u32>,
	/// This connection's own `clock.now_us()` at the moment the peer's identity was
	/// installed (handshake conclusion): the local-clock instant that corresponds to
	/// the peer's wire timestamp 0, i.e. "peerStartTime" expressed on *our* clock
	/// (§4.5's `playTime = peerStartTime + packet.timestamp + rcvLatency + drift`).
	/// Without this anchor, a dewrapped peer timestamp and `self.clock.now_us()` are
	/// two unrelated counters (each connection owns its own clock origin) and
	/// comparing them directly is meaningless across processes.
	peer_origin_us: AtomicU64,

	snd_buffer: Mutex<SndBuffer>,
	snd_loss_list: SndLossList,
	snd_rtt: Mutex<RttEstimator>,
	ack_book: Mutex<AckBook>,

	rcv_buffer: Mutex<RcvBuffer>,
	rcv_loss_list: RcvLossList,
	rcv_curr_seq: Mutex<SeqNo>,
	rcv_rate: Mutex<RateEstimator>,
	drift: Mutex<DriftEstimator>,
	dewrap: Mutex<Dewrap>,
	rcv_packets_since_ack: AtomicU32,
	delivered: Mutex<VecDeque<Delivered>>,

	crypto: Mutex<CryptoControl>,
	provider: Arc<dyn CryptoProvider>,

	timers: Mutex<Timers>,

	send_mutex: Mutex<()>,
	send_cond: Condvar,
	recv_mutex: Mutex<()>,
	recv_cond: Condvar,
	tsbpd_mutex: Mutex<()>,
	tsbpd_cond: Condvar,

	channel: Arc<Channel>,
	target_time: Mutex<Instant>,
	pkt_snd_period: Mutex<Duration>,

	/// Set once the peer's conclusion handshake carried `version < 5`: drives the
	/// post-handshake `Extension(HsReq)` retry loop in `on_tick` (§4.7's HSv4
	/// compatibility path).
	peer_hsv4: AtomicBool,
	hsv4_nego_done: AtomicBool,

	stats: Stats,

	pub closing: AtomicBool,
	linger: Mutex<Duration>,

	last_error: Mutex<Option<(ErrorKind, &'static str, String)>>,
}

impl Connection {
	pub fn new(local_socket_id: u32, config: Config, channel: Arc<Channel>, provider: Arc<dyn CryptoProvider>, clock: Clock, isn: SeqNo) -> Self {
		let now = Instant::now();
		let crypto = if let (Some(passphrase), Some(key_len)) = (config.passphrase.clone(), config.pb_key_len) {
			CryptoControl::new_sender(passphrase, key_len, Cipher::Ctr, config.km_refresh_rate, config.km_pre_announce, provider.as_ref()).unwrap_or_else(|_| CryptoControl::disabled())
		} else {
			CryptoControl::disabled()
		};

		// Invariant 6 (§3): `pktSndPeriod > 0`. Seed pacing from the configured
		// bandwidth ceiling rather than zero; `on_ack` tightens or relaxes it from
		// there as ACKs arrive.
		let initial_pkt_snd_period_us = ((config.payload_size as u64) * 1_000_000 / (config.effective_max_bw().max(1) as u64)).max(1);

		Self {
			local_socket_id,
			peer_socket_id: AtomicU32::new(0),
			peer_addr: Mutex::new(None),
			state: Mutex::new(ConnState::Opened),
			state_cond: Condvar::new(),

			origin_us: clock.now_us(),
			clock,
			isn,
			peer_isn: Mutex::new(SeqNo::new(0)),
			peer_mss: Mutex::new(config.mss),
			peer_tsbpd_delay_ms: Mutex::new(config.rcv_latency.as_millis() as u32),
			cookie: Mutex::new(0),
			peer_origin_us: AtomicU64::new(0),

			snd_buffer: Mutex::new(SndBuffer::new(isn, config.payload_size as usize, config.snd_buffer_size as usize)),
			snd_loss_list: SndLossList::new(),
			snd_rtt: Mutex::new(RttEstimator::new(1024)),
			ack_book: Mutex::new(AckBook { snd_last_ack: isn, ack_seq_no: 0, pending: VecDeque::new() }),

			rcv_buffer: Mutex::new(RcvBuffer::new(config.rcv_buffer_size as usize, isn)),
			rcv_loss_list: RcvLossList::new(),
			rcv_curr_seq: Mutex::new(isn.advance(-1)),
			rcv_rate: Mutex::new(RateEstimator::new(64, 16)),
			drift: Mutex::new(DriftEstimator::new()),
			dewrap: Mutex::new(Dewrap::new(0)),
			rcv_packets_since_ack: AtomicU32::new(0),
			delivered: Mutex::new(VecDeque::new()),

			crypto: Mutex::new(crypto),
			provider,

			timers: Mutex::new(Timers {
				next_ack: now + ACK_INTERVAL,
				next_nak: now + MIN_NAK_INTERVAL,
				next_exp: now + MIN_EXP_INTERVAL,
				next_hsv4_retry: now + HSV4_RETRY_INTERVAL,
				last_snd: now,
				last_rsp: now,
				exp_count: 0,
				hsv4_retry_count: 0,
			}),

			send_mutex: Mutex::new(()),
			send_cond: Condvar::new(),
			recv_mutex: Mutex::new(()),
			recv_cond: Condvar::new(),
			tsbpd_mutex: Mutex::new(()),
			tsbpd_cond: Condvar::new(),

			channel,
			target_time: Mutex::new(now),
			pkt_snd_period: Mutex::new(Duration::from_micros(initial_pkt_snd_period_us)),

			peer_hsv4: AtomicBool::new(false),
			hsv4_nego_done: AtomicBool::new(true),

			stats: Stats::default(),

			closing: AtomicBool::new(false),
			linger: Mutex::new(Duration::from_secs(0)),

			last_error: Mutex::new(None),
			config,
		}
	}

	pub fn state(&self) -> ConnState {
		*self.state.lock().unwrap()
	}

	fn set_state(&self, s: ConnState) {
		*self.state.lock().unwrap() = s;
		self.state_cond.notify_all();
		self.recv_cond.notify_all();
		self.send_cond.notify_all();
		self.tsbpd_cond.notify_all();
	}

	pub fn peer_socket_id(&self) -> u32 {
		self.peer_socket_id.load(Ordering::Acquire)
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn is_broken(&self) -> bool {
		self.state() == ConnState::Broken
	}

	fn mark_broken(&self, subcode: &'static str, message: impl Into<String>) {
		*self.last_error.lock().unwrap() = Some((ErrorKind::Connection, subcode, message.into()));
		self.set_state(ConnState::Broken);
	}

	fn now_ts(&self) -> Timestamp {
		self.clock.timestamp_since(self.origin_us)
	}

	fn send_ctrl(&self, mtype: MessageType, ext_type: Option<ExtType>, additional_info: u32, payload: Vec<u8>, to: SocketAddr) {
		let pkt = Packet::control(mtype, ext_type, additional_info, self.now_ts(), self.peer_socket_id(), payload);
		if self.channel.send(&pkt.pack(), to).is_ok() {
			self.timers.lock().unwrap().last_snd = Instant::now();
		}
	}

	// ---- Caller-side handshake ----

	/// Send the initial `Induction` (header destId=0, since the listener has no
	/// session object yet). Returns immediately; the reply is delivered to
	/// `on_handshake_ctrl` by the multiplexer's receive loop.
	pub fn begin_connect(&self, peer: SocketAddr) -> Result<()> {
		*self.peer_addr.lock().unwrap() = Some(peer);
		self.set_state(ConnState::Connecting);

		let hs = Handshake {
			version: SRT_VERSION,
			encryption_field: 0,
			ext_field: 0,
			isn: self.isn,
			mss: self.config.mss,
			flight_flag_size: self.config.flight_flag_size,
			req_type: if self.config.rendezvous { HandshakeType::Waveahand } else { HandshakeType::Induction },
			socket_id: self.local_socket_id,
			syn_cookie: 0,
			peer_addr: peer.ip(),
			extensions: vec![],
		};

		self.send_ctrl(MessageType::Handshake, None, 0, hs.pack(), peer);
		Ok(())
	}

	/// Block until the handshake completes (`Connected`), is rejected (`Broken`), or
	/// `timeout` elapses.
	pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
		let guard = self.state.lock().unwrap();
		let (guard, _) = self
			.state_cond
			.wait_timeout_while(guard, timeout, |s| *s == ConnState::Connecting)
			.map_err(|_| SrtError::system_resources("wait_connected", "poisoned lock"))?;

		match *guard {
			ConnState::Connected => Ok(()),
			ConnState::Broken => match self.last_error.lock().unwrap().as_ref() {
				Some((kind, subcode, message)) => Err(SrtError::new(*kind, subcode, message.clone())),
				None => Err(SrtError::connection("rejected", "handshake rejected")),
			},
			_ => Err(SrtError::connection("timeout", "handshake did not complete in time")),
		}
	}

	/// This side's SRT feature request, carried in `HsReq`/`HsRsp` extensions for
	/// HSv5 peers (in the handshake itself) and HSv4 peers (post-handshake, §4.7).
	fn local_hsreq(&self) -> SrtHsReq {
		let flags = SrtFlags::new(true, true, self.config.tl_pkt_drop, self.config.nak_report, true, u27::new(0));
		SrtHsReq { srt_version: SRT_LIB_VERSION, flags, tsbpd_delay_ms: self.config.rcv_latency.as_millis() as u16 }
	}

	fn build_conclusion(&self, cookie: u32, peer: SocketAddr) -> Handshake {
		let mut extensions = vec![];
		extensions.push((ExtType::HsReq, self.local_hsreq().pack()));

		if self.crypto.lock().unwrap().is_enabled() {
			if let Ok(km) = self.crypto.lock().unwrap().build_km_req(Instant::now(), self.provider.as_ref()) {
				extensions.push((ExtType::KmReq, km));
			}
		}

		Handshake {
			version: SRT_VERSION,
			encryption_field: 0,
			ext_field: 1,
			isn: self.isn,
			mss: self.config.mss,
			flight_flag_size: self.config.flight_flag_size,
			req_type: HandshakeType::Conclusion,
			socket_id: self.local_socket_id,
			syn_cookie: cookie,
			peer_addr: peer.ip(),
			extensions,
		}
	}

	fn install_peer(&self, hs: &Handshake, peer: SocketAddr) {
		self.peer_socket_id.store(hs.socket_id, Ordering::Release);
		*self.peer_isn.lock().unwrap() = hs.isn;
		*self.peer_mss.lock().unwrap() = self.config.mss.min(hs.mss);
		*self.peer_addr.lock().unwrap() = Some(peer);
		*self.rcv_curr_seq.lock().unwrap() = hs.isn.advance(-1);
		// The handshake body carries no timestamp; the real dewrap base is seeded from
		// the first data packet's timestamp instead, via `Dewrap::new(0)` here.
		*self.dewrap.lock().unwrap() = Dewrap::new(0);
		// Anchor "peer wire timestamp 0" to our own clock's current reading, right as
		// the connection becomes usable — see the field doc on `peer_origin_us`.
		self.peer_origin_us.store(self.clock.now_us(), Ordering::Release);

		if let Some(ext) = hs.find_extension(ExtType::HsReq) {
			if let Ok(req) = SrtHsReq::unpack(ext) {
				*self.peer_tsbpd_delay_ms.lock().unwrap() = req.tsbpd_delay_ms as u32;
			}
		}

		if let Some(ext) = hs.find_extension(ExtType::KmReq) {
			let _ = self.crypto.lock().unwrap().on_km_req(ext, self.provider.as_ref());
		}
		if let Some(ext) = hs.find_extension(ExtType::KmRsp) {
			let _ = self.crypto.lock().unwrap().on_km_rsp(ext);
		}
	}

	/// Dispatch a received `Handshake`-type control packet, from either role.
	pub fn on_handshake_ctrl(&self, packet: &Packet, from: SocketAddr) {
		let Header::Control { .. } = packet.header else { return };
		let Ok(hs) = Handshake::unpack(&packet.payload) else { return };

		match (self.state(), hs.req_type) {
			(ConnState::Connecting, HandshakeType::Induction) => {
				*self.cookie.lock().unwrap() = hs.syn_cookie;
				let conclusion = self.build_conclusion(hs.syn_cookie, from);
				self.send_ctrl(MessageType::Handshake, None, 0, conclusion.pack(), from);
			}
			(ConnState::Connecting, HandshakeType::Conclusion) => {
				self.install_peer(&hs, from);
				if hs.version < 5 {
					// Peer only speaks HSv4: feature negotiation (TSBPD/TLPktDrop/
					// NAKReport/REXMIT) didn't ride along in this handshake's extensions,
					// so fall back to the post-handshake Extension(HsReq) exchange that
					// `on_tick` drives (§4.7's HSv4 compatibility path).
					self.peer_hsv4.store(true, Ordering::Release);
					self.hsv4_nego_done.store(false, Ordering::Release);
				}
				self.set_state(ConnState::Connected);
			}
			(ConnState::Connecting, HandshakeType::Rejection(reason)) => {
				self.mark_broken("rejected", format!("peer rejected handshake: {reason:?}"));
			}
			(ConnState::Connecting, HandshakeType::Waveahand) => {
				self.on_rendezvous_waveahand(&hs, from);
			}
			_ => {}
		}
	}

	/// Rendezvous tie-break (SPEC_FULL supplemented feature 1): both sides send
	/// `Waveahand`; the higher cookie becomes initiator (sends `Conclusion` first),
	/// the lower becomes responder (waits for it). An exact cookie tie falls back to
	/// comparing the raw socket id, a documented deterministic tie-break.
	fn on_rendezvous_waveahand(&self, peer_hs: &Handshake, from: SocketAddr) {
		let local = self.channel.local_addr().unwrap_or(from);
		let my_cookie = make_cookie(from, local, b"rendezvous", current_epoch());
		*self.cookie.lock().unwrap() = my_cookie;

		let i_am_initiator = match my_cookie.cmp(&peer_hs.syn_cookie) {
			std::cmp::Ordering::Greater => true,
			std::cmp::Ordering::Less => false,
			std::cmp::Ordering::Equal => self.local_socket_id > peer_hs.socket_id,
		};

		if i_am_initiator {
			let conclusion = self.build_conclusion(peer_hs.syn_cookie, from);
			self.send_ctrl(MessageType::Handshake, None, 0, conclusion.pack(), from);
		}
		// The responder just waits for the initiator's Conclusion, which arrives as a
		// normal `(Connecting, Conclusion)` match above and completes the handshake.
	}

	// ---- Listener-side handshake (called by the multiplexer for destId==0 traffic) ----

	/// Produce the listener's reply to an `Induction`/`Waveahand` (stateless: no
	/// `Connection` object is mintable yet without a valid cookie back).
	pub fn listener_induction_reply(secret: &[u8], local: SocketAddr, from: SocketAddr, req: &Handshake) -> Packet {
		let cookie = make_cookie(from, local, secret, current_epoch());
		let hs = Handshake {
			version: SRT_VERSION,
			encryption_field: 0,
			ext_field: 0,
			isn: SeqNo::new(0),
			mss: req.mss,
			flight_flag_size: req.flight_flag_size,
			req_type: HandshakeType::Induction,
			socket_id: 0,
			syn_cookie: cookie,
			peer_addr: from.ip(),
			extensions: vec![],
		};

		Packet::control(MessageType::Handshake, None, 0, Timestamp::new(0), req.socket_id, hs.pack())
	}

	/// Validate a `Conclusion` handshake against the listener's cookie secret.
	pub fn listener_cookie_is_valid(secret: &[u8], from: SocketAddr, local: SocketAddr, hs: &Handshake) -> bool {
		cookie_is_valid(hs.syn_cookie, from, local, secret)
	}

	/// Build the listener's reply once it has minted (or found an existing) server-
	/// side `Connection` for this peer.
	pub fn accepted_reply(&self, peer_hs: &Handshake, from: SocketAddr) -> Packet {
		self.install_peer(peer_hs, from);
		self.set_state(ConnState::Connected);

		// HSv4 compatibility (§4.7, Scenario 5): either the peer only offered v4, or
		// this listener is configured (via `max_hs_version`) to reply as one. Either
		// way, the conclusion itself carries no extensions; SRT feature negotiation
		// moves to post-handshake Extension(HsReq/HsRsp) packets driven by `on_tick`.
		if peer_hs.version < 5 || self.config.max_hs_version < 5 {
			self.peer_hsv4.store(true, Ordering::Release);
			self.hsv4_nego_done.store(false, Ordering::Release);

			let hs = Handshake {
				version: 4,
				encryption_field: 0,
				ext_field: 0,
				isn: self.isn,
				mss: self.config.mss,
				flight_flag_size: self.config.flight_flag_size,
				req_type: HandshakeType::Conclusion,
				socket_id: self.local_socket_id,
				syn_cookie: peer_hs.syn_cookie,
				peer_addr: from.ip(),
				extensions: vec![],
			};
			return Packet::control(MessageType::Handshake, None, 0, self.now_ts(), peer_hs.socket_id, hs.pack());
		}

		let mut extensions = vec![(ExtType::HsReq, self.local_hsreq().pack())];

		if let Some(km_req) = peer_hs.find_extension(ExtType::KmReq) {
			if let Ok(rsp) = self.crypto.lock().unwrap().on_km_req(km_req, self.provider.as_ref()) {
				extensions.push((ExtType::KmRsp, rsp));
			}
		}

		let hs = Handshake {
			version: SRT_VERSION,
			encryption_field: 0,
			ext_field: 1,
			isn: self.isn,
			mss: self.config.mss,
			flight_flag_size: self.config.flight_flag_size,
			req_type: HandshakeType::Conclusion,
			socket_id: self.local_socket_id,
			syn_cookie: peer_hs.syn_cookie,
			peer_addr: from.ip(),
			extensions,
		};

		Packet::control(MessageType::Handshake, None, 0, self.now_ts(), peer_hs.socket_id, hs.pack())
	}

	pub fn reject_reply(reason: RejectReason, req: &Handshake, from: SocketAddr) -> Packet {
		let hs = Handshake {
			version: SRT_VERSION,
			encryption_field: 0,
			ext_field: 0,
			isn: SeqNo::new(0),
			mss: 0,
			flight_flag_size: 0,
			req_type: HandshakeType::Rejection(reason),
			socket_id: 0,
			syn_cookie: 0,
			peer_addr: from.ip(),
			extensions: vec![],
		};

		Packet::control(MessageType::Handshake, None, 0, Timestamp::new(0), req.socket_id, hs.pack())
	}

	// ---- Application-facing send/recv ----

	pub fn send(&self, data: &[u8], in_order: bool) -> Result<()> {
		if self.state() != ConnState::Connected {
			return Err(SrtError::not_supported("send", "connection is not connected"));
		}
		if self.crypto.lock().unwrap().tx_state == KmState::BadSecret {
			return Err(SrtError::security("bad_secret", "key material exchange failed: passphrase mismatch with peer"));
		}

		let mut guard = self.send_mutex.lock().unwrap();
		let now = Instant::now();
		let ts = self.now_ts();

		loop {
			let mut buf = self.snd_buffer.lock().unwrap();
			if buf.add_message(data, None, in_order, ts, now).is_some() {
				break;
			}
			drop(buf);

			if self.closing.load(Ordering::Acquire) || self.is_broken() {
				return Err(SrtError::connection("closed", "connection closing while send blocked"));
			}

			// §5's `sendBlockCond` suspension point: wait on the guard we already
			// hold rather than re-locking `send_mutex`, which would deadlock since
			// the mutex isn't reentrant.
			let (g, _) = self.send_cond.wait_timeout(guard, Duration::from_millis(100)).map_err(|_| SrtError::system_resources("send", "poisoned lock"))?;
			guard = g;
		}

		self.send_cond.notify_all();
		Ok(())
	}

	pub fn recv(&self) -> Result<Delivered> {
		loop {
			if self.crypto.lock().unwrap().rx_state == KmState::BadSecret {
				return Err(SrtError::security("bad_secret", "key material exchange failed: passphrase mismatch with peer"));
			}

			if let Some(msg) = self.delivered.lock().unwrap().pop_front() {
				return Ok(msg);
			}

			if self.is_broken() {
				return Err(SrtError::connection("broken", "connection broken"));
			}
			if self.closing.load(Ordering::Acquire) && self.rcv_buffer.lock().unwrap().is_empty() {
				return Err(SrtError::connection("closed", "connection closed, nothing left to deliver"));
			}

			let guard = self.recv_mutex.lock().unwrap();
			let _ = self.recv_cond.wait_timeout(guard, Duration::from_millis(100));
		}
	}

	pub fn stats(&self) -> StatsSnapshot {
		StatsSnapshot {
			sent_packets: self.stats.sent_packets.load(Ordering::Relaxed),
			sent_bytes: self.stats.sent_bytes.load(Ordering::Relaxed),
			recv_packets: self.stats.recv_packets.load(Ordering::Relaxed),
			recv_bytes: self.stats.recv_bytes.load(Ordering::Relaxed),
			lost_packets: self.stats.lost_packets.load(Ordering::Relaxed),
			retrans_packets: self.stats.retrans_packets.load(Ordering::Relaxed),
			dropped_packets: self.stats.dropped_packets.load(Ordering::Relaxed),
			undecryptable_packets: self.stats.undecryptable_packets.load(Ordering::Relaxed),
		}
	}

	// ---- Data path ----

	pub fn process_data(&self, packet: Packet, from: SocketAddr) {
		let Header::Data { seq, boundary, in_order, enc, msg_no, timestamp, .. } = packet.header else { return };
		self.timers.lock().unwrap().last_rsp = Instant::now();

		let mut payload = packet.payload;
		if enc != EncFlags::None {
			let spec = if enc == EncFlags::Even { KeySpec::Even } else { KeySpec::Odd };
			if self.crypto.lock().unwrap().decrypt(seq, spec, &mut payload, self.provider.as_ref()).is_err() {
				log::warn!("srt: dropping undecryptable packet seq={}", seq.value());
				self.stats.undecryptable_packets.fetch_add(1, Ordering::Relaxed);
				return;
			}
		}

		self.stats.recv_packets.fetch_add(1, Ordering::Relaxed);
		self.stats.recv_bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);

		let next_expected = self.rcv_curr_seq.lock().unwrap().advance(1);
		if seqcmp(seq, next_expected) > 0 {
			self.stats.lost_packets.fetch_add(seqcmp(seq, next_expected) as u64, Ordering::Relaxed);
			self.rcv_loss_list.insert(next_expected, seq.advance(-1));
		}
		if seqcmp(seq, *self.rcv_curr_seq.lock().unwrap()) > 0 {
			*self.rcv_curr_seq.lock().unwrap() = seq;
		}
		self.rcv_loss_list.remove_one(seq);

		// Map the peer's dewrapped wire timestamp onto our own clock via the anchor
		// `install_peer` recorded, then fold in the bounded drift correction (§4.5).
		let dewrapped = self.dewrap.lock().unwrap().push(timestamp.value());
		let predicted_local_us = self.peer_origin_us.load(Ordering::Acquire) + dewrapped;
		let now_us = self.clock.now_us();
		self.drift.lock().unwrap().update(now_us as i64 - predicted_local_us as i64);
		let drift_us = self.drift.lock().unwrap().drift_us();

		let peer_latency_us = (*self.peer_tsbpd_delay_ms.lock().unwrap()).max(self.config.rcv_latency.as_millis() as u32) as u64 * 1000;
		let play_time_us = (predicted_local_us as i64 + drift_us).max(0) as u64 + peer_latency_us;

		let add_result = self.rcv_buffer.lock().unwrap().add_data(seq, payload, boundary, msg_no, in_order, play_time_us);
		if add_result == AddResult::Accepted {
			self.rcv_rate.lock().unwrap().on_arrival(self.clock.now_us());
			self.tsbpd_cond.notify_all();
			self.recv_cond.notify_all();
		}

		let since = self.rcv_packets_since_ack.fetch_add(1, Ordering::AcqRel) + 1;
		if since >= ACK_EVERY_N_PACKETS {
			self.rcv_packets_since_ack.store(0, Ordering::Release);
			self.send_ack(from);
		}
	}

	/// Drain any messages (message-mode, in-order) or contiguous prefix (stream-mode)
	/// whose playout deadline has passed, delivering them to the `delivered` queue.
	/// Called by the per-connection TSBPD thread.
	pub fn tsbpd_tick(&self) -> Option<Instant> {
		if !self.config.tsbpd_enabled() {
			loop {
				let msg = {
					let mut buf = self.rcv_buffer.lock().unwrap();
					buf.read_message()
				};
				match msg {
					Some(data) => self.deliver(data),
					None => return None,
				}
			}
		}

		// Accumulates the contiguous span of sequences TSBPD-dropped this tick, so a
		// single `DropReq(lo..hi)` is sent to the peer instead of one per unit
		// (§4.5 step 1, Scenario 3).
		let mut dropped_span: Option<(SeqNo, SeqNo)> = None;

		let wake_at = loop {
			let now_us = self.clock.now_us();
			let deadline_us = {
				let buf = self.rcv_buffer.lock().unwrap();
				buf.first_filled().and_then(|seq| buf.play_time(seq))
			};

			let Some(deadline_us) = deadline_us else { break None };

			if deadline_us > now_us {
				let remaining = Duration::from_micros(deadline_us - now_us);
				break Some(Instant::now() + remaining);
			}

			let msg = {
				let mut buf = self.rcv_buffer.lock().unwrap();
				buf.read_message()
			};

			match msg {
				Some(data) => self.deliver(data),
				None if self.config.tl_pkt_drop => {
					// Deadline passed but the message's later units haven't all arrived:
					// advance past the stalled head so later, already-complete messages
					// aren't held hostage (§4.5's "bounds latency by dropping").
					let mut buf = self.rcv_buffer.lock().unwrap();
					let Some(stuck) = buf.first_filled() else { break None };
					buf.advance_base(stuck.advance(1));
					drop(buf);

					dropped_span = Some(match dropped_span {
						Some((lo, _)) => (lo, stuck),
						None => (stuck, stuck),
					});
					self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
				}
				None => break None,
			}
		};

		if let Some((lo, hi)) = dropped_span {
			if let Some(peer) = *self.peer_addr.lock().unwrap() {
				let body = body_from_words(&[lo.value(), hi.value()]);
				self.send_ctrl(MessageType::DropReq, None, 0, body, peer);
			}
		}

		wake_at
	}

	fn deliver(&self, data: Vec<u8>) {
		let seq = *self.rcv_curr_seq.lock().unwrap();
		self.delivered.lock().unwrap().push_back(Delivered { data, seq, msg_no: MsgNo::new(0), timestamp: self.now_ts() });
		self.recv_cond.notify_all();
	}

	// ---- Control-packet dispatch (post-handshake) ----

	pub fn process_ctrl(&self, packet: Packet, from: SocketAddr) {
		self.timers.lock().unwrap().last_rsp = Instant::now();

		let Header::Control { mtype, ext_type, additional_info, .. } = packet.header else { return };

		match mtype {
			MessageType::Handshake => self.on_handshake_ctrl(&packet, from),
			MessageType::Ack => self.on_ack(additional_info, &packet.payload, from),
			MessageType::AckAck => self.on_ackack(additional_info),
			MessageType::LossReport => self.on_nak(&packet.payload),
			MessageType::DropReq => self.on_drop_req(&packet.payload),
			MessageType::Shutdown => self.mark_broken("peer_shutdown", "peer sent Shutdown"),
			MessageType::Keepalive => {}
			MessageType::CongestionWarning => log::debug!("srt: received CongestionWarning"),
			MessageType::PeerError => self.mark_broken("peer_error", format!("peer reported error {additional_info}")),
			MessageType::Extension => self.on_extension(ext_type, &packet.payload, from),
		}
	}

	fn on_extension(&self, ext_type: Option<ExtType>, body: &[u8], from: SocketAddr) {
		match ext_type {
			Some(ExtType::KmReq) => {
				if let Ok(rsp) = self.crypto.lock().unwrap().on_km_req(body, self.provider.as_ref()) {
					self.send_ctrl(MessageType::Extension, Some(ExtType::KmRsp), 0, rsp, from);
				}
			}
			Some(ExtType::KmRsp) => {
				let _ = self.crypto.lock().unwrap().on_km_rsp(body);
			}
			// HSv4 compatibility fallback (§4.7): feature negotiation arrives here
			// instead of riding along in the handshake's extension blocks.
			Some(ExtType::HsReq) => {
				if let Ok(req) = SrtHsReq::unpack(body) {
					*self.peer_tsbpd_delay_ms.lock().unwrap() = req.tsbpd_delay_ms as u32;
				}
				self.hsv4_nego_done.store(true, Ordering::Release);
				self.send_ctrl(MessageType::Extension, Some(ExtType::HsRsp), 0, self.local_hsreq().pack(), from);
			}
			Some(ExtType::HsRsp) => {
				if let Ok(req) = SrtHsReq::unpack(body) {
					*self.peer_tsbpd_delay_ms.lock().unwrap() = req.tsbpd_delay_ms as u32;
				}
				self.hsv4_nego_done.store(true, Ordering::Release);
			}
			_ => {}
		}
	}

	fn send_ack(&self, to: SocketAddr) {
		let rcv_last_ack = self.rcv_curr_seq.lock().unwrap().advance(1);
		let rtt = self.snd_rtt.lock().unwrap();
		let rate = self.rcv_rate.lock().unwrap();
		let buffer_left = self.config.rcv_buffer_size.saturating_sub(self.rcv_buffer.lock().unwrap().len() as u32);

		let body = body_from_words(&[
			rcv_last_ack.value(),
			rtt.rtt_us() as u32,
			rtt.rtt_var_us() as u32,
			buffer_left,
			rate.packet_rate() as u32,
			rate.bandwidth() as u32,
		]);
		drop(rtt);
		drop(rate);

		let mut book = self.ack_book.lock().unwrap();
		book.ack_seq_no = book.ack_seq_no.wrapping_add(1);
		let ack_seq_no = book.ack_seq_no;
		book.pending.push_back((ack_seq_no, rcv_last_ack));
		if book.pending.len() > 256 {
			book.pending.pop_front();
		}
		drop(book);

		self.snd_rtt.lock().unwrap().record_ack_sent(SeqNo::new(ack_seq_no), self.clock.now_us());
		self.send_ctrl(MessageType::Ack, None, ack_seq_no, body, to);
	}

	fn on_ack(&self, ack_seq_no: u32, body: &[u8], from: SocketAddr) {
		let words = words_from_body(body);
		if words.is_empty() {
			return;
		}
		let rcv_last_ack = SeqNo::new(words[0]);

		self.snd_buffer.lock().unwrap().ack_data(rcv_last_ack);
		self.snd_loss_list.remove(rcv_last_ack);
		self.ack_book.lock().unwrap().snd_last_ack = rcv_last_ack;
		self.update_pacing(&words);

		self.send_ctrl(MessageType::AckAck, None, ack_seq_no, vec![], from);
		self.send_cond.notify_all();
	}

	/// Recompute `pktSndPeriod` from the peer-advertised bandwidth carried in the
	/// ACK body (§4.7's "On ACK received: ... update cwndSize and pktSndPeriod per
	/// the selected congestion policy"). Congestion control policy itself is an
	/// external plugin (§1); this keeps invariant 6 (`pktSndPeriod > 0`) honored
	/// with a simple bandwidth-paced default instead of leaving it frozen at its
	/// startup value for the lifetime of the connection.
	fn update_pacing(&self, ack_words: &[u32]) {
		let Some(&bandwidth_pps) = ack_words.get(5) else { return };
		if bandwidth_pps == 0 {
			return;
		}

		let payload_size = self.config.payload_size.max(1) as u64;
		let ceiling_pps = (self.config.effective_max_bw().max(1) as u64 / payload_size).max(1);
		let pps = (bandwidth_pps as u64).min(ceiling_pps).max(1);
		let period_us = (1_000_000 / pps).max(1);

		*self.pkt_snd_period.lock().unwrap() = Duration::from_micros(period_us);
	}

	fn on_ackack(&self, ack_seq_no: u32) {
		let rcv_last_ack = {
			let mut book = self.ack_book.lock().unwrap();
			let idx = book.pending.iter().position(|(seq, _)| *seq == ack_seq_no);
			idx.map(|i| book.pending.remove(i).unwrap().1)
		};

		if rcv_last_ack.is_some() {
			self.snd_rtt.lock().unwrap().on_ackack(SeqNo::new(ack_seq_no), self.clock.now_us());
		}
	}

	fn on_nak(&self, body: &[u8]) {
		let words = words_from_body(body);
		for (lo, hi) in RcvLossList::parse_loss_array(&words) {
			self.snd_loss_list.insert(lo, hi);
		}
		self.send_cond.notify_all();
	}

	fn on_drop_req(&self, body: &[u8]) {
		let words = words_from_body(body);
		if words.len() < 2 {
			return;
		}
		let (lo, hi) = (SeqNo::new(words[0]), SeqNo::new(words[1]));
		self.snd_buffer.lock().unwrap().drop_range(lo, hi);
		self.snd_loss_list.remove(hi.advance(1));
	}

	// ---- Periodic actions, driven by the multiplexer's timer thread ----

	/// Run one tick of ACK/NAK/keepalive/EXP bookkeeping. Returns `false` once the
	/// connection transitions to `Broken` so the caller can stop scheduling it.
	pub fn on_tick(&self, peer: SocketAddr) -> bool {
		if self.state() != ConnState::Connected {
			return self.state() != ConnState::Broken && self.state() != ConnState::Closed;
		}

		let now = Instant::now();
		let rtt_interval = self.snd_rtt.lock().unwrap().interval(MIN_EXP_INTERVAL.as_micros() as u64);

		let mut timers = self.timers.lock().unwrap();

		if now >= timers.next_ack {
			timers.next_ack = now + ACK_INTERVAL;
			drop(timers);
			self.send_ack(peer);
			timers = self.timers.lock().unwrap();
		}

		if !self.rcv_loss_list.is_empty() && self.config.nak_report && now >= timers.next_nak {
			timers.next_nak = now + MIN_NAK_INTERVAL.max(Duration::from_micros(rtt_interval));
			let words = self.rcv_loss_list.get_loss_array(256);
			drop(timers);
			self.send_ctrl(MessageType::LossReport, None, 0, body_from_words(&words), peer);
			timers = self.timers.lock().unwrap();
		}

		if now.duration_since(timers.last_snd) >= KEEPALIVE_INTERVAL {
			drop(timers);
			self.send_ctrl(MessageType::Keepalive, None, 0, vec![], peer);
			timers = self.timers.lock().unwrap();
		}

		if now >= timers.next_exp {
			timers.next_exp = now + MIN_EXP_INTERVAL.max(Duration::from_micros(rtt_interval));
			timers.exp_count += 1;
			let broken = timers.exp_count > EXP_MAX_COUNT && now.duration_since(timers.last_rsp) > EXP_MAX_ELAPSED;
			drop(timers);

			if broken {
				self.mark_broken("expired", "no response within the expiry window");
				return false;
			}
			timers = self.timers.lock().unwrap();
		}

		// Release `timers` before calling out: both `maybe_hsv4_retry` and a future
		// tick re-entering this function lock it themselves, and it isn't reentrant.
		drop(timers);

		self.maybe_hsv4_retry(peer, now);
		self.maybe_rekey(peer);
		true
	}

	/// Resend `Extension(HsReq)` while an HSv4 peer hasn't yet replied with
	/// `HsRsp`, up to `HSV4_MAX_RETRIES` times (§4.7's HSv4 compatibility path).
	fn maybe_hsv4_retry(&self, peer: SocketAddr, now: Instant) {
		if !self.peer_hsv4.load(Ordering::Acquire) || self.hsv4_nego_done.load(Ordering::Acquire) {
			return;
		}

		let mut timers = self.timers.lock().unwrap();
		if now < timers.next_hsv4_retry || timers.hsv4_retry_count >= HSV4_MAX_RETRIES {
			return;
		}
		timers.next_hsv4_retry = now + HSV4_RETRY_INTERVAL;
		timers.hsv4_retry_count += 1;
		drop(timers);

		self.send_ctrl(MessageType::Extension, Some(ExtType::HsReq), 0, self.local_hsreq().pack(), peer);
	}

	fn maybe_rekey(&self, peer: SocketAddr) {
		let mut crypto = self.crypto.lock().unwrap();
		if !crypto.is_enabled() {
			return;
		}

		if crypto.should_regenerate() {
			crypto.begin_regenerate(self.provider.as_ref());
		}
		if crypto.should_resend_km_req(Instant::now()) {
			if let Ok(body) = crypto.build_km_req(Instant::now(), self.provider.as_ref()) {
				drop(crypto);
				self.send_ctrl(MessageType::Extension, Some(ExtType::KmReq), 0, body, peer);
			}
		}
	}

	// ---- Send scheduling (SndQueue worker) ----

	pub fn target_time(&self) -> Instant {
		*self.target_time.lock().unwrap()
	}

	/// Send exactly one due packet (fresh data or a retransmit), advancing
	/// `targetTime` by `pktSndPeriod` (§4.7's send-scheduling pseudocode).
	pub fn pump_send(&self, peer: SocketAddr) {
		let now = Instant::now();
		let retransmit_seq = self.snd_loss_list.pop_first();

		let (seq, retransmitted) = match retransmit_seq {
			Some(seq) => (seq, true),
			None => (self.snd_buffer.lock().unwrap().next_seq(), false),
		};

		let buf = self.snd_buffer.lock().unwrap();
		let read = buf.read_data(seq, now);
		let (payload, boundary, in_order, msg_no, timestamp) = match read {
			ReadResult::Data { payload, boundary, in_order, msg_no, timestamp } => (payload.to_vec(), boundary, in_order, msg_no, timestamp),
			ReadResult::Dropped => {
				drop(buf);
				self.snd_loss_list.remove(seq.advance(1));
				return;
			}
			ReadResult::Gone => {
				if !retransmitted {
					return;
				}
				drop(buf);
				return;
			}
		};
		drop(buf);

		let mut data = payload;
		let enc = {
			let mut crypto = self.crypto.lock().unwrap();
			if crypto.is_enabled() {
				match crypto.encrypt(seq, &mut data, self.provider.as_ref()) {
					Ok(KeySpec::Even) => EncFlags::Even,
					Ok(KeySpec::Odd) => EncFlags::Odd,
					Err(_) => EncFlags::None,
				}
			} else {
				EncFlags::None
			}
		};

		let sent_len = data.len() as u64;
		let pkt = Packet::data(seq, boundary, in_order, enc, retransmitted, msg_no, timestamp, self.peer_socket_id(), data);
		if self.channel.send(&pkt.pack(), peer).is_ok() {
			self.timers.lock().unwrap().last_snd = Instant::now();
			self.stats.sent_packets.fetch_add(1, Ordering::Relaxed);
			self.stats.sent_bytes.fetch_add(sent_len, Ordering::Relaxed);
			if retransmitted {
				self.stats.retrans_packets.fetch_add(1, Ordering::Relaxed);
			}
		}

		let period = *self.pkt_snd_period.lock().unwrap();
		*self.target_time.lock().unwrap() = now + period;
	}

	pub fn has_pending_send(&self) -> bool {
		!self.snd_loss_list.is_empty() || !self.snd_buffer.lock().unwrap().is_empty()
	}

	// ---- Close ----

	pub fn close(&self, linger: Duration) {
		self.closing.store(true, Ordering::Release);
		*self.linger.lock().unwrap() = linger;

		let deadline = Instant::now() + linger;
		while Instant::now() < deadline && !self.snd_buffer.lock().unwrap().is_empty() {
			std::thread::sleep(Duration::from_millis(10));
		}

		if let Some(peer) = *self.peer_addr.lock().unwrap() {
			if self.state() == ConnState::Connected {
				self.send_ctrl(MessageType::Shutdown, None, 0, vec![], peer);
			}
		}

		self.set_state(ConnState::Closing);
		self.set_state(ConnState::Closed);
	}
}

/// Upper bound on how long the TSBPD worker sleeps with nothing due, so it keeps
/// noticing the connection closing/breaking promptly even with no packets arriving.
const TSBPD_IDLE_POLL: Duration = Duration::from_millis(100);

/// Per-connection TSBPD thread (§5: "per connection with TSBPD enabled, one TSBPD
/// thread"). Also the only path that drains `rcv_buffer` into `delivered` for
/// TSBPD-disabled connections, since `tsbpd_tick` handles both cases. Runs until the
/// connection is `Broken` or `Closed`.
pub fn run_tsbpd(conn: Arc<Connection>) {
	loop {
		match conn.state() {
			ConnState::Broken | ConnState::Closed => return,
			_ => {}
		}

		let wake_at = conn.tsbpd_tick();

		let guard = conn.tsbpd_mutex.lock().unwrap();
		let timeout = match wake_at {
			Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(TSBPD_IDLE_POLL),
			None => TSBPD_IDLE_POLL,
		};
		let _ = conn.tsbpd_cond.wait_timeout(guard, timeout);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crypto::RustCrypto;

	fn conn(id: u32) -> Connection {
		let channel = Arc::new(Channel::bind("127.0.0.1:0".parse().unwrap()).unwrap());
		Connection::new(id, Config::default(), channel, Arc::new(RustCrypto), Clock::new(), SeqNo::new(1000))
	}

	#[test]
	fn new_connection_starts_opened() {
		let c = conn(1);
		assert_eq!(c.state(), ConnState::Opened);
	}

	#[test]
	fn send_before_connected_is_rejected() {
		let c = conn(2);
		assert!(c.send(b"hi", true).is_err());
	}

	#[test]
	fn ack_ackack_round_trip_feeds_rtt() {
		let c = conn(3);
		c.set_state(ConnState::Connected);
		*c.peer_addr.lock().unwrap() = Some("127.0.0.1:1".parse().unwrap());

		let peer = c.peer_addr.lock().unwrap().unwrap();
		c.send_ack(peer);
		let ack_seq = c.ack_book.lock().unwrap().ack_seq_no;
		c.on_ackack(ack_seq);
		assert!(c.ack_book.lock().unwrap().pending.is_empty());
	}

	#[test]
	fn ack_releases_acknowledged_send_buffer_range() {
		let c = conn(7);
		c.set_state(ConnState::Connected);
		*c.peer_addr.lock().unwrap() = Some("127.0.0.1:1".parse().unwrap());
		let now = Instant::now();
		let base = c.isn;
		{
			let mut buf = c.snd_buffer.lock().unwrap();
			buf.add_message(b"a", None, true, Timestamp::new(0), now);
			buf.add_message(b"b", None, true, Timestamp::new(0), now);
		}

		let acked = base.advance(1);
		let body = body_from_words(&[acked.value(), 0, 0, 0, 0, 0]);
		c.on_ack(1, &body, "127.0.0.1:1".parse().unwrap());

		assert_eq!(c.ack_book.lock().unwrap().snd_last_ack, acked);
		assert_eq!(c.snd_buffer.lock().unwrap().curr_buf_size(), 1);
	}

	#[test]
	fn nak_feeds_snd_loss_list() {
		let c = conn(4);
		let words = RcvLossList::parse_loss_array(&[]);
		assert!(words.is_empty());
		c.on_nak(&body_from_words(&[10, 20]));
		assert_eq!(c.snd_loss_list.len(), 11);
	}

	#[test]
	fn drop_req_clears_snd_buffer_range() {
		let c = conn(5);
		let now = Instant::now();
		c.snd_buffer.lock().unwrap().add_message(b"x", None, true, Timestamp::new(0), now);
		let seq = c.isn;
		c.on_drop_req(&body_from_words(&[seq.value(), seq.value()]));
		assert!(c.snd_buffer.lock().unwrap().is_empty());
	}

	#[test]
	fn send_on_full_buffer_waits_instead_of_deadlocking() {
		let c = Arc::new(conn(6));
		c.set_state(ConnState::Connected);
		*c.peer_addr.lock().unwrap() = Some("127.0.0.1:1".parse().unwrap());

		// Fill the send buffer so the first `add_message` in `send` fails and the
		// loop has to wait on `send_cond` using the guard it already holds.
		let cap = c.config().snd_buffer_size as usize;
		{
			let mut buf = c.snd_buffer.lock().unwrap();
			let now = Instant::now();
			for _ in 0..cap {
				buf.add_message(b"x", None, true, Timestamp::new(0), now);
			}
		}

		let waiter = Arc::clone(&c);
		let handle = std::thread::spawn(move || waiter.send(b"blocked", true));

		std::thread::sleep(Duration::from_millis(50));
		c.closing.store(true, Ordering::Release);
		c.send_cond.notify_all();

		let result = handle.join().expect("send thread must not deadlock");
		assert!(result.is_err());
	}

	#[test]
	fn send_and_recv_refused_once_km_state_is_bad_secret() {
		let c = conn(7);
		c.set_state(ConnState::Connected);
		c.crypto.lock().unwrap().tx_state = KmState::BadSecret;
		c.crypto.lock().unwrap().rx_state = KmState::BadSecret;

		let send_err = c.send(b"hi", true).unwrap_err();
		assert_eq!(send_err.kind, ErrorKind::Security);

		let recv_err = c.recv().unwrap_err();
		assert_eq!(recv_err.kind, ErrorKind::Security);
	}

	#[test]
	fn tsbpd_drop_emits_drop_req_and_counts_it() {
		let c = conn(8);
		*c.peer_addr.lock().unwrap() = Some("127.0.0.1:1".parse().unwrap());

		// A message `First` unit with no following units and a playout deadline
		// already in the past: `read_message` can never complete it, so
		// `tsbpd_tick` must drop it and report the span to the peer.
		let seq = c.isn;
		let added = c.rcv_buffer.lock().unwrap().add_data(seq, vec![1, 2, 3], Boundary::First, MsgNo::new(1), true, 0);
		assert_eq!(added, AddResult::Accepted);

		c.tsbpd_tick();

		assert_eq!(c.stats().dropped_packets, 1);
		assert_eq!(c.rcv_buffer.lock().unwrap().base(), seq.advance(1));
	}

	#[test]
	fn stats_track_sent_and_received_packets() {
		let c = conn(9);
		c.set_state(ConnState::Connected);
		let peer = "127.0.0.1:1".parse().unwrap();
		*c.peer_addr.lock().unwrap() = Some(peer);

		c.send(b"hello", true).unwrap();
		c.pump_send(peer);
		assert_eq!(c.stats().sent_packets, 1);

		// `rcv_curr_seq` starts at `isn - 1`, so `isn` itself is the next expected
		// sequence: delivering it leaves no gap for `lost_packets` to count.
		let pkt = Packet::data(c.isn, Boundary::Solo, true, EncFlags::None, false, MsgNo::new(1), Timestamp::new(0), c.local_socket_id, b"world".to_vec());
		c.process_data(pkt, peer);
		assert_eq!(c.stats().recv_packets, 1);
		assert_eq!(c.stats().lost_packets, 0);
	}

	#[test]
	fn hsv4_peer_gets_plain_v4_conclusion_and_schedules_fallback() {
		let c = conn(10);
		let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();

		let peer_hs = Handshake {
			version: 4,
			encryption_field: 0,
			ext_field: 0,
			isn: SeqNo::new(5000),
			mss: 1500,
			flight_flag_size: 25600,
			req_type: HandshakeType::Conclusion,
			socket_id: 42,
			syn_cookie: 7,
			peer_addr: peer.ip(),
			extensions: vec![],
		};

		let reply = c.accepted_reply(&peer_hs, peer);
		let unpacked = Handshake::unpack(&reply.payload).unwrap();
		assert_eq!(unpacked.version, 4);
		assert!(unpacked.extensions.is_empty());
		assert!(c.peer_hsv4.load(Ordering::Acquire));
		assert!(!c.hsv4_nego_done.load(Ordering::Acquire));
	}

	#[test]
	fn hsv4_extension_exchange_completes_negotiation() {
		let c = conn(11);
		let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
		c.set_state(ConnState::Connected);
		*c.peer_addr.lock().unwrap() = Some(peer);
		c.peer_hsv4.store(true, Ordering::Release);
		c.hsv4_nego_done.store(false, Ordering::Release);

		let their_req = c.local_hsreq();
		c.on_extension(Some(ExtType::HsReq), &their_req.pack(), peer);
		assert!(c.hsv4_nego_done.load(Ordering::Acquire));
	}
}
