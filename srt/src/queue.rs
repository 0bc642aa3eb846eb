//! `SndQueue`/`RcvQueue` worker loops (§4.7, §5): the two long-running threads every
//! multiplexer owns. Both take an `Arc<Multiplexer>` and run until told to stop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::ConnState;
use crate::multiplexer::Multiplexer;
use crate::packet::{Header, MessageType};

/// Upper bound on how long the SndQueue worker sleeps with nothing due, so it keeps
/// noticing newly-registered connections and the shutdown flag promptly.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Drives every connection's send scheduling (§4.7's pseudocode): wakes at the
/// earliest `targetTime` across all connections, sends whatever is due, and loops.
pub fn run_snd_queue(mux: Arc<Multiplexer>) {
	while !mux.shutting_down() {
		let now = Instant::now();
		let mut earliest = now + IDLE_POLL;

		for conn in mux.registry().all() {
			if conn.state() != ConnState::Connected || !conn.has_pending_send() {
				continue;
			}

			let due = conn.target_time();
			if due <= now {
				if let Some(peer) = *conn.peer_addr.lock().unwrap() {
					conn.pump_send(peer);
				}
			} else if due < earliest {
				earliest = due;
			}
		}

		let sleep = earliest.saturating_duration_since(Instant::now()).min(IDLE_POLL);
		std::thread::sleep(sleep);
	}
}

/// Blocks on the channel, dispatching every arriving datagram either to the listener
/// (handshake packets addressed to destId 0) or to the owning connection via the
/// registry (§4.7's receive-dispatch pseudocode).
pub fn run_rcv_queue(mux: Arc<Multiplexer>) {
	while !mux.shutting_down() {
		let dgram = match mux.channel().recv(Some(IDLE_POLL)) {
			Ok(Some(dgram)) => dgram,
			Ok(None) => continue,
			Err(e) => {
				log::warn!("srt: channel recv error: {e}");
				continue;
			}
		};

		let packet = match crate::packet::Packet::unpack(&dgram.bytes) {
			Ok(p) => p,
			Err(e) => {
				log::debug!("srt: dropping malformed datagram from {}: {e}", dgram.from);
				continue;
			}
		};

		let dest_id = packet.header.dest_id();

		if dest_id == 0 {
			if matches!(packet.header, Header::Control { mtype: MessageType::Handshake, .. }) {
				mux.handle_listener_handshake(packet, dgram.from);
			}
			continue;
		}

		let Some(conn) = mux.registry().lookup(dest_id) else {
			log::debug!("srt: dropping datagram for unknown socket id {dest_id} from {}", dgram.from);
			continue;
		};

		if packet.header.is_control() {
			conn.process_ctrl(packet, dgram.from);
		} else {
			conn.process_data(packet, dgram.from);
		}
	}
}

/// Per-multiplexer periodic-action tick (ACK/NAK/keepalive/EXP/rekey), driven on its
/// own cadence rather than folded into `run_snd_queue` so a busy send path never
/// starves the timers (§5: "Timer thread (may be merged with SndQueue)" — kept
/// separate here for clarity).
pub fn run_timer(mux: Arc<Multiplexer>) {
	const TICK: Duration = Duration::from_millis(10);

	while !mux.shutting_down() {
		for conn in mux.registry().all() {
			let Some(peer) = *conn.peer_addr.lock().unwrap() else { continue };
			if !conn.on_tick(peer) {
				log::debug!("srt: connection {} broken, removing from registry", conn.local_socket_id);
			}
		}
		std::thread::sleep(TICK);
	}
}

/// The process-global GC thread (§4.8): reaps connections that reached `Broken` after
/// an extra grace period, and removes fully `Closed` ones immediately.
pub fn run_gc(mux: Arc<Multiplexer>) {
	const GC_TICK: Duration = Duration::from_secs(1);
	const BROKEN_GRACE: Duration = Duration::from_secs(1);

	let mut broken_since: std::collections::HashMap<u32, Instant> = std::collections::HashMap::new();

	while !mux.shutting_down() {
		std::thread::sleep(GC_TICK);
		let now = Instant::now();

		for conn in mux.registry().all() {
			match conn.state() {
				ConnState::Broken => {
					let first_seen = *broken_since.entry(conn.local_socket_id).or_insert(now);
					if now.duration_since(first_seen) >= BROKEN_GRACE {
						mux.registry().remove(conn.local_socket_id);
						broken_since.remove(&conn.local_socket_id);
					}
				}
				ConnState::Closed => {
					mux.registry().remove(conn.local_socket_id);
					broken_since.remove(&conn.local_socket_id);
				}
				_ => {
					broken_since.remove(&conn.local_socket_id);
				}
			}
		}
	}

	let _ = mux.refcount().load(Ordering::Acquire);
}
