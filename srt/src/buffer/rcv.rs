//! `RcvBuffer` (§4.5): a ring of arrived payload units indexed by `seq - baseSeq`,
//! plus message-mode reassembly and the TSBPD playout-time computation.

use collections::ring::Ring;
use collections::seq::{seqcmp, MsgNo, SeqNo, Timestamp, Wrapping};

use crate::packet::Boundary;

struct Unit {
	payload: Vec<u8>,
	boundary: Boundary,
	msg_no: MsgNo,
	in_order: bool,
	/// Local playout deadline: `peerStartTime + packet.timestamp + rcvLatency + drift`.
	play_time_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
	Accepted,
	Duplicate,
	TooLate,
	TooFar,
}

pub struct RcvBuffer {
	ring: Ring<Unit>,
}

impl RcvBuffer {
	pub fn new(capacity: usize, base: SeqNo) -> Self {
		Self { ring: Ring::new(capacity, base) }
	}

	pub fn base(&self) -> SeqNo {
		self.ring.base()
	}

	pub fn capacity(&self) -> usize {
		self.ring.capacity()
	}

	/// Insert an arrived data packet (§4.5). Rejects anything below the current base
	/// (`TooLate`) or beyond the window (`TooFar`); a slot already filled is a
	/// `Duplicate` (most likely an unnecessary retransmit that crossed the NAK).
	pub fn add_data(&mut self, seq: SeqNo, payload: Vec<u8>, boundary: Boundary, msg_no: MsgNo, in_order: bool, play_time_us: u64) -> AddResult {
		if seqcmp(seq, self.ring.base()) < 0 {
			return AddResult::TooLate;
		}

		let offset = seqcmp(seq, self.ring.base());
		if offset < 0 || offset as usize >= self.ring.capacity() {
			return AddResult::TooFar;
		}

		if self.ring.contains(seq) {
			return AddResult::Duplicate;
		}

		self.ring.insert(seq, Unit { payload, boundary, msg_no, in_order, play_time_us });
		AddResult::Accepted
	}

	pub fn contains(&self, seq: SeqNo) -> bool {
		self.ring.contains(seq)
	}

	pub fn play_time(&self, seq: SeqNo) -> Option<u64> {
		self.ring.get(seq).map(|u| u.play_time_us)
	}

	/// Advance the base to `new_base`, vacating everything before it — either because
	/// it was delivered to the application or TSBPD-dropped (§4.5).
	pub fn advance_base(&mut self, new_base: SeqNo) {
		self.ring.advance_base(new_base);
	}

	/// The sequence of the first filled slot at or after the base, if any — used by
	/// the TSBPD worker to find the next candidate for delivery or drop.
	pub fn first_filled(&self) -> Option<SeqNo> {
		self.ring.iter().next().map(|(seq, _)| seq)
	}

	/// Whether the head slot (at `base`) is filled.
	pub fn head_filled(&self) -> bool {
		self.ring.contains(self.ring.base())
	}

	/// Extract one complete message starting at the base, if the base is filled and,
	/// for a multi-unit message, every unit through `Last` has also arrived. Advances
	/// the base past the consumed units. Message-mode only delivers whole messages;
	/// stream-mode callers should use `read_prefix` instead.
	pub fn read_message(&mut self) -> Option<Vec<u8>> {
		let base = self.ring.base();
		let first = self.ring.get(base)?;

		let mut len = match first.boundary {
			Boundary::Solo => 1,
			Boundary::First => {
				let mut n = 1;
				loop {
					let seq = base.advance(n as i32);
					match self.ring.get(seq) {
						Some(u) if u.boundary == Boundary::Middle => n += 1,
						Some(u) if u.boundary == Boundary::Last => break n + 1,
						_ => return None, // message not yet fully arrived
					}
				}
			}
			// A `Middle`/`Last` at the base means the message's head already got
			// consumed or dropped; nothing playable sits at the base yet.
			Boundary::Middle | Boundary::Last => return None,
		};

		let mut out = Vec::new();
		for i in 0..len {
			let seq = base.advance(i as i32);
			out.extend_from_slice(&self.ring.remove(seq).expect("checked present above").payload);
		}
		len = len.max(1);
		self.ring.advance_base(base.advance(len as i32));

		Some(out)
	}

	/// Extract up to `max_len` bytes of any contiguous filled prefix starting at the
	/// base (stream-mode delivery, §4.5: "any prefix"). Consumes whole units only.
	pub fn read_prefix(&mut self, max_len: usize) -> Vec<u8> {
		let mut out = Vec::new();
		let mut seq = self.ring.base();

		while out.len() < max_len {
			let Some(unit) = self.ring.get(seq) else { break };
			if out.len() + unit.payload.len() > max_len && !out.is_empty() {
				break;
			}

			let unit = self.ring.remove(seq).expect("checked present above");
			out.extend_from_slice(&unit.payload);
			seq = seq.next();
		}

		self.ring.advance_base(seq);
		out
	}

	pub fn len(&self) -> usize {
		self.ring.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ring.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_in_window_rejects_outside() {
		let mut buf = RcvBuffer::new(8, SeqNo::new(100));
		assert_eq!(buf.add_data(SeqNo::new(100), vec![1], Boundary::Solo, MsgNo::new(0), true, 0), AddResult::Accepted);
		assert_eq!(buf.add_data(SeqNo::new(99), vec![1], Boundary::Solo, MsgNo::new(0), true, 0), AddResult::TooLate);
		assert_eq!(buf.add_data(SeqNo::new(200), vec![1], Boundary::Solo, MsgNo::new(0), true, 0), AddResult::TooFar);
	}

	#[test]
	fn duplicate_insert_is_reported() {
		let mut buf = RcvBuffer::new(8, SeqNo::new(0));
		buf.add_data(SeqNo::new(0), vec![1], Boundary::Solo, MsgNo::new(0), true, 0);
		assert_eq!(buf.add_data(SeqNo::new(0), vec![9], Boundary::Solo, MsgNo::new(0), true, 0), AddResult::Duplicate);
	}

	#[test]
	fn read_message_waits_for_all_units() {
		let mut buf = RcvBuffer::new(8, SeqNo::new(0));
		buf.add_data(SeqNo::new(0), b"AB".to_vec(), Boundary::First, MsgNo::new(5), true, 0);
		assert!(buf.read_message().is_none());

		buf.add_data(SeqNo::new(1), b"CD".to_vec(), Boundary::Last, MsgNo::new(5), true, 0);
		let msg = buf.read_message().unwrap();
		assert_eq!(msg, b"ABCD");
		assert_eq!(buf.base().value(), 2);
	}

	#[test]
	fn read_prefix_consumes_contiguous_bytes() {
		let mut buf = RcvBuffer::new(8, SeqNo::new(0));
		buf.add_data(SeqNo::new(0), b"ab".to_vec(), Boundary::Solo, MsgNo::new(0), false, 0);
		buf.add_data(SeqNo::new(1), b"cd".to_vec(), Boundary::Solo, MsgNo::new(1), false, 0);

		let out = buf.read_prefix(10);
		assert_eq!(out, b"abcd");
	}
}
