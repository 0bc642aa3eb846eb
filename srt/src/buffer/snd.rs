//! `SndBuffer` (§4.4): owned payload units awaiting first send or retransmission.
//! Messages larger than `payloadSize` span consecutive units marked
//! `First`/`Middle`/`Last`; a message that fits in one unit is `Solo`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use collections::seq::{seqcmp, MsgNo, SeqNo, Timestamp, Wrapping};

use crate::packet::Boundary;

struct Unit {
	seq: SeqNo,
	payload: Vec<u8>,
	boundary: Boundary,
	msg_no: MsgNo,
	in_order: bool,
	/// The timestamp to stamp the packet with on send (relative to connection origin).
	src_time: Timestamp,
	enqueued_at: Instant,
	ttl: Option<Duration>,
}

pub enum ReadResult<'a> {
	/// Payload, boundary/in-order flags, message number, and the timestamp to stamp.
	Data { payload: &'a [u8], boundary: Boundary, in_order: bool, msg_no: MsgNo, timestamp: Timestamp },
	/// The unit at this sequence was TTL-dropped before ever going out live.
	Dropped,
	/// No unit at this sequence (already acknowledged or never existed).
	Gone,
}

/// A growing queue of payload units, addressed by assigned `SeqNo`. Unlike
/// `RcvBuffer`, units are always appended in sequence order, so a `VecDeque` indexed
/// by `seq - base` needs no out-of-order slotting.
pub struct SndBuffer {
	units: VecDeque<Unit>,
	/// Sequence that will be assigned to the next unit appended.
	next_seq: SeqNo,
	next_msg_no: MsgNo,
	payload_size: usize,
	capacity: usize,
}

impl SndBuffer {
	pub fn new(isn: SeqNo, payload_size: usize, capacity: usize) -> Self {
		Self { units: VecDeque::new(), next_seq: isn, next_msg_no: MsgNo::new(0), payload_size, capacity }
	}

	/// Split `bytes` into payload-sized units and append them, assigning sequence
	/// numbers and one shared message number. Returns the first sequence assigned, or
	/// `None` if the buffer is full (`ErrorKind::NoBuf` at the call site).
	pub fn add_message(&mut self, bytes: &[u8], ttl: Option<Duration>, in_order: bool, src_time: Timestamp, now: Instant) -> Option<SeqNo> {
		let chunks: Vec<&[u8]> = if bytes.is_empty() { vec![&[]] } else { bytes.chunks(self.payload_size).collect() };

		if self.units.len() + chunks.len() > self.capacity {
			return None;
		}

		let first_seq = self.next_seq;
		let msg_no = self.next_msg_no;
		self.next_msg_no = self.next_msg_no.next();

		let last_idx = chunks.len() - 1;
		for (i, chunk) in chunks.into_iter().enumerate() {
			let boundary = match (i == 0, i == last_idx) {
				(true, true) => Boundary::Solo,
				(true, false) => Boundary::First,
				(false, true) => Boundary::Last,
				(false, false) => Boundary::Middle,
			};

			self.units.push_back(Unit { seq: self.next_seq, payload: chunk.to_vec(), boundary, msg_no, in_order, src_time, enqueued_at: now, ttl });
			self.next_seq = self.next_seq.next();
		}

		Some(first_seq)
	}

	fn index_of(&self, seq: SeqNo) -> Option<usize> {
		let first = self.units.front()?.seq;
		let offset = seqcmp(seq, first);
		if offset < 0 || offset as usize >= self.units.len() {
			None
		} else {
			Some(offset as usize)
		}
	}

	/// Retrieve the unit at `seq` for first-send or retransmission (§4.4). Evaluates
	/// the TTL-drop check for live-mode "too late to bother sending" units.
	pub fn read_data(&self, seq: SeqNo, now: Instant) -> ReadResult<'_> {
		let Some(idx) = self.index_of(seq) else { return ReadResult::Gone };
		let unit = &self.units[idx];

		if let Some(ttl) = unit.ttl {
			if now.duration_since(unit.enqueued_at) > ttl {
				return ReadResult::Dropped;
			}
		}

		ReadResult::Data { payload: &unit.payload, boundary: unit.boundary, in_order: unit.in_order, msg_no: unit.msg_no, timestamp: unit.src_time }
	}

	/// Release every unit with `seq < up_to` — an ACK acknowledging that much of the
	/// buffer (§7.1's invariant: data leaves `SndBuffer` once acknowledged).
	pub fn ack_data(&mut self, up_to: SeqNo) {
		while let Some(front) = self.units.front() {
			if seqcmp(front.seq, up_to) < 0 {
				self.units.pop_front();
			} else {
				break;
			}
		}
	}

	/// Drop every unit in `[lo, hi]` outright — used for `DropReq` (§4.7's "On DropReq
	/// received (sender)").
	pub fn drop_range(&mut self, lo: SeqNo, hi: SeqNo) {
		self.units.retain(|u| !(seqcmp(lo, u.seq) <= 0 && seqcmp(u.seq, hi) <= 0));
	}

	pub fn curr_buf_size(&self) -> usize {
		self.units.len()
	}

	pub fn avg_payload_size(&self) -> usize {
		if self.units.is_empty() {
			return 0;
		}
		self.units.iter().map(|u| u.payload.len()).sum::<usize>() / self.units.len()
	}

	pub fn is_empty(&self) -> bool {
		self.units.is_empty()
	}

	pub fn next_seq(&self) -> SeqNo {
		self.next_seq
	}

	/// The lowest sequence not yet acknowledged — `sndLastAck` tracks this externally,
	/// but `Connection` uses this to sanity-check against it.
	pub fn base(&self) -> Option<SeqNo> {
		self.units.front().map(|u| u.seq)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_small_message_is_solo() {
		let mut buf = SndBuffer::new(SeqNo::new(0), 1456, 8192);
		let now = Instant::now();
		let seq = buf.add_message(b"hello", None, true, Timestamp::new(0), now).unwrap();

		match buf.read_data(seq, now) {
			ReadResult::Data { payload, boundary, .. } => {
				assert_eq!(payload, b"hello");
				assert_eq!(boundary, Boundary::Solo);
			}
			_ => panic!("expected data"),
		}
	}

	#[test]
	fn large_message_spans_units_with_boundaries() {
		let mut buf = SndBuffer::new(SeqNo::new(0), 4, 8192);
		let now = Instant::now();
		let seq = buf.add_message(b"abcdefghij", None, true, Timestamp::new(0), now).unwrap();

		let boundaries: Vec<_> = (0..3)
			.map(|i| match buf.read_data(seq.advance(i), now) {
				ReadResult::Data { boundary, .. } => boundary,
				_ => panic!("expected data"),
			})
			.collect();

		assert_eq!(boundaries, vec![Boundary::First, Boundary::Middle, Boundary::Last]);
	}

	#[test]
	fn ack_releases_units() {
		let mut buf = SndBuffer::new(SeqNo::new(100), 1456, 8192);
		let now = Instant::now();
		buf.add_message(b"one", None, true, Timestamp::new(0), now);
		buf.add_message(b"two", None, true, Timestamp::new(0), now);

		buf.ack_data(SeqNo::new(101));
		assert_eq!(buf.curr_buf_size(), 1);
		assert!(matches!(buf.read_data(SeqNo::new(100), now), ReadResult::Gone));
	}

	#[test]
	fn ttl_expired_unit_is_dropped() {
		let mut buf = SndBuffer::new(SeqNo::new(0), 1456, 8192);
		let past = Instant::now() - Duration::from_secs(1);
		let seq = buf.add_message(b"late", Some(Duration::from_millis(100)), true, Timestamp::new(0), past).unwrap();

		assert!(matches!(buf.read_data(seq, Instant::now()), ReadResult::Dropped));
	}

	#[test]
	fn capacity_is_enforced() {
		let mut buf = SndBuffer::new(SeqNo::new(0), 1, 2);
		let now = Instant::now();
		assert!(buf.add_message(b"ab", None, true, Timestamp::new(0), now).is_none());
	}
}
