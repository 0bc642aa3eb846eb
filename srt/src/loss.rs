//! `SndLossList` / `RcvLossList` (§4.2, §4.3): the domain-specific wrapper around
//! `collections::rangeset::RangeSet` — capacity policy and, for the receive side,
//! the NAK wire serialization.

use std::sync::Mutex;

use collections::rangeset::RangeSet;
use collections::seq::{seqcmp, SeqNo, Wrapping};

/// The send-side loss list: sequences the peer NAK'd, awaiting retransmission.
/// Capacity equals the send buffer size (§4.2); an insert never actually overflows
/// it in practice since entries are only added for packets still in flight.
#[derive(Default)]
pub struct SndLossList {
	inner: Mutex<RangeSet>,
}

impl SndLossList {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert the inclusive range `[lo, hi]`; returns the count of genuinely new
	/// entries (duplicates are coalesced away, never double-counted or erred on).
	pub fn insert(&self, lo: SeqNo, hi: SeqNo) -> usize {
		self.inner.lock().unwrap().insert(lo, hi)
	}

	pub fn remove(&self, up_to: SeqNo) -> usize {
		self.inner.lock().unwrap().remove(up_to)
	}

	pub fn pop_first(&self) -> Option<SeqNo> {
		self.inner.lock().unwrap().pop_first()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().unwrap().is_empty()
	}

	pub fn clear(&self) {
		self.inner.lock().unwrap().clear()
	}
}

/// The receive-side loss list: gaps detected in `[rcvLastAck, rcvCurrSeqNo]` that
/// haven't arrived yet (§4.3, invariant 4). Capacity equals the receive buffer size.
#[derive(Default)]
pub struct RcvLossList {
	inner: Mutex<RangeSet>,
}

impl RcvLossList {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, lo: SeqNo, hi: SeqNo) -> usize {
		self.inner.lock().unwrap().insert(lo, hi)
	}

	pub fn remove_one(&self, seq: SeqNo) {
		self.inner.lock().unwrap().remove_single(seq);
	}

	pub fn contains(&self, seq: SeqNo) -> bool {
		self.inner.lock().unwrap().contains(seq)
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().unwrap().is_empty()
	}

	/// Serialize the loss ranges for an outbound NAK (§4.3): a lone sequence is one
	/// 32-bit entry with its high bit clear; a range is two entries, `lo` with its
	/// high bit set followed by `hi` plain, truncated to at most `limit` entries.
	pub fn get_loss_array(&self, limit: usize) -> Vec<u32> {
		let set = self.inner.lock().unwrap();
		let mut out = Vec::new();

		for (lo, hi) in set.ranges() {
			if out.len() >= limit {
				break;
			}

			if lo == hi {
				out.push(lo.value() & 0x7FFF_FFFF);
			} else {
				if out.len() + 2 > limit {
					break;
				}
				out.push(lo.value() | 0x8000_0000);
				out.push(hi.value() & 0x7FFF_FFFF);
			}
		}

		out
	}

	/// Parse a NAK's wire loss array back into `(lo, hi)` ranges.
	pub fn parse_loss_array(words: &[u32]) -> Vec<(SeqNo, SeqNo)> {
		let mut out = Vec::new();
		let mut i = 0;

		while i < words.len() {
			if words[i] & 0x8000_0000 != 0 {
				if i + 1 >= words.len() {
					break;
				}
				out.push((SeqNo::new(words[i] & 0x7FFF_FFFF), SeqNo::new(words[i + 1])));
				i += 2;
			} else {
				let s = SeqNo::new(words[i]);
				out.push((s, s));
				i += 1;
			}
		}

		out
	}
}

/// `RangeSet` only exposes bulk `remove(up_to)`; the receive loss list also needs to
/// drop exactly one sequence once it arrives (the gap is filled, not acknowledged in
/// bulk), which this extension trait adds without complicating the generic container.
trait RemoveSingle {
	fn remove_single(&mut self, seq: SeqNo);
}

impl RemoveSingle for RangeSet {
	fn remove_single(&mut self, seq: SeqNo) {
		// A single-element remove is just `remove(seq)` when `seq` is the set's
		// minimum; for an interior hit, reinsert the remainder either side. Receive
		// loss entries are always filled in roughly ascending order in practice
		// (retransmits arrive close to the original small gap), so this is rarely the
		// expensive path, but it must be correct regardless of order.
		let ranges: Vec<_> = self.ranges().collect();
		self.clear();

		for (lo, hi) in ranges {
			if seqcmp(lo, seq) <= 0 && seqcmp(seq, hi) <= 0 {
				if lo != seq {
					self.insert(lo, seq.advance(-1));
				}
				if hi != seq {
					self.insert(seq.advance(1), hi);
				}
			} else {
				self.insert(lo, hi);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn snd_loss_list_pops_ascending() {
		let list = SndLossList::new();
		list.insert(SeqNo::new(10), SeqNo::new(12));
		list.insert(SeqNo::new(50), SeqNo::new(50));

		assert_eq!(list.pop_first().unwrap().value(), 10);
		assert_eq!(list.pop_first().unwrap().value(), 11);
	}

	#[test]
	fn rcv_loss_array_encodes_singles_and_ranges() {
		let list = RcvLossList::new();
		list.insert(SeqNo::new(5), SeqNo::new(5));
		list.insert(SeqNo::new(10), SeqNo::new(12));

		let words = list.get_loss_array(16);
		let parsed = RcvLossList::parse_loss_array(&words);
		assert_eq!(parsed, vec![(SeqNo::new(5), SeqNo::new(5)), (SeqNo::new(10), SeqNo::new(12))]);
	}

	#[test]
	fn remove_single_splits_a_range() {
		let list = RcvLossList::new();
		list.insert(SeqNo::new(10), SeqNo::new(20));
		list.remove_one(SeqNo::new(15));

		assert!(!list.contains(SeqNo::new(15)));
		assert!(list.contains(SeqNo::new(10)));
		assert!(list.contains(SeqNo::new(20)));
		assert_eq!(list.len(), 10);
	}

	#[test]
	fn loss_array_respects_limit() {
		let list = RcvLossList::new();
		for i in 0..10 {
			list.insert(SeqNo::new(i * 100), SeqNo::new(i * 100));
		}
		assert_eq!(list.get_loss_array(3).len(), 3);
	}
}
