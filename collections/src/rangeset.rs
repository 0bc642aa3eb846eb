//! An ordered, coalescing set of sequence numbers, stored as a sorted list of inclusive
//! ranges. Used as the storage for both the send-side and receive-side loss lists —
//! the domain-specific parts (capacity policy, wire serialization) live in
//! `srt::loss`; this is just the sparse range-set mechanics.

use std::collections::VecDeque;

use crate::seq::{seqcmp, SeqNo, Wrapping};

/// A coalesced set of `SeqNo` ranges, each kept disjoint and non-adjacent. All
/// sequence arithmetic is wrap-aware (`seqcmp`), so the set is only meaningful over
/// spans much shorter than half the sequence space — true of every loss list in this
/// protocol, which never holds more than a flight window's worth of entries.
#[derive(Default)]
pub struct RangeSet {
	ranges: VecDeque<(SeqNo, SeqNo)>,
}

impl RangeSet {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert the inclusive range `[lo, hi]`, coalescing with neighbours. Returns the
	/// number of sequence numbers newly added (duplicates are ignored, not counted).
	pub fn insert(&mut self, lo: SeqNo, hi: SeqNo) -> usize {
		debug_assert!(seqcmp(lo, hi) <= 0);

		// Find the first range that could possibly touch [lo, hi]: its high end is not
		// strictly more than one before lo.
		let mut idx = 0;
		while idx < self.ranges.len() && seqcmp(self.ranges[idx].1, lo.advance(-1)) < 0 {
			idx += 1;
		}

		let mut new_lo = lo;
		let mut new_hi = hi;
		let mut removed_total = 0i64;

		// Merge every range overlapping-or-adjacent to [new_lo, new_hi].
		while idx < self.ranges.len() && seqcmp(self.ranges[idx].0, new_hi.advance(1)) <= 0 {
			let (rlo, rhi) = self.ranges.remove(idx).unwrap();
			removed_total += seqcmp(rhi, rlo) as i64 + 1;

			if seqcmp(rlo, new_lo) < 0 {
				new_lo = rlo;
			}
			if seqcmp(rhi, new_hi) > 0 {
				new_hi = rhi;
			}
		}

		let merged_len = seqcmp(new_hi, new_lo) as i64 + 1;
		self.ranges.insert(idx, (new_lo, new_hi));

		(merged_len - removed_total).max(0) as usize
	}

	/// Remove every entry with sequence `<= up_to`, splitting a range if `up_to` falls
	/// inside it. Returns the number of sequence numbers removed.
	pub fn remove(&mut self, up_to: SeqNo) -> usize {
		let mut removed = 0usize;

		while let Some(&(lo, hi)) = self.ranges.front() {
			if seqcmp(hi, up_to) <= 0 {
				removed += seqcmp(hi, lo) as usize + 1;
				self.ranges.pop_front();
			} else if seqcmp(lo, up_to) <= 0 {
				removed += seqcmp(up_to, lo) as usize + 1;
				self.ranges[0].0 = up_to.next();
				break;
			} else {
				break;
			}
		}

		removed
	}

	/// Extract and remove the lowest sequence number in the set.
	pub fn pop_first(&mut self) -> Option<SeqNo> {
		let (lo, hi) = *self.ranges.front()?;

		if lo == hi {
			self.ranges.pop_front();
		} else {
			self.ranges[0].0 = lo.next();
		}

		Some(lo)
	}

	/// Whether `seq` is present in the set.
	pub fn contains(&self, seq: SeqNo) -> bool {
		self.ranges.iter().any(|&(lo, hi)| seqcmp(lo, seq) <= 0 && seqcmp(seq, hi) <= 0)
	}

	/// Total count of sequence numbers held (not range count).
	pub fn len(&self) -> usize {
		self.ranges.iter().map(|&(lo, hi)| seqcmp(hi, lo) as usize + 1).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.ranges.is_empty()
	}

	/// Iterate the disjoint ranges in ascending order.
	pub fn ranges(&self) -> impl Iterator<Item = (SeqNo, SeqNo)> + '_ {
		self.ranges.iter().copied()
	}

	pub fn clear(&mut self) {
		self.ranges.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn insert_coalesces_adjacent_ranges() {
		let mut set = RangeSet::new();
		assert_eq!(set.insert(SeqNo::new(10), SeqNo::new(12)), 3);
		assert_eq!(set.insert(SeqNo::new(13), SeqNo::new(15)), 3);
		assert_eq!(set.ranges().collect::<Vec<_>>().len(), 1);
		assert_eq!(set.len(), 6);
	}

	#[test]
	fn insert_ignores_duplicates() {
		let mut set = RangeSet::new();
		set.insert(SeqNo::new(5), SeqNo::new(9));
		assert_eq!(set.insert(SeqNo::new(6), SeqNo::new(7)), 0);
		assert_eq!(set.len(), 5);
	}

	#[test]
	fn pop_first_is_ascending() {
		let mut set = RangeSet::new();
		set.insert(SeqNo::new(100), SeqNo::new(100));
		set.insert(SeqNo::new(50), SeqNo::new(52));
		set.insert(SeqNo::new(200), SeqNo::new(201));

		let mut out = Vec::new();
		while let Some(s) = set.pop_first() {
			out.push(s.value());
		}

		assert_eq!(out, vec![50, 51, 52, 100, 200, 201]);
	}

	#[test]
	fn remove_up_to_exact_cardinality() {
		let mut set = RangeSet::new();
		let lo = SeqNo::new(1000);
		let hi = SeqNo::new(1010);
		set.insert(lo, hi);

		assert_eq!(set.remove(hi), 11);
		assert!(set.is_empty());
	}

	#[test]
	fn remove_splits_a_range() {
		let mut set = RangeSet::new();
		set.insert(SeqNo::new(10), SeqNo::new(20));

		let removed = set.remove(SeqNo::new(14));
		assert_eq!(removed, 5);
		assert_eq!(set.len(), 6);
		assert!(set.contains(SeqNo::new(15)));
		assert!(!set.contains(SeqNo::new(14)));
	}

	#[test]
	fn wraps_around_sequence_space() {
		let mut set = RangeSet::new();
		let near_top = SeqNo::new((1 << 31) - 2);
		set.insert(near_top, near_top.advance(3));
		assert_eq!(set.len(), 4);
		assert!(set.contains(SeqNo::new(1)));
	}
}
