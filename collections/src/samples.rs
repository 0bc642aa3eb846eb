//! Fixed-size sample windows backing the connection's RTT and rate estimators.
//!
//! `AckWindow` remembers the send time of recent ACKs so that the matching ACKACK can
//! turn "time elapsed" into an RTT sample. `TimeWindow` remembers recent packet
//! arrival and packet-pair probe intervals so the receiver can estimate its own
//! arrival rate and the sender-to-receiver link bandwidth, both reported back to the
//! sender in the next ACK.

use crate::seq::SeqNo;

/// Records `(ack_seq_no, send_time)` pairs in a ring so an ACKACK carrying
/// `ack_seq_no` can be turned into an RTT sample.
pub struct AckWindow {
	slots: Vec<Option<(SeqNo, u64)>>,
	head: usize,
}

impl AckWindow {
	pub fn new(capacity: usize) -> Self {
		assert!(capacity > 0);
		Self { slots: vec![None; capacity], head: 0 }
	}

	/// Record that an ACK carrying `ack_seq_no` was sent at `now` (microseconds).
	pub fn record(&mut self, ack_seq_no: SeqNo, now: u64) {
		let cap = self.slots.len();
		self.slots[self.head] = Some((ack_seq_no, now));
		self.head = (self.head + 1) % cap;
	}

	/// Look up the send time for `ack_seq_no` and return the elapsed microseconds, if
	/// the record hasn't been overwritten yet.
	pub fn rtt_sample(&self, ack_seq_no: SeqNo, now: u64) -> Option<u64> {
		self.slots.iter().flatten().find(|(seq, _)| *seq == ack_seq_no).map(|(_, sent)| now.saturating_sub(*sent))
	}
}

/// Arrival-time and packet-pair probe interval samples, used to estimate the
/// receiver's incoming packet rate and the link's available bandwidth.
///
/// Every 16th packet starts a "probe pair": the gap between it and the packet
/// immediately following estimates the bottleneck's per-packet service time, which
/// scaled by MSS gives a bandwidth estimate largely immune to ordinary jitter.
pub struct TimeWindow {
	arrivals: Vec<u64>,
	arrival_head: usize,
	probes: Vec<u64>,
	probe_head: usize,
	last_arrival: Option<u64>,
	probe_pending: Option<u64>,
	packet_count: u64,
}

const PROBE_STRIDE: u64 = 16;

impl TimeWindow {
	pub fn new(arrival_capacity: usize, probe_capacity: usize) -> Self {
		assert!(arrival_capacity > 0 && probe_capacity > 0);
		Self {
			arrivals: Vec::with_capacity(arrival_capacity),
			arrival_head: 0,
			probes: Vec::with_capacity(probe_capacity),
			probe_head: 0,
			last_arrival: None,
			probe_pending: None,
			packet_count: 0,
		}
	}

	/// Feed the arrival time (microseconds) of a newly received data packet.
	pub fn on_arrival(&mut self, now: u64) {
		if let Some(last) = self.last_arrival {
			push_ring(&mut self.arrivals, &mut self.arrival_head, now.saturating_sub(last));
		}
		self.last_arrival = Some(now);

		if self.packet_count % PROBE_STRIDE == 0 {
			self.probe_pending = Some(now);
		} else if self.packet_count % PROBE_STRIDE == 1 {
			if let Some(first) = self.probe_pending.take() {
				push_ring(&mut self.probes, &mut self.probe_head, now.saturating_sub(first));
			}
		}

		self.packet_count += 1;
	}

	/// Estimated receive rate in packets/second, from the median arrival interval.
	pub fn packet_rate(&self) -> Option<u64> {
		median(&self.arrivals).filter(|&us| us > 0).map(|us| 1_000_000 / us)
	}

	/// Estimated link bandwidth in packets/second, from the median probe-pair gap.
	pub fn bandwidth(&self) -> Option<u64> {
		median(&self.probes).filter(|&us| us > 0).map(|us| 1_000_000 / us)
	}
}

fn push_ring(buf: &mut Vec<u64>, head: &mut usize, value: u64) {
	if buf.len() < buf.capacity() {
		buf.push(value);
	} else {
		buf[*head] = value;
		*head = (*head + 1) % buf.capacity().max(1);
	}
}

/// The median of `samples`, discarding the top and bottom octile as outliers — the
/// same trim UDT-family implementations apply before averaging probe intervals.
fn median(samples: &[u64]) -> Option<u64> {
	if samples.is_empty() {
		return None;
	}

	let mut sorted = samples.to_vec();
	sorted.sort_unstable();

	let trim = sorted.len() / 8;
	let trimmed = &sorted[trim..sorted.len() - trim];
	let trimmed = if trimmed.is_empty() { &sorted[..] } else { trimmed };

	Some(trimmed[trimmed.len() / 2])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ack_window_matches_recorded_send_time() {
		let mut win = AckWindow::new(4);
		win.record(SeqNo::new(1), 1_000);
		win.record(SeqNo::new(2), 1_500);

		assert_eq!(win.rtt_sample(SeqNo::new(2), 1_700), Some(200));
		assert_eq!(win.rtt_sample(SeqNo::new(99), 1_700), None);
	}

	#[test]
	fn ack_window_wraps_and_forgets_oldest() {
		let mut win = AckWindow::new(2);
		win.record(SeqNo::new(1), 0);
		win.record(SeqNo::new(2), 10);
		win.record(SeqNo::new(3), 20);

		assert_eq!(win.rtt_sample(SeqNo::new(1), 100), None);
		assert_eq!(win.rtt_sample(SeqNo::new(3), 100), Some(80));
	}

	#[test]
	fn time_window_estimates_steady_rate() {
		let mut tw = TimeWindow::new(16, 8);
		let mut t = 0u64;
		for _ in 0..64 {
			tw.on_arrival(t);
			t += 1_000;
		}

		let rate = tw.packet_rate().expect("should have a rate estimate");
		assert_eq!(rate, 1_000);
	}

	#[test]
	fn time_window_empty_has_no_estimate() {
		let tw = TimeWindow::new(16, 8);
		assert_eq!(tw.packet_rate(), None);
		assert_eq!(tw.bandwidth(), None);
	}
}
