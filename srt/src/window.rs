//! RTT/RTTVar smoothing and the TSBPD clock-drift estimator built on top of
//! `collections::samples::{AckWindow, TimeWindow}` (§4.5's "Time-Stamp-Based Packet
//! Delivery").

use collections::samples::{AckWindow, TimeWindow};
use collections::seq::SeqNo;

/// RFC 6298-style exponentially weighted RTT/RTTVar estimator, seeded the way the
/// protocol's initial handshake RTT guess is: a conservative default until the first
/// real sample arrives.
pub struct RttEstimator {
	rtt_us: u64,
	rtt_var_us: u64,
	ack_window: AckWindow,
	samples_seen: u32,
}

const INITIAL_RTT_US: u64 = 100_000;
const INITIAL_RTT_VAR_US: u64 = 50_000;

impl RttEstimator {
	pub fn new(ack_window_capacity: usize) -> Self {
		Self { rtt_us: INITIAL_RTT_US, rtt_var_us: INITIAL_RTT_VAR_US, ack_window: AckWindow::new(ack_window_capacity), samples_seen: 0 }
	}

	pub fn record_ack_sent(&mut self, ack_seq_no: SeqNo, now_us: u64) {
		self.ack_window.record(ack_seq_no, now_us);
	}

	/// Feed an ACKACK's round trip and update the smoothed estimate.
	pub fn on_ackack(&mut self, ack_seq_no: SeqNo, now_us: u64) {
		let Some(sample) = self.ack_window.rtt_sample(ack_seq_no, now_us) else { return };

		if self.samples_seen == 0 {
			self.rtt_us = sample;
			self.rtt_var_us = sample / 2;
		} else {
			let diff = self.rtt_us.abs_diff(sample);
			self.rtt_var_us = (3 * self.rtt_var_us + diff) / 4;
			self.rtt_us = (7 * self.rtt_us + sample) / 8;
		}

		self.samples_seen += 1;
	}

	pub fn rtt_us(&self) -> u64 {
		self.rtt_us
	}

	pub fn rtt_var_us(&self) -> u64 {
		self.rtt_var_us
	}

	/// `max(rtt + 4*rttVar, floor)` — the shape every periodic-action interval in
	/// §4.7 (NAK, EXP) is computed with.
	pub fn interval(&self, floor_us: u64) -> u64 {
		(self.rtt_us + 4 * self.rtt_var_us).max(floor_us)
	}
}

/// Receive-rate and bandwidth estimation, reported back to the sender in each ACK.
pub struct RateEstimator {
	time_window: TimeWindow,
}

impl RateEstimator {
	pub fn new(arrival_capacity: usize, probe_capacity: usize) -> Self {
		Self { time_window: TimeWindow::new(arrival_capacity, probe_capacity) }
	}

	pub fn on_arrival(&mut self, now_us: u64) {
		self.time_window.on_arrival(now_us);
	}

	pub fn packet_rate(&self) -> u64 {
		self.time_window.packet_rate().unwrap_or(0)
	}

	pub fn bandwidth(&self) -> u64 {
		self.time_window.bandwidth().unwrap_or(0)
	}
}

/// Exponentially-filtered estimate of peer-vs-local clock skew for TSBPD playout
/// math (§4.5): `playTime = peerStartTime + packet.timestamp + rcvLatency + drift`.
/// Updated from every ACKACK RTT sample and every data packet's timestamp gap, with
/// updates capped per-step so a burst of jitter can't corrupt the time base.
pub struct DriftEstimator {
	drift_us: i64,
	initialized: bool,
}

/// No single update may move the drift estimate by more than this (§4.5: "drift
/// updates are bounded... to prevent bursty jitter from corrupting the time base").
const MAX_STEP_US: i64 = 5_000;

impl DriftEstimator {
	pub fn new() -> Self {
		Self { drift_us: 0, initialized: false }
	}

	/// `observed` is `local_arrival_us - (peer_timestamp_us)` for a single packet;
	/// folds it into the running estimate with an EWMA, capped per update.
	pub fn update(&mut self, observed_us: i64) {
		if !self.initialized {
			self.drift_us = observed_us;
			self.initialized = true;
			return;
		}

		let delta = (observed_us - self.drift_us).clamp(-MAX_STEP_US, MAX_STEP_US);
		self.drift_us += delta / 8;
	}

	pub fn drift_us(&self) -> i64 {
		self.drift_us
	}
}

impl Default for DriftEstimator {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rtt_estimator_converges_toward_steady_samples() {
		let mut est = RttEstimator::new(16);
		for i in 0..20u32 {
			est.record_ack_sent(SeqNo::new(i), (i as u64) * 1000);
			est.on_ackack(SeqNo::new(i), (i as u64) * 1000 + 20_000);
		}

		assert!(est.rtt_us() < INITIAL_RTT_US, "should converge down from the conservative initial guess");
		assert!(est.rtt_us() > 15_000);
	}

	#[test]
	fn drift_estimator_caps_single_step_jump() {
		let mut drift = DriftEstimator::new();
		drift.update(0);
		drift.update(1_000_000);
		assert!(drift.drift_us() < MAX_STEP_US);
	}
}
