//! `Config` (§6 "Configurable knobs"): every typed, documented-default knob an
//! application sets before `connect`/`bind`, plus `validate()`'s range checks.

use std::time::Duration;

use crypto::KeyLen;
use utils::error::{ErrorKind, Result, SrtError};

#[derive(Debug, Clone)]
pub struct Config {
	pub mss: u32,
	pub payload_size: u32,
	pub flight_flag_size: u32,
	pub snd_buffer_size: u32,
	pub rcv_buffer_size: u32,
	pub rcv_latency: Duration,
	pub peer_latency: Duration,
	pub passphrase: Option<String>,
	pub pb_key_len: Option<KeyLen>,
	pub km_refresh_rate: u32,
	pub km_pre_announce: u32,
	pub max_bw: i64,
	pub input_bw: i64,
	pub overhead_bw: u32,
	pub nak_report: bool,
	pub tl_pkt_drop: bool,
	pub stream_id: String,
	pub rendezvous: bool,
	pub conn_timeout: Duration,
	/// The highest handshake version this side will offer as a *listener* (§6's
	/// `MinVersion`/`PeerVersion` knobs, narrowed to the one lever a test or
	/// deployment actually needs: forcing a listener down to HSv4 so §4.7's
	/// post-handshake extension fallback exercises against a real HSv5 caller).
	/// Callers always advertise 5; this only affects `accepted_reply`.
	pub max_hs_version: u32,
}

/// "30 Mbit/s ceiling" fallback for `MaxBW=-1` with `InputBW=0` (§9's open question:
/// the source takes this fallback in one code path and the last measured send rate in
/// another — this implementation picks the fixed ceiling and documents it here and in
/// `DESIGN.md`, since it's the simpler, more predictable choice for a fresh connection
/// that has no measured rate yet).
pub const DEFAULT_BW_CEILING_BYTES_PER_SEC: i64 = 30_000_000 / 8;

impl Default for Config {
	fn default() -> Self {
		Self {
			mss: 1500,
			payload_size: 1456,
			flight_flag_size: 25600,
			snd_buffer_size: 8192,
			rcv_buffer_size: 8192,
			rcv_latency: Duration::from_millis(120),
			peer_latency: Duration::from_millis(0),
			passphrase: None,
			pb_key_len: None,
			km_refresh_rate: 1 << 24,
			km_pre_announce: 1 << 12,
			max_bw: -1,
			input_bw: 0,
			overhead_bw: 25,
			nak_report: true,
			tl_pkt_drop: true,
			stream_id: String::new(),
			rendezvous: false,
			conn_timeout: Duration::from_millis(3000),
			max_hs_version: 5,
		}
	}
}

impl Config {
	pub fn with_mss(mut self, mss: u32) -> Self {
		self.mss = mss;
		self
	}

	pub fn with_payload_size(mut self, size: u32) -> Self {
		self.payload_size = size;
		self
	}

	pub fn with_buffer_sizes(mut self, snd: u32, rcv: u32) -> Self {
		self.snd_buffer_size = snd;
		self.rcv_buffer_size = rcv;
		self
	}

	pub fn with_rcv_latency(mut self, latency: Duration) -> Self {
		self.rcv_latency = latency;
		self
	}

	pub fn with_peer_latency(mut self, latency: Duration) -> Self {
		self.peer_latency = latency;
		self
	}

	pub fn with_passphrase(mut self, passphrase: impl Into<String>, key_len: KeyLen) -> Self {
		self.passphrase = Some(passphrase.into());
		self.pb_key_len = Some(key_len);
		self
	}

	pub fn with_km_schedule(mut self, refresh_rate: u32, pre_announce: u32) -> Self {
		self.km_refresh_rate = refresh_rate;
		self.km_pre_announce = pre_announce;
		self
	}

	pub fn with_stream_id(mut self, id: impl Into<String>) -> Self {
		self.stream_id = id.into();
		self
	}

	pub fn with_rendezvous(mut self, on: bool) -> Self {
		self.rendezvous = on;
		self
	}

	pub fn with_conn_timeout(mut self, timeout: Duration) -> Self {
		self.conn_timeout = timeout;
		self
	}

	/// Force this side's listener to reply with an HSv4 conclusion (§4.7's
	/// compatibility path) regardless of what version the caller advertised.
	pub fn with_max_hs_version(mut self, version: u32) -> Self {
		self.max_hs_version = version;
		self
	}

	pub fn tsbpd_enabled(&self) -> bool {
		!self.rcv_latency.is_zero()
	}

	/// Effective send-pacing ceiling in bytes/sec, resolving `MaxBW`/`InputBW`/
	/// `OverheadBW` per §6 (and the open question above).
	pub fn effective_max_bw(&self) -> i64 {
		if self.max_bw >= 0 {
			return self.max_bw;
		}

		if self.input_bw > 0 {
			self.input_bw * (100 + self.overhead_bw as i64) / 100
		} else {
			DEFAULT_BW_CEILING_BYTES_PER_SEC
		}
	}

	pub fn validate(&self) -> Result<()> {
		if !(76..=65535).contains(&self.mss) {
			return Err(SrtError::new(ErrorKind::Setup, "mss", "MSS must be in 76..65535"));
		}

		if self.payload_size == 0 || self.payload_size > self.mss.saturating_sub(28) {
			return Err(SrtError::new(ErrorKind::Setup, "payload_size", "PayloadSize must be <= MSS - 28"));
		}

		if self.snd_buffer_size == 0 || self.rcv_buffer_size == 0 {
			return Err(SrtError::new(ErrorKind::Setup, "buffer_size", "buffer sizes must be nonzero"));
		}

		if let Some(passphrase) = &self.passphrase {
			if !(10..=79).contains(&passphrase.len()) {
				return Err(SrtError::new(ErrorKind::Setup, "passphrase", "passphrase must be 10-79 bytes"));
			}
		}

		if self.stream_id.len() > 512 {
			return Err(SrtError::new(ErrorKind::Setup, "stream_id", "StreamId must be <= 512 bytes"));
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_validate() {
		Config::default().validate().unwrap();
	}

	#[test]
	fn payload_size_over_mss_minus_28_rejected() {
		let cfg = Config::default().with_mss(100).with_payload_size(100);
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn short_passphrase_rejected() {
		let cfg = Config::default().with_passphrase("short", KeyLen::Aes128);
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn max_bw_falls_back_to_ceiling_when_unset() {
		let cfg = Config::default();
		assert_eq!(cfg.effective_max_bw(), DEFAULT_BW_CEILING_BYTES_PER_SEC);
	}

	#[test]
	fn max_bw_derives_from_input_bw_and_overhead() {
		let mut cfg = Config::default();
		cfg.input_bw = 1_000_000;
		cfg.overhead_bw = 25;
		assert_eq!(cfg.effective_max_bw(), 1_250_000);
	}
}
