//! Handshake (§4.7, §6): cookie generation/validation, the fixed 48-byte handshake
//! body, HSv5 extension blocks (`SrtHsReq`/`SrtHsRsp`, KM), and the caller/listener/
//! rendezvous state machines that drive a connection from `Opened` to `Connected`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use bilge::prelude::*;
use collections::seq::SeqNo;
use sha1::{Digest, Sha1};
use utils::error::{Result, SrtError};

use crate::packet::{words_from_body, ExtType};

pub const HS_BODY_LEN: usize = 48;

/// The handshake's `reqType` field (§6). Negative values below `Induction` carry a
/// reject reason (`Rejection`); this mirrors the original's sign convention without
/// importing its exact numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
	Waveahand,
	Induction,
	Conclusion,
	Rejection(RejectReason),
}

/// Numeric reject reasons carried in a rejecting handshake response (§9's
/// "Supplemented features": the original carries reject-reason codes that spec.md
/// references without enumerating).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
	BadSecret,
	VersionMismatch,
	BadCookie,
	Overloaded,
	Backlog,
}

impl RejectReason {
	fn code(self) -> i32 {
		match self {
			RejectReason::BadSecret => 1,
			RejectReason::VersionMismatch => 2,
			RejectReason::BadCookie => 3,
			RejectReason::Overloaded => 4,
			RejectReason::Backlog => 5,
		}
	}

	fn from_code(c: i32) -> Option<Self> {
		Some(match c {
			1 => RejectReason::BadSecret,
			2 => RejectReason::VersionMismatch,
			3 => RejectReason::BadCookie,
			4 => RejectReason::Overloaded,
			5 => RejectReason::Backlog,
			_ => return None,
		})
	}
}

impl HandshakeType {
	fn code(self) -> i32 {
		match self {
			HandshakeType::Waveahand => 0,
			HandshakeType::Induction => 1,
			HandshakeType::Conclusion => -1,
			HandshakeType::Rejection(reason) => -1000 - reason.code(),
		}
	}

	fn from_code(c: i32) -> Self {
		match c {
			0 => HandshakeType::Waveahand,
			1 => HandshakeType::Induction,
			-1 => HandshakeType::Conclusion,
			c if c <= -1000 => HandshakeType::Rejection(RejectReason::from_code(-1000 - c).unwrap_or(RejectReason::Overloaded)),
			_ => HandshakeType::Rejection(RejectReason::Overloaded),
		}
	}
}

fn ip_to_bytes(addr: IpAddr) -> [u8; 16] {
	match addr {
		IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
		IpAddr::V6(v6) => v6.octets(),
	}
}

fn ip_from_bytes(bytes: [u8; 16]) -> IpAddr {
	let v6 = Ipv6Addr::from(bytes);
	match v6.to_ipv4_mapped() {
		Some(v4) => IpAddr::V4(v4),
		None => IpAddr::V6(v6),
	}
}

/// The fixed-shape part of a handshake control packet's body (§6).
#[derive(Debug, Clone)]
pub struct Handshake {
	pub version: u32,
	pub encryption_field: u16,
	pub ext_field: u16,
	pub isn: SeqNo,
	pub mss: u32,
	pub flight_flag_size: u32,
	pub req_type: HandshakeType,
	pub socket_id: u32,
	pub syn_cookie: u32,
	pub peer_addr: IpAddr,
	/// HSv5 extension blocks appended after the fixed body, each `(extType, extSize,
	/// extData[extSize x 4])` (§6).
	pub extensions: Vec<(ExtType, Vec<u8>)>,
}

impl Handshake {
	pub fn pack(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(HS_BODY_LEN);
		out.extend_from_slice(&self.version.to_be_bytes());
		out.extend_from_slice(&((self.encryption_field as u32) << 16 | self.ext_field as u32).to_be_bytes());
		out.extend_from_slice(&self.isn.value().to_be_bytes());
		out.extend_from_slice(&self.mss.to_be_bytes());
		out.extend_from_slice(&self.flight_flag_size.to_be_bytes());
		out.extend_from_slice(&self.req_type.code().to_be_bytes());
		out.extend_from_slice(&self.socket_id.to_be_bytes());
		out.extend_from_slice(&self.syn_cookie.to_be_bytes());
		out.extend_from_slice(&ip_to_bytes(self.peer_addr));

		for (ext_type, data) in &self.extensions {
			out.extend_from_slice(&(ext_type.code() as u16).to_be_bytes());
			out.extend_from_slice(&((data.len() / 4) as u16).to_be_bytes());
			out.extend_from_slice(data);
		}

		out
	}

	pub fn unpack(bytes: &[u8]) -> Result<Self> {
		if bytes.len() < HS_BODY_LEN {
			return Err(SrtError::connection("short_handshake", format!("{} bytes, need {HS_BODY_LEN}", bytes.len())));
		}

		let u32_at = |i: usize| u32::from_be_bytes(bytes[i..i + 4].try_into().unwrap());

		let version = u32_at(0);
		let packed = u32_at(4);
		let isn = SeqNo::new(u32_at(8));
		let mss = u32_at(12);
		let flight_flag_size = u32_at(16);
		let req_type = HandshakeType::from_code(u32_at(20) as i32);
		let socket_id = u32_at(24);
		let syn_cookie = u32_at(28);
		let peer_addr = ip_from_bytes(bytes[32..48].try_into().unwrap());

		let mut extensions = Vec::new();
		let mut pos = HS_BODY_LEN;

		while pos + 4 <= bytes.len() {
			let ext_code = u16::from_be_bytes(bytes[pos..pos + 2].try_into().unwrap());
			let ext_words = u16::from_be_bytes(bytes[pos + 2..pos + 4].try_into().unwrap()) as usize;
			let ext_len = ext_words * 4;
			pos += 4;

			if pos + ext_len > bytes.len() {
				break;
			}

			if let Ok(ext_type) = ExtType::from_code(ext_code as u32) {
				extensions.push((ext_type, bytes[pos..pos + ext_len].to_vec()));
			}

			pos += ext_len;
		}

		Ok(Self {
			version,
			encryption_field: (packed >> 16) as u16,
			ext_field: packed as u16,
			isn,
			mss,
			flight_flag_size,
			req_type,
			socket_id,
			syn_cookie,
			peer_addr,
			extensions,
		})
	}

	pub fn find_extension(&self, ty: ExtType) -> Option<&[u8]> {
		self.extensions.iter().find(|(t, _)| *t == ty).map(|(_, d)| d.as_slice())
	}
}

/// SRT extension flags negotiated in `SrtHsReq`/`SrtHsRsp` (§4.7), packed LSB-first
/// into the extension body's flags word; the remaining 27 bits are reserved.
#[bitsize(32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBits)]
pub struct SrtFlags {
	pub tsbpd_snd: bool,
	pub tsbpd_rcv: bool,
	pub tlpktdrop: bool,
	pub nakreport: bool,
	pub rexmit: bool,
	reserved: u27,
}

/// `HsReq`/`HsRsp` extension body (§6): `[srtVersion, flags, extrasHi:16|tsbpdDelay:16]`.
#[derive(Debug, Clone, Copy)]
pub struct SrtHsReq {
	pub srt_version: u32,
	pub flags: SrtFlags,
	pub tsbpd_delay_ms: u16,
}

impl SrtHsReq {
	pub fn pack(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(12);
		out.extend_from_slice(&self.srt_version.to_be_bytes());
		out.extend_from_slice(&u32::from(self.flags).to_be_bytes());
		out.extend_from_slice(&(0u16).to_be_bytes());
		out.extend_from_slice(&self.tsbpd_delay_ms.to_be_bytes());
		out
	}

	pub fn unpack(bytes: &[u8]) -> Result<Self> {
		if bytes.len() < 12 {
			return Err(SrtError::connection("short_hsreq", "SrtHsReq extension truncated"));
		}

		let words = words_from_body(&bytes[..12]);
		Ok(Self { srt_version: words[0], flags: SrtFlags::from(words[1]), tsbpd_delay_ms: (words[2] & 0xFFFF) as u16 })
	}
}

/// One-minute cookie epoch rotation with previous-epoch acceptance for clock skew
/// (§4.7, §9: "the handshake cookie grace window... is never stated as a contract" —
/// this implementation's chosen window is exactly the current and prior full minute,
/// documented here and in `DESIGN.md`).
const COOKIE_EPOCH: u64 = 60;

pub fn make_cookie(peer: SocketAddr, local: SocketAddr, secret: &[u8], epoch: u64) -> u32 {
	let mut hasher = Sha1::new();
	hasher.update(peer.to_string().as_bytes());
	hasher.update(local.to_string().as_bytes());
	hasher.update(epoch.to_le_bytes());
	hasher.update(secret);
	let digest = hasher.finalize();
	u32::from_be_bytes(digest[..4].try_into().unwrap())
}

pub fn current_epoch() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() / COOKIE_EPOCH
}

/// Validate `cookie` against the current epoch or the one immediately before it.
pub fn cookie_is_valid(cookie: u32, peer: SocketAddr, local: SocketAddr, secret: &[u8]) -> bool {
	let now = current_epoch();
	cookie == make_cookie(peer, local, secret, now) || cookie == make_cookie(peer, local, secret, now.saturating_sub(1))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn addr(port: u16) -> SocketAddr {
		SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
	}

	#[test]
	fn handshake_round_trips_without_extensions() {
		let hs = Handshake {
			version: 5,
			encryption_field: 0,
			ext_field: 0,
			isn: SeqNo::new(999),
			mss: 1500,
			flight_flag_size: 25600,
			req_type: HandshakeType::Induction,
			socket_id: 42,
			syn_cookie: 0xdead_beef,
			peer_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
			extensions: vec![],
		};

		let back = Handshake::unpack(&hs.pack()).unwrap();
		assert_eq!(back.version, 5);
		assert_eq!(back.isn.value(), 999);
		assert_eq!(back.req_type, HandshakeType::Induction);
		assert_eq!(back.syn_cookie, 0xdead_beef);
		assert_eq!(back.peer_addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
	}

	#[test]
	fn handshake_round_trips_with_srt_hsreq_extension() {
		let flags = SrtFlags::new(true, false, false, false, true, u27::new(0));
		let hsreq = SrtHsReq { srt_version: 0x0001_0500, flags, tsbpd_delay_ms: 120 };

		let hs = Handshake {
			version: 5,
			encryption_field: 0,
			ext_field: 1,
			isn: SeqNo::new(1),
			mss: 1500,
			flight_flag_size: 25600,
			req_type: HandshakeType::Conclusion,
			socket_id: 7,
			syn_cookie: 1234,
			peer_addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
			extensions: vec![(ExtType::HsReq, hsreq.pack())],
		};

		let back = Handshake::unpack(&hs.pack()).unwrap();
		let ext = back.find_extension(ExtType::HsReq).unwrap();
		let decoded = SrtHsReq::unpack(ext).unwrap();
		assert_eq!(decoded.srt_version, 0x0001_0500);
		assert!(decoded.flags.tsbpd_snd());
		assert!(decoded.flags.rexmit());
		assert!(!decoded.flags.tlpktdrop());
		assert_eq!(decoded.tsbpd_delay_ms, 120);
	}

	#[test]
	fn rejection_round_trips_reason() {
		let code = HandshakeType::Rejection(RejectReason::BadSecret).code();
		assert_eq!(HandshakeType::from_code(code), HandshakeType::Rejection(RejectReason::BadSecret));
	}

	#[test]
	fn cookie_accepts_current_and_previous_epoch() {
		let secret = b"listener-secret";
		let a = addr(1111);
		let b = addr(2222);

		let cookie = make_cookie(a, b, secret, current_epoch());
		assert!(cookie_is_valid(cookie, a, b, secret));

		let stale = make_cookie(a, b, secret, current_epoch().saturating_sub(2));
		assert!(!cookie_is_valid(stale, a, b, secret));
	}
}
