//! Wire header pack/unpack (§4.1). Data and control packets share one 16-byte header
//! shape; bit 0 of word 0 disambiguates. All header words are big-endian on the
//! wire; byte-order conversion happens once here, at the boundary — everything above
//! this module works entirely in host order.

use bilge::prelude::*;
use collections::seq::{MsgNo, SeqNo, Timestamp, Wrapping};
use utils::error::{Result, SrtError};

pub const HEADER_LEN: usize = 16;

/// Data packet word 1's sub-byte fields (§3: message-number adjacent flag bits),
/// packed LSB-first: the 26-bit message number, the retransmit flag, the 2-bit
/// key-spec, the in-order flag, then the 2-bit message-boundary code.
#[bitsize(32)]
#[derive(Clone, Copy, FromBits)]
struct DataWord1 {
	msg_no: u26,
	retransmitted: bool,
	keyspec: u2,
	in_order: bool,
	boundary: u2,
}

/// Control packet word 0: the extension subtype (or 0), the 15-bit control type, and
/// the high bit that disambiguates a control packet from a data packet's raw sequence
/// number (§3, §6).
#[bitsize(32)]
#[derive(Clone, Copy, FromBits)]
struct ControlWord0 {
	ext_type: u16,
	mtype: u15,
	is_control: bool,
}

/// Message-boundary flag pair carried in a data packet's word 1 (§3's message-number
/// adjacent flag bits). Bit values match the scheme UDT-family wire formats use, so a
/// `Solo` message (fits in one packet) sets both boundary bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
	Middle,
	Last,
	First,
	Solo,
}

impl Boundary {
	fn bits(self) -> u32 {
		match self {
			Boundary::Middle => 0b00,
			Boundary::Last => 0b01,
			Boundary::First => 0b10,
			Boundary::Solo => 0b11,
		}
	}

	fn from_bits(b: u32) -> Self {
		match b & 0b11 {
			0b00 => Boundary::Middle,
			0b01 => Boundary::Last,
			0b10 => Boundary::First,
			_ => Boundary::Solo,
		}
	}
}

/// The encryption-key-spec flag carried alongside message flags (§3): which SEK, if
/// any, a data packet's payload was sealed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncFlags {
	None,
	Even,
	Odd,
}

impl EncFlags {
	fn bits(self) -> u32 {
		match self {
			EncFlags::None => 0b00,
			EncFlags::Even => 0b01,
			EncFlags::Odd => 0b10,
		}
	}

	fn from_bits(b: u32) -> Result<Self> {
		match b & 0b11 {
			0b00 => Ok(EncFlags::None),
			0b01 => Ok(EncFlags::Even),
			0b10 => Ok(EncFlags::Odd),
			b => Err(SrtError::connection("bad_keyspec", format!("reserved key-spec value {b}"))),
		}
	}
}

/// Control packet type, carried in the high 15 bits of word 0's low half (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
	Handshake,
	Keepalive,
	Ack,
	LossReport,
	CongestionWarning,
	Shutdown,
	AckAck,
	DropReq,
	PeerError,
	Extension,
}

impl MessageType {
	fn code(self) -> u32 {
		match self {
			MessageType::Handshake => 0,
			MessageType::Keepalive => 1,
			MessageType::Ack => 2,
			MessageType::LossReport => 3,
			MessageType::CongestionWarning => 4,
			MessageType::Shutdown => 5,
			MessageType::AckAck => 6,
			MessageType::DropReq => 7,
			MessageType::PeerError => 8,
			MessageType::Extension => 0x7FFF,
		}
	}

	fn from_code(code: u32) -> Result<Self> {
		Ok(match code {
			0 => MessageType::Handshake,
			1 => MessageType::Keepalive,
			2 => MessageType::Ack,
			3 => MessageType::LossReport,
			4 => MessageType::CongestionWarning,
			5 => MessageType::Shutdown,
			6 => MessageType::AckAck,
			7 => MessageType::DropReq,
			8 => MessageType::PeerError,
			0x7FFF => MessageType::Extension,
			n => return Err(SrtError::connection("bad_ctrl_type", format!("unknown control type {n}"))),
		})
	}
}

/// `Extension` subtype, carried in the low 16 bits of word 1 (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtType {
	HsReq,
	HsRsp,
	KmReq,
	KmRsp,
}

impl ExtType {
	pub(crate) fn code(self) -> u32 {
		match self {
			ExtType::HsReq => 1,
			ExtType::HsRsp => 2,
			ExtType::KmReq => 3,
			ExtType::KmRsp => 4,
		}
	}

	pub(crate) fn from_code(code: u32) -> Result<Self> {
		Ok(match code {
			1 => ExtType::HsReq,
			2 => ExtType::HsRsp,
			3 => ExtType::KmReq,
			4 => ExtType::KmRsp,
			n => return Err(SrtError::connection("bad_ext_type", format!("unknown extension subtype {n}"))),
		})
	}
}

/// The 16-byte header, decoded. Word 2 (timestamp) and word 3 (destination socket
/// id) are common to both variants.
#[derive(Debug, Clone, Copy)]
pub enum Header {
	Data {
		seq: SeqNo,
		boundary: Boundary,
		in_order: bool,
		enc: EncFlags,
		retransmitted: bool,
		msg_no: MsgNo,
		timestamp: Timestamp,
		dest_id: u32,
	},
	Control {
		mtype: MessageType,
		ext_type: Option<ExtType>,
		additional_info: u32,
		timestamp: Timestamp,
		dest_id: u32,
	},
}

impl Header {
	pub fn timestamp(&self) -> Timestamp {
		match *self {
			Header::Data { timestamp, .. } | Header::Control { timestamp, .. } => timestamp,
		}
	}

	pub fn dest_id(&self) -> u32 {
		match *self {
			Header::Data { dest_id, .. } | Header::Control { dest_id, .. } => dest_id,
		}
	}

	pub fn is_control(&self) -> bool {
		matches!(self, Header::Control { .. })
	}
}

/// A full packet: header plus opaque (data) or word-array (control) payload bytes.
#[derive(Debug, Clone)]
pub struct Packet {
	pub header: Header,
	pub payload: Vec<u8>,
}

impl Packet {
	pub fn data(seq: SeqNo, boundary: Boundary, in_order: bool, enc: EncFlags, retransmitted: bool, msg_no: MsgNo, timestamp: Timestamp, dest_id: u32, payload: Vec<u8>) -> Self {
		Self { header: Header::Data { seq, boundary, in_order, enc, retransmitted, msg_no, timestamp, dest_id }, payload }
	}

	pub fn control(mtype: MessageType, ext_type: Option<ExtType>, additional_info: u32, timestamp: Timestamp, dest_id: u32, payload: Vec<u8>) -> Self {
		Self { header: Header::Control { mtype, ext_type, additional_info, timestamp, dest_id }, payload }
	}

	/// Serialize header and payload into one on-wire datagram.
	pub fn pack(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());

		match self.header {
			Header::Data { seq, boundary, in_order, enc, retransmitted, msg_no, timestamp, dest_id } => {
				let word0 = seq.value() & 0x7FFF_FFFF;
				let word1 = DataWord1::new(u26::new(msg_no.value() & 0x3FF_FFFF), retransmitted, u2::new(enc.bits() as u8), in_order, u2::new(boundary.bits() as u8));

				out.extend_from_slice(&word0.to_be_bytes());
				out.extend_from_slice(&u32::from(word1).to_be_bytes());
				out.extend_from_slice(&timestamp.value().to_be_bytes());
				out.extend_from_slice(&dest_id.to_be_bytes());
			}
			Header::Control { mtype, ext_type, additional_info, timestamp, dest_id } => {
				let sub = ext_type.map(ExtType::code).unwrap_or(0);
				let word0 = ControlWord0::new(sub as u16, u15::new(mtype.code() as u16), true);

				out.extend_from_slice(&u32::from(word0).to_be_bytes());
				out.extend_from_slice(&additional_info.to_be_bytes());
				out.extend_from_slice(&timestamp.value().to_be_bytes());
				out.extend_from_slice(&dest_id.to_be_bytes());
			}
		}

		out.extend_from_slice(&self.payload);
		out
	}

	/// Parse a datagram into a header and payload slice. Never panics on malformed
	/// input; per §7 the caller logs and drops rather than tearing the connection down.
	pub fn unpack(bytes: &[u8]) -> Result<Self> {
		if bytes.len() < HEADER_LEN {
			return Err(SrtError::connection("short_packet", format!("{} bytes, need at least {HEADER_LEN}", bytes.len())));
		}

		let word = |i: usize| u32::from_be_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
		let (word0, word1, word2, word3) = (word(0), word(1), word(2), word(3));
		let timestamp = Timestamp::new(word2);
		let dest_id = word3;
		let payload = bytes[HEADER_LEN..].to_vec();

		let header = if word0 & 0x8000_0000 == 0 {
			let fields = DataWord1::from(word1);
			Header::Data {
				seq: SeqNo::new(word0),
				boundary: Boundary::from_bits(fields.boundary().value() as u32),
				in_order: fields.in_order(),
				enc: EncFlags::from_bits(fields.keyspec().value() as u32)?,
				retransmitted: fields.retransmitted(),
				msg_no: MsgNo::new(fields.msg_no().value()),
				timestamp,
				dest_id,
			}
		} else {
			let fields = ControlWord0::from(word0);
			let mtype = MessageType::from_code(fields.mtype().value() as u32)?;
			let ext_type = if mtype == MessageType::Extension { Some(ExtType::from_code(fields.ext_type() as u32)?) } else { None };

			Header::Control { mtype, ext_type, additional_info: word1, timestamp, dest_id }
		};

		Ok(Packet { header, payload })
	}
}

/// Split a control payload of big-endian 32-bit words into a `Vec<u32>`.
pub fn words_from_body(body: &[u8]) -> Vec<u32> {
	body.chunks_exact(4).map(|c| u32::from_be_bytes(c.try_into().unwrap())).collect()
}

/// Serialize 32-bit words into a control payload.
pub fn body_from_words(words: &[u32]) -> Vec<u8> {
	let mut out = Vec::with_capacity(words.len() * 4);
	for w in words {
		out.extend_from_slice(&w.to_be_bytes());
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(p: &Packet) -> Packet {
		Packet::unpack(&p.pack()).unwrap()
	}

	#[test]
	fn data_packet_round_trips() {
		let p = Packet::data(SeqNo::new(12345), Boundary::Solo, true, EncFlags::Odd, false, MsgNo::new(77), Timestamp::new(999_999), 42, vec![1, 2, 3, 4, 5]);
		let back = roundtrip(&p);

		match back.header {
			Header::Data { seq, boundary, in_order, enc, retransmitted, msg_no, timestamp, dest_id } => {
				assert_eq!(seq.value(), 12345);
				assert_eq!(boundary, Boundary::Solo);
				assert!(in_order);
				assert_eq!(enc, EncFlags::Odd);
				assert!(!retransmitted);
				assert_eq!(msg_no.value(), 77);
				assert_eq!(timestamp.value(), 999_999);
				assert_eq!(dest_id, 42);
			}
			_ => panic!("expected data header"),
		}
		assert_eq!(back.payload, vec![1, 2, 3, 4, 5]);
	}

	#[test]
	fn control_packet_round_trips() {
		let p = Packet::control(MessageType::Ack, None, 555, Timestamp::new(10), 7, body_from_words(&[1, 2, 3]));
		let back = roundtrip(&p);

		match back.header {
			Header::Control { mtype, ext_type, additional_info, timestamp, dest_id } => {
				assert_eq!(mtype, MessageType::Ack);
				assert_eq!(ext_type, None);
				assert_eq!(additional_info, 555);
				assert_eq!(timestamp.value(), 10);
				assert_eq!(dest_id, 7);
			}
			_ => panic!("expected control header"),
		}
		assert_eq!(words_from_body(&back.payload), vec![1, 2, 3]);
	}

	#[test]
	fn extension_subtype_round_trips() {
		let p = Packet::control(MessageType::Extension, Some(ExtType::KmReq), 0, Timestamp::new(1), 9, vec![]);
		let back = roundtrip(&p);

		match back.header {
			Header::Control { mtype, ext_type, .. } => {
				assert_eq!(mtype, MessageType::Extension);
				assert_eq!(ext_type, Some(ExtType::KmReq));
			}
			_ => panic!("expected control header"),
		}
	}

	#[test]
	fn retransmit_flag_is_preserved() {
		let p = Packet::data(SeqNo::new(1), Boundary::Solo, true, EncFlags::None, true, MsgNo::new(1), Timestamp::new(0), 1, vec![]);
		let back = roundtrip(&p);
		match back.header {
			Header::Data { retransmitted, .. } => assert!(retransmitted),
			_ => panic!("expected data header"),
		}
	}

	#[test]
	fn too_short_is_rejected_not_panicked() {
		assert!(Packet::unpack(&[0u8; 4]).is_err());
	}
}
