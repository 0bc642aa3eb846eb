//! Wire shape for Key Material messages (KMREQ/KMRSP, §4.6 and §6).
//!
//! The upstream wire format bit-packs several flag fields into shared 32-bit words;
//! this crate uses a simpler word-per-field layout instead (documented as a
//! deliberate simplification in `DESIGN.md`) since spec.md specifies the fields KM
//! carries, not their exact bit offsets.

use utils::error::{Result, SrtError};

use crate::provider::{Cipher, KeyLen};

pub const SALT_LEN: usize = 14;

/// Key-material state for one direction of a connection (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmState {
	Unsecured,
	Securing,
	Secured,
	NoSecret,
	BadSecret,
}

/// Which Stream Encrypting Key a data packet was sealed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
	Even,
	Odd,
}

impl KeySpec {
	pub fn index(self) -> usize {
		match self {
			KeySpec::Even => 0,
			KeySpec::Odd => 1,
		}
	}

	pub fn other(self) -> Self {
		match self {
			KeySpec::Even => KeySpec::Odd,
			KeySpec::Odd => KeySpec::Even,
		}
	}
}

fn cipher_code(c: Cipher) -> u32 {
	match c {
		Cipher::Ctr => 0,
		Cipher::Gcm => 1,
	}
}

fn cipher_from_code(c: u32) -> Result<Cipher> {
	match c {
		0 => Ok(Cipher::Ctr),
		1 => Ok(Cipher::Gcm),
		n => Err(SrtError::setup("km_cipher", format!("unknown cipher id {n}"))),
	}
}

fn state_code(s: KmState) -> u32 {
	match s {
		KmState::Unsecured => 0,
		KmState::Securing => 1,
		KmState::Secured => 2,
		KmState::NoSecret => 3,
		KmState::BadSecret => 4,
	}
}

fn state_from_code(c: u32) -> Result<KmState> {
	match c {
		0 => Ok(KmState::Unsecured),
		1 => Ok(KmState::Securing),
		2 => Ok(KmState::Secured),
		3 => Ok(KmState::NoSecret),
		4 => Ok(KmState::BadSecret),
		n => Err(SrtError::setup("km_state", format!("unknown KM state code {n}"))),
	}
}

/// A decoded KMREQ or KMRSP control-packet body (§6's "HaiCrypt KM structure").
#[derive(Debug, Clone)]
pub enum KmMessage {
	/// Carries key material: version, which SEK(s) are present, cipher, key length,
	/// salt, and the wrapped SEK bytes (concatenated even-then-odd when both present).
	Keys {
		version: u32,
		even: bool,
		odd: bool,
		cipher: Cipher,
		key_len: KeyLen,
		salt: [u8; SALT_LEN],
		wrapped: Vec<u8>,
	},
	/// A KMRSP carrying only a failure state code (`NoSecret` or `BadSecret`), sent
	/// when the receiver has no passphrase or the unwrap integrity check failed.
	Failure(KmState),
}

const TAG_KEYS: u32 = 1;
const TAG_FAILURE: u32 = 2;

impl KmMessage {
	pub fn pack(&self) -> Vec<u8> {
		let mut out = Vec::new();

		match self {
			KmMessage::Keys { version, even, odd, cipher, key_len, salt, wrapped } => {
				out.extend_from_slice(&TAG_KEYS.to_be_bytes());
				out.extend_from_slice(&version.to_be_bytes());
				let flags = (*even as u32) | ((*odd as u32) << 1);
				out.extend_from_slice(&flags.to_be_bytes());
				out.extend_from_slice(&cipher_code(*cipher).to_be_bytes());
				out.extend_from_slice(&(key_len.bytes() as u32).to_be_bytes());
				out.extend_from_slice(salt);
				out.extend_from_slice(&(wrapped.len() as u32).to_be_bytes());
				out.extend_from_slice(wrapped);
			}
			KmMessage::Failure(state) => {
				out.extend_from_slice(&TAG_FAILURE.to_be_bytes());
				out.extend_from_slice(&state_code(*state).to_be_bytes());
			}
		}

		out
	}

	pub fn unpack(bytes: &[u8]) -> Result<Self> {
		let bad = || SrtError::security("km_unpack", "truncated or malformed KM message");
		let word = |b: &[u8], i: usize| -> Result<u32> { Ok(u32::from_be_bytes(b.get(i..i + 4).ok_or_else(bad)?.try_into().unwrap())) };

		match word(bytes, 0)? {
			TAG_KEYS => {
				let version = word(bytes, 4)?;
				let flags = word(bytes, 8)?;
				let cipher = cipher_from_code(word(bytes, 12)?)?;
				let key_len = KeyLen::from_bytes(word(bytes, 16)? as usize)?;
				let salt: [u8; SALT_LEN] = bytes.get(20..20 + SALT_LEN).ok_or_else(bad)?.try_into().unwrap();
				let wlen = word(bytes, 20 + SALT_LEN)? as usize;
				let wrapped = bytes.get(24 + SALT_LEN..24 + SALT_LEN + wlen).ok_or_else(bad)?.to_vec();

				Ok(KmMessage::Keys { version, even: flags & 1 != 0, odd: flags & 2 != 0, cipher, key_len, salt, wrapped })
			}
			TAG_FAILURE => Ok(KmMessage::Failure(state_from_code(word(bytes, 4)?)?)),
			n => Err(SrtError::security("km_unpack", format!("unknown KM message tag {n}"))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keys_round_trip() {
		let msg = KmMessage::Keys {
			version: 0x0001_0000,
			even: true,
			odd: false,
			cipher: Cipher::Ctr,
			key_len: KeyLen::Aes256,
			salt: [0x5a; SALT_LEN],
			wrapped: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
		};

		let packed = msg.pack();
		let back = KmMessage::unpack(&packed).unwrap();

		match back {
			KmMessage::Keys { version, even, odd, cipher, key_len, salt, wrapped } => {
				assert_eq!(version, 0x0001_0000);
				assert!(even && !odd);
				assert_eq!(cipher, Cipher::Ctr);
				assert_eq!(key_len, KeyLen::Aes256);
				assert_eq!(salt, [0x5a; SALT_LEN]);
				assert_eq!(wrapped, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
			}
			_ => panic!("expected Keys variant"),
		}
	}

	#[test]
	fn failure_round_trips() {
		let packed = KmMessage::Failure(KmState::BadSecret).pack();
		match KmMessage::unpack(&packed).unwrap() {
			KmMessage::Failure(KmState::BadSecret) => {}
			other => panic!("unexpected {other:?}"),
		}
	}
}
