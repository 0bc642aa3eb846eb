//! The `CryptoProvider` capability trait (design note "Conditional compilation for
//! crypto providers") and a RustCrypto-backed implementation. `CryptoControl` depends
//! only on this trait; a different back-end (OpenSSL, mbedTLS, Botan, ...) could be
//! swapped in at the edge without touching the key-material state machine.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit as AeadKeyInit};
use aes_gcm::{Aes128Gcm, Aes192Gcm, Aes256Gcm};
use aes_kw::{KekAes128, KekAes192, KekAes256};
use hmac::Hmac;
use rand::RngCore;
use sha1::Sha1;

use utils::error::{Result, SrtError};

/// 16-byte AES block / GCM IV size used throughout the key schedule.
pub const IV_LEN: usize = 16;
/// AES-GCM uses the low 96 bits of the 128-bit IV as its nonce.
pub const GCM_NONCE_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;

type Ctr128Be<C> = ctr::Ctr128BE<C>;

/// 128/192/256-bit AES key length, as negotiated by `PbKeyLen` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLen {
	Aes128,
	Aes192,
	Aes256,
}

impl KeyLen {
	pub fn bytes(self) -> usize {
		match self {
			KeyLen::Aes128 => 16,
			KeyLen::Aes192 => 24,
			KeyLen::Aes256 => 32,
		}
	}

	pub fn from_bytes(n: usize) -> Result<Self> {
		match n {
			16 => Ok(KeyLen::Aes128),
			24 => Ok(KeyLen::Aes192),
			32 => Ok(KeyLen::Aes256),
			_ => Err(SrtError::setup("pbkeylen", format!("unsupported key length {n} bytes"))),
		}
	}
}

/// Which per-packet cipher mode a connection negotiated. GCM carries a trailing
/// 16-byte authentication tag; CTR does not authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
	Ctr,
	Gcm,
}

/// The capability set the core key-material state machine needs from a back-end:
/// random bytes, AES-CTR/GCM, PBKDF2, and NIST AES key wrap/unwrap.
pub trait CryptoProvider: Send + Sync {
	/// Fill `buf` with cryptographically secure random bytes.
	fn prng(&self, buf: &mut [u8]);

	/// XOR `data` in place under AES-CTR. Encryption and decryption are the same
	/// operation for CTR mode. `key.len()` selects AES-128/192/256.
	fn aes_ctr_xor(&self, key: &[u8], iv: &[u8; IV_LEN], data: &mut [u8]) -> Result<()>;

	/// Encrypt `data` in place with AES-GCM, appending the 16-byte tag.
	fn aes_gcm_seal(&self, key: &[u8], iv: &[u8; IV_LEN], aad: &[u8], data: &mut Vec<u8>) -> Result<()>;

	/// Decrypt an AES-GCM sealed buffer in place (tag at the tail), truncating the tag
	/// off on success. Fails closed: any tag or AAD mismatch returns `Err(Security)`.
	fn aes_gcm_open(&self, key: &[u8], iv: &[u8; IV_LEN], aad: &[u8], data: &mut Vec<u8>) -> Result<()>;

	/// PBKDF2-HMAC-SHA1(passphrase, salt, iterations, key_len) -> derived key bytes.
	fn pbkdf2(&self, passphrase: &[u8], salt: &[u8], iterations: u32, key_len: KeyLen) -> Vec<u8>;

	/// NIST SP 800-38F AES key wrap. Output is `sek.len() + 8` bytes.
	fn key_wrap(&self, kek: &[u8], sek: &[u8]) -> Result<Vec<u8>>;

	/// Inverse of `key_wrap`. An integrity-check failure (the wrong KEK, i.e. a
	/// passphrase mismatch) is reported as `ErrorKind::Security`.
	fn key_unwrap(&self, kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>>;
}

/// The default back-end, built entirely on pure-Rust RustCrypto crates.
#[derive(Default)]
pub struct RustCrypto;

macro_rules! ctr_xor {
	($cipher:ty, $key:expr, $iv:expr, $data:expr) => {{
		let mut c = Ctr128Be::<$cipher>::new($key.into(), $iv.into());
		c.apply_keystream($data);
	}};
}

macro_rules! gcm_seal {
	($gcm:ty, $key:expr, $nonce:expr, $aad:expr, $data:expr) => {{
		let cipher = <$gcm as AeadKeyInit>::new($key.into());
		cipher
			.encrypt_in_place(GenericArray::from_slice($nonce), $aad, $data)
			.map_err(|_| SrtError::security("gcm_seal", "AES-GCM encryption failed"))?;
	}};
}

macro_rules! gcm_open {
	($gcm:ty, $key:expr, $nonce:expr, $aad:expr, $data:expr) => {{
		let cipher = <$gcm as AeadKeyInit>::new($key.into());
		cipher
			.decrypt_in_place(GenericArray::from_slice($nonce), $aad, $data)
			.map_err(|_| SrtError::security("gcm_open", "AES-GCM tag verification failed"))?;
	}};
}

impl CryptoProvider for RustCrypto {
	fn prng(&self, buf: &mut [u8]) {
		rand::thread_rng().fill_bytes(buf);
	}

	fn aes_ctr_xor(&self, key: &[u8], iv: &[u8; IV_LEN], data: &mut [u8]) -> Result<()> {
		match key.len() {
			16 => ctr_xor!(Aes128, key, iv.as_slice(), data),
			24 => ctr_xor!(Aes192, key, iv.as_slice(), data),
			32 => ctr_xor!(Aes256, key, iv.as_slice(), data),
			n => return Err(SrtError::setup("aes_ctr", format!("unsupported key length {n}"))),
		}

		Ok(())
	}

	fn aes_gcm_seal(&self, key: &[u8], iv: &[u8; IV_LEN], aad: &[u8], data: &mut Vec<u8>) -> Result<()> {
		let nonce = &iv[..GCM_NONCE_LEN];

		match key.len() {
			16 => gcm_seal!(Aes128Gcm, key, nonce, aad, data),
			24 => gcm_seal!(Aes192Gcm, key, nonce, aad, data),
			32 => gcm_seal!(Aes256Gcm, key, nonce, aad, data),
			n => return Err(SrtError::setup("aes_gcm", format!("unsupported key length {n}"))),
		}

		Ok(())
	}

	fn aes_gcm_open(&self, key: &[u8], iv: &[u8; IV_LEN], aad: &[u8], data: &mut Vec<u8>) -> Result<()> {
		let nonce = &iv[..GCM_NONCE_LEN];

		match key.len() {
			16 => gcm_open!(Aes128Gcm, key, nonce, aad, data),
			24 => gcm_open!(Aes192Gcm, key, nonce, aad, data),
			32 => gcm_open!(Aes256Gcm, key, nonce, aad, data),
			n => return Err(SrtError::setup("aes_gcm", format!("unsupported key length {n}"))),
		}

		Ok(())
	}

	fn pbkdf2(&self, passphrase: &[u8], salt: &[u8], iterations: u32, key_len: KeyLen) -> Vec<u8> {
		let mut out = vec![0u8; key_len.bytes()];
		pbkdf2::pbkdf2::<Hmac<Sha1>>(passphrase, salt, iterations, &mut out).expect("pbkdf2 output length is nonzero and bounded");
		out
	}

	fn key_wrap(&self, kek: &[u8], sek: &[u8]) -> Result<Vec<u8>> {
		let wrap = |kek: &[u8]| -> std::result::Result<Vec<u8>, aes_kw::Error> {
			match kek.len() {
				16 => KekAes128::try_from(kek).unwrap().wrap_vec(sek),
				24 => KekAes192::try_from(kek).unwrap().wrap_vec(sek),
				32 => KekAes256::try_from(kek).unwrap().wrap_vec(sek),
				_ => unreachable!("kek length validated by caller"),
			}
		};

		wrap(kek).map_err(|_| SrtError::security("key_wrap", "AES key wrap failed"))
	}

	fn key_unwrap(&self, kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
		let unwrap = |kek: &[u8]| -> std::result::Result<Vec<u8>, aes_kw::Error> {
			match kek.len() {
				16 => KekAes128::try_from(kek).unwrap().unwrap_vec(wrapped),
				24 => KekAes192::try_from(kek).unwrap().unwrap_vec(wrapped),
				32 => KekAes256::try_from(kek).unwrap().unwrap_vec(wrapped),
				_ => unreachable!("kek length validated by caller"),
			}
		};

		// An integrity-check failure here is exactly the KM "BadSecret" sentinel: the
		// unwrap's internal check value didn't match, almost always a wrong passphrase.
		unwrap(kek).map_err(|_| SrtError::security("key_unwrap", "key unwrap integrity check failed"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ctr_round_trips() {
		let provider = RustCrypto;
		let key = [0x42u8; 16];
		let iv = [0x7u8; IV_LEN];
		let mut data = b"hello over an unreliable datagram transport".to_vec();
		let plain = data.clone();

		provider.aes_ctr_xor(&key, &iv, &mut data).unwrap();
		assert_ne!(data, plain);

		provider.aes_ctr_xor(&key, &iv, &mut data).unwrap();
		assert_eq!(data, plain);
	}

	#[test]
	fn ctr_is_deterministic() {
		let provider = RustCrypto;
		let key = [0x11u8; 32];
		let iv = [0x22u8; IV_LEN];

		let mut a = b"same key same iv same plaintext".to_vec();
		let mut b = a.clone();

		provider.aes_ctr_xor(&key, &iv, &mut a).unwrap();
		provider.aes_ctr_xor(&key, &iv, &mut b).unwrap();

		assert_eq!(a, b);
	}

	#[test]
	fn gcm_round_trips() {
		let provider = RustCrypto;
		let key = [0x9u8; 16];
		let iv = [0x3u8; IV_LEN];
		let aad = b"header-as-aad";

		let plain = b"live video frame payload".to_vec();
		let mut buf = plain.clone();

		provider.aes_gcm_seal(&key, &iv, aad, &mut buf).unwrap();
		assert_eq!(buf.len(), plain.len() + GCM_TAG_LEN);

		provider.aes_gcm_open(&key, &iv, aad, &mut buf).unwrap();
		assert_eq!(buf, plain);
	}

	#[test]
	fn gcm_tamper_detected() {
		let provider = RustCrypto;
		let key = [0x9u8; 16];
		let iv = [0x3u8; IV_LEN];
		let aad = b"header-as-aad";

		let mut buf = b"live video frame payload".to_vec();
		provider.aes_gcm_seal(&key, &iv, aad, &mut buf).unwrap();

		let last = buf.len() - 1;
		buf[last] ^= 0xff;

		assert!(provider.aes_gcm_open(&key, &iv, aad, &mut buf).is_err());
	}

	#[test]
	fn key_wrap_round_trips_and_grows_by_eight() {
		let provider = RustCrypto;
		let kek = [0x5u8; 16];
		let sek = [0xabu8; 16];

		let wrapped = provider.key_wrap(&kek, &sek).unwrap();
		assert_eq!(wrapped.len(), sek.len() + 8);

		let unwrapped = provider.key_unwrap(&kek, &wrapped).unwrap();
		assert_eq!(unwrapped, sek);
	}

	#[test]
	fn key_unwrap_detects_wrong_kek() {
		let provider = RustCrypto;
		let kek = [0x5u8; 16];
		let wrong_kek = [0x6u8; 16];
		let sek = [0xabu8; 16];

		let wrapped = provider.key_wrap(&kek, &sek).unwrap();
		assert!(provider.key_unwrap(&wrong_kek, &wrapped).is_err());
	}

	#[test]
	fn pbkdf2_is_deterministic() {
		let provider = RustCrypto;
		let a = provider.pbkdf2(b"passphrase1234", b"salt-eight-byte!", 2048, KeyLen::Aes256);
		let b = provider.pbkdf2(b"passphrase1234", b"salt-eight-byte!", 2048, KeyLen::Aes256);
		assert_eq!(a, b);
		assert_eq!(a.len(), 32);
	}
}
