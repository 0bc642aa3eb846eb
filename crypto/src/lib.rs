//! The encryption subsystem: the `CryptoProvider` capability trait, a RustCrypto
//! back-end, the Key Material (KM) wire format, and the `CryptoControl` session-key
//! state machine (§4.6 and §9's "Conditional compilation for crypto providers").

pub mod control;
pub mod km;
pub mod provider;

pub use control::CryptoControl;
pub use km::{KeySpec, KmMessage, KmState};
pub use provider::{Cipher, CryptoProvider, KeyLen, RustCrypto};
