//! C3: PSK-based handshake, key derivation, and AEAD record protection.
//!
//! The handshake is a small explicit state machine rather than anything
//! `tokio_util::codec`-shaped, because both sides must track the in-flight
//! challenge nonce across suspension points. Frame wrap/unwrap builds directly
//! on `aes_gcm` since there is no underlying transport-level TLS to lean on here.

mod replay;

pub use replay::ReplayWindow;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use crate::error::SecurityError;

pub const FRAME_HELLO: u8 = 0x01;
pub const FRAME_CHALLENGE: u8 = 0x02;
pub const FRAME_RESPONSE: u8 = 0x03;
pub const FRAME_ENCRYPTED: u8 = 0x10;
pub const FRAME_PLAINTEXT: u8 = 0xFE;

/// Plaintext payload sealed into the handshake's encrypted ACK. The receiving side
/// checks it after a successful decrypt, so a peer that can't derive matching keys
/// can never produce a frame that both decrypts and carries this marker.
pub const ACK_PAYLOAD: &[u8] = b"ACK";

const CHALLENGE_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 4;
const TAG_LEN: usize = 16;

/// The 32-byte pre-shared key minted by the directory for one session. Zeroized on
/// drop so a dropped `Psk` doesn't leave key material lying around in freed memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Psk(pub [u8; 32]);

impl std::fmt::Debug for Psk {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("Psk(..)")
	}
}

type HmacSha256 = Hmac<Sha256>;

/// Both direction keys derived from one challenge exchange. Zeroized on drop.
///
/// The spec's nonce construction needs a "per-connection random prefix" shared by
/// sender and receiver for the same direction; rather than exchange it as extra wire
/// bytes, it is derived alongside the direction key from the same HKDF context so
/// both peers land on identical prefixes without a further round trip.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
	pub c2s_key: [u8; 32],
	pub s2c_key: [u8; 32],
	pub c2s_nonce_prefix: [u8; NONCE_PREFIX_LEN],
	pub s2c_nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl std::fmt::Debug for SessionKeys {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("SessionKeys(..)")
	}
}

/// `c2s_key = HKDF(salt=challenge, ikm=psk, info="client_to_server")`,
/// `s2c_key = HKDF(salt=challenge, ikm=psk, info="server_to_client")`.
pub fn derive_session_keys(psk: &Psk, challenge: &[u8; CHALLENGE_LEN]) -> SessionKeys {
	let hk = Hkdf::<Sha256>::new(Some(challenge), &psk.0);
	let mut c2s_key = [0u8; 32];
	let mut s2c_key = [0u8; 32];
	hk.expand(b"client_to_server", &mut c2s_key).expect("32 <= 255*32");
	hk.expand(b"server_to_client", &mut s2c_key).expect("32 <= 255*32");
	let mut c2s_nonce_prefix = [0u8; NONCE_PREFIX_LEN];
	let mut s2c_nonce_prefix = [0u8; NONCE_PREFIX_LEN];
	hk.expand(b"client_to_server_nonce", &mut c2s_nonce_prefix).expect("4 <= 255*32");
	hk.expand(b"server_to_client_nonce", &mut s2c_nonce_prefix).expect("4 <= 255*32");
	SessionKeys { c2s_key, s2c_key, c2s_nonce_prefix, s2c_nonce_prefix }
}

pub fn random_challenge() -> [u8; CHALLENGE_LEN] {
	let mut bytes = [0u8; CHALLENGE_LEN];
	rand::thread_rng().fill_bytes(&mut bytes);
	bytes
}

/// `HMAC-SHA256(psk, challenge)`, the client's RESPONSE payload.
pub fn compute_response(psk: &Psk, challenge: &[u8; CHALLENGE_LEN]) -> [u8; 32] {
	let mut mac = <HmacSha256 as Mac>::new_from_slice(&psk.0).expect("HMAC accepts any key length");
	mac.update(challenge);
	mac.finalize().into_bytes().into()
}

/// Constant-time verification of a peer's RESPONSE payload.
pub fn verify_response(psk: &Psk, challenge: &[u8; CHALLENGE_LEN], response: &[u8]) -> bool {
	if response.len() != 32 {
		return false;
	}
	let expected = compute_response(psk, challenge);
	expected.ct_eq(response).into()
}

/// Client-side handshake phases.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakeState {
	Start,
	AwaitChallenge,
	Computing,
	AwaitAck,
	Live,
}

#[derive(Error, Debug)]
pub enum HandshakeError {
	#[error(transparent)]
	Security(#[from] SecurityError),
	#[error("handshake frame arrived out of order for state {0:?}")]
	UnexpectedFrame(HandshakeState),
}

/// A live AES-256-GCM record-protection context for one direction.
pub struct AeadContext {
	cipher: Aes256Gcm,
	nonce_prefix: [u8; NONCE_PREFIX_LEN],
	next_seq: u64,
}

impl AeadContext {
	pub fn new(key: &[u8; 32], nonce_prefix: [u8; NONCE_PREFIX_LEN]) -> Self {
		Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)), nonce_prefix, next_seq: 0 }
	}

	/// `[8-byte big-endian sequence][4-byte per-connection random prefix]`.
	fn build_nonce(&self, seq: u64) -> [u8; 12] {
		let mut nonce = [0u8; 12];
		nonce[0..8].copy_from_slice(&seq.to_be_bytes());
		nonce[8..12].copy_from_slice(&self.nonce_prefix);
		nonce
	}

	/// Wraps a plaintext application frame as `[seq:u64be][ciphertext||tag]`, returning
	/// the sequence number used so the caller can prefix `FRAME_ENCRYPTED` when writing
	/// to the wire. The other 4 bytes of the 12-byte AEAD nonce (the per-connection
	/// random prefix) never go on the wire at all: both peers rederive it from the same
	/// HKDF context that produced the direction key, so only the 8-byte sequence needs
	/// to travel alongside the ciphertext.
	pub fn seal(&mut self, plaintext: &[u8]) -> Result<(u64, Vec<u8>), SecurityError> {
		let seq = self.next_seq;
		self.next_seq += 1;
		let nonce_bytes = self.build_nonce(seq);
		let nonce = Nonce::from_slice(&nonce_bytes);
		let ciphertext = self
			.cipher
			.encrypt(nonce, Payload { msg: plaintext, aad: &[] })
			.map_err(|_| SecurityError::DecryptionFailed)?;
		Ok((seq, ciphertext))
	}

	pub fn open(&self, seq: u64, ciphertext: &[u8]) -> Result<Vec<u8>, SecurityError> {
		if ciphertext.len() < TAG_LEN {
			return Err(SecurityError::Malformed("ciphertext shorter than AEAD tag".into()));
		}
		let nonce_bytes = self.build_nonce(seq);
		let nonce = Nonce::from_slice(&nonce_bytes);
		self.cipher
			.decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
			.map_err(|_| SecurityError::DecryptionFailed)
	}
}

/// The two AEAD contexts plus replay window a `Live` session holds for its lifetime.
pub struct SecuritySession {
	pub outbound: AeadContext,
	pub inbound: AeadContext,
	pub replay_window: ReplayWindow,
	pub consecutive_decrypt_failures: u32,
}

impl SecuritySession {
	pub fn from_keys(keys: &SessionKeys, is_client: bool) -> Self {
		let (outbound_key, outbound_prefix, inbound_key, inbound_prefix) = if is_client {
			(&keys.c2s_key, keys.c2s_nonce_prefix, &keys.s2c_key, keys.s2c_nonce_prefix)
		} else {
			(&keys.s2c_key, keys.s2c_nonce_prefix, &keys.c2s_key, keys.c2s_nonce_prefix)
		};
		Self {
			outbound: AeadContext::new(outbound_key, outbound_prefix),
			inbound: AeadContext::new(inbound_key, inbound_prefix),
			replay_window: ReplayWindow::new(),
			consecutive_decrypt_failures: 0,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn psk(byte: u8) -> Psk {
		Psk([byte; 32])
	}

	#[test]
	fn test_response_roundtrip() {
		let p = psk(7);
		let challenge = [3u8; CHALLENGE_LEN];
		let response = compute_response(&p, &challenge);
		assert!(verify_response(&p, &challenge, &response));
	}

	#[test]
	fn test_response_rejects_wrong_psk() {
		let challenge = [3u8; CHALLENGE_LEN];
		let response = compute_response(&psk(7), &challenge);
		assert!(!verify_response(&psk(8), &challenge, &response));
	}

	#[test]
	fn test_keys_differ_by_direction_and_challenge() {
		let p = psk(1);
		let keys_a = derive_session_keys(&p, &[1u8; CHALLENGE_LEN]);
		let keys_b = derive_session_keys(&p, &[2u8; CHALLENGE_LEN]);
		assert_ne!(keys_a.c2s_key, keys_a.s2c_key);
		assert_ne!(keys_a.c2s_key, keys_b.c2s_key);
	}

	#[test]
	fn test_aead_roundtrip() {
		let mut ctx = AeadContext::new(&[9u8; 32], [1u8; NONCE_PREFIX_LEN]);
		let (seq, ciphertext) = ctx.seal(b"hello world").unwrap();
		let plaintext = ctx.open(seq, &ciphertext).unwrap();
		assert_eq!(plaintext, b"hello world");
	}

	#[test]
	fn test_aead_rejects_tampered_ciphertext() {
		let mut ctx = AeadContext::new(&[9u8; 32], [1u8; NONCE_PREFIX_LEN]);
		let (seq, mut ciphertext) = ctx.seal(b"hello world").unwrap();
		ciphertext[0] ^= 0xff;
		assert!(matches!(ctx.open(seq, &ciphertext), Err(SecurityError::DecryptionFailed)));
	}

	#[test]
	fn test_client_server_contexts_are_symmetric() {
		let keys = derive_session_keys(&psk(5), &[4u8; CHALLENGE_LEN]);
		let client = SecuritySession::from_keys(&keys, true);
		let mut client_out = client.outbound;
		let server = SecuritySession::from_keys(&keys, false);
		let (seq, ciphertext) = client_out.seal(b"ping").unwrap();
		let plaintext = server.inbound.open(seq, &ciphertext).unwrap();
		assert_eq!(plaintext, b"ping");
	}
}
