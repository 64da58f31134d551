//! Cryptographic primitives for the relay protocol.
//!
//! Key derivation is HKDF-SHA256 over the pre-shared key with the
//! concatenated handshake publics as salt; frames are AES-256-GCM with a
//! random 96-bit nonce carried in front of the ciphertext.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Minimum sealed frame size: nonce plus tag around an empty plaintext.
pub const FRAME_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

pub const HKDF_INFO: &[u8] = b"secure-proxy-v1";
pub const AUTH_LABEL: &[u8] = b"auth";
pub const AUTH_OK_LABEL: &[u8] = b"ok";

type HmacSha256 = Hmac<Sha256>;

/// Derive the per-direction AEAD keys from the pre-shared key.
///
/// The salt MUST be `client_public ‖ server_public`; the relay performs the
/// mirrored split so the client's send key is the server's recv key.
pub fn derive_keys(psk: &[u8; KEY_LEN], salt: &[u8; 64]) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let hk = Hkdf::<Sha256>::new(Some(salt.as_slice()), psk);
    let mut okm = [0u8; KEY_LEN * 2];
    hk.expand(HKDF_INFO, &mut okm)
        .expect("64 bytes is a valid HKDF-SHA256 output length");

    let mut send_key = [0u8; KEY_LEN];
    let mut recv_key = [0u8; KEY_LEN];
    send_key.copy_from_slice(&okm[..KEY_LEN]);
    recv_key.copy_from_slice(&okm[KEY_LEN..]);
    (send_key, recv_key)
}

/// Encrypt a plaintext into a wire frame: `nonce ‖ ciphertext ‖ tag`.
///
/// The nonce is a fresh CSPRNG draw per frame; frame length is always
/// plaintext length + [`FRAME_OVERHEAD`].
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::internal("invalid AEAD key length"))?;

    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .map_err(|_| Error::internal("AEAD seal failed"))?;

    let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Decrypt a wire frame produced by [`seal`].
///
/// Frames shorter than the nonce+tag overhead are rejected outright; a GCM
/// tag mismatch is an authentication failure and fatal for the session.
pub fn open(key: &[u8; KEY_LEN], frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(Error::protocol(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::internal("invalid AEAD key length"))?;

    let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| Error::auth("frame authentication failed"))
}

/// HMAC-SHA256.
pub fn hmac(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Constant-time equality; runtime is independent of the differing index.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Fill a buffer from the system CSPRNG.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::fill(buf).map_err(|e| Error::internal(format!("rng failure: {}", e)))
}

/// Draw `n` bytes from the system CSPRNG.
pub fn random_bytes(n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    fill_random(&mut buf)?;
    Ok(buf)
}
