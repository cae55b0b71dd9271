//! Session cryptography for Viera TVs requiring encryption.
//!
//! Panasonic does not document this scheme. Everything here reproduces, byte for byte, what the
//! TV firmware expects: AES-128-CBC without block padding, a 16-byte header (12 random bytes and
//! a big-endian payload length), zero padding, and an HMAC-SHA256 signature appended to the
//! ciphertext. The key shuffles and the HMAC key mask must not be "tidied up"; any deviation
//! results in the TV silently rejecting commands.

use aes::Aes128;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use log::debug;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Outcome, VieraError};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK_SIZE: usize = 16;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 16;

// Closing tag of decrypted command results. Anything after it is junk the TV sometimes appends.
const ORIGINAL_RESULT_CLOSE: &[u8] = b"</X_OriginalResult>";

// HMAC key mask used when deriving pairing keys from a challenge (taken from libtvconnect.so).
const HMAC_KEY_MASK: [u8; 32] = [
    0x15, 0xc9, 0x5a, 0xc2, 0xb0, 0x8a, 0xa7, 0xeb, 0x4e, 0x22, 0x8f, 0x81, 0x1e, 0x34, 0xd0, 0x4f,
    0xa5, 0x4b, 0xa7, 0xdc, 0xac, 0x98, 0x79, 0xfa, 0x8a, 0xcd, 0xa3, 0xfc, 0x24, 0x4f, 0x38, 0x54,
];

/// Key material for an encrypted session, derived from a [`crate::Credentials`] key.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub iv: [u8; 16],
    pub key: [u8; 16],
    pub hmac_key: [u8; 32],
}

// Key material is never written to logs.
impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Derive the session IV, AES key, and HMAC key from a base64 encoded credentials key.
pub fn derive_session_key(seed: &str) -> Outcome<SessionKeys> {
    let decoded = STANDARD
        .decode(seed.trim())
        .map_err(|e| VieraError::Authentication(format!("Encryption key is not base64: {e}")))?;

    let iv: [u8; 16] = decoded.as_slice().try_into().map_err(|_| {
        VieraError::Authentication(format!(
            "Encryption key must decode to 16 bytes (got {})",
            decoded.len()
        ))
    })?;

    let mut key = [0u8; 16];

    for i in (0..16).step_by(4) {
        key[i] = iv[i + 2];
        key[i + 1] = iv[i + 3];
        key[i + 2] = iv[i];
        key[i + 3] = iv[i + 1];
    }

    let mut hmac_key = [0u8; 32];
    hmac_key[..16].copy_from_slice(&iv);
    hmac_key[16..].copy_from_slice(&iv);

    Ok(SessionKeys { iv, key, hmac_key })
}

/// Derive the one-shot AES key and HMAC key used to authorize a PIN code.
///
/// The challenge itself doubles as the IV.
pub fn derive_challenge_keys(challenge: &[u8; 16]) -> ([u8; 16], [u8; 32]) {
    let mut key = [0u8; 16];

    for i in (0..16).step_by(4) {
        key[i] = !challenge[i + 3];
        key[i + 1] = !challenge[i + 2];
        key[i + 2] = !challenge[i + 1];
        key[i + 3] = !challenge[i];
    }

    let mut hmac_key = [0u8; 32];

    for j in (0..32).step_by(4) {
        hmac_key[j] = HMAC_KEY_MASK[j] ^ challenge[(j + 2) & 0xf];
        hmac_key[j + 1] = HMAC_KEY_MASK[j + 1] ^ challenge[(j + 3) & 0xf];
        hmac_key[j + 2] = HMAC_KEY_MASK[j + 2] ^ challenge[j & 0xf];
        hmac_key[j + 3] = HMAC_KEY_MASK[j + 3] ^ challenge[(j + 1) & 0xf];
    }

    (key, hmac_key)
}

/// Encrypt and sign `plaintext`, returning base64(ciphertext ‖ HMAC-SHA256(ciphertext)).
pub fn encrypt(
    plaintext: &str,
    key: &[u8; 16],
    iv: &[u8; 16],
    hmac_key: &[u8; 32],
) -> Outcome<String> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    encrypt_with_nonce(plaintext.as_bytes(), &nonce, key, iv, hmac_key)
}

pub(crate) fn encrypt_with_nonce(
    data: &[u8],
    nonce: &[u8; NONCE_LEN],
    key: &[u8; 16],
    iv: &[u8; 16],
    hmac_key: &[u8; 32],
) -> Outcome<String> {
    let data_len = u32::try_from(data.len())
        .map_err(|_| VieraError::Internal(format!("Payload too large: {} bytes", data.len())))?;

    let mut payload = Vec::with_capacity(HEADER_LEN + data.len() + BLOCK_SIZE);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&data_len.to_be_bytes());
    payload.extend_from_slice(data);

    // Always pads, adding a whole block of zeros when the payload is already aligned
    let padding = BLOCK_SIZE - (payload.len() % BLOCK_SIZE);
    payload.resize(payload.len() + padding, 0);

    let ciphertext = Aes128CbcEnc::new(&(*key).into(), &(*iv).into())
        .encrypt_padded_vec_mut::<NoPadding>(&payload);

    let mut mac = Hmac::<Sha256>::new_from_slice(hmac_key)
        .map_err(|e| VieraError::Internal(format!("Invalid HMAC key: {e}")))?;
    mac.update(&ciphertext);
    let signature = mac.finalize().into_bytes();

    let mut signed = ciphertext;
    signed.extend_from_slice(&signature);

    Ok(STANDARD.encode(signed))
}

/// Decrypt a base64 payload received from the TV.
///
/// The 16-byte header is dropped. The result ends at the `</X_OriginalResult>` closing tag when
/// present, otherwise at the first NUL byte; trailing padding and junk are discarded.
pub fn decrypt(ciphertext: &str, key: &[u8; 16], iv: &[u8; 16]) -> Outcome<String> {
    let decrypted = decrypt_raw(ciphertext, key, iv)?;
    let body = decrypted.get(HEADER_LEN..).unwrap_or_default();

    let end = match find_subslice(body, ORIGINAL_RESULT_CLOSE) {
        Some(pos) => pos + ORIGINAL_RESULT_CLOSE.len(),
        None => body.iter().position(|b| *b == 0).unwrap_or(body.len()),
    };

    Ok(String::from_utf8_lossy(&body[..end]).into_owned())
}

/// Decrypt a base64 payload without removing the header, padding or trailing bytes.
pub fn decrypt_raw(ciphertext: &str, key: &[u8; 16], iv: &[u8; 16]) -> Outcome<Vec<u8>> {
    let bytes = STANDARD
        .decode(ciphertext.trim())
        .map_err(|e| VieraError::MalformedReply(format!("Encrypted payload is not base64: {e}")))?;

    if bytes.is_empty() || bytes.len() % BLOCK_SIZE != 0 {
        return Err(VieraError::MalformedReply(format!(
            "Encrypted payload length {} is not a multiple of {}",
            bytes.len(),
            BLOCK_SIZE
        )));
    }

    let decrypted = Aes128CbcDec::new(&(*key).into(), &(*iv).into())
        .decrypt_padded_vec_mut::<NoPadding>(&bytes)
        .map_err(|e| VieraError::MalformedReply(format!("Could not decrypt payload: {e}")))?;

    debug!("Decrypted {} byte payload", decrypted.len());

    Ok(decrypted)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ================================================================================================
// Tests
