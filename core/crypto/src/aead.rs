//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation.
//!
//! Sealed envelopes are laid out as `version || nonce || ciphertext || tag`.
//! The version byte is also bound into the associated data, so changing it
//! fails authentication rather than selecting another format.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::keys::VaultKey;
use imghost_common::{Error, Result};

/// Envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Bytes preceding the ciphertext: version + nonce.
pub const HEADER_SIZE: usize = 1 + NONCE_SIZE;

fn associated_data(context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + context.len());
    aad.push(ENVELOPE_VERSION);
    aad.extend_from_slice(context);
    aad
}

/// Seal plaintext under `key`, binding it to `context`.
///
/// # Postconditions
/// - Returns version || nonce || ciphertext || tag
/// - The nonce is randomly generated
/// - The sealed length is plaintext length + HEADER_SIZE + TAG_SIZE
///
/// # Errors
/// - Returns `Crypto` if encryption fails
pub fn seal(key: &VaultKey, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.as_bytes()));
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let aad = associated_data(context);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    sealed.push(ENVELOPE_VERSION);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    Ok(sealed)
}

/// Open an envelope produced by [`seal`] with the same key and context.
///
/// # Errors
/// - `Decryption` if the envelope is too short or has an unknown version
/// - `Decryption` if authentication fails (tampered data, wrong key or context)
///
/// # Security
/// - Authenticates before returning any plaintext
pub fn open(key: &VaultKey, sealed: &[u8], context: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < HEADER_SIZE + TAG_SIZE {
        return Err(Error::Decryption("Ciphertext too short".to_string()));
    }

    let (version, rest) = sealed.split_at(1);
    if version[0] != ENVELOPE_VERSION {
        return Err(Error::Decryption(format!(
            "Unsupported envelope version {}",
            version[0]
        )));
    }

    let (nonce_bytes, encrypted) = rest.split_at(NONCE_SIZE);
    let nonce = GenericArray::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.as_bytes()));
    let aad = associated_data(context);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: encrypted,
                aad: &aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| Error::Decryption("Authentication failed".to_string()))
}
