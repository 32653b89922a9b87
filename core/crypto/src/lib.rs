//! Cryptographic primitives for imghost.
//!
//! This module provides:
//! - Authenticated encryption using XChaCha20-Poly1305
//! - The credential encryption key with automatic zeroization
//! - The credential vault that seals provider secrets at rest
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Tampered ciphertext is rejected before any plaintext is returned

pub mod aead;
pub mod keys;
pub mod vault;

pub use aead::{open, seal};
pub use keys::VaultKey;
pub use vault::CredentialVault;
