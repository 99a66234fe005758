//! Private message crypto
//!
//! RSA with PKCS#1 v1.5 padding, ciphertext carried as standard base64 so it
//! fits on a single protocol line. Public keys travel as two decimal lines:
//! modulus, then public exponent.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::error::CryptoError;

/// Generate a fresh keypair of `bits` size
pub fn generate_private_key(bits: usize) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::new(&mut rand::thread_rng(), bits).map_err(CryptoError::KeyGeneration)
}

/// Decimal `(modulus, exponent)` strings for sending a key over the wire
pub fn public_key_components(key: &RsaPublicKey) -> (String, String) {
    (key.n().to_string(), key.e().to_string())
}

/// Rebuild a public key from its decimal modulus and exponent lines
pub fn parse_public_key(modulus: &str, exponent: &str) -> Result<RsaPublicKey, CryptoError> {
    let n = parse_decimal(modulus)?;
    let e = parse_decimal(exponent)?;
    RsaPublicKey::new(n, e).map_err(CryptoError::InvalidPublicKey)
}

fn parse_decimal(value: &str) -> Result<BigUint, CryptoError> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CryptoError::InvalidKeyComponent(value.to_string()));
    }
    BigUint::parse_bytes(value.as_bytes(), 10)
        .ok_or_else(|| CryptoError::InvalidKeyComponent(value.to_string()))
}

/// Encrypt `plaintext` for the holder of `recipient` and base64 encode it
///
/// Fails when the plaintext is longer than the key can carry in one block.
pub fn encrypt_private(plaintext: &str, recipient: &RsaPublicKey) -> Result<String, CryptoError> {
    let ciphertext = recipient
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, plaintext.as_bytes())
        .map_err(CryptoError::Encrypt)?;
    Ok(BASE64.encode(ciphertext))
}

/// Decode a base64 payload and decrypt it with `key`
///
/// Every padding or key mismatch surfaces as the same `Decrypt` error, and
/// callers never report it back to the peer that sent the payload.
pub fn decrypt_private(payload: &str, key: &RsaPrivateKey) -> Result<String, CryptoError> {
    let ciphertext = BASE64.decode(payload.trim())?;
    let plaintext = key
        .decrypt(Pkcs1v15Encrypt, &ciphertext)
        .map_err(CryptoError::Decrypt)?;
    Ok(String::from_utf8(plaintext)?)
}
