//! # Message crypto
//!
//! RSA-OAEP (SHA-256) encryption of message payloads. Every payload that
//! crosses the relay is encrypted under the recipient's public key and
//! base64-encoded for transport; the relay only ever sees opaque
//! ciphertext.
//!
//! Keys are configured as the base64 body of PKCS#1 PEM documents; the
//! armor is added (and the body re-wrapped to strict 64-column lines) at
//! import.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(#[from] rsa::pkcs1::Error),

    #[error("encryption failed: {0}")]
    Encrypt(rsa::Error),

    #[error("decryption failed: {0}")]
    Decrypt(rsa::Error),

    #[error("ciphertext is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("plaintext is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Holds the endpoint's imported private key for the life of the process.
pub struct Cipher {
    private_key: RsaPrivateKey,
}

impl Cipher {
    /// Import a private key from the base64 body of a PKCS#1 document.
    pub fn new(private_key_body: &str) -> Result<Self, CryptoError> {
        let pem = pem_armor("RSA PRIVATE KEY", private_key_body);
        Ok(Self {
            private_key: RsaPrivateKey::from_pkcs1_pem(&pem)?,
        })
    }

    /// Encrypt a message under a recipient's public key; the result is the
    /// base64 transport encoding of the ciphertext.
    pub fn encrypt(plaintext: &str, recipient_public_key: &str) -> Result<String, CryptoError> {
        let pem = pem_armor("RSA PUBLIC KEY", recipient_public_key);
        let public_key = RsaPublicKey::from_pkcs1_pem(&pem)?;
        let ciphertext = public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext.as_bytes())
            .map_err(CryptoError::Encrypt)?;
        Ok(STANDARD.encode(ciphertext))
    }

    /// Decrypt a base64-encoded ciphertext with the endpoint's own key.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let raw = STANDARD.decode(ciphertext)?;
        let plaintext = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &raw)
            .map_err(CryptoError::Decrypt)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

/// A fresh URL-safe challenge token carrying 64 bytes of entropy.
pub fn challenge_token() -> String {
    let mut bytes = [0u8; 64];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Re-wrap a bare base64 key body as a strict PEM document: armor lines
/// plus a 64-column body, which is what the PEM parser requires.
fn pem_armor(label: &str, body: &str) -> String {
    let compact: String = body
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_whitespace())
        .collect();
    let mut pem = format!("-----BEGIN {label}-----\n");
    for chunk in compact.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {label}-----\n"));
    pem
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};

    /// Generate a keypair and export both keys the way they appear in
    /// configuration files: bare base64 bodies without armor or newlines.
    fn generate_key_bodies() -> (String, String) {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).expect("keygen failed");
        let public_key = RsaPublicKey::from(&private_key);
        let private_pem = private_key.to_pkcs1_pem(LineEnding::LF).expect("encode failed");
        let public_pem = public_key.to_pkcs1_pem(LineEnding::LF).expect("encode failed");
        (strip_armor(&private_pem), strip_armor(&public_pem))
    }

    fn strip_armor(pem: &str) -> String {
        pem.lines()
            .filter(|line| !line.starts_with("-----"))
            .collect()
    }

    #[test]
    fn encrypt_decrypt_round_trips_utf8() {
        let (private, public) = generate_key_bodies();
        let cipher = Cipher::new(&private).unwrap();

        for message in ["hello", "", "ADD [1000] [2000] [150]", "héllo wörld ✓"] {
            let ciphertext = Cipher::encrypt(message, &public).unwrap();
            assert_ne!(ciphertext, message);
            assert_eq!(cipher.decrypt(&ciphertext).unwrap(), message);
        }
    }

    #[test]
    fn decrypting_with_the_wrong_key_fails() {
        let (_, public) = generate_key_bodies();
        let (other_private, _) = generate_key_bodies();
        let wrong_cipher = Cipher::new(&other_private).unwrap();

        let ciphertext = Cipher::encrypt("secret", &public).unwrap();
        assert!(matches!(
            wrong_cipher.decrypt(&ciphertext),
            Err(CryptoError::Decrypt(_))
        ));
    }

    #[test]
    fn garbage_ciphertext_is_rejected() {
        let (private, _) = generate_key_bodies();
        let cipher = Cipher::new(&private).unwrap();
        assert!(matches!(
            cipher.decrypt("not!!valid@@base64"),
            Err(CryptoError::Base64(_))
        ));
    }

    #[test]
    fn invalid_key_body_is_rejected() {
        assert!(matches!(
            Cipher::new("AAAAnotakey"),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn challenge_tokens_are_url_safe_and_unique() {
        let first = challenge_token();
        let second = challenge_token();
        assert_ne!(first, second);
        // 64 bytes of entropy encode to 86 unpadded base64 characters.
        assert_eq!(first.len(), 86);
        assert!(first
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn challenge_round_trips_through_the_cipher() {
        let (private, public) = generate_key_bodies();
        let cipher = Cipher::new(&private).unwrap();

        let token = challenge_token();
        let ciphertext = Cipher::encrypt(&token, &public).unwrap();
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), token);
    }
}
