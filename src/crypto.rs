//! Hybrid payload sealing for the gossip tier.
//!
//! A fresh AES-256-GCM key encrypts the payload; RSA-OAEP (SHA-256) wraps
//! the key under the recipient's public key. Only the recipient's private
//! key opens the blob, and GCM authentication rejects any tampering.
//!
//! Blob layout: `u16 wrapped_len (BE) ‖ wrapped_key ‖ nonce (12) ‖
//! ciphertext‖tag`. The 16-byte GCM tag trails the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

const AES_KEY_LEN: usize = 32;
const AES_NONCE_LEN: usize = 12;

/// Deliberately vague: "wrong key" vs "tampered blob" is nobody's business.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("sealing failed")]
    SealFailed,

    #[error("opening failed -- wrong key or corrupted blob")]
    OpenFailed,

    #[error("blob too short")]
    Truncated,
}

/// Seal `payload` for the holder of `recipient`.
pub fn seal(payload: &[u8], recipient: &RsaPublicKey) -> Result<Vec<u8>, SealError> {
    let mut rng = rand::rngs::OsRng;

    let mut key = [0u8; AES_KEY_LEN];
    rng.fill_bytes(&mut key);
    let mut nonce_bytes = [0u8; AES_NONCE_LEN];
    rng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SealError::SealFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), payload)
        .map_err(|_| SealError::SealFailed)?;

    let wrapped_key = recipient
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &key)
        .map_err(|_| SealError::SealFailed)?;

    let mut out = Vec::with_capacity(2 + wrapped_key.len() + AES_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&(wrapped_key.len() as u16).to_be_bytes());
    out.extend_from_slice(&wrapped_key);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a blob produced by [`seal`]. Fails on a wrong key or any
/// single-bit alteration of the ciphertext or tag.
pub fn open(blob: &[u8], private_key: &RsaPrivateKey) -> Result<Vec<u8>, SealError> {
    if blob.len() < 2 {
        return Err(SealError::Truncated);
    }
    let wrapped_len = u16::from_be_bytes([blob[0], blob[1]]) as usize;
    let rest = &blob[2..];
    if rest.len() < wrapped_len + AES_NONCE_LEN {
        return Err(SealError::Truncated);
    }

    let (wrapped_key, rest) = rest.split_at(wrapped_len);
    let (nonce_bytes, ciphertext) = rest.split_at(AES_NONCE_LEN);

    let key = private_key
        .decrypt(Oaep::new::<Sha256>(), wrapped_key)
        .map_err(|_| SealError::OpenFailed)?;

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SealError::OpenFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| SealError::OpenFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = private.to_public_key();
        (private, public)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (private, public) = keypair();
        let payload = br#"{"command":"HELLO","payload":{}}"#;

        let blob = seal(payload, &public).unwrap();
        let opened = open(&blob, &private).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (private, public) = keypair();
        let mut blob = seal(b"secret", &public).unwrap();

        // Flip a bit in the ciphertext region (last bytes are ct + tag)
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(open(&blob, &private).is_err());
    }

    #[test]
    fn test_tampered_wrapped_key_fails() {
        let (private, public) = keypair();
        let mut blob = seal(b"secret", &public).unwrap();
        blob[5] ^= 0xff;
        assert!(open(&blob, &private).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let (_, public) = keypair();
        let (other_private, _) = keypair();
        let blob = seal(b"secret", &public).unwrap();
        assert!(open(&blob, &other_private).is_err());
    }

    #[test]
    fn test_truncated_blob_fails() {
        let (private, public) = keypair();
        let blob = seal(b"secret", &public).unwrap();
        assert!(matches!(open(&blob[..1], &private), Err(SealError::Truncated)));
        assert!(open(&blob[..40], &private).is_err());
    }

    #[test]
    fn test_blobs_differ_between_seals() {
        let (_, public) = keypair();
        let a = seal(b"same payload", &public).unwrap();
        let b = seal(b"same payload", &public).unwrap();
        assert_ne!(a, b);
    }
}
