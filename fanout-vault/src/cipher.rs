//! Authenticated symmetric cipher for credentials at rest.
//!
//! SHA-256 counter keystream XORed over the plaintext, authenticated with
//! an HMAC-SHA-256 tag over `nonce || ciphertext`, encoded as URL-safe
//! base64. The key is derived from the configured vault secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::VaultError;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;

pub(crate) struct StreamCipher {
    key: [u8; 32],
}

impl StreamCipher {
    /// Derive the cipher key from an operator-supplied secret string.
    pub fn from_secret(secret: &str) -> Self {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(secret.as_bytes()));
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let keystream = self.keystream(&nonce, plaintext.len());
        let ciphertext: Vec<u8> = plaintext
            .iter()
            .zip(keystream.iter())
            .map(|(byte, pad)| byte ^ pad)
            .collect();

        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&nonce);
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len() + TAG_LEN);
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);
        raw.extend_from_slice(&tag);
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, VaultError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| VaultError::Malformed)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::Malformed);
        }
        let (nonce, rest) = raw.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(nonce);
        mac.update(ciphertext);
        // verify_slice is constant-time over the tag bytes.
        mac.verify_slice(tag).map_err(|_| VaultError::Tampered)?;

        let keystream = self.keystream(nonce, ciphertext.len());
        Ok(ciphertext
            .iter()
            .zip(keystream.iter())
            .map(|(byte, pad)| byte ^ pad)
            .collect())
    }

    fn keystream(&self, nonce: &[u8], len: usize) -> Vec<u8> {
        let mut stream = Vec::with_capacity(len + 32);
        let mut counter: u64 = 0;
        while stream.len() < len {
            let mut hasher = Sha256::new();
            hasher.update(self.key);
            hasher.update(nonce);
            hasher.update(counter.to_be_bytes());
            stream.extend_from_slice(&hasher.finalize());
            counter += 1;
        }
        stream.truncate(len);
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_restores_plaintext() {
        let cipher = StreamCipher::from_secret("vault-key");
        let token = cipher.encrypt(b"api_key=abc;totp=XYZ");
        assert_eq!(cipher.decrypt(&token).unwrap(), b"api_key=abc;totp=XYZ");
    }

    #[test]
    fn nonce_makes_tokens_unique() {
        let cipher = StreamCipher::from_secret("vault-key");
        assert_ne!(cipher.encrypt(b"same"), cipher.encrypt(b"same"));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let cipher = StreamCipher::from_secret("vault-key");
        let token = cipher.encrypt(b"secret");
        let mut raw = URL_SAFE_NO_PAD.decode(token.as_bytes()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let forged = URL_SAFE_NO_PAD.encode(raw);
        assert!(matches!(cipher.decrypt(&forged), Err(VaultError::Tampered)));
    }

    #[test]
    fn wrong_key_cannot_decrypt() {
        let token = StreamCipher::from_secret("key-a").encrypt(b"secret");
        assert!(StreamCipher::from_secret("key-b").decrypt(&token).is_err());
    }
}
