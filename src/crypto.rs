use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::prelude::*;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// Seals secret fields before they hit the store. Key is the SHA-256 digest
/// of the configured passphrase; each record gets a fresh random nonce,
/// prepended to the ciphertext.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl SecretCipher {
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        SecretCipher { key }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes[..]);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| Error::fatal("sealing secret failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(out))
    }

    pub fn open(&self, sealed: &str) -> Result<String> {
        let raw = BASE64_STANDARD
            .decode(sealed)
            .map_err(|_| Error::fatal("sealed secret is not valid base64"))?;
        if raw.len() <= NONCE_LEN {
            return Err(Error::fatal("sealed secret is truncated"));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::fatal("decrypting secret failed"))?;
        String::from_utf8(plaintext).map_err(|_| Error::fatal("decrypted secret is not utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let cipher = SecretCipher::new("correct horse battery staple");
        let sealed = cipher.seal("hunter2").unwrap();
        assert_ne!(sealed, "hunter2");
        assert_eq!(cipher.open(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn nonce_is_per_record() {
        let cipher = SecretCipher::new("p");
        assert_ne!(cipher.seal("x").unwrap(), cipher.seal("x").unwrap());
    }

    #[test]
    fn wrong_passphrase_is_fatal() {
        let sealed = SecretCipher::new("a").seal("x").unwrap();
        let err = SecretCipher::new("b").open(&sealed).unwrap_err();
        assert!(err.is_fatal());
    }
}
