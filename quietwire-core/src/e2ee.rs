//! End-to-end encryption contract: X25519 key agreement with
//! XSalsa20-Poly1305 authenticated encryption (the NaCl box
//! construction).
//!
//! This module runs on clients. The relay stores published public keys
//! and the opaque payloads produced here; it never holds a secret key
//! and cannot read a payload. Wire format: `base64(nonce ++ ciphertext)`
//! with a 24-byte random nonce per message.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crypto_box::aead::{Aead, AeadCore, Nonce, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use zeroize::Zeroize;

use crate::{Error, Result};

pub const NONCE_LEN: usize = 24;
pub const KEY_LEN: usize = 32;
/// Poly1305 tag length; the smallest possible ciphertext overhead.
const TAG_LEN: usize = 16;

/// A device keypair. Generated once per installation; only the public
/// half is ever published.
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        KeyPair {
            secret: SecretKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from a locally persisted secret. The decoded
    /// buffer is wiped once the key object owns a copy.
    pub fn from_secret_b64(encoded: &str) -> Result<Self> {
        let decoded = BASE64
            .decode(encoded)
            .map_err(|_| Error::InvalidInput("Invalid secret key encoding".to_string()))?;
        let mut bytes: [u8; KEY_LEN] = decoded
            .try_into()
            .map_err(|_| Error::InvalidInput("Secret key must be 32 bytes".to_string()))?;
        let secret = SecretKey::from(bytes);
        bytes.zeroize();
        Ok(KeyPair { secret })
    }

    /// Base64 secret for the local keystore. Callers own keeping this
    /// off the wire.
    pub fn secret_b64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    pub fn public(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// The value published to the relay's key directory.
    pub fn public_b64(&self) -> String {
        BASE64.encode(self.public().as_bytes())
    }

    /// Encrypt a message for one recipient.
    pub fn seal(&self, plaintext: &str, recipient: &PublicKey) -> Result<String> {
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let sealed = SalsaBox::new(recipient, &self.secret)
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::InvalidInput("Encryption failed".to_string()))?;

        let nonce_bytes: [u8; NONCE_LEN] = nonce.into();
        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&sealed);
        Ok(BASE64.encode(payload))
    }

    /// Decrypt a received payload. Every failure mode, from bad base64
    /// to a forged tag, collapses into `DecryptionFailed`: the message
    /// is shown as undecryptable and the channel stays up.
    pub fn open(&self, payload: &str, sender: &PublicKey) -> Result<String> {
        let blob = BASE64.decode(payload).map_err(|_| Error::DecryptionFailed)?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::DecryptionFailed);
        }

        let nonce_bytes: [u8; NONCE_LEN] =
            blob[..NONCE_LEN].try_into().map_err(|_| Error::DecryptionFailed)?;
        let nonce = Nonce::<SalsaBox>::from(nonce_bytes);

        let plaintext = SalsaBox::new(sender, &self.secret)
            .decrypt(&nonce, &blob[NONCE_LEN..])
            .map_err(|_| Error::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| Error::DecryptionFailed)
    }
}

/// Parse a public key out of the relay's key directory.
pub fn public_from_b64(encoded: &str) -> Result<PublicKey> {
    let decoded = BASE64
        .decode(encoded)
        .map_err(|_| Error::InvalidInput("Invalid public key encoding".to_string()))?;
    let bytes: [u8; KEY_LEN] = decoded
        .try_into()
        .map_err(|_| Error::InvalidInput("Public key must be 32 bytes".to_string()))?;
    Ok(PublicKey::from(bytes))
}
