//! cryptographic operations
//!
//! Third party caveats are addressed to the holder of an X25519 key pair.
//! The caveat payload is sealed with ChaCha20-Poly1305, under a key derived
//! from the Diffie-Hellman shared secret between the first party and the
//! third party, so only the addressed discharger can read the condition.
//!
//! The macaroon signature chain itself is left to the `macaroon` crate, see
//! [`crate::format`].
use crate::error::{self, Format};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand_core::{CryptoRng, OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::{convert::TryInto, fmt, hash::Hash, ops::Drop, str::FromStr};
use zeroize::Zeroize;

/// size of public and private keys, and of derived symmetric keys
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
/// authentication tag appended to every sealed payload
pub const TAG_LEN: usize = 16;

const BOX_KEY_CONTEXT: &[u8] = b"macaroon-bakery-box-v1";

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// pair of X25519 keys used to encrypt and decrypt third party caveats
#[derive(Clone)]
pub struct KeyPair {
    pub(crate) secret: x25519_dalek::StaticSecret,
}

impl KeyPair {
    pub fn new() -> Self {
        Self::new_with_rng(&mut OsRng)
    }

    pub fn new_with_rng<T: RngCore + CryptoRng>(rng: &mut T) -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rng);

        KeyPair { secret }
    }

    pub fn from(key: &PrivateKey) -> Self {
        KeyPair {
            secret: x25519_dalek::StaticSecret::from(key.0),
        }
    }

    pub fn private(&self) -> PrivateKey {
        PrivateKey(self.secret.to_bytes())
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.secret))
    }

    /// symmetric key shared with the holder of `peer`'s private key
    fn box_key(&self, peer: &PublicKey) -> Result<[u8; KEY_LEN], Format> {
        let shared = self.secret.diffie_hellman(&peer.0);
        if !shared.was_contributory() {
            return Err(Format::InvalidKey(
                "low order public key in key agreement".to_string(),
            ));
        }
        keyed_hash(shared.as_bytes(), BOX_KEY_CONTEXT)
    }

    /// encrypts `plaintext` for `peer`, returns the nonce and the ciphertext
    pub(crate) fn seal(
        &self,
        peer: &PublicKey,
        plaintext: &[u8],
    ) -> Result<([u8; NONCE_LEN], Vec<u8>), Format> {
        let key = self.box_key(peer)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = encrypt(&key, &nonce, plaintext)?;
        Ok((nonce, ciphertext))
    }

    /// decrypts a payload sealed by `peer` for this key pair
    pub(crate) fn open(
        &self,
        peer: &PublicKey,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Format> {
        let key = self.box_key(peer)?;
        decrypt(&key, nonce, ciphertext)
    }
}

impl std::default::Default for KeyPair {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public())
            .finish()
    }
}

/// the private part of a [KeyPair]
pub struct PrivateKey(pub(crate) [u8; KEY_LEN]);

impl PrivateKey {
    /// serializes to a byte array
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0
    }

    /// deserializes from a byte array
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, error::Format> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Format::InvalidKeySize(bytes.len()))?;
        Ok(PrivateKey(bytes))
    }

    /// serializes to a standard base64 string
    pub fn to_base64(&self) -> String {
        base64::encode(self.0)
    }

    /// deserializes from base64, in either alphabet
    pub fn from_base64(s: &str) -> Result<Self, error::Format> {
        let bytes = crate::format::b64decode(s)?;
        Self::from_bytes(&bytes)
    }

    /// returns the matching public key
    pub fn public(&self) -> PublicKey {
        KeyPair::from(self).public()
    }
}

impl std::clone::Clone for PrivateKey {
    fn clone(&self) -> Self {
        PrivateKey(self.0)
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(<redacted>)")
    }
}

/// the public part of a [KeyPair]
#[derive(Clone, Copy, Eq)]
pub struct PublicKey(pub(crate) x25519_dalek::PublicKey);

impl PublicKey {
    /// serializes to a byte array
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    /// deserializes from a byte array
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, error::Format> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Format::InvalidKeySize(bytes.len()))?;

        Ok(PublicKey(x25519_dalek::PublicKey::from(bytes)))
    }

    /// serializes to a standard base64 string, the form used in the
    /// discharge protocol and in local caveat locations
    pub fn to_base64(&self) -> String {
        base64::encode(self.to_bytes())
    }

    /// deserializes from base64, in either alphabet, with or without padding
    pub fn from_base64(s: &str) -> Result<Self, error::Format> {
        let bytes = crate::format::b64decode(s)?;
        Self::from_bytes(&bytes)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.as_bytes().hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl FromStr for PublicKey {
    type Err = error::Format;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PublicKey::from_base64(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// generates a fresh random root key
pub fn generate_root_key(len: usize) -> Vec<u8> {
    let mut key = vec![0u8; len];
    OsRng.fill_bytes(&mut key);
    key
}

/// HMAC-SHA256 of `data` keyed with `key`
pub(crate) fn keyed_hash(key: &[u8], data: &[u8]) -> Result<[u8; KEY_LEN], Format> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Format::InvalidKey(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn encrypt(key: &[u8; KEY_LEN], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Format> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| Format::Encryption(e.to_string()))
}

fn decrypt(key: &[u8; KEY_LEN], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Format> {
    if nonce.len() != NONCE_LEN {
        return Err(Format::Decryption(format!(
            "invalid nonce length {}",
            nonce.len()
        )));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| Format::Decryption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn box_roundtrip() {
        let mut rng: StdRng = SeedableRng::seed_from_u64(0);
        let first = KeyPair::new_with_rng(&mut rng);
        let third = KeyPair::new_with_rng(&mut rng);

        let (nonce, sealed) = first.seal(&third.public(), b"is-authenticated-user").unwrap();
        let opened = third.open(&first.public(), &nonce, &sealed).unwrap();
        assert_eq!(opened, b"is-authenticated-user");

        let other = KeyPair::new_with_rng(&mut rng);
        assert!(other.open(&first.public(), &nonce, &sealed).is_err());
    }

    #[test]
    fn public_key_encoding() {
        let mut rng: StdRng = SeedableRng::seed_from_u64(1);
        let kp = KeyPair::new_with_rng(&mut rng);
        let public = kp.public();

        let encoded = public.to_base64();
        assert_eq!(encoded.parse::<PublicKey>().unwrap(), public);

        let url_safe = base64::encode_config(public.to_bytes(), base64::URL_SAFE_NO_PAD);
        assert_eq!(PublicKey::from_base64(&url_safe).unwrap(), public);

        assert_eq!(
            PublicKey::from_bytes(&[0u8; 12]),
            Err(Format::InvalidKeySize(12))
        );

        let private = kp.private();
        assert_eq!(private.public(), public);
        assert_eq!(
            PrivateKey::from_base64(&private.to_base64()).unwrap().public(),
            public
        );
    }
}
