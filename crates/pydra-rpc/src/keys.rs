//! RSA key management.
//!
//! Grounded on `rsa_auth.py`'s `generate_keys`/`load_crypto`: keys are
//! serialized as a JSON array of decimal-string big integers — `[n, e]` for
//! a public key, `[n, e, d, q, p]` for a keypair — and private key files are
//! written with `0400` permissions. The auth handshake in [`crate::auth`]
//! uses *textbook* RSA (no padding scheme), matching PyCrypto's
//! `key.encrypt(data, None)` / `key.decrypt(data)`, which are plain modular
//! exponentiation: `encrypt` is always the public operation `m^e mod n`
//! (even when called on a full keypair) and `decrypt` is always the private
//! operation `c^d mod n`.

use std::path::Path;

use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Default modulus size, matching the original's `key_size=4096`.
pub const DEFAULT_KEY_SIZE: usize = 4096;

/// A public key: `[n, e]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub n: BigUintWire,
    pub e: BigUintWire,
}

/// A full keypair: `[n, e, d, q, p]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub n: BigUintWire,
    pub e: BigUintWire,
    pub d: BigUintWire,
    pub q: BigUintWire,
    pub p: BigUintWire,
}

/// A `BigUint` serialized as its base-10 string, the way `simplejson` renders
/// the Python `long`s in the original wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigUintWire(pub BigUint);

impl Serialize for BigUintWire {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_str_radix(10))
    }
}

impl<'de> Deserialize<'de> for BigUintWire {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BigUint::parse_bytes(s.as_bytes(), 10)
            .map(BigUintWire)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid big integer: {s}")))
    }
}

impl KeyPair {
    /// Generate a fresh keypair of `bits` modulus size.
    pub fn generate(bits: usize) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits).map_err(|e| RpcError::Key(e.to_string()))?;
        Ok(Self::from_rsa_private_key(&private))
    }

    fn from_rsa_private_key(key: &RsaPrivateKey) -> Self {
        let primes = key.primes();
        // `rsa` stores primes in the order generated; the original's
        // `[n, e, d, q, p]` layout just needs two primes present, order
        // between them is not otherwise significant to the handshake.
        let p = primes[0].clone();
        let q = primes.get(1).cloned().unwrap_or_else(|| primes[0].clone());
        Self {
            n: BigUintWire(key.n().clone()),
            e: BigUintWire(key.e().clone()),
            d: BigUintWire(key.d().clone()),
            q: BigUintWire(q),
            p: BigUintWire(p),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey {
            n: self.n.clone(),
            e: self.e.clone(),
        }
    }

    /// Load a keypair from `path`, generating and persisting a new one (with
    /// `0400` permissions, matching `load_crypto(path, create=True)`) if it
    /// doesn't exist yet.
    pub fn load_or_create(path: impl AsRef<Path>, bits: usize) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let values: Vec<BigUintWire> = serde_json::from_str(&raw)?;
            if values.len() != 5 {
                return Err(RpcError::Key(format!(
                    "key file {} does not contain a full keypair",
                    path.display()
                )));
            }
            let mut it = values.into_iter();
            return Ok(Self {
                n: it.next().unwrap(),
                e: it.next().unwrap(),
                d: it.next().unwrap(),
                q: it.next().unwrap(),
                p: it.next().unwrap(),
            });
        }

        let keypair = Self::generate(bits)?;
        keypair.save(path)?;
        Ok(keypair)
    }

    fn save(&self, path: &Path) -> Result<()> {
        let values = [&self.n, &self.e, &self.d, &self.q, &self.p];
        let json = serde_json::to_string(&values)?;
        std::fs::write(path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))?;
        }
        Ok(())
    }

    pub fn to_rsa_public_key(&self) -> Result<RsaPublicKey> {
        RsaPublicKey::new(self.n.0.clone(), self.e.0.clone()).map_err(|e| RpcError::Key(e.to_string()))
    }
}

impl PublicKey {
    /// Split this key's `[n, e]` JSON encoding into `chunk`-byte string
    /// pieces for transports that can't carry one large message, matching
    /// `RSAAvatar.chunks`/`RSAClient.exchange_keys`'s splitting of the
    /// serialized key.
    pub fn chunks(&self, chunk_size: usize) -> Result<Vec<String>> {
        let json = serde_json::to_string(&[&self.n, &self.e])?;
        Ok(json
            .as_bytes()
            .chunks(chunk_size)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect())
    }

    pub fn from_chunks(chunks: &[String]) -> Result<Self> {
        let json = chunks.concat();
        serde_json::from_str(&json).map_err(Into::into)
    }
}

/// Raw RSA public-key operation: `m^e mod n`. No padding — this is a direct
/// port of PyCrypto's `key.encrypt(data, None)`.
pub fn raw_encrypt(key: &PublicKey, data: &[u8]) -> Vec<u8> {
    let m = BigUint::from_bytes_be(data);
    let c = m.modpow(&key.e.0, &key.n.0);
    biguint_to_fixed_bytes(&c, modulus_byte_len(&key.n.0))
}

/// Raw RSA private-key operation: `c^d mod n`, the counterpart to
/// [`raw_encrypt`]. A direct port of PyCrypto's `key.decrypt(data)`.
pub fn raw_decrypt(key: &KeyPair, data: &[u8]) -> Vec<u8> {
    let c = BigUint::from_bytes_be(data);
    let m = c.modpow(&key.d.0, &key.n.0);
    // Unlike encrypt, decrypted plaintext has no fixed expected width —
    // strip the big-endian representation down to its minimal length.
    m.to_bytes_be()
}

fn modulus_byte_len(n: &BigUint) -> usize {
    n.bits().div_ceil(8) as usize
}

fn biguint_to_fixed_bytes(value: &BigUint, len: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    if raw.len() >= len {
        return raw;
    }
    let mut out = vec![0u8; len - raw.len()];
    out.extend_from_slice(&raw);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_round_trips_through_json() {
        let keypair = KeyPair::generate(512).expect("generate");
        let json = serde_json::to_string(&[
            &keypair.n,
            &keypair.e,
            &keypair.d,
            &keypair.q,
            &keypair.p,
        ])
        .unwrap();
        let values: Vec<BigUintWire> = serde_json::from_str(&json).unwrap();
        assert_eq!(values[0], keypair.n);
    }

    #[test]
    fn raw_encrypt_then_decrypt_recovers_plaintext() {
        let keypair = KeyPair::generate(512).expect("generate");
        let plaintext = b"pydra-challenge";
        let ciphertext = raw_encrypt(&keypair.public(), plaintext);
        let recovered = raw_decrypt(&keypair, &ciphertext);
        // decrypted plaintext may have stripped leading zero bytes.
        assert!(recovered.ends_with(plaintext) || recovered == plaintext);
    }

    #[test]
    fn load_or_create_persists_a_reusable_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");

        let first = KeyPair::load_or_create(&path, 512).unwrap();
        let second = KeyPair::load_or_create(&path, 512).unwrap();

        assert_eq!(first.n, second.n);
        assert_eq!(first.d, second.d);
    }

    #[test]
    fn public_key_chunk_round_trip() {
        let keypair = KeyPair::generate(512).expect("generate");
        let chunks = keypair.public().chunks(16).unwrap();
        assert!(chunks.len() > 1);
        let rebuilt = PublicKey::from_chunks(&chunks).unwrap();
        assert_eq!(rebuilt, keypair.public());
    }
}
