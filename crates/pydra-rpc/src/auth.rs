//! Node↔Master pairing and challenge/response handshake.
//!
//! Ported from `rsa_auth.py`'s `RSAAvatar` (master side) and `RSAClient`
//! (node side). Two handshakes:
//!
//! - **Pairing** (`exchange_keys`/`get_key`): the first time a Node connects
//!   it has no copy of the Master's public key and vice versa, so each side
//!   sends the other its public key, chunked to fit the transport.
//! - **Challenge/response** (`auth_challenge`/`auth_response`): once paired,
//!   the Master proves the Node holds the matching private key (and the
//!   Node implicitly proves the same of the Master) before it is allowed to
//!   drive the sealed RPC surface.
//!
//! The digest exchanged in the response is `sha512(pub_key.encrypt(m))` —
//! computed with the *Master's own* key on both sides — never the raw
//! challenge, so a passive observer of the wire never sees the same bytes
//! twice even across retries.

use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::error::{Result, RpcError};
use crate::keys::{raw_decrypt, raw_encrypt, KeyPair, PublicKey};

/// Challenge length in bytes, matching the original's
/// `secureRandom(key_size/16)` — a quarter of the modulus bit length, kept
/// well under the modulus so the raw RSA operation never wraps.
fn challenge_len_bytes(modulus_bits: u64) -> usize {
    (modulus_bits / 16) as usize
}

/// Master-side per-connection handshake state — one per connected Node.
/// Mirrors `RSAAvatar`.
pub struct MasterHandshake {
    server_key: KeyPair,
    client_key: Option<PublicKey>,
    challenge: Option<String>,
    challenged: bool,
}

impl MasterHandshake {
    pub fn new(server_key: KeyPair, client_key: Option<PublicKey>) -> Self {
        Self {
            server_key,
            client_key,
            challenge: None,
            challenged: false,
        }
    }

    /// `perspective_auth_challenge`. `None` means the Master doesn't have
    /// this Node's public key yet (the original's `-1` sentinel) — the
    /// caller should fall back to `exchange_keys` before retrying.
    pub fn auth_challenge(&mut self) -> Option<Vec<u8>> {
        let client_key = self.client_key.as_ref()?;

        let len = challenge_len_bytes(client_key.n.0.bits());
        let mut raw = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut raw);

        let encrypted_for_client = raw_encrypt(client_key, &raw);

        let encrypted_for_server = raw_encrypt(&self.server_key.public(), &raw);
        let digest = hex::encode(Sha512::digest(&encrypted_for_server));

        self.challenge = Some(digest);
        self.challenged = true;
        Some(encrypted_for_client)
    }

    /// `perspective_auth_response`. Single-use: the stored challenge is
    /// cleared whether or not verification succeeds, so retries require a
    /// fresh `auth_challenge` and can't be brute-forced offline.
    pub fn auth_response(&mut self, response: &str) -> bool {
        if !self.challenged {
            return false;
        }
        let verified = self.challenge.as_deref() == Some(response);
        self.challenge = None;
        self.challenged = false;
        verified
    }

    /// `perspective_exchange_keys`. Stores the Node's public key and returns
    /// the Master's own public key, encrypted against it, chunked for
    /// transport.
    pub fn exchange_keys(&mut self, node_public_key: PublicKey, chunk_size: usize) -> Result<Vec<Vec<u8>>> {
        self.client_key = Some(node_public_key.clone());
        let json_chunks = self.server_key.public().chunks(chunk_size)?;
        Ok(json_chunks
            .into_iter()
            .map(|chunk| raw_encrypt(&node_public_key, chunk.as_bytes()))
            .collect())
    }

    /// `perspective_get_key`: plaintext chunks of the Master's public key.
    pub fn get_key(&self, chunk_size: usize) -> Result<Vec<String>> {
        self.server_key.public().chunks(chunk_size)
    }

    pub fn client_key(&self) -> Option<&PublicKey> {
        self.client_key.as_ref()
    }
}

/// Node-side handshake state. Mirrors `RSAClient`.
pub struct NodeHandshake {
    client_key: KeyPair,
    server_key: Option<PublicKey>,
}

impl NodeHandshake {
    pub fn new(client_key: KeyPair, server_key: Option<PublicKey>) -> Self {
        Self {
            client_key,
            server_key,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.client_key.public()
    }

    pub fn has_server_key(&self) -> bool {
        self.server_key.is_some()
    }

    /// `RSAClient.auth_challenge`: decrypt the challenge the Master
    /// encrypted against our public key, then re-encrypt it against the
    /// Master's public key and hash, producing the value `auth_response`
    /// expects.
    pub fn respond_to_challenge(&self, challenge_ciphertext: &[u8]) -> Result<String> {
        let server_key = self
            .server_key
            .as_ref()
            .ok_or_else(|| RpcError::Auth("no server key to respond with".into()))?;
        let plaintext = raw_decrypt(&self.client_key, challenge_ciphertext);
        let reencrypted = raw_encrypt(server_key, &plaintext);
        Ok(hex::encode(Sha512::digest(&reencrypted)))
    }

    /// `RSAClient.exchange_keys`: this Node's public key, plaintext-chunked
    /// for the `exchange_keys` call.
    pub fn exchange_keys_payload(&self, chunk_size: usize) -> Result<Vec<String>> {
        self.client_key.public().chunks(chunk_size)
    }

    /// `RSAClient.exchange_keys_receive`: decrypt the Master's public key
    /// chunks (each individually encrypted against our public key) and
    /// adopt the result as our known server key.
    pub fn receive_server_key(&mut self, encrypted_chunks: &[Vec<u8>]) -> Result<PublicKey> {
        let mut joined = String::new();
        for chunk in encrypted_chunks {
            let decrypted = raw_decrypt(&self.client_key, chunk);
            joined.push_str(&String::from_utf8_lossy(&decrypted));
        }
        let key: PublicKey = serde_json::from_str(&joined)?;
        self.server_key = Some(key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_authenticates() {
        let master_key = KeyPair::generate(512).unwrap();
        let node_key = KeyPair::generate(512).unwrap();

        let mut master = MasterHandshake::new(master_key.clone(), Some(node_key.public()));
        let node = NodeHandshake::new(node_key, Some(master_key.public()));

        let challenge_for_node = master.auth_challenge().expect("master has node's key");
        let response = node.respond_to_challenge(&challenge_for_node).unwrap();
        assert!(master.auth_response(&response));
    }

    #[test]
    fn challenge_without_client_key_returns_none() {
        let master_key = KeyPair::generate(512).unwrap();
        let mut master = MasterHandshake::new(master_key, None);
        assert!(master.auth_challenge().is_none());
    }

    #[test]
    fn response_is_single_use() {
        let master_key = KeyPair::generate(512).unwrap();
        let node_key = KeyPair::generate(512).unwrap();
        let mut master = MasterHandshake::new(master_key.clone(), Some(node_key.public()));
        let node = NodeHandshake::new(node_key, Some(master_key.public()));

        let challenge = master.auth_challenge().unwrap();
        let response = node.respond_to_challenge(&challenge).unwrap();
        assert!(master.auth_response(&response));
        // Same response replayed after the challenge was consumed fails.
        assert!(!master.auth_response(&response));
    }

    #[test]
    fn wrong_response_is_rejected() {
        let master_key = KeyPair::generate(512).unwrap();
        let node_key = KeyPair::generate(512).unwrap();
        let mut master = MasterHandshake::new(master_key, Some(node_key.public()));
        master.auth_challenge().unwrap();
        assert!(!master.auth_response("not-the-right-digest"));
    }

    #[test]
    fn key_exchange_round_trips() {
        let master_key = KeyPair::generate(512).unwrap();
        let node_key = KeyPair::generate(512).unwrap();

        let mut master = MasterHandshake::new(master_key.clone(), None);
        let mut node = NodeHandshake::new(node_key.clone(), None);

        let encrypted_master_key = master.exchange_keys(node_key.public(), 64).unwrap();
        let received = node.receive_server_key(&encrypted_master_key).unwrap();
        assert_eq!(received, master_key.public());
        assert!(node.has_server_key());
    }
}
