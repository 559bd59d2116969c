//! Controller session authentication.
//!
//! Grounded on `interface_module.py`'s `authenticate`/`challenge_response`
//! and `controller.py`'s `WebControllerFunction`: unlike the Node↔Master
//! pairing handshake in `pydra_rpc::auth` (separate keypairs, `exchange_keys`
//! pairing), a Controller authenticates against the **same** keypair file
//! the Master itself holds (`master.key`) — there is no controller-specific
//! key or pairing step. Proof of authentication is simply the ability to
//! reproduce `sha512(master_pub_key.encrypt(challenge))`, which anyone
//! holding a copy of `master.key` can compute.
//!
//! Sessions are created lazily on first contact (see
//! `controller/web/interface.py`'s `FunctionResource`) and expire after a
//! fixed TTL if never authenticated or left idle, mirroring the original's
//! `_clean_sessions` sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha512};

use pydra_rpc::keys::{raw_encrypt, PublicKey};

use crate::error::{AuthError, Result};

/// Matches `interface_module.py`'s 20-second session-cleanup interval and
/// the `FunctionResource` session TTL of `datetime.timedelta(0, 120)`.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 120;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(20);

struct Session {
    expires_at: DateTime<Utc>,
    challenge: Option<String>,
    authenticated: bool,
}

/// Tracks one challenge/response session per connected Controller.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, Session>>,
    master_key: Arc<PublicKey>,
    ttl_secs: i64,
}

impl SessionManager {
    pub fn new(master_key: PublicKey) -> Self {
        Self::with_ttl(master_key, DEFAULT_SESSION_TTL_SECS)
    }

    pub fn with_ttl(master_key: PublicKey, ttl_secs: i64) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            master_key: Arc::new(master_key),
            ttl_secs,
        }
    }

    /// Ensure a session record exists for `session_id`, creating an
    /// unauthenticated one with a fresh TTL on first contact.
    pub fn touch(&self, session_id: &str) {
        self.sessions
            .entry(session_id.to_string())
            .and_modify(|s| s.expires_at = Utc::now() + chrono::Duration::seconds(self.ttl_secs))
            .or_insert_with(|| Session {
                expires_at: Utc::now() + chrono::Duration::seconds(self.ttl_secs),
                challenge: None,
                authenticated: false,
            });
    }

    pub fn is_authenticated(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.authenticated && s.expires_at > Utc::now())
            .unwrap_or(false)
    }

    /// `authenticate(user)`: generate and store a fresh challenge, return
    /// the plaintext challenge string for the Controller to answer.
    pub fn authenticate(&self, session_id: &str) -> Result<String> {
        self.touch(session_id);
        let mut entry = self.sessions.get_mut(session_id).ok_or(AuthError::NoSession)?;

        let mut random = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut random);
        let challenge = hex::encode(Sha512::digest(random));

        let encrypted = raw_encrypt(&self.master_key, challenge.as_bytes());
        let digest = hex::encode(Sha512::digest(&encrypted));

        entry.challenge = Some(digest);
        entry.authenticated = false;
        Ok(challenge)
    }

    /// `challenge_response(user, response)`: single-use comparison against
    /// the stored digest. Returns whether this session is now authenticated.
    pub fn challenge_response(&self, session_id: &str, response: &str) -> Result<bool> {
        let mut entry = self.sessions.get_mut(session_id).ok_or(AuthError::NoSession)?;
        let Some(expected) = entry.challenge.take() else {
            return Err(AuthError::NoChallenge);
        };

        let matched = expected == response;
        entry.authenticated = matched;
        if !matched {
            return Err(AuthError::ChallengeRejected);
        }
        Ok(true)
    }

    /// `_clean_sessions`: drop every session past its TTL.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.sessions.retain(|_, s| s.expires_at > now);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Spawn a background task that sweeps expired sessions on
    /// [`SWEEP_INTERVAL`] until the returned handle is dropped or aborted.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                manager.sweep_expired();
            }
        })
    }
}
