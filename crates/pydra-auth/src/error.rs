//! Controller-session auth errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no session for this id")]
    NoSession,

    #[error("no outstanding challenge for this session")]
    NoChallenge,

    #[error("challenge response did not match")]
    ChallengeRejected,

    #[error("session has not completed the authentication handshake")]
    NotAuthenticated,
}

pub type Result<T> = std::result::Result<T, AuthError>;
