use crate::*;

use thiserror::Error;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("prestige: ballot not found: {0}")]
    BallotNotFound(String),

    #[error("prestige: ballot is still collecting petition signatures")]
    BallotInPetition,

    #[error("prestige: ballot is closed to voting")]
    BallotClosed,

    #[error("prestige: ballot is not in its reveal window")]
    BallotNotRevealing,

    #[error("prestige: commitment or nullifier is not a 32-byte hex value")]
    InvalidCommitment,

    #[error("prestige: reveal does not match the committed vote")]
    InvalidReveal,

    #[error("prestige: signature verification failed")]
    InvalidSignature,

    #[error("prestige: eligibility proof verification failed")]
    InvalidProof,

    #[error("prestige: witness attestation failed to verify")]
    InvalidAttestation,

    #[error("prestige: nullifier has already been used for this ballot")]
    DoubleVote,

    #[error("prestige: attestation timestamp is after the ballot deadline")]
    TooLate,

    #[error("prestige: not authorized: {0}")]
    NotAuthorized(String),

    #[error("prestige: not eligible: {0}")]
    NotEligible(String),

    #[error("prestige: petition threshold has not been met")]
    PetitionNotMet,

    #[error("prestige: validation error: {0}")]
    ValidationError(String),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("prestige: eligibility issuer unavailable: {0}")]
    IssuerUnavailable(String),

    #[error("prestige: witness unavailable: {0}")]
    WitnessUnavailable(String),

    #[error("prestige: relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("{0}")]
    Crypto(#[from] CryptoError),
}

impl Error {
    /// Stable machine-readable code for this error kind.
    ///
    /// External surfaces key their responses off these codes, so they must
    /// never change for an existing kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BallotNotFound(_) => "ballot_not_found",
            Error::BallotInPetition => "ballot_in_petition",
            Error::BallotClosed => "ballot_closed",
            Error::BallotNotRevealing => "ballot_not_revealing",
            Error::InvalidCommitment => "invalid_commitment",
            Error::InvalidReveal => "invalid_reveal",
            Error::InvalidSignature => "invalid_signature",
            Error::InvalidProof => "invalid_proof",
            Error::InvalidAttestation => "invalid_attestation",
            Error::DoubleVote => "double_vote",
            Error::TooLate => "too_late",
            Error::NotAuthorized(_) => "not_authorized",
            Error::NotEligible(_) => "not_eligible",
            Error::PetitionNotMet => "petition_not_met",
            Error::ValidationError(_) => "validation_error",
            Error::Store(_) => "store_error",
            Error::IssuerUnavailable(_) => "issuer_unavailable",
            Error::WitnessUnavailable(_) => "witness_unavailable",
            Error::RelayUnavailable(_) => "relay_unavailable",
            Error::Crypto(e) => e.code(),
        }
    }
}
