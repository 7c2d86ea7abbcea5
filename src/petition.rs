use crate::*;

use ed25519_dalek::{PublicKey, Signature};
use std::sync::Arc;
use tracing::info;

/// A voter's signature backing a petition ballot. Unique per
/// `(ballot_id, public_key)`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PetitionSignature {
    pub ballot_id: String,
    #[serde(with = "EdPublicKeyHex")]
    pub public_key: PublicKey,
    /// Signature over the ballot id bytes.
    #[serde(with = "EdSignatureHex")]
    pub signature: Signature,
    pub timestamp_ms: u64,
}

/// Outcome of an `add_signature` call.
///
/// Only the signature that crosses the threshold carries `just_activated`;
/// later calls still see `activated` but must not re-run activation.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureOutcome {
    pub added: bool,
    pub activated: bool,
    pub just_activated: bool,
}

/// Collects petition signatures and activates ballots at the threshold.
pub struct PetitionManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: PrestigeConfig,
    voter_gate: VoterGate,
    threshold: usize,
}

impl<S: Store> PetitionManager<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        config: PrestigeConfig,
    ) -> Result<Self, Error> {
        let voter_gate = VoterGate::from_config(&config.voter_gate)?;
        let threshold = BallotGate::from_config(&config)?
            .petition_threshold()
            .unwrap_or(10);
        Ok(PetitionManager {
            store,
            clock,
            config,
            voter_gate,
            threshold,
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record a signature; activate the ballot when this signature crosses
    /// the threshold. Duplicate signatures are ignored without error.
    pub async fn add_signature(
        &self,
        ballot_id: &str,
        public_key: PublicKey,
        signature: Signature,
    ) -> Result<SignatureOutcome, Error> {
        let ballot = self
            .store
            .get_ballot(ballot_id)
            .await?
            .ok_or_else(|| Error::BallotNotFound(ballot_id.to_string()))?;

        if !self.voter_gate.can_vote(&public_key).await? {
            return Err(Error::NotEligible(self.voter_gate.requirements()));
        }

        public_key
            .verify_strict(ballot_id.as_bytes(), &signature)
            .map_err(|_| Error::InvalidSignature)?;

        let already_active = ballot.status != BallotStatus::Petition;
        if self
            .store
            .has_petition_signature(ballot_id, &public_key)
            .await?
        {
            return Ok(SignatureOutcome {
                added: false,
                activated: already_active,
                just_activated: false,
            });
        }

        let petition_signature = PetitionSignature {
            ballot_id: ballot_id.to_string(),
            public_key,
            signature,
            timestamp_ms: self.clock.now_ms(),
        };
        if !self.store.save_petition_signature(&petition_signature).await? {
            // Lost a race with an identical signature
            return Ok(SignatureOutcome {
                added: false,
                activated: already_active,
                just_activated: false,
            });
        }

        let count = self.store.get_petition_signatures(ballot_id).await?.len();
        info!(ballot_id, count, threshold = self.threshold, "petition signature added");

        if already_active {
            return Ok(SignatureOutcome {
                added: true,
                activated: true,
                just_activated: false,
            });
        }

        if count >= self.threshold {
            activate_ballot(
                self.store.as_ref(),
                self.clock.as_ref(),
                &self.config,
                ballot_id,
            )
            .await?;
            return Ok(SignatureOutcome {
                added: true,
                activated: true,
                just_activated: true,
            });
        }

        Ok(SignatureOutcome {
            added: true,
            activated: false,
            just_activated: false,
        })
    }
}
