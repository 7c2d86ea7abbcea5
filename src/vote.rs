use crate::*;

use ed25519_dalek::PublicKey;
use std::sync::Arc;
use tracing::info;

/// A cast vote: hidden commitment, single-use nullifier, eligibility proof
/// and the witness attestation produced at admission. Unique per
/// `(ballot_id, nullifier)`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Vote {
    pub ballot_id: String,
    pub nullifier: Hash32,
    pub commitment: Hash32,
    pub proof: EligibilityToken,
    pub attestation: WitnessAttestation,
}

/// Admits votes and brokers eligibility tokens.
pub struct VoteManager<S, I, W> {
    store: Arc<S>,
    issuer: Arc<I>,
    witness: Arc<W>,
    clock: Arc<dyn Clock>,
    config: PrestigeConfig,
    voter_gate: VoterGate,
    batcher: Option<TokenBatcher>,
}

impl<S: Store, I: Issuer + 'static, W: Witness> VoteManager<S, I, W> {
    pub fn new(
        store: Arc<S>,
        issuer: Arc<I>,
        witness: Arc<W>,
        clock: Arc<dyn Clock>,
        config: PrestigeConfig,
    ) -> Result<Self, Error> {
        let voter_gate = VoterGate::from_config(&config.voter_gate)?;
        let batcher = if config.privacy.enabled && config.privacy.batching_enabled {
            Some(TokenBatcher::spawn(issuer.clone(), config.privacy.clone()))
        } else {
            None
        };
        Ok(VoteManager {
            store,
            issuer,
            witness,
            clock,
            config,
            voter_gate,
            batcher,
        })
    }

    fn normalized_target_ms(&self) -> u64 {
        if self.config.privacy.enabled {
            self.config.privacy.normalized_response_ms
        } else {
            0
        }
    }

    /// Admit a vote. Every check short-circuits in a fixed order so a caller
    /// learns exactly one reason for rejection.
    pub async fn cast_vote(
        &self,
        ballot_id: &str,
        commitment: &str,
        nullifier: &str,
        proof: EligibilityToken,
    ) -> Result<Vote, Error> {
        privacy::random_delay(&self.config.privacy).await;
        let result = privacy::normalize_response(
            self.normalized_target_ms(),
            self.admit_vote(ballot_id, commitment, nullifier, proof),
        )
        .await;
        privacy::random_delay(&self.config.privacy).await;
        result
    }

    async fn admit_vote(
        &self,
        ballot_id: &str,
        commitment: &str,
        nullifier: &str,
        proof: EligibilityToken,
    ) -> Result<Vote, Error> {
        let ballot = self
            .store
            .get_ballot(ballot_id)
            .await?
            .ok_or_else(|| Error::BallotNotFound(ballot_id.to_string()))?;

        if ballot.status == BallotStatus::Petition {
            return Err(Error::BallotInPetition);
        }
        if self.clock.now_ms() >= ballot.deadline_ms {
            return Err(Error::BallotClosed);
        }

        let commitment = Hash32::from_hex(commitment).map_err(|_| Error::InvalidCommitment)?;
        let nullifier = Hash32::from_hex(nullifier).map_err(|_| Error::InvalidCommitment)?;

        if self.store.has_nullifier(ballot_id, &nullifier).await? {
            return Err(Error::DoubleVote);
        }

        if !self.issuer.verify(&proof).await? {
            return Err(Error::InvalidProof);
        }

        let attestation = self
            .witness
            .attest(hash_concat(&[
                ballot_id.as_bytes(),
                nullifier.as_bytes(),
                commitment.as_bytes(),
            ]))
            .await?;
        if attestation.timestamp_ms() > ballot.deadline_ms {
            return Err(Error::TooLate);
        }

        let vote = Vote {
            ballot_id: ballot_id.to_string(),
            nullifier,
            commitment,
            proof,
            attestation,
        };

        // The store's unique constraint is the ground truth; a concurrent
        // cast that won the race surfaces here.
        if !self.store.save_vote(&vote).await? {
            return Err(Error::DoubleVote);
        }

        info!(ballot_id, nullifier = %vote.nullifier, "vote cast");
        Ok(vote)
    }

    /// Obtain an eligibility token for a ballot.
    ///
    /// The blinded element comes from the voter's client; this only checks
    /// the gates and forwards to the issuer, batched when privacy batching
    /// is on.
    pub async fn request_token(
        &self,
        ballot_id: &str,
        requester: &PublicKey,
        blinded_element_b64: &str,
    ) -> Result<EligibilityToken, Error> {
        privacy::random_delay(&self.config.privacy).await;
        let result = privacy::normalize_response(
            self.normalized_target_ms(),
            self.admit_token_request(ballot_id, requester, blinded_element_b64),
        )
        .await;
        privacy::random_delay(&self.config.privacy).await;
        result
    }

    async fn admit_token_request(
        &self,
        ballot_id: &str,
        requester: &PublicKey,
        blinded_element_b64: &str,
    ) -> Result<EligibilityToken, Error> {
        let ballot = self
            .store
            .get_ballot(ballot_id)
            .await?
            .ok_or_else(|| Error::BallotNotFound(ballot_id.to_string()))?;
        if ballot.status == BallotStatus::Petition {
            return Err(Error::BallotInPetition);
        }

        if !self.voter_gate.can_vote(requester).await? {
            return Err(Error::NotEligible(self.voter_gate.requirements()));
        }
        if !ballot.eligibility.admits(requester) {
            return Err(Error::NotEligible(
                "this ballot restricts eligibility to listed keys".to_string(),
            ));
        }

        match &self.batcher {
            Some(batcher) => batcher.request(blinded_element_b64.to_string()).await,
            None => self.issuer.issue(blinded_element_b64).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        store: Arc<MemStore>,
        issuer: Arc<MemIssuer>,
        clock: Arc<TestClock>,
        witness_clock: Arc<TestClock>,
        manager: VoteManager<MemStore, MemIssuer, MemWitness>,
    }

    const DEADLINE_MS: u64 = 100_000;
    const REVEAL_DEADLINE_MS: u64 = 200_000;

    async fn fixture() -> Fixture {
        let clock = Arc::new(TestClock::new(1_000));
        let witness_clock = Arc::new(TestClock::new(1_000));
        let store = Arc::new(MemStore::default());
        let issuer = Arc::new(MemIssuer::new(b"freebird".to_vec(), clock.clone()));
        let witness = Arc::new(MemWitness::single(witness_clock.clone()));

        let config = PrestigeConfig {
            voter_gate: VoterGateConfig::Open,
            ..PrestigeConfig::default()
        };
        let manager = VoteManager::new(
            store.clone(),
            issuer.clone(),
            witness,
            clock.clone(),
            config,
        )
        .unwrap();

        Fixture {
            store,
            issuer,
            clock,
            witness_clock,
            manager,
        }
    }

    async fn seed_ballot(fixture: &Fixture, status: BallotStatus) -> Ballot {
        let (_, public) = generate_keypair();
        let petition = status == BallotStatus::Petition;
        let ballot = Ballot {
            id: "b-1".to_string(),
            question: "Color?".to_string(),
            choices: vec!["Red".to_string(), "Blue".to_string(), "Green".to_string()],
            created_ms: 1_000,
            deadline_ms: if petition { 0 } else { DEADLINE_MS },
            reveal_deadline_ms: if petition { 0 } else { REVEAL_DEADLINE_MS },
            eligibility: EligibilityConfig::Open,
            vote_type: VoteTypeConfig::Single,
            creator_public_key: public,
            attestation: WitnessAttestation {
                target_hash: Hash32::from_array([0; 32]),
                timestamp_seconds: 1,
                signatures: vec![],
                witness_ids: vec![],
                network_id: None,
                sequence: None,
            },
            status,
        };
        fixture.store.save_ballot(&ballot).await.unwrap();
        ballot
    }

    async fn cast(fixture: &Fixture, choice: &str) -> Result<Vote, Error> {
        let secret = generate_voter_secret();
        let salt = generate_salt();
        let nullifier = nullifier(&secret, "b-1");
        let commitment = commit_single(choice, &salt);
        let proof = fixture.issuer.issue_for_input(secret.as_bytes()).await.unwrap();
        fixture
            .manager
            .cast_vote("b-1", &commitment.to_hex(), &nullifier.to_hex(), proof)
            .await
    }

    #[tokio::test]
    async fn happy_path_cast() {
        let fixture = fixture().await;
        seed_ballot(&fixture, BallotStatus::Voting).await;

        let vote = cast(&fixture, "Red").await.unwrap();
        assert_eq!(vote.ballot_id, "b-1");
        assert!(fixture
            .store
            .has_nullifier("b-1", &vote.nullifier)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn double_vote_is_rejected() {
        let fixture = fixture().await;
        seed_ballot(&fixture, BallotStatus::Voting).await;

        let secret = generate_voter_secret();
        let null = nullifier(&secret, "b-1");
        let proof = fixture.issuer.issue_for_input(secret.as_bytes()).await.unwrap();
        fixture
            .manager
            .cast_vote(
                "b-1",
                &commit_single("Red", &generate_salt()).to_hex(),
                &null.to_hex(),
                proof.clone(),
            )
            .await
            .unwrap();

        // Same nullifier, fresh commitment
        let err = fixture
            .manager
            .cast_vote(
                "b-1",
                &commit_single("Blue", &generate_salt()).to_hex(),
                &null.to_hex(),
                proof,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DoubleVote));
    }

    #[tokio::test]
    async fn rejects_unknown_ballot_and_petitions() {
        let fixture = fixture().await;
        let err = cast(&fixture, "Red").await.unwrap_err();
        assert!(matches!(err, Error::BallotNotFound(_)));

        seed_ballot(&fixture, BallotStatus::Petition).await;
        let err = cast(&fixture, "Red").await.unwrap_err();
        assert!(matches!(err, Error::BallotInPetition));
    }

    #[tokio::test]
    async fn rejects_after_deadline() {
        let fixture = fixture().await;
        seed_ballot(&fixture, BallotStatus::Voting).await;

        fixture.clock.set(DEADLINE_MS);
        let err = cast(&fixture, "Red").await.unwrap_err();
        assert!(matches!(err, Error::BallotClosed));
    }

    #[tokio::test]
    async fn rejects_malformed_commitment_and_nullifier() {
        let fixture = fixture().await;
        seed_ballot(&fixture, BallotStatus::Voting).await;

        let secret = generate_voter_secret();
        let proof = fixture.issuer.issue_for_input(secret.as_bytes()).await.unwrap();
        let err = fixture
            .manager
            .cast_vote("b-1", "abcd", &nullifier(&secret, "b-1").to_hex(), proof.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCommitment));

        let err = fixture
            .manager
            .cast_vote(
                "b-1",
                &commit_single("Red", &generate_salt()).to_hex(),
                "not-hex",
                proof,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCommitment));
    }

    #[tokio::test]
    async fn rejects_tampered_proof() {
        let fixture = fixture().await;
        seed_ballot(&fixture, BallotStatus::Voting).await;

        let secret = generate_voter_secret();
        let mut proof = fixture.issuer.issue_for_input(secret.as_bytes()).await.unwrap();
        proof.token_bytes[10] ^= 0x01;

        let err = fixture
            .manager
            .cast_vote(
                "b-1",
                &commit_single("Red", &generate_salt()).to_hex(),
                &nullifier(&secret, "b-1").to_hex(),
                proof,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidProof));
    }

    #[tokio::test]
    async fn attestation_at_deadline_is_accepted_but_later_is_too_late() {
        let fixture = fixture().await;
        seed_ballot(&fixture, BallotStatus::Voting).await;

        // Witness timestamp lands exactly on the deadline: accepted.
        fixture.witness_clock.set(DEADLINE_MS);
        cast(&fixture, "Red").await.unwrap();

        // One witness second past the deadline: rejected.
        fixture.witness_clock.set(DEADLINE_MS + 1000);
        let err = cast(&fixture, "Red").await.unwrap_err();
        assert!(matches!(err, Error::TooLate));
    }

    #[tokio::test]
    async fn token_requests_respect_ballot_eligibility() {
        let fixture = fixture().await;
        let mut ballot = seed_ballot(&fixture, BallotStatus::Voting).await;

        let (_, listed) = generate_keypair();
        let (_, unlisted) = generate_keypair();
        ballot.eligibility = EligibilityConfig::Allowlist {
            keys: vec![hex::encode(listed.as_bytes())],
        };
        fixture.store.save_ballot(&ballot).await.unwrap();

        let (blinded, _) = voprf::blind(b"input", fixture.issuer.context()).unwrap();
        let blinded_b64 = base64::encode_config(&blinded, base64::URL_SAFE_NO_PAD);

        let token = fixture
            .manager
            .request_token("b-1", &listed, &blinded_b64)
            .await
            .unwrap();
        assert!(fixture.issuer.verify(&token).await.unwrap());

        let err = fixture
            .manager
            .request_token("b-1", &unlisted, &blinded_b64)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotEligible(_)));
    }
}
