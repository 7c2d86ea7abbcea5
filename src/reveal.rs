use crate::*;

use std::sync::Arc;
use tracing::info;

/// A revealed vote. Unique per `(ballot_id, nullifier)`.
///
/// `choice` remains for single-choice clients; when `vote_data` is present
/// it supersedes `choice` for the integrity check.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Reveal {
    pub ballot_id: String,
    pub nullifier: Hash32,
    pub choice: String,
    pub salt: Hash32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_data: Option<VoteData>,
}

impl Reveal {
    /// The structured form this reveal commits to.
    pub fn effective_vote_data(&self) -> VoteData {
        match &self.vote_data {
            Some(vote_data) => vote_data.clone(),
            None => VoteData::Single {
                choice: self.choice.clone(),
            },
        }
    }
}

/// Validate revealed vote data against the ballot's type and bounds.
/// Fail-closed: anything not explicitly allowed is rejected.
pub fn validate_vote_data(ballot: &Ballot, vote_data: &VoteData) -> Result<(), Error> {
    if vote_data.tag() != ballot.vote_type.tag() {
        return Err(Error::InvalidReveal);
    }

    let known = |choice: &String| ballot.choices.contains(choice);
    match vote_data {
        VoteData::Single { choice } => {
            if !known(choice) {
                return Err(Error::InvalidReveal);
            }
        }
        VoteData::Approval { choices } => {
            if choices.is_empty() || !choices.iter().all(known) {
                return Err(Error::InvalidReveal);
            }
            if has_duplicates(choices) {
                return Err(Error::InvalidReveal);
            }
        }
        VoteData::Ranked { rankings } => {
            let (min, max) = ballot.vote_type.ranking_bounds(ballot.choices.len());
            if rankings.len() < min || rankings.len() > max {
                return Err(Error::InvalidReveal);
            }
            if !rankings.iter().all(known) || has_duplicates(rankings) {
                return Err(Error::InvalidReveal);
            }
        }
        VoteData::Score { scores } => {
            let (min, max) = ballot.vote_type.score_bounds();
            for (choice, score) in scores {
                if !known(choice) || *score < min || *score > max {
                    return Err(Error::InvalidReveal);
                }
            }
        }
    }
    Ok(())
}

fn has_duplicates(choices: &[String]) -> bool {
    choices
        .iter()
        .enumerate()
        .any(|(position, choice)| choices[..position].contains(choice))
}

/// Admits reveals during the reveal window.
pub struct RevealManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: PrestigeConfig,
}

impl<S: Store> RevealManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: PrestigeConfig) -> Self {
        RevealManager {
            store,
            clock,
            config,
        }
    }

    pub async fn submit_reveal(
        &self,
        ballot_id: &str,
        nullifier: &str,
        choice: &str,
        salt: &str,
        vote_data: Option<VoteData>,
    ) -> Result<Reveal, Error> {
        privacy::random_delay(&self.config.privacy).await;
        let target_ms = if self.config.privacy.enabled {
            self.config.privacy.normalized_response_ms
        } else {
            0
        };
        let result = privacy::normalize_response(
            target_ms,
            self.admit_reveal(ballot_id, nullifier, choice, salt, vote_data),
        )
        .await;
        privacy::random_delay(&self.config.privacy).await;
        result
    }

    async fn admit_reveal(
        &self,
        ballot_id: &str,
        nullifier: &str,
        choice: &str,
        salt: &str,
        vote_data: Option<VoteData>,
    ) -> Result<Reveal, Error> {
        let ballot = self
            .store
            .get_ballot(ballot_id)
            .await?
            .ok_or_else(|| Error::BallotNotFound(ballot_id.to_string()))?;

        if ballot.status == BallotStatus::Petition {
            return Err(Error::BallotInPetition);
        }
        let now = self.clock.now_ms();
        if now < ballot.deadline_ms {
            return Err(Error::BallotClosed);
        }
        if now >= ballot.reveal_deadline_ms {
            return Err(Error::BallotNotRevealing);
        }

        let nullifier = Hash32::from_hex(nullifier).map_err(|_| Error::InvalidCommitment)?;

        let vote = self
            .store
            .get_vote(ballot_id, &nullifier)
            .await?
            .ok_or(Error::InvalidReveal)?;

        let reveal = Reveal {
            ballot_id: ballot_id.to_string(),
            nullifier,
            choice: choice.to_string(),
            salt: Hash32::from_hex(salt).map_err(|_| Error::InvalidReveal)?,
            vote_data,
        };

        let effective = reveal.effective_vote_data();
        validate_vote_data(&ballot, &effective)?;

        if !verify_commitment(&vote.commitment, &effective, &reveal.salt) {
            return Err(Error::InvalidReveal);
        }

        if !self.store.save_reveal(&reveal).await? {
            return Err(Error::DoubleVote);
        }

        info!(ballot_id, nullifier = %reveal.nullifier, "vote revealed");
        Ok(reveal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    const DEADLINE_MS: u64 = 100_000;
    const REVEAL_DEADLINE_MS: u64 = 200_000;

    struct Fixture {
        store: Arc<MemStore>,
        clock: Arc<TestClock>,
        manager: RevealManager<MemStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::default());
        // Start inside the reveal window
        let clock = Arc::new(TestClock::new(DEADLINE_MS));
        let manager = RevealManager::new(store.clone(), clock.clone(), PrestigeConfig::default());
        Fixture {
            store,
            clock,
            manager,
        }
    }

    async fn seed_ballot(fixture: &Fixture, vote_type: VoteTypeConfig) -> Ballot {
        let (_, public) = generate_keypair();
        let ballot = Ballot {
            id: "b-1".to_string(),
            question: "Color?".to_string(),
            choices: vec!["Red".to_string(), "Blue".to_string(), "Green".to_string()],
            created_ms: 1_000,
            deadline_ms: DEADLINE_MS,
            reveal_deadline_ms: REVEAL_DEADLINE_MS,
            eligibility: EligibilityConfig::Open,
            vote_type,
            creator_public_key: public,
            attestation: WitnessAttestation {
                target_hash: Hash32::from_array([0; 32]),
                timestamp_seconds: 1,
                signatures: vec![],
                witness_ids: vec![],
                network_id: None,
                sequence: None,
            },
            status: BallotStatus::Voting,
        };
        fixture.store.save_ballot(&ballot).await.unwrap();
        ballot
    }

    fn dummy_proof() -> EligibilityToken {
        EligibilityToken {
            token_bytes: vec![0; voprf::TOKEN_LENGTH],
            issuer_public_key: vec![],
            expires_at_ms: u64::MAX,
            key_id: None,
            epoch: None,
        }
    }

    async fn seed_vote(fixture: &Fixture, vote_data: &VoteData, salt: &Hash32) -> Hash32 {
        let secret = generate_voter_secret();
        let null = nullifier(&secret, "b-1");
        let vote = Vote {
            ballot_id: "b-1".to_string(),
            nullifier: null,
            commitment: commit_vote_data(vote_data, salt),
            proof: dummy_proof(),
            attestation: WitnessAttestation {
                target_hash: Hash32::from_array([0; 32]),
                timestamp_seconds: 1,
                signatures: vec![],
                witness_ids: vec![],
                network_id: None,
                sequence: None,
            },
        };
        fixture.store.save_vote(&vote).await.unwrap();
        null
    }

    #[tokio::test]
    async fn single_choice_reveal_round_trip() {
        let fixture = fixture();
        seed_ballot(&fixture, VoteTypeConfig::Single).await;

        let salt = generate_salt();
        let vote_data = VoteData::Single {
            choice: "Red".to_string(),
        };
        let null = seed_vote(&fixture, &vote_data, &salt).await;

        let reveal = fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "Red", &salt.to_hex(), None)
            .await
            .unwrap();
        assert_eq!(reveal.choice, "Red");
    }

    #[tokio::test]
    async fn wrong_salt_is_rejected() {
        let fixture = fixture();
        seed_ballot(&fixture, VoteTypeConfig::Single).await;

        let salt = generate_salt();
        let vote_data = VoteData::Single {
            choice: "Red".to_string(),
        };
        let null = seed_vote(&fixture, &vote_data, &salt).await;

        let err = fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "Red", &generate_salt().to_hex(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReveal));
    }

    #[tokio::test]
    async fn reveal_window_boundaries() {
        let fixture = fixture();
        seed_ballot(&fixture, VoteTypeConfig::Single).await;

        let salt = generate_salt();
        let vote_data = VoteData::Single {
            choice: "Red".to_string(),
        };
        let null = seed_vote(&fixture, &vote_data, &salt).await;

        // One ms before the deadline: still in the voting phase.
        fixture.clock.set(DEADLINE_MS - 1);
        let err = fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "Red", &salt.to_hex(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BallotClosed));

        // At the reveal deadline: window is over.
        fixture.clock.set(REVEAL_DEADLINE_MS);
        let err = fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "Red", &salt.to_hex(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BallotNotRevealing));

        // Exactly at the deadline: accepted.
        fixture.clock.set(DEADLINE_MS);
        fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "Red", &salt.to_hex(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_reveal_is_rejected() {
        let fixture = fixture();
        seed_ballot(&fixture, VoteTypeConfig::Single).await;

        let salt = generate_salt();
        let vote_data = VoteData::Single {
            choice: "Red".to_string(),
        };
        let null = seed_vote(&fixture, &vote_data, &salt).await;

        fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "Red", &salt.to_hex(), None)
            .await
            .unwrap();
        let err = fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "Red", &salt.to_hex(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DoubleVote));
    }

    #[tokio::test]
    async fn reveal_without_matching_vote_is_rejected() {
        let fixture = fixture();
        seed_ballot(&fixture, VoteTypeConfig::Single).await;

        let err = fixture
            .manager
            .submit_reveal(
                "b-1",
                &generate_voter_secret().to_hex(),
                "Red",
                &generate_salt().to_hex(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReveal));
    }

    #[tokio::test]
    async fn ranked_bounds_are_enforced() {
        let fixture = fixture();
        seed_ballot(
            &fixture,
            VoteTypeConfig::Ranked {
                min_rankings: Some(2),
                max_rankings: Some(3),
            },
        )
        .await;

        let salt = generate_salt();
        let valid = VoteData::Ranked {
            rankings: vec!["Red".to_string(), "Blue".to_string()],
        };
        let null = seed_vote(&fixture, &valid, &salt).await;

        // min_rankings - 1 entries
        let short = VoteData::Ranked {
            rankings: vec!["Red".to_string()],
        };
        let err = fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "", &salt.to_hex(), Some(short))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReveal));

        // duplicate rankings
        let duplicated = VoteData::Ranked {
            rankings: vec!["Red".to_string(), "Red".to_string()],
        };
        let err = fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "", &salt.to_hex(), Some(duplicated))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReveal));

        // exactly min_rankings entries
        fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "", &salt.to_hex(), Some(valid))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn score_bounds_are_enforced() {
        let fixture = fixture();
        seed_ballot(
            &fixture,
            VoteTypeConfig::Score {
                min_score: Some(0),
                max_score: Some(5),
            },
        )
        .await;

        let salt = generate_salt();
        let mut scores = IndexMap::new();
        scores.insert("Red".to_string(), 5i64);
        scores.insert("Blue".to_string(), 0i64);
        let valid = VoteData::Score { scores };
        let null = seed_vote(&fixture, &valid, &salt).await;

        let mut out_of_range = IndexMap::new();
        out_of_range.insert("Red".to_string(), 6i64);
        let err = fixture
            .manager
            .submit_reveal(
                "b-1",
                &null.to_hex(),
                "",
                &salt.to_hex(),
                Some(VoteData::Score {
                    scores: out_of_range,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReveal));

        let mut unknown_choice = IndexMap::new();
        unknown_choice.insert("Yellow".to_string(), 3i64);
        let err = fixture
            .manager
            .submit_reveal(
                "b-1",
                &null.to_hex(),
                "",
                &salt.to_hex(),
                Some(VoteData::Score {
                    scores: unknown_choice,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReveal));

        fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "", &salt.to_hex(), Some(valid))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn vote_data_tag_must_match_ballot_type() {
        let fixture = fixture();
        seed_ballot(&fixture, VoteTypeConfig::Single).await;

        let salt = generate_salt();
        let vote_data = VoteData::Single {
            choice: "Red".to_string(),
        };
        let null = seed_vote(&fixture, &vote_data, &salt).await;

        let mismatched = VoteData::Approval {
            choices: vec!["Red".to_string()],
        };
        let err = fixture
            .manager
            .submit_reveal("b-1", &null.to_hex(), "", &salt.to_hex(), Some(mismatched))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReveal));
    }
}
