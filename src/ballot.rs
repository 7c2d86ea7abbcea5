use crate::*;

use ed25519_dalek::PublicKey;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Lifecycle phase of a ballot.
///
/// `Petition` is sticky until activation and `Finalized` is sticky forever;
/// the two middle states are derived from the clock.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BallotStatus {
    Petition,
    Voting,
    Revealing,
    Finalized,
}

/// Ballot-level eligibility. May only further restrict the instance voter
/// gate, never expand it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EligibilityConfig {
    Open,
    InviteList { keys: Vec<String> },
    Allowlist { keys: Vec<String> },
}

impl EligibilityConfig {
    /// Whether a voter key passes this ballot's eligibility restriction.
    pub fn admits(&self, public_key: &PublicKey) -> bool {
        let hex_key = hex::encode(public_key.as_bytes());
        match self {
            EligibilityConfig::Open => true,
            EligibilityConfig::InviteList { keys } | EligibilityConfig::Allowlist { keys } => {
                keys.iter().any(|key| key.eq_ignore_ascii_case(&hex_key))
            }
        }
    }

    fn validate(&self) -> Result<(), Error> {
        match self {
            EligibilityConfig::Open => Ok(()),
            EligibilityConfig::InviteList { keys } | EligibilityConfig::Allowlist { keys } => {
                if keys.is_empty() {
                    return Err(Error::ValidationError(
                        "eligibility list must not be empty".to_string(),
                    ));
                }
                for key in keys {
                    parse_public_key(key)?;
                }
                Ok(())
            }
        }
    }
}

/// Parse a hex-encoded Ed25519 public key, as carried in config and
/// eligibility lists.
pub fn parse_public_key(hex_key: &str) -> Result<PublicKey, Error> {
    let bytes = hex::decode(hex_key)
        .map_err(|_| Error::ValidationError(format!("invalid public key hex: {}", hex_key)))?;
    PublicKey::from_bytes(&bytes)
        .map_err(|_| Error::ValidationError(format!("invalid public key: {}", hex_key)))
}

/// Aggregation rule for the ballot, with optional per-rule bounds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoteTypeConfig {
    Single,
    Approval,
    Ranked {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_rankings: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_rankings: Option<usize>,
    },
    Score {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_score: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_score: Option<i64>,
    },
}

impl VoteTypeConfig {
    pub fn tag(&self) -> &'static str {
        match self {
            VoteTypeConfig::Single => "single",
            VoteTypeConfig::Approval => "approval",
            VoteTypeConfig::Ranked { .. } => "ranked",
            VoteTypeConfig::Score { .. } => "score",
        }
    }

    /// Effective ranking bounds given the ballot's choice count.
    pub fn ranking_bounds(&self, num_choices: usize) -> (usize, usize) {
        match self {
            VoteTypeConfig::Ranked {
                min_rankings,
                max_rankings,
            } => (
                min_rankings.unwrap_or(1),
                max_rankings.unwrap_or(num_choices),
            ),
            _ => (1, num_choices),
        }
    }

    /// Effective score bounds.
    pub fn score_bounds(&self) -> (i64, i64) {
        match self {
            VoteTypeConfig::Score {
                min_score,
                max_score,
            } => (min_score.unwrap_or(0), max_score.unwrap_or(10)),
            _ => (0, 10),
        }
    }

    fn validate(&self, num_choices: usize) -> Result<(), Error> {
        match self {
            VoteTypeConfig::Single | VoteTypeConfig::Approval => Ok(()),
            VoteTypeConfig::Ranked { .. } => {
                let (min, max) = self.ranking_bounds(num_choices);
                if min < 1 || min > max || max > num_choices {
                    return Err(Error::ValidationError(format!(
                        "invalid ranking bounds {}..{} for {} choices",
                        min, max, num_choices
                    )));
                }
                Ok(())
            }
            VoteTypeConfig::Score { .. } => {
                let (min, max) = self.score_bounds();
                if min >= max || max > 100 {
                    return Err(Error::ValidationError(format!(
                        "invalid score bounds {}..{}",
                        min, max
                    )));
                }
                Ok(())
            }
        }
    }
}

/// The revealed structured ballot, mirroring [`VoteTypeConfig`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoteData {
    Single { choice: String },
    Approval { choices: Vec<String> },
    Ranked { rankings: Vec<String> },
    Score { scores: IndexMap<String, i64> },
}

impl VoteData {
    pub fn tag(&self) -> &'static str {
        match self {
            VoteData::Single { .. } => "single",
            VoteData::Approval { .. } => "approval",
            VoteData::Ranked { .. } => "ranked",
            VoteData::Score { .. } => "score",
        }
    }

    /// Canonical serialization committed to by `H(serialize(vote_data), salt)`.
    ///
    /// Approval choices and score keys are sorted so any insertion order
    /// commits to the same bytes; rankings are order-preserving by
    /// definition.
    pub fn canonical_form(&self) -> String {
        match self {
            VoteData::Single { choice } => choice.clone(),
            VoteData::Approval { choices } => {
                let mut sorted = choices.clone();
                sorted.sort();
                format!("approval:{}", sorted.join(","))
            }
            VoteData::Ranked { rankings } => format!("ranked:{}", rankings.join(",")),
            VoteData::Score { scores } => {
                let mut pairs: Vec<(&String, &i64)> = scores.iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(b.0));
                let joined = pairs
                    .iter()
                    .map(|(choice, score)| format!("{}:{}", choice, score))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("score:{}", joined)
            }
        }
    }
}

/// The question put to voters.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Ballot {
    pub id: String,
    pub question: String,
    pub choices: Vec<String>,
    pub created_ms: u64,
    /// `0` while the ballot is a petition.
    pub deadline_ms: u64,
    /// `0` while the ballot is a petition.
    pub reveal_deadline_ms: u64,
    pub eligibility: EligibilityConfig,
    pub vote_type: VoteTypeConfig,
    #[serde(with = "EdPublicKeyHex")]
    pub creator_public_key: PublicKey,
    pub attestation: WitnessAttestation,
    pub status: BallotStatus,
}

impl Ballot {
    /// The phase implied by the clock, honoring the sticky states.
    pub fn phase_at(&self, now_ms: u64) -> BallotStatus {
        match self.status {
            BallotStatus::Petition => BallotStatus::Petition,
            BallotStatus::Finalized => BallotStatus::Finalized,
            _ => {
                if now_ms < self.deadline_ms {
                    BallotStatus::Voting
                } else if now_ms < self.reveal_deadline_ms {
                    BallotStatus::Revealing
                } else {
                    BallotStatus::Finalized
                }
            }
        }
    }

    /// Hash over the canonical JSON of every field that precedes the
    /// attestation. This is what the witness attests at creation.
    pub fn canonical_hash(&self) -> Hash32 {
        let value = serde_json::json!({
            "id": self.id,
            "question": self.question,
            "choices": self.choices,
            "created_ms": self.created_ms,
            "deadline_ms": self.deadline_ms,
            "reveal_deadline_ms": self.reveal_deadline_ms,
            "eligibility": self.eligibility,
            "vote_type": self.vote_type,
            "creator_public_key": hex::encode(self.creator_public_key.as_bytes()),
        });
        let canonical = serde_json::to_string(&value)
            .expect("prestige: ballot canonical form cannot fail to serialize");
        hash_concat(&[canonical.as_bytes()])
    }

    /// Structural invariants, also applied to ballots received over gossip.
    pub fn validate(&self, config: &PrestigeConfig) -> Result<(), Error> {
        validate_question_and_choices(&self.question, &self.choices, config)?;
        self.eligibility.validate()?;
        self.vote_type.validate(self.choices.len())?;

        match self.status {
            BallotStatus::Petition => {
                if self.deadline_ms != 0 || self.reveal_deadline_ms != 0 {
                    return Err(Error::ValidationError(
                        "petition ballots must not carry deadlines".to_string(),
                    ));
                }
            }
            _ => {
                if self.created_ms == 0
                    || self.created_ms > self.deadline_ms
                    || self.deadline_ms > self.reveal_deadline_ms
                {
                    return Err(Error::ValidationError(
                        "ballot deadlines are out of order".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn validate_question_and_choices(
    question: &str,
    choices: &[String],
    config: &PrestigeConfig,
) -> Result<(), Error> {
    if question.trim().is_empty() {
        return Err(Error::ValidationError("question must not be empty".to_string()));
    }
    if question.len() > config.max_question_length {
        return Err(Error::ValidationError(format!(
            "question exceeds {} characters",
            config.max_question_length
        )));
    }
    if choices.len() < 2 || choices.len() > config.max_choices {
        return Err(Error::ValidationError(format!(
            "ballots need between 2 and {} choices",
            config.max_choices
        )));
    }
    for (position, choice) in choices.iter().enumerate() {
        if choice.trim().is_empty() {
            return Err(Error::ValidationError("choices must not be empty".to_string()));
        }
        if choices[..position].contains(choice) {
            return Err(Error::ValidationError(format!(
                "duplicate choice: {}",
                choice
            )));
        }
    }
    Ok(())
}

/// Request to create a ballot.
#[derive(Deserialize, Debug, Clone)]
pub struct CreateBallotRequest {
    pub question: String,
    pub choices: Vec<String>,
    #[serde(default)]
    pub duration_minutes: Option<u64>,
    #[serde(default = "default_eligibility")]
    pub eligibility: EligibilityConfig,
    #[serde(default = "default_vote_type")]
    pub vote_type: VoteTypeConfig,
}

fn default_eligibility() -> EligibilityConfig {
    EligibilityConfig::Open
}

fn default_vote_type() -> VoteTypeConfig {
    VoteTypeConfig::Single
}

/// Creates ballots and owns their lifecycle transitions.
pub struct BallotManager<S, W, I> {
    store: Arc<S>,
    witness: Arc<W>,
    issuer: Arc<I>,
    clock: Arc<dyn Clock>,
    config: PrestigeConfig,
    gate: BallotGate,
}

impl<S: Store, W: Witness, I: Issuer> BallotManager<S, W, I> {
    pub fn new(
        store: Arc<S>,
        witness: Arc<W>,
        issuer: Arc<I>,
        clock: Arc<dyn Clock>,
        config: PrestigeConfig,
    ) -> Result<Self, Error> {
        let gate = BallotGate::from_config(&config)?;
        Ok(BallotManager {
            store,
            witness,
            issuer,
            clock,
            config,
            gate,
        })
    }

    pub fn gate(&self) -> &BallotGate {
        &self.gate
    }

    /// Create a ballot under the configured ballot gate.
    ///
    /// A petition gate starts the ballot in `Petition` with zeroed deadlines;
    /// any other gate starts it in `Voting` with a deadline `duration` from
    /// now and a reveal deadline one reveal window after that.
    pub async fn create_ballot(
        &self,
        request: CreateBallotRequest,
        creator: PublicKey,
        proof: Option<&EligibilityToken>,
    ) -> Result<Ballot, Error> {
        if !self
            .gate
            .can_create(&creator, proof, self.issuer.as_ref())
            .await?
        {
            return Err(Error::NotAuthorized(self.gate.requirements()));
        }

        let choices: Vec<String> = request
            .choices
            .iter()
            .map(|choice| choice.trim().to_string())
            .collect();
        validate_question_and_choices(&request.question, &choices, &self.config)?;
        request.eligibility.validate()?;
        request.vote_type.validate(choices.len())?;

        let duration_ms = request
            .duration_minutes
            .map(|minutes| minutes * 60_000)
            .unwrap_or_else(|| self.config.default_ballot_duration_ms());
        if duration_ms < self.config.min_duration_ms() || duration_ms > self.config.max_duration_ms()
        {
            return Err(Error::ValidationError(format!(
                "duration must be between {} and {} minutes",
                self.config.min_duration_minutes, self.config.max_duration_minutes
            )));
        }

        let now = self.clock.now_ms();
        let is_petition = matches!(self.gate, BallotGate::Petition { .. });
        let (status, deadline_ms, reveal_deadline_ms) = if is_petition {
            (BallotStatus::Petition, 0, 0)
        } else {
            let deadline = now + duration_ms;
            (
                BallotStatus::Voting,
                deadline,
                deadline + self.config.reveal_window_ms(),
            )
        };

        let mut ballot = Ballot {
            id: Uuid::new_v4().to_string(),
            question: request.question,
            choices,
            created_ms: now,
            deadline_ms,
            reveal_deadline_ms,
            eligibility: request.eligibility,
            vote_type: request.vote_type,
            creator_public_key: creator,
            // Placeholder until the witness signs the canonical hash below
            attestation: WitnessAttestation {
                target_hash: Hash32::from_array([0; 32]),
                timestamp_seconds: 0,
                signatures: vec![],
                witness_ids: vec![],
                network_id: None,
                sequence: None,
            },
            status,
        };

        ballot.attestation = self.witness.attest(ballot.canonical_hash()).await?;
        self.store.save_ballot(&ballot).await?;
        info!(ballot_id = %ballot.id, status = ?ballot.status, "created ballot");
        Ok(ballot)
    }

    /// Load a ballot, persisting any phase transition the clock implies.
    pub async fn get_ballot(&self, ballot_id: &str) -> Result<Ballot, Error> {
        let ballot = self
            .store
            .get_ballot(ballot_id)
            .await?
            .ok_or_else(|| Error::BallotNotFound(ballot_id.to_string()))?;
        observe_phase(self.store.as_ref(), self.clock.as_ref(), ballot).await
    }

    pub async fn list_ballots(&self, filter: BallotFilter) -> Result<Vec<Ballot>, Error> {
        let mut observed = Vec::new();
        for ballot in self.store.list_ballots(filter).await? {
            observed.push(observe_phase(self.store.as_ref(), self.clock.as_ref(), ballot).await?);
        }
        Ok(observed)
    }

    /// Promote an activated petition to a live voting ballot.
    pub async fn activate(&self, ballot_id: &str) -> Result<Ballot, Error> {
        activate_ballot(
            self.store.as_ref(),
            self.clock.as_ref(),
            &self.config,
            ballot_id,
        )
        .await
    }
}

/// Persist the phase transition the clock implies, if any. `Petition` and
/// `Finalized` are sticky; time alone never leaves them.
pub async fn observe_phase<S: Store>(
    store: &S,
    clock: &dyn Clock,
    mut ballot: Ballot,
) -> Result<Ballot, Error> {
    let phase = ballot.phase_at(clock.now_ms());
    if phase != ballot.status {
        store.update_ballot_status(&ballot.id, phase).await?;
        info!(ballot_id = %ballot.id, from = ?ballot.status, to = ?phase, "ballot phase transition");
        ballot.status = phase;
    }
    Ok(ballot)
}

/// Petition activation: set real deadlines and move to `Voting`.
pub async fn activate_ballot<S: Store>(
    store: &S,
    clock: &dyn Clock,
    config: &PrestigeConfig,
    ballot_id: &str,
) -> Result<Ballot, Error> {
    let mut ballot = store
        .get_ballot(ballot_id)
        .await?
        .ok_or_else(|| Error::BallotNotFound(ballot_id.to_string()))?;

    if ballot.status != BallotStatus::Petition {
        return Err(Error::ValidationError(
            "only petition ballots can be activated".to_string(),
        ));
    }

    let deadline_ms = clock.now_ms() + config.default_ballot_duration_ms();
    let reveal_deadline_ms = deadline_ms + config.reveal_window_ms();
    store
        .update_ballot_deadlines(ballot_id, deadline_ms, reveal_deadline_ms)
        .await?;
    store
        .update_ballot_status(ballot_id, BallotStatus::Voting)
        .await?;

    ballot.deadline_ms = deadline_ms;
    ballot.reveal_deadline_ms = reveal_deadline_ms;
    ballot.status = BallotStatus::Voting;
    info!(ballot_id = %ballot.id, deadline_ms, "petition activated");
    Ok(ballot)
}
