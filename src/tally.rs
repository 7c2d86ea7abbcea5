use crate::*;

use indexmap::IndexMap;
use std::sync::Arc;
use tracing::info;

/// One instant-runoff round: the per-choice counts among still-standing
/// choices and which choice was eliminated, if any. The winning round
/// carries no elimination; callers read the winner off its max-vote entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RankedRound {
    pub round: u32,
    pub votes: IndexMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eliminated: Option<String>,
}

/// The finalized, witness-attested outcome of a ballot.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BallotResult {
    pub ballot_id: String,
    pub tally: IndexMap<String, u64>,
    pub total_votes: u64,
    pub total_reveals: u64,
    pub valid_reveals: u64,
    pub attestation: WitnessAttestation,
    pub finalized_ms: u64,
    pub vote_type: VoteTypeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranked_choice_rounds: Option<Vec<RankedRound>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_scores: Option<IndexMap<String, f64>>,
}

/// Computes and persists ballot results.
pub struct Tallier<S, W> {
    store: Arc<S>,
    witness: Arc<W>,
    clock: Arc<dyn Clock>,
}

impl<S: Store, W: Witness> Tallier<S, W> {
    pub fn new(store: Arc<S>, witness: Arc<W>, clock: Arc<dyn Clock>) -> Self {
        Tallier {
            store,
            witness,
            clock,
        }
    }

    /// Compute the result once; subsequent calls return the stored result.
    ///
    /// Concurrent callers may race to compute. The store upsert decides the
    /// winner and every caller observes an equal payload modulo the
    /// attestation.
    pub async fn compute_result(&self, ballot_id: &str) -> Result<BallotResult, Error> {
        if let Some(result) = self.store.get_result(ballot_id).await? {
            return Ok(result);
        }

        let ballot = self
            .store
            .get_ballot(ballot_id)
            .await?
            .ok_or_else(|| Error::BallotNotFound(ballot_id.to_string()))?;
        let now = self.clock.now_ms();
        if ballot.phase_at(now) != BallotStatus::Finalized {
            return Err(Error::ValidationError(
                "ballot is not finalized yet".to_string(),
            ));
        }

        let votes = self.store.get_votes(ballot_id).await?;
        let reveals = self.store.get_reveals(ballot_id).await?;

        // Defensive recheck: a reveal only counts if its commitment still
        // matches the stored vote it claims to open.
        let valid: Vec<VoteData> = reveals
            .iter()
            .filter(|reveal| {
                votes
                    .iter()
                    .find(|vote| vote.nullifier == reveal.nullifier)
                    .map(|vote| {
                        verify_commitment(
                            &vote.commitment,
                            &reveal.effective_vote_data(),
                            &reveal.salt,
                        )
                    })
                    .unwrap_or(false)
            })
            .map(|reveal| reveal.effective_vote_data())
            .collect();

        let (tally, ranked_choice_rounds, average_scores) =
            tally_vote_data(&ballot.choices, &ballot.vote_type, &valid);

        let attestation = self
            .witness
            .attest(result_hash(
                ballot_id,
                &tally,
                votes.len() as u64,
                valid.len() as u64,
            ))
            .await?;

        let result = BallotResult {
            ballot_id: ballot_id.to_string(),
            tally,
            total_votes: votes.len() as u64,
            total_reveals: reveals.len() as u64,
            valid_reveals: valid.len() as u64,
            attestation,
            finalized_ms: now,
            vote_type: ballot.vote_type.clone(),
            ranked_choice_rounds,
            average_scores,
        };

        self.store.save_result(&result).await?;
        if ballot.status != BallotStatus::Finalized {
            self.store
                .update_ballot_status(ballot_id, BallotStatus::Finalized)
                .await?;
        }
        info!(ballot_id, total = result.total_votes, valid = result.valid_reveals, "ballot tallied");
        Ok(result)
    }
}

/// `H(ballot_id, canonical_json(tally), total_votes, valid_reveals)` with
/// the counters as decimal strings.
pub(crate) fn result_hash(
    ballot_id: &str,
    tally: &IndexMap<String, u64>,
    total_votes: u64,
    valid_reveals: u64,
) -> Hash32 {
    let canonical = serde_json::to_string(
        &serde_json::to_value(tally).expect("prestige: tally cannot fail to serialize"),
    )
    .expect("prestige: tally cannot fail to serialize");
    hash_concat(&[
        ballot_id.as_bytes(),
        canonical.as_bytes(),
        total_votes.to_string().as_bytes(),
        valid_reveals.to_string().as_bytes(),
    ])
}

type TallyOutput = (
    IndexMap<String, u64>,
    Option<Vec<RankedRound>>,
    Option<IndexMap<String, f64>>,
);

fn tally_vote_data(
    choices: &[String],
    vote_type: &VoteTypeConfig,
    reveals: &[VoteData],
) -> TallyOutput {
    match vote_type {
        VoteTypeConfig::Single => (tally_single(choices, reveals), None, None),
        VoteTypeConfig::Approval => (tally_approval(choices, reveals), None, None),
        VoteTypeConfig::Ranked { .. } => {
            let (tally, rounds) = tally_ranked(choices, reveals);
            (tally, Some(rounds), None)
        }
        VoteTypeConfig::Score { .. } => {
            let (tally, averages) = tally_score(choices, reveals);
            (tally, None, Some(averages))
        }
    }
}

fn zeroed(choices: &[String]) -> IndexMap<String, u64> {
    choices.iter().map(|choice| (choice.clone(), 0)).collect()
}

fn tally_single(choices: &[String], reveals: &[VoteData]) -> IndexMap<String, u64> {
    let mut tally = zeroed(choices);
    for reveal in reveals {
        if let VoteData::Single { choice } = reveal {
            if let Some(count) = tally.get_mut(choice) {
                *count += 1;
            }
        }
    }
    tally
}

fn tally_approval(choices: &[String], reveals: &[VoteData]) -> IndexMap<String, u64> {
    let mut tally = zeroed(choices);
    for reveal in reveals {
        if let VoteData::Approval { choices: approved } = reveal {
            for choice in approved {
                if let Some(count) = tally.get_mut(choice) {
                    *count += 1;
                }
            }
        }
    }
    tally
}

/// Instant-runoff: each round counts first preferences among remaining
/// choices, stops on a majority, otherwise eliminates the lowest count with
/// ties broken by ASCII order of the choice name.
fn tally_ranked(choices: &[String], reveals: &[VoteData]) -> (IndexMap<String, u64>, Vec<RankedRound>) {
    let rankings: Vec<&Vec<String>> = reveals
        .iter()
        .filter_map(|reveal| match reveal {
            VoteData::Ranked { rankings } => Some(rankings),
            _ => None,
        })
        .collect();

    let mut remaining: Vec<String> = choices.to_vec();
    let mut rounds: Vec<RankedRound> = Vec::new();
    // Safety cap against a loop that fails to converge
    let max_rounds = choices.len() + 1;

    for round in 1..=max_rounds as u32 {
        let mut votes: IndexMap<String, u64> =
            remaining.iter().map(|choice| (choice.clone(), 0)).collect();
        for ranking in &rankings {
            if let Some(first) = ranking.iter().find(|choice| remaining.contains(choice)) {
                *votes.get_mut(first).expect("prestige: counted choice must remain") += 1;
            }
        }

        let total: u64 = votes.values().sum();
        let majority_needed = total / 2 + 1;
        let top = votes.values().max().copied().unwrap_or(0);

        if top >= majority_needed || remaining.len() <= 1 {
            rounds.push(RankedRound {
                round,
                votes: votes.clone(),
                eliminated: None,
            });
            let mut tally = zeroed(choices);
            for (choice, count) in votes {
                tally.insert(choice, count);
            }
            return (tally, rounds);
        }

        let lowest = votes.values().min().copied().unwrap_or(0);
        let eliminated = votes
            .iter()
            .filter(|(_, count)| **count == lowest)
            .map(|(choice, _)| choice.clone())
            .min()
            .expect("prestige: a non-winning round always has a lowest choice");

        remaining.retain(|choice| choice != &eliminated);
        rounds.push(RankedRound {
            round,
            votes,
            eliminated: Some(eliminated),
        });
    }

    // Cap reached: report the standing of the last recorded round.
    let mut tally = zeroed(choices);
    if let Some(last) = rounds.last() {
        for (choice, count) in &last.votes {
            tally.insert(choice.clone(), *count);
        }
    }
    (tally, rounds)
}

/// Primary tally is the per-choice score sum; averages ride alongside.
fn tally_score(
    choices: &[String],
    reveals: &[VoteData],
) -> (IndexMap<String, u64>, IndexMap<String, f64>) {
    let mut sums = zeroed(choices);
    let mut counts: IndexMap<String, u64> = zeroed(choices);

    for reveal in reveals {
        if let VoteData::Score { scores } = reveal {
            for (choice, score) in scores {
                if let Some(sum) = sums.get_mut(choice) {
                    *sum += *score as u64;
                    *counts.get_mut(choice).expect("prestige: sums and counts share keys") += 1;
                }
            }
        }
    }

    let averages = choices
        .iter()
        .map(|choice| {
            let count = counts[choice];
            let average = if count > 0 {
                sums[choice] as f64 / count as f64
            } else {
                0.0
            };
            (choice.clone(), average)
        })
        .collect();

    (sums, averages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn choices(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn ranked(names: &[&str]) -> VoteData {
        VoteData::Ranked {
            rankings: names.iter().map(|name| name.to_string()).collect(),
        }
    }

    #[test]
    fn single_tally_counts_and_zeroes() {
        let choices = choices(&["R", "B", "G"]);
        let reveals: Vec<VoteData> = ["R", "R", "B"]
            .iter()
            .map(|choice| VoteData::Single {
                choice: choice.to_string(),
            })
            .collect();

        let tally = tally_single(&choices, &reveals);
        assert_eq!(tally["R"], 2);
        assert_eq!(tally["B"], 1);
        assert_eq!(tally["G"], 0);
        assert_eq!(tally.values().sum::<u64>(), reveals.len() as u64);
    }

    #[test]
    fn approval_tally_counts_memberships() {
        let choices = choices(&["A", "B", "C"]);
        let reveals = vec![
            VoteData::Approval {
                choices: vec!["A".to_string(), "B".to_string()],
            },
            VoteData::Approval {
                choices: vec!["B".to_string()],
            },
        ];

        let tally = tally_approval(&choices, &reveals);
        assert_eq!(tally["A"], 1);
        assert_eq!(tally["B"], 2);
        assert_eq!(tally["C"], 0);
    }

    #[test]
    fn instant_runoff_eliminates_and_finds_majority() {
        // Round 1: A:2 B:2 C:1, eliminate C; round 2: A:3 B:2, A wins.
        let choices = choices(&["A", "B", "C"]);
        let reveals = vec![
            ranked(&["A", "B"]),
            ranked(&["B", "C"]),
            ranked(&["C", "A"]),
            ranked(&["A", "C"]),
            ranked(&["B", "A"]),
        ];

        let (tally, rounds) = tally_ranked(&choices, &reveals);
        assert_eq!(rounds.len(), 2);

        assert_eq!(rounds[0].votes["A"], 2);
        assert_eq!(rounds[0].votes["B"], 2);
        assert_eq!(rounds[0].votes["C"], 1);
        assert_eq!(rounds[0].eliminated.as_deref(), Some("C"));

        assert_eq!(rounds[1].votes["A"], 3);
        assert_eq!(rounds[1].votes["B"], 2);
        assert_eq!(rounds[1].eliminated, None);

        assert_eq!(tally["A"], 3);
        assert_eq!(tally["B"], 2);
        assert_eq!(tally["C"], 0);
    }

    #[test]
    fn instant_runoff_tie_breaks_by_ascii_order() {
        let choices = choices(&["B", "A", "C"]);
        // Everyone's first choice survives; A and B tie at the bottom.
        let reveals = vec![ranked(&["A"]), ranked(&["B"]), ranked(&["C"]), ranked(&["C"])];

        let (_, rounds) = tally_ranked(&choices, &reveals);
        assert_eq!(rounds[0].eliminated.as_deref(), Some("A"));
    }

    #[test]
    fn instant_runoff_is_deterministic() {
        let choices = choices(&["A", "B", "C", "D"]);
        let reveals = vec![
            ranked(&["A", "B", "C"]),
            ranked(&["B", "C", "D"]),
            ranked(&["C", "D", "A"]),
            ranked(&["D", "A", "B"]),
            ranked(&["A", "C"]),
        ];

        let first = tally_ranked(&choices, &reveals);
        let second = tally_ranked(&choices, &reveals);
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn score_tally_sums_and_averages() {
        let choices = choices(&["A", "B"]);
        let mut one = IndexMap::new();
        one.insert("A".to_string(), 4i64);
        one.insert("B".to_string(), 2i64);
        let mut two = IndexMap::new();
        two.insert("A".to_string(), 8i64);

        let reveals = vec![VoteData::Score { scores: one }, VoteData::Score { scores: two }];
        let (sums, averages) = tally_score(&choices, &reveals);

        assert_eq!(sums["A"], 12);
        assert_eq!(sums["B"], 2);
        assert!((averages["A"] - 6.0).abs() < f64::EPSILON);
        assert!((averages["B"] - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn score_average_is_zero_without_scores() {
        let choices = choices(&["A", "B"]);
        let (sums, averages) = tally_score(&choices, &[]);
        assert_eq!(sums["A"], 0);
        assert!((averages["B"] - 0.0).abs() < f64::EPSILON);
    }
}
