use crate::*;

use async_trait::async_trait;
use ed25519_dalek::PublicKey;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Error)]
#[error("prestige: store error: {0}")]
pub struct StoreError(pub String);

/// Filter for ballot listings.
#[derive(Debug, Default, Clone)]
pub struct BallotFilter {
    pub status: Option<BallotStatus>,
    pub limit: Option<usize>,
}

/// The persistence boundary.
///
/// The store owns every persistent entity. Its unique constraints on
/// `(ballot_id, nullifier)` pairs are the ground truth for double-vote and
/// double-reveal suppression; the `save_*` operations that carry them return
/// `false` instead of erroring when a duplicate is ignored.
#[async_trait]
pub trait Store: Send + Sync {
    // Ballots
    async fn save_ballot(&self, ballot: &Ballot) -> Result<(), StoreError>;
    async fn get_ballot(&self, id: &str) -> Result<Option<Ballot>, StoreError>;
    async fn list_ballots(&self, filter: BallotFilter) -> Result<Vec<Ballot>, StoreError>;
    async fn update_ballot_status(&self, id: &str, status: BallotStatus) -> Result<(), StoreError>;
    async fn update_ballot_deadlines(
        &self,
        id: &str,
        deadline_ms: u64,
        reveal_deadline_ms: u64,
    ) -> Result<(), StoreError>;

    // Votes, unique on (ballot_id, nullifier)
    async fn save_vote(&self, vote: &Vote) -> Result<bool, StoreError>;
    async fn get_votes(&self, ballot_id: &str) -> Result<Vec<Vote>, StoreError>;
    async fn get_vote(&self, ballot_id: &str, nullifier: &Hash32)
        -> Result<Option<Vote>, StoreError>;
    async fn has_nullifier(&self, ballot_id: &str, nullifier: &Hash32) -> Result<bool, StoreError>;

    // Reveals, unique on (ballot_id, nullifier)
    async fn save_reveal(&self, reveal: &Reveal) -> Result<bool, StoreError>;
    async fn get_reveals(&self, ballot_id: &str) -> Result<Vec<Reveal>, StoreError>;
    async fn get_reveal(
        &self,
        ballot_id: &str,
        nullifier: &Hash32,
    ) -> Result<Option<Reveal>, StoreError>;

    // Results (upsert)
    async fn save_result(&self, result: &BallotResult) -> Result<(), StoreError>;
    async fn get_result(&self, ballot_id: &str) -> Result<Option<BallotResult>, StoreError>;

    // Petition signatures, unique on (ballot_id, public_key)
    async fn save_petition_signature(
        &self,
        signature: &PetitionSignature,
    ) -> Result<bool, StoreError>;
    async fn get_petition_signatures(
        &self,
        ballot_id: &str,
    ) -> Result<Vec<PetitionSignature>, StoreError>;
    async fn has_petition_signature(
        &self,
        ballot_id: &str,
        public_key: &PublicKey,
    ) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct MemStoreInner {
    ballots: BTreeMap<String, Ballot>,
    votes: BTreeMap<String, Vote>,
    reveals: BTreeMap<String, Reveal>,
    results: BTreeMap<String, BallotResult>,
    petition_signatures: BTreeMap<String, PetitionSignature>,
}

/// A simple store that uses in-memory BTreeMaps.
///
/// Keys for the nullifier-scoped tables are `"{ballot_id}/{nullifier_hex}"`,
/// so per-ballot listings are prefix range scans. All mutations happen under
/// a single writer lock, which gives the uniqueness constraints their
/// check-then-insert atomicity.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<MemStoreInner>,
}

fn scoped_key(ballot_id: &str, suffix: &str) -> String {
    format!("{}/{}", ballot_id, suffix)
}

fn prefix_scan<'a, T: Clone>(map: &'a BTreeMap<String, T>, ballot_id: &str) -> Vec<T> {
    let prefix = format!("{}/", ballot_id);
    map.range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .map(|(_, value)| value.clone())
        .collect()
}

#[async_trait]
impl Store for MemStore {
    async fn save_ballot(&self, ballot: &Ballot) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.ballots.insert(ballot.id.clone(), ballot.clone());
        Ok(())
    }

    async fn get_ballot(&self, id: &str) -> Result<Option<Ballot>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.ballots.get(id).cloned())
    }

    async fn list_ballots(&self, filter: BallotFilter) -> Result<Vec<Ballot>, StoreError> {
        let inner = self.inner.read().await;
        let ballots = inner
            .ballots
            .values()
            .filter(|ballot| match filter.status {
                Some(status) => ballot.status == status,
                None => true,
            })
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(ballots)
    }

    async fn update_ballot_status(&self, id: &str, status: BallotStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let ballot = inner
            .ballots
            .get_mut(id)
            .ok_or_else(|| StoreError(format!("no such ballot: {}", id)))?;
        ballot.status = status;
        Ok(())
    }

    async fn update_ballot_deadlines(
        &self,
        id: &str,
        deadline_ms: u64,
        reveal_deadline_ms: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let ballot = inner
            .ballots
            .get_mut(id)
            .ok_or_else(|| StoreError(format!("no such ballot: {}", id)))?;
        ballot.deadline_ms = deadline_ms;
        ballot.reveal_deadline_ms = reveal_deadline_ms;
        Ok(())
    }

    async fn save_vote(&self, vote: &Vote) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let key = scoped_key(&vote.ballot_id, &vote.nullifier.to_hex());
        if inner.votes.contains_key(&key) {
            return Ok(false);
        }
        inner.votes.insert(key, vote.clone());
        Ok(true)
    }

    async fn get_votes(&self, ballot_id: &str) -> Result<Vec<Vote>, StoreError> {
        let inner = self.inner.read().await;
        Ok(prefix_scan(&inner.votes, ballot_id))
    }

    async fn get_vote(
        &self,
        ballot_id: &str,
        nullifier: &Hash32,
    ) -> Result<Option<Vote>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .votes
            .get(&scoped_key(ballot_id, &nullifier.to_hex()))
            .cloned())
    }

    async fn has_nullifier(&self, ballot_id: &str, nullifier: &Hash32) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .votes
            .contains_key(&scoped_key(ballot_id, &nullifier.to_hex())))
    }

    async fn save_reveal(&self, reveal: &Reveal) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let key = scoped_key(&reveal.ballot_id, &reveal.nullifier.to_hex());
        if inner.reveals.contains_key(&key) {
            return Ok(false);
        }
        inner.reveals.insert(key, reveal.clone());
        Ok(true)
    }

    async fn get_reveals(&self, ballot_id: &str) -> Result<Vec<Reveal>, StoreError> {
        let inner = self.inner.read().await;
        Ok(prefix_scan(&inner.reveals, ballot_id))
    }

    async fn get_reveal(
        &self,
        ballot_id: &str,
        nullifier: &Hash32,
    ) -> Result<Option<Reveal>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .reveals
            .get(&scoped_key(ballot_id, &nullifier.to_hex()))
            .cloned())
    }

    async fn save_result(&self, result: &BallotResult) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .results
            .insert(result.ballot_id.clone(), result.clone());
        Ok(())
    }

    async fn get_result(&self, ballot_id: &str) -> Result<Option<BallotResult>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.results.get(ballot_id).cloned())
    }

    async fn save_petition_signature(
        &self,
        signature: &PetitionSignature,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let key = scoped_key(
            &signature.ballot_id,
            &hex::encode(signature.public_key.as_bytes()),
        );
        if inner.petition_signatures.contains_key(&key) {
            return Ok(false);
        }
        inner.petition_signatures.insert(key, signature.clone());
        Ok(true)
    }

    async fn get_petition_signatures(
        &self,
        ballot_id: &str,
    ) -> Result<Vec<PetitionSignature>, StoreError> {
        let inner = self.inner.read().await;
        Ok(prefix_scan(&inner.petition_signatures, ballot_id))
    }

    async fn has_petition_signature(
        &self,
        ballot_id: &str,
        public_key: &PublicKey,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .petition_signatures
            .contains_key(&scoped_key(ballot_id, &hex::encode(public_key.as_bytes()))))
    }
}
