//! Epidemic distribution of votes, reveals, ballots and results.
//!
//! Gossip runs alongside the admission path, never inside it: handlers
//! observe storage through the same store interface and keep their own
//! nullifier cache for double-vote detection. Misbehaving peers lose score
//! until their messages are silently dropped.

use crate::*;

use ed25519_dalek::{ExpandedSecretKey, Keypair, PublicKey, SecretKey, Signature};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Vote,
    Reveal,
    Ballot,
    Result,
}

/// A signed gossip message.
///
/// The signature covers the canonical JSON (object keys sorted ascending) of
/// `{type, payload, nonce, timestamp_ms}` under the in-envelope sender key.
/// A relay-attached peer id never participates in signature checking.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub payload: serde_json::Value,
    #[serde(rename = "sender", with = "EdPublicKeyHex")]
    pub sender_pk: PublicKey,
    #[serde(with = "EdSignatureHex")]
    pub signature: Signature,
    #[serde(with = "Bytes16Hex")]
    pub nonce: [u8; 16],
    pub timestamp_ms: u64,
}

impl Envelope {
    pub fn sign(
        secret: &SecretKey,
        sender: PublicKey,
        msg_type: MessageType,
        payload: serde_json::Value,
        timestamp_ms: u64,
    ) -> Envelope {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill(&mut nonce);

        let message = Envelope::signing_bytes(msg_type, &payload, &nonce, timestamp_ms);
        let expanded: ExpandedSecretKey = secret.into();
        let signature = expanded.sign(&message, &sender);

        Envelope {
            msg_type,
            payload,
            sender_pk: sender,
            signature,
            nonce,
            timestamp_ms,
        }
    }

    pub fn verify(&self) -> Result<(), Error> {
        let message =
            Envelope::signing_bytes(self.msg_type, &self.payload, &self.nonce, self.timestamp_ms);
        self.sender_pk
            .verify_strict(&message, &self.signature)
            .map_err(|_| Error::InvalidSignature)
    }

    fn signing_bytes(
        msg_type: MessageType,
        payload: &serde_json::Value,
        nonce: &[u8; 16],
        timestamp_ms: u64,
    ) -> Vec<u8> {
        // serde_json maps are sorted, which makes this canonical
        let value = serde_json::json!({
            "type": msg_type,
            "payload": payload,
            "nonce": hex::encode(nonce),
            "timestamp_ms": timestamp_ms,
        });
        serde_json::to_vec(&value).expect("prestige: envelope cannot fail to serialize")
    }
}

/// Why a peer is being penalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Penalty {
    InvalidSignature,
    UnknownBallot,
    InvalidProof,
    InvalidAttestation,
    TooLate,
    DoubleVote,
    Duplicate,
    WrongPhase,
    NoMatchingVote,
    InvalidReveal,
}

impl PenaltyConfig {
    pub fn amount(&self, penalty: Penalty) -> i64 {
        match penalty {
            Penalty::InvalidSignature => self.invalid_signature,
            Penalty::UnknownBallot => self.unknown_ballot,
            Penalty::InvalidProof => self.invalid_proof,
            Penalty::InvalidAttestation => self.invalid_attestation,
            Penalty::TooLate => self.too_late,
            Penalty::DoubleVote => self.double_vote,
            Penalty::Duplicate => self.duplicate,
            Penalty::WrongPhase => self.wrong_phase,
            Penalty::NoMatchingVote => self.no_matching_vote,
            Penalty::InvalidReveal => self.invalid_reveal,
        }
    }
}

const INITIAL_PEER_SCORE: i64 = 100;

/// Per-peer reputation. Scores start at 100, are capped there, and peers
/// below the threshold are silently ignored. There is no decay and no
/// forgiveness beyond the +1 per accepted message.
pub struct PeerScores {
    scores: HashMap<String, i64>,
    config: GossipConfig,
}

impl PeerScores {
    pub fn new(config: GossipConfig) -> Self {
        PeerScores {
            scores: HashMap::new(),
            config,
        }
    }

    pub fn score(&self, peer_id: &str) -> i64 {
        self.scores
            .get(peer_id)
            .copied()
            .unwrap_or(INITIAL_PEER_SCORE)
    }

    pub fn penalize(&mut self, peer_id: &str, penalty: Penalty) -> i64 {
        let amount = self.config.penalties.amount(penalty);
        let score = self
            .scores
            .entry(peer_id.to_string())
            .or_insert(INITIAL_PEER_SCORE);
        *score -= amount;
        debug!(peer_id, ?penalty, score = *score, "penalized peer");
        *score
    }

    pub fn reward(&mut self, peer_id: &str) -> i64 {
        let score = self
            .scores
            .entry(peer_id.to_string())
            .or_insert(INITIAL_PEER_SCORE);
        *score = (*score + 1).min(INITIAL_PEER_SCORE);
        *score
    }

    pub fn is_banned(&self, peer_id: &str) -> bool {
        self.score(peer_id) < self.config.score_threshold
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub commitment: Hash32,
    pub timestamp_ms: u64,
    /// How many peers have relayed this exact vote.
    pub peer_count: u32,
}

/// Bounded map of observed `(ballot_id, nullifier)` pairs.
pub struct NullifierCache {
    entries: HashMap<(String, Hash32), CacheEntry>,
    config: GossipConfig,
}

impl NullifierCache {
    pub fn new(config: GossipConfig) -> Self {
        NullifierCache {
            entries: HashMap::new(),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_mut(&mut self, ballot_id: &str, nullifier: &Hash32) -> Option<&mut CacheEntry> {
        self.entries
            .get_mut(&(ballot_id.to_string(), *nullifier))
    }

    pub fn insert(&mut self, ballot_id: &str, nullifier: Hash32, commitment: Hash32, now_ms: u64) {
        self.entries.insert(
            (ballot_id.to_string(), nullifier),
            CacheEntry {
                commitment,
                timestamp_ms: now_ms,
                peer_count: 1,
            },
        );
    }

    /// Drop expired entries first; if still over the cap, drop oldest-first.
    /// Returns how many entries were removed.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();

        let max_age_ms = self.config.max_age_ms;
        self.entries
            .retain(|_, entry| now_ms.saturating_sub(entry.timestamp_ms) <= max_age_ms);

        if self.entries.len() > self.config.max_nullifiers {
            let excess = self.entries.len() - self.config.max_nullifiers;
            let mut by_age: Vec<((String, Hash32), u64)> = self
                .entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.timestamp_ms))
                .collect();
            by_age.sort_by_key(|(_, timestamp_ms)| *timestamp_ms);
            for (key, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }

        before - self.entries.len()
    }
}

/// One gossip participant: verifies incoming envelopes, applies the receipt
/// rules, scores peers and rebroadcasts novel messages.
pub struct GossipNode<S, I, W, R> {
    store: Arc<S>,
    issuer: Arc<I>,
    witness: Arc<W>,
    relay: Arc<R>,
    clock: Arc<dyn Clock>,
    config: PrestigeConfig,
    keypair: Keypair,
    scores: Mutex<PeerScores>,
    cache: Mutex<NullifierCache>,
}

impl<S, I, W, R> GossipNode<S, I, W, R>
where
    S: Store,
    I: Issuer,
    W: Witness,
    R: Relay,
{
    pub fn new(
        store: Arc<S>,
        issuer: Arc<I>,
        witness: Arc<W>,
        relay: Arc<R>,
        clock: Arc<dyn Clock>,
        config: PrestigeConfig,
        keypair: Keypair,
    ) -> Self {
        let scores = Mutex::new(PeerScores::new(config.gossip.clone()));
        let cache = Mutex::new(NullifierCache::new(config.gossip.clone()));
        GossipNode {
            store,
            issuer,
            witness,
            relay,
            clock,
            config,
            keypair,
            scores,
            cache,
        }
    }

    pub async fn peer_score(&self, peer_id: &str) -> i64 {
        self.scores.lock().await.score(peer_id)
    }

    pub async fn cached_nullifiers(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Handle one envelope from one peer. Protocol violations penalize the
    /// peer and drop the message; only infrastructure failures surface.
    pub async fn handle_envelope(&self, envelope: Envelope, from_peer: &str) -> Result<(), Error> {
        if self.scores.lock().await.is_banned(from_peer) {
            debug!(from_peer, "dropping message from banned peer");
            return Ok(());
        }

        if envelope.verify().is_err() {
            self.penalize(from_peer, Penalty::InvalidSignature).await;
            return Ok(());
        }

        match envelope.msg_type {
            MessageType::Vote => self.receive_vote(envelope, from_peer).await,
            MessageType::Reveal => self.receive_reveal(envelope, from_peer).await,
            MessageType::Ballot => self.receive_ballot(envelope, from_peer).await,
            MessageType::Result => self.receive_result(envelope, from_peer).await,
        }
    }

    async fn receive_vote(&self, envelope: Envelope, from_peer: &str) -> Result<(), Error> {
        let vote: Vote = match serde_json::from_value(envelope.payload.clone()) {
            Ok(vote) => vote,
            Err(_) => {
                self.penalize(from_peer, Penalty::InvalidSignature).await;
                return Ok(());
            }
        };

        let ballot = match self.store.get_ballot(&vote.ballot_id).await? {
            Some(ballot) => ballot,
            None => {
                self.penalize(from_peer, Penalty::UnknownBallot).await;
                return Ok(());
            }
        };
        if ballot.status == BallotStatus::Petition {
            self.penalize(from_peer, Penalty::WrongPhase).await;
            return Ok(());
        }

        if !self.issuer.verify(&vote.proof).await? {
            self.penalize(from_peer, Penalty::InvalidProof).await;
            return Ok(());
        }
        if !self.witness.verify(&vote.attestation).await? {
            self.penalize(from_peer, Penalty::InvalidAttestation).await;
            return Ok(());
        }
        if vote.attestation.timestamp_ms() > ballot.deadline_ms {
            self.penalize(from_peer, Penalty::TooLate).await;
            return Ok(());
        }

        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get_mut(&vote.ballot_id, &vote.nullifier) {
                if entry.commitment.ct_eq(&vote.commitment) {
                    // Same vote seen again through another peer
                    entry.peer_count += 1;
                    self.penalize(from_peer, Penalty::Duplicate).await;
                } else {
                    warn!(
                        ballot_id = %vote.ballot_id,
                        nullifier = %vote.nullifier,
                        from_peer,
                        "double vote detected: conflicting commitments for one nullifier"
                    );
                    self.penalize(from_peer, Penalty::DoubleVote).await;
                }
                return Ok(());
            }
            cache.insert(
                &vote.ballot_id,
                vote.nullifier,
                vote.commitment,
                self.clock.now_ms(),
            );
        }

        self.store.save_vote(&vote).await?;
        self.scores.lock().await.reward(from_peer);
        self.rebroadcast(&envelope).await;
        Ok(())
    }

    async fn receive_reveal(&self, envelope: Envelope, from_peer: &str) -> Result<(), Error> {
        let reveal: Reveal = match serde_json::from_value(envelope.payload.clone()) {
            Ok(reveal) => reveal,
            Err(_) => {
                self.penalize(from_peer, Penalty::InvalidSignature).await;
                return Ok(());
            }
        };

        let ballot = match self.store.get_ballot(&reveal.ballot_id).await? {
            Some(ballot) => ballot,
            None => {
                self.penalize(from_peer, Penalty::UnknownBallot).await;
                return Ok(());
            }
        };
        if ballot.phase_at(self.clock.now_ms()) != BallotStatus::Revealing {
            self.penalize(from_peer, Penalty::WrongPhase).await;
            return Ok(());
        }

        let vote = match self.store.get_vote(&reveal.ballot_id, &reveal.nullifier).await? {
            Some(vote) => vote,
            None => {
                self.penalize(from_peer, Penalty::NoMatchingVote).await;
                return Ok(());
            }
        };

        let effective = reveal.effective_vote_data();
        if validate_vote_data(&ballot, &effective).is_err()
            || !verify_commitment(&vote.commitment, &effective, &reveal.salt)
        {
            self.penalize(from_peer, Penalty::InvalidReveal).await;
            return Ok(());
        }

        if !self.store.save_reveal(&reveal).await? {
            self.penalize(from_peer, Penalty::Duplicate).await;
            return Ok(());
        }

        self.scores.lock().await.reward(from_peer);
        self.rebroadcast(&envelope).await;
        Ok(())
    }

    async fn receive_ballot(&self, envelope: Envelope, from_peer: &str) -> Result<(), Error> {
        let ballot: Ballot = match serde_json::from_value(envelope.payload.clone()) {
            Ok(ballot) => ballot,
            Err(_) => {
                self.penalize(from_peer, Penalty::InvalidSignature).await;
                return Ok(());
            }
        };

        if self.store.get_ballot(&ballot.id).await?.is_some() {
            self.penalize(from_peer, Penalty::Duplicate).await;
            return Ok(());
        }

        if ballot.validate(&self.config).is_err() {
            self.penalize(from_peer, Penalty::InvalidSignature).await;
            return Ok(());
        }
        if !self.witness.verify(&ballot.attestation).await?
            || !ballot.attestation.target_hash.ct_eq(&ballot.canonical_hash())
        {
            self.penalize(from_peer, Penalty::InvalidAttestation).await;
            return Ok(());
        }

        self.store.save_ballot(&ballot).await?;
        info!(ballot_id = %ballot.id, from_peer, "adopted gossiped ballot");
        self.scores.lock().await.reward(from_peer);
        self.rebroadcast(&envelope).await;
        Ok(())
    }

    async fn receive_result(&self, envelope: Envelope, from_peer: &str) -> Result<(), Error> {
        let result: BallotResult = match serde_json::from_value(envelope.payload.clone()) {
            Ok(result) => result,
            Err(_) => {
                self.penalize(from_peer, Penalty::InvalidSignature).await;
                return Ok(());
            }
        };

        if self.store.get_ballot(&result.ballot_id).await?.is_none() {
            self.penalize(from_peer, Penalty::UnknownBallot).await;
            return Ok(());
        }

        let expected = crate::tally::result_hash(
            &result.ballot_id,
            &result.tally,
            result.total_votes,
            result.valid_reveals,
        );
        if !self.witness.verify(&result.attestation).await?
            || !result.attestation.target_hash.ct_eq(&expected)
        {
            self.penalize(from_peer, Penalty::InvalidAttestation).await;
            return Ok(());
        }

        if self.store.get_result(&result.ballot_id).await?.is_some() {
            self.penalize(from_peer, Penalty::Duplicate).await;
            return Ok(());
        }

        self.store.save_result(&result).await?;
        self.scores.lock().await.reward(from_peer);
        self.rebroadcast(&envelope).await;
        Ok(())
    }

    /// Announce a locally admitted vote. Seeds our own cache so the same
    /// vote echoing back is recognized as a duplicate, not a double vote.
    pub async fn announce_vote(&self, vote: &Vote) -> Result<(), Error> {
        self.cache.lock().await.insert(
            &vote.ballot_id,
            vote.nullifier,
            vote.commitment,
            self.clock.now_ms(),
        );
        self.announce(MessageType::Vote, serde_json::to_value(vote).unwrap_or_default())
            .await
    }

    pub async fn announce_reveal(&self, reveal: &Reveal) -> Result<(), Error> {
        self.announce(
            MessageType::Reveal,
            serde_json::to_value(reveal).unwrap_or_default(),
        )
        .await
    }

    pub async fn announce_ballot(&self, ballot: &Ballot) -> Result<(), Error> {
        self.announce(
            MessageType::Ballot,
            serde_json::to_value(ballot).unwrap_or_default(),
        )
        .await
    }

    pub async fn announce_result(&self, result: &BallotResult) -> Result<(), Error> {
        self.announce(
            MessageType::Result,
            serde_json::to_value(result).unwrap_or_default(),
        )
        .await
    }

    async fn announce(&self, msg_type: MessageType, payload: serde_json::Value) -> Result<(), Error> {
        let envelope = Envelope::sign(
            &self.keypair.secret,
            self.keypair.public,
            msg_type,
            payload,
            self.clock.now_ms(),
        );
        self.relay.broadcast(&envelope).await
    }

    async fn rebroadcast(&self, envelope: &Envelope) {
        if let Err(error) = self.relay.broadcast(envelope).await {
            warn!(error = %error, "failed to rebroadcast gossip message");
        }
    }

    async fn penalize(&self, peer_id: &str, penalty: Penalty) {
        self.scores.lock().await.penalize(peer_id, penalty);
    }

    /// Periodic cache pruning; the handle aborts with the owner.
    pub fn spawn_pruner(self: &Arc<Self>) -> JoinHandle<()>
    where
        S: 'static,
        I: 'static,
        W: 'static,
        R: 'static,
    {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(node.config.gossip.prune_interval_ms));
            loop {
                ticker.tick().await;
                let removed = node.cache.lock().await.prune(node.clock.now_ms());
                if removed > 0 {
                    debug!(removed, "pruned nullifier cache");
                }
            }
        })
    }
}
