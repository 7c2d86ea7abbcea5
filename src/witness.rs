use crate::*;

use async_trait::async_trait;
use ed25519_dalek::{ExpandedSecretKey, Keypair, PublicKey, Signature};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A BFT-signed claim that `target_hash` existed at `timestamp_seconds`.
///
/// The core treats attestations opaquely: only the timestamp and the witness
/// id set are consumed, signature checking is delegated back to the witness
/// collaborator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WitnessAttestation {
    pub target_hash: Hash32,
    pub timestamp_seconds: u64,
    pub signatures: Vec<WitnessSignature>,
    pub witness_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WitnessSignature {
    pub witness_id: String,
    #[serde(with = "EdSignatureHex")]
    pub signature: Signature,
}

impl WitnessAttestation {
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_seconds * 1000
    }
}

/// Timestamp witness collaborator.
#[async_trait]
pub trait Witness: Send + Sync {
    async fn attest(&self, hash: Hash32) -> Result<WitnessAttestation, Error>;
    async fn verify(&self, attestation: &WitnessAttestation) -> Result<bool, Error>;
    async fn health(&self) -> Result<bool, Error>;
}

/// In-memory witness quorum signing with local Ed25519 keys.
///
/// Attested messages are `target_hash ‖ timestamp_seconds (8-byte BE)`, the
/// same layout the production witness network signs.
pub struct MemWitness {
    keys: Vec<(String, Keypair)>,
    quorum: usize,
    clock: Arc<dyn Clock>,
}

impl MemWitness {
    pub fn new(num_witnesses: usize, quorum: usize, clock: Arc<dyn Clock>) -> Self {
        let mut csprng = rand::rngs::OsRng {};
        let keys = (0..num_witnesses)
            .map(|i| (format!("witness-{}", i), Keypair::generate(&mut csprng)))
            .collect();
        MemWitness { keys, quorum, clock }
    }

    /// Single-witness instance, the common test configuration.
    pub fn single(clock: Arc<dyn Clock>) -> Self {
        Self::new(1, 1, clock)
    }

    fn message(hash: &Hash32, timestamp_seconds: u64) -> Vec<u8> {
        let mut message = Vec::with_capacity(40);
        message.extend_from_slice(hash.as_bytes());
        message.extend_from_slice(&timestamp_seconds.to_be_bytes());
        message
    }

    fn public_keys(&self) -> HashMap<&str, &PublicKey> {
        self.keys
            .iter()
            .map(|(id, keypair)| (id.as_str(), &keypair.public))
            .collect()
    }
}

#[async_trait]
impl Witness for MemWitness {
    async fn attest(&self, hash: Hash32) -> Result<WitnessAttestation, Error> {
        let timestamp_seconds = self.clock.now_ms() / 1000;
        let message = Self::message(&hash, timestamp_seconds);

        let signatures = self
            .keys
            .iter()
            .map(|(id, keypair)| {
                let expanded: ExpandedSecretKey = (&keypair.secret).into();
                WitnessSignature {
                    witness_id: id.clone(),
                    signature: expanded.sign(&message, &keypair.public),
                }
            })
            .collect();

        Ok(WitnessAttestation {
            target_hash: hash,
            timestamp_seconds,
            signatures,
            witness_ids: self.keys.iter().map(|(id, _)| id.clone()).collect(),
            network_id: None,
            sequence: None,
        })
    }

    async fn verify(&self, attestation: &WitnessAttestation) -> Result<bool, Error> {
        let known = self.public_keys();
        let message = Self::message(&attestation.target_hash, attestation.timestamp_seconds);

        let mut valid = 0;
        for entry in &attestation.signatures {
            let public = match known.get(entry.witness_id.as_str()) {
                Some(public) => public,
                None => continue,
            };
            if public.verify_strict(&message, &entry.signature).is_ok() {
                valid += 1;
            }
        }

        Ok(valid >= self.quorum)
    }

    async fn health(&self) -> Result<bool, Error> {
        Ok(true)
    }
}

/// HTTP client for the external witness service.
pub struct HttpWitness {
    base_url: String,
    client: reqwest::Client,
}

impl HttpWitness {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("prestige: failed to build witness HTTP client");
        HttpWitness {
            base_url: base_url.into(),
            client,
        }
    }
}

#[derive(Serialize)]
struct AttestRequest<'a> {
    hash: &'a Hash32,
}

#[derive(Deserialize)]
struct VerifyResponse {
    ok: bool,
}

#[async_trait]
impl Witness for HttpWitness {
    async fn attest(&self, hash: Hash32) -> Result<WitnessAttestation, Error> {
        let url = format!("{}/attest", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&AttestRequest { hash: &hash })
            .send()
            .await
            .map_err(|e| Error::WitnessUnavailable(e.to_string()))?;

        response
            .error_for_status()
            .map_err(|e| Error::WitnessUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::WitnessUnavailable(e.to_string()))
    }

    async fn verify(&self, attestation: &WitnessAttestation) -> Result<bool, Error> {
        let url = format!("{}/verify", self.base_url);
        let response: VerifyResponse = self
            .client
            .post(&url)
            .json(attestation)
            .send()
            .await
            .map_err(|e| Error::WitnessUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::WitnessUnavailable(e.to_string()))?;

        Ok(response.ok)
    }

    async fn health(&self) -> Result<bool, Error> {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
