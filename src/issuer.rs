use crate::*;

use async_trait::async_trait;
use p256::Scalar;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// An issuer response usable as an unlinkable eligibility proof.
///
/// `token_bytes` is the raw `A ‖ B ‖ π` evaluation; it travels base64url
/// (unpadded) at service boundaries.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EligibilityToken {
    #[serde(with = "crate::serde_hex::base64url")]
    pub token_bytes: Vec<u8>,
    #[serde(with = "crate::serde_hex::base64url")]
    pub issuer_public_key: Vec<u8>,
    pub expires_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

impl EligibilityToken {
    pub fn token_b64(&self) -> String {
        base64::encode_config(&self.token_bytes, base64::URL_SAFE_NO_PAD)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct IssuerMetadata {
    pub issuer_id: String,
    pub voprf: VoprfMetadata,
    pub current_epoch: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct VoprfMetadata {
    pub pubkey: String,
}

/// Eligibility issuer collaborator. The PRF private key lives on the other
/// side of this interface and is never held here.
#[async_trait]
pub trait Issuer: Send + Sync {
    async fn metadata(&self) -> Result<IssuerMetadata, Error>;

    /// Evaluate a blinded element into a token.
    async fn issue(&self, blinded_element_b64: &str) -> Result<EligibilityToken, Error>;

    /// Re-check a token's proof and expiry.
    async fn verify(&self, token: &EligibilityToken) -> Result<bool, Error>;
}

/// In-memory issuer holding a real VOPRF key. Issues and verifies genuine
/// DLEQ-proved evaluations, so admission behaves exactly as with the
/// production service.
pub struct MemIssuer {
    key: Scalar,
    public_key: Vec<u8>,
    context: Vec<u8>,
    clock: Arc<dyn Clock>,
    token_ttl_ms: u64,
    epoch: u64,
}

impl MemIssuer {
    pub fn new(context: Vec<u8>, clock: Arc<dyn Clock>) -> Self {
        let key = voprf::generate_issuer_key();
        let public_key = voprf::issuer_public_key(&key);
        MemIssuer {
            key,
            public_key,
            context,
            clock,
            token_ttl_ms: 60 * 60 * 1000,
            epoch: 1,
        }
    }

    pub fn with_token_ttl_ms(mut self, token_ttl_ms: u64) -> Self {
        self.token_ttl_ms = token_ttl_ms;
        self
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn context(&self) -> &[u8] {
        &self.context
    }

    /// Run the whole client flow against this issuer: blind, issue, finalize.
    /// What a voter's client does, packaged for tests and local setups.
    pub async fn issue_for_input(&self, input: &[u8]) -> Result<EligibilityToken, Error> {
        let (blinded, state) = voprf::blind(input, &self.context)?;
        let blinded_b64 = base64::encode_config(&blinded, base64::URL_SAFE_NO_PAD);
        let token = self.issue(&blinded_b64).await?;
        voprf::finalize(&state, &token.token_bytes, &self.public_key, &self.context)?;
        Ok(token)
    }
}

#[async_trait]
impl Issuer for MemIssuer {
    async fn metadata(&self) -> Result<IssuerMetadata, Error> {
        Ok(IssuerMetadata {
            issuer_id: "mem-issuer".to_string(),
            voprf: VoprfMetadata {
                pubkey: base64::encode_config(&self.public_key, base64::URL_SAFE_NO_PAD),
            },
            current_epoch: self.epoch,
        })
    }

    async fn issue(&self, blinded_element_b64: &str) -> Result<EligibilityToken, Error> {
        let blinded = base64::decode_config(blinded_element_b64, base64::URL_SAFE_NO_PAD)
            .map_err(|_| Error::InvalidProof)?;
        let token_bytes = voprf::evaluate(&self.key, &blinded, &self.context)?;

        Ok(EligibilityToken {
            token_bytes,
            issuer_public_key: self.public_key.clone(),
            expires_at_ms: self.clock.now_ms() + self.token_ttl_ms,
            key_id: Some("mem-1".to_string()),
            epoch: Some(self.epoch),
        })
    }

    async fn verify(&self, token: &EligibilityToken) -> Result<bool, Error> {
        if token.expires_at_ms <= self.clock.now_ms() {
            return Ok(false);
        }
        if token.issuer_public_key != self.public_key {
            return Ok(false);
        }
        Ok(voprf::verify_token(&token.token_bytes, &self.public_key, &self.context).is_ok())
    }
}

/// HTTP client for the external issuer and its verifier host.
pub struct HttpIssuer {
    issuer_url: String,
    verifier_url: String,
    client: reqwest::Client,
    metadata: OnceCell<IssuerMetadata>,
}

#[derive(Serialize)]
struct IssueRequest<'a> {
    blinded_element_b64: &'a str,
    sybil_proof: SybilProof<'a>,
}

#[derive(Serialize)]
struct SybilProof<'a> {
    #[serde(rename = "type")]
    proof_type: &'a str,
}

#[derive(Deserialize)]
struct IssueResponse {
    token: String,
    proof: String,
    #[serde(default)]
    kid: Option<String>,
    /// Unix seconds.
    exp: u64,
    #[serde(default)]
    epoch: Option<u64>,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    token_b64: String,
    issuer_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    epoch: Option<u64>,
}

#[derive(Deserialize)]
struct VerifyResponse {
    ok: bool,
}

impl HttpIssuer {
    pub fn new(
        issuer_url: impl Into<String>,
        verifier_url: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("prestige: failed to build issuer HTTP client");
        HttpIssuer {
            issuer_url: issuer_url.into(),
            verifier_url: verifier_url.into(),
            client,
            metadata: OnceCell::new(),
        }
    }

    async fn cached_metadata(&self) -> Result<&IssuerMetadata, Error> {
        self.metadata
            .get_or_try_init(|| async {
                let url = format!("{}/.well-known/issuer", self.issuer_url);
                self.client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Error::IssuerUnavailable(e.to_string()))?
                    .json()
                    .await
                    .map_err(|e| Error::IssuerUnavailable(e.to_string()))
            })
            .await
    }
}

#[async_trait]
impl Issuer for HttpIssuer {
    async fn metadata(&self) -> Result<IssuerMetadata, Error> {
        self.cached_metadata().await.map(|metadata| metadata.clone())
    }

    async fn issue(&self, blinded_element_b64: &str) -> Result<EligibilityToken, Error> {
        let metadata = self.cached_metadata().await?.clone();

        let url = format!("{}/v1/oprf/issue", self.issuer_url);
        let response: IssueResponse = self
            .client
            .post(&url)
            .json(&IssueRequest {
                blinded_element_b64,
                sybil_proof: SybilProof { proof_type: "none" },
            })
            .send()
            .await
            .map_err(|e| Error::IssuerUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::IssuerUnavailable(e.to_string()))?;

        let mut token_bytes = base64::decode_config(&response.token, base64::URL_SAFE_NO_PAD)
            .map_err(|_| Error::InvalidProof)?;
        let proof = base64::decode_config(&response.proof, base64::URL_SAFE_NO_PAD)
            .map_err(|_| Error::InvalidProof)?;
        token_bytes.extend_from_slice(&proof);
        if token_bytes.len() != voprf::TOKEN_LENGTH {
            return Err(CryptoError::InvalidTokenLength.into());
        }

        let issuer_public_key =
            base64::decode_config(&metadata.voprf.pubkey, base64::URL_SAFE_NO_PAD)
                .map_err(|_| Error::IssuerUnavailable("bad issuer metadata".to_string()))?;

        Ok(EligibilityToken {
            token_bytes,
            issuer_public_key,
            expires_at_ms: response.exp * 1000,
            key_id: response.kid,
            epoch: response.epoch,
        })
    }

    async fn verify(&self, token: &EligibilityToken) -> Result<bool, Error> {
        let metadata = self.cached_metadata().await?.clone();

        let url = format!("{}/v1/verify", self.verifier_url);
        let response: VerifyResponse = self
            .client
            .post(&url)
            .json(&VerifyRequest {
                token_b64: token.token_b64(),
                issuer_id: &metadata.issuer_id,
                exp: Some(token.expires_at_ms / 1000),
                epoch: token.epoch,
            })
            .send()
            .await
            .map_err(|e| Error::IssuerUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::IssuerUnavailable(e.to_string()))?;

        Ok(response.ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_issuer_round_trip() {
        let clock = Arc::new(TestClock::new(1_000));
        let issuer = MemIssuer::new(b"ctx".to_vec(), clock.clone());

        let token = issuer.issue_for_input(b"voter secret").await.unwrap();
        assert_eq!(token.token_bytes.len(), voprf::TOKEN_LENGTH);
        assert!(issuer.verify(&token).await.unwrap());
    }

    #[tokio::test]
    async fn expired_tokens_fail_verification() {
        let clock = Arc::new(TestClock::new(1_000));
        let issuer = MemIssuer::new(b"ctx".to_vec(), clock.clone()).with_token_ttl_ms(500);

        let token = issuer.issue_for_input(b"voter secret").await.unwrap();
        assert!(issuer.verify(&token).await.unwrap());

        clock.advance(501);
        assert!(!issuer.verify(&token).await.unwrap());
    }

    #[tokio::test]
    async fn foreign_tokens_fail_verification() {
        let clock = Arc::new(TestClock::new(1_000));
        let ours = MemIssuer::new(b"ctx".to_vec(), clock.clone());
        let theirs = MemIssuer::new(b"ctx".to_vec(), clock);

        let token = theirs.issue_for_input(b"voter secret").await.unwrap();
        assert!(!ours.verify(&token).await.unwrap());
    }

    #[tokio::test]
    async fn tampered_token_bytes_fail_verification() {
        let clock = Arc::new(TestClock::new(1_000));
        let issuer = MemIssuer::new(b"ctx".to_vec(), clock);

        let mut token = issuer.issue_for_input(b"voter secret").await.unwrap();
        token.token_bytes[40] ^= 0x01;
        assert!(!issuer.verify(&token).await.unwrap());
    }
}
