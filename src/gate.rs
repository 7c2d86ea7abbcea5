use crate::*;

use ed25519_dalek::PublicKey;

/// Who may vote on (and petition for) ballots in this instance.
///
/// Gates are decided against a public key; the `EligibilityToken` variant
/// admits everyone here because the actual proof is demanded and verified at
/// cast time, where a token is in hand.
#[derive(Debug, Clone)]
pub enum VoterGate {
    Open,
    EligibilityToken,
    Allowlist { keys: Vec<PublicKey> },
}

impl VoterGate {
    pub fn from_config(config: &VoterGateConfig) -> Result<Self, Error> {
        Ok(match config {
            VoterGateConfig::Open => VoterGate::Open,
            VoterGateConfig::Freebird => VoterGate::EligibilityToken,
            VoterGateConfig::Allowlist { allowlist } => VoterGate::Allowlist {
                keys: parse_keys(allowlist)?,
            },
        })
    }

    pub async fn can_vote(&self, public_key: &PublicKey) -> Result<bool, Error> {
        Ok(match self {
            VoterGate::Open => true,
            VoterGate::EligibilityToken => true,
            VoterGate::Allowlist { keys } => keys.contains(public_key),
        })
    }

    pub fn requirements(&self) -> String {
        match self {
            VoterGate::Open => "anyone may vote".to_string(),
            VoterGate::EligibilityToken => {
                "voting requires a freebird eligibility token".to_string()
            }
            VoterGate::Allowlist { keys } => {
                format!("voting is restricted to {} allowlisted keys", keys.len())
            }
        }
    }
}

/// Who may propose petition ballots.
#[derive(Debug, Clone)]
pub enum ProposalGate {
    /// Anyone the voter gate admits.
    Voters(VoterGate),
    Delegation { delegates: Vec<PublicKey> },
}

impl ProposalGate {
    pub fn from_config(
        config: &ProposalGateConfig,
        voter_gate: &VoterGate,
    ) -> Result<Self, Error> {
        Ok(match config {
            ProposalGateConfig::Voters => ProposalGate::Voters(voter_gate.clone()),
            ProposalGateConfig::Delegation { delegates } => ProposalGate::Delegation {
                delegates: parse_keys(delegates)?,
            },
        })
    }

    pub async fn can_propose(&self, public_key: &PublicKey) -> Result<bool, Error> {
        match self {
            ProposalGate::Voters(voter_gate) => voter_gate.can_vote(public_key).await,
            ProposalGate::Delegation { delegates } => Ok(delegates.contains(public_key)),
        }
    }

    pub fn requirements(&self) -> String {
        match self {
            ProposalGate::Voters(voter_gate) => {
                format!("proposals are open to voters ({})", voter_gate.requirements())
            }
            ProposalGate::Delegation { delegates } => {
                format!("proposals are restricted to {} delegates", delegates.len())
            }
        }
    }
}

/// Who may create ballots.
#[derive(Debug, Clone)]
pub enum BallotGate {
    Open,
    /// `None` means no admin key was configured, which denies everyone.
    Owner { admin: Option<PublicKey> },
    Delegation { delegates: Vec<PublicKey> },
    EligibilityToken { issuer_id: String },
    Petition {
        threshold: usize,
        proposal_gate: ProposalGate,
    },
}

impl BallotGate {
    pub fn from_config(config: &PrestigeConfig) -> Result<Self, Error> {
        Ok(match &config.ballot_gate {
            BallotGateConfig::Open => BallotGate::Open,
            BallotGateConfig::Owner { admin_key } => BallotGate::Owner {
                admin: if admin_key.is_empty() {
                    None
                } else {
                    Some(parse_public_key(admin_key)?)
                },
            },
            BallotGateConfig::Delegation { delegates } => BallotGate::Delegation {
                delegates: parse_keys(delegates)?,
            },
            BallotGateConfig::EligibilityToken { freebird_issuer } => {
                BallotGate::EligibilityToken {
                    issuer_id: freebird_issuer.clone(),
                }
            }
            BallotGateConfig::Petition { petition_threshold } => {
                let voter_gate = VoterGate::from_config(&config.voter_gate)?;
                BallotGate::Petition {
                    threshold: *petition_threshold,
                    proposal_gate: ProposalGate::from_config(
                        &config.petition_proposal_gate,
                        &voter_gate,
                    )?,
                }
            }
        })
    }

    /// Gate decision for ballot creation. The petition variant delegates to
    /// its nested proposal gate; signature eligibility is checked separately
    /// when signatures arrive.
    pub async fn can_create<I: Issuer>(
        &self,
        public_key: &PublicKey,
        proof: Option<&EligibilityToken>,
        issuer: &I,
    ) -> Result<bool, Error> {
        match self {
            BallotGate::Open => Ok(true),
            BallotGate::Owner { admin } => Ok(admin.as_ref() == Some(public_key)),
            BallotGate::Delegation { delegates } => Ok(delegates.contains(public_key)),
            BallotGate::EligibilityToken { .. } => match proof {
                Some(token) => issuer.verify(token).await,
                None => Ok(false),
            },
            BallotGate::Petition { proposal_gate, .. } => {
                proposal_gate.can_propose(public_key).await
            }
        }
    }

    pub fn petition_threshold(&self) -> Option<usize> {
        match self {
            BallotGate::Petition { threshold, .. } => Some(*threshold),
            _ => None,
        }
    }

    pub fn requirements(&self) -> String {
        match self {
            BallotGate::Open => "anyone may create ballots".to_string(),
            BallotGate::Owner { admin: Some(_) } => {
                "only the instance admin may create ballots".to_string()
            }
            BallotGate::Owner { admin: None } => {
                "ballot creation is disabled until an admin key is configured".to_string()
            }
            BallotGate::Delegation { delegates } => {
                format!("ballot creation is restricted to {} delegates", delegates.len())
            }
            BallotGate::EligibilityToken { issuer_id } => {
                format!("ballot creation requires an eligibility token from {}", issuer_id)
            }
            BallotGate::Petition {
                threshold,
                proposal_gate,
            } => format!(
                "ballots activate after {} petition signatures; {}",
                threshold,
                proposal_gate.requirements()
            ),
        }
    }
}

fn parse_keys(hex_keys: &[String]) -> Result<Vec<PublicKey>, Error> {
    hex_keys.iter().map(|key| parse_public_key(key)).collect()
}
