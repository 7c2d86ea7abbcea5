/// Process-wide configuration.
///
/// Initialized once before any task is spawned and read-only thereafter.
/// Every field has a serde default so a partial config file (or none at all)
/// yields a working instance.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PrestigeConfig {
    pub default_ballot_duration_minutes: u64,
    pub reveal_window_minutes: u64,
    pub min_duration_minutes: u64,
    pub max_duration_minutes: u64,
    pub max_choices: usize,
    pub max_question_length: usize,

    pub ballot_gate: BallotGateConfig,
    pub voter_gate: VoterGateConfig,
    pub petition_proposal_gate: ProposalGateConfig,

    pub privacy: PrivacyConfig,
    pub gossip: GossipConfig,

    /// Timeout applied to every outbound issuer/witness/relay call.
    pub collaborator_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for PrestigeConfig {
    fn default() -> Self {
        PrestigeConfig {
            default_ballot_duration_minutes: 1440,
            reveal_window_minutes: 1440,
            min_duration_minutes: 1,
            max_duration_minutes: 30 * 24 * 60,
            max_choices: 20,
            max_question_length: 500,
            ballot_gate: BallotGateConfig::default(),
            voter_gate: VoterGateConfig::default(),
            petition_proposal_gate: ProposalGateConfig::default(),
            privacy: PrivacyConfig::default(),
            gossip: GossipConfig::default(),
            collaborator_timeout_ms: 10_000,
            max_reconnect_attempts: 10,
        }
    }
}

impl PrestigeConfig {
    pub fn default_ballot_duration_ms(&self) -> u64 {
        self.default_ballot_duration_minutes * 60_000
    }

    pub fn reveal_window_ms(&self) -> u64 {
        self.reveal_window_minutes * 60_000
    }

    pub fn min_duration_ms(&self) -> u64 {
        self.min_duration_minutes * 60_000
    }

    pub fn max_duration_ms(&self) -> u64 {
        self.max_duration_minutes * 60_000
    }
}

/// Who may create ballots. Public keys are hex-encoded Ed25519 keys.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BallotGateConfig {
    Open,
    Owner {
        admin_key: String,
    },
    Delegation {
        delegates: Vec<String>,
    },
    EligibilityToken {
        freebird_issuer: String,
    },
    Petition {
        #[serde(default = "default_petition_threshold")]
        petition_threshold: usize,
    },
}

impl Default for BallotGateConfig {
    fn default() -> Self {
        BallotGateConfig::Owner {
            admin_key: String::new(),
        }
    }
}

fn default_petition_threshold() -> usize {
    10
}

/// Who may vote (and sign petitions).
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoterGateConfig {
    Open,
    /// Anyone who can present a freebird eligibility token.
    Freebird,
    Allowlist {
        allowlist: Vec<String>,
    },
}

impl Default for VoterGateConfig {
    fn default() -> Self {
        VoterGateConfig::Freebird
    }
}

/// Who may propose petition ballots.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposalGateConfig {
    /// Anyone the voter gate admits.
    Voters,
    Delegation {
        delegates: Vec<String>,
    },
}

impl Default for ProposalGateConfig {
    fn default() -> Self {
        ProposalGateConfig::Voters
    }
}

/// Timing-privacy countermeasures around sensitive operations.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PrivacyConfig {
    pub enabled: bool,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Minimum total duration of a wrapped operation; `0` disables.
    pub normalized_response_ms: u64,
    pub batching_enabled: bool,
    pub batch_interval_ms: u64,
    pub max_batch_size: usize,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        PrivacyConfig {
            enabled: false,
            min_delay_ms: 100,
            max_delay_ms: 2000,
            normalized_response_ms: 0,
            batching_enabled: false,
            batch_interval_ms: 5000,
            max_batch_size: 10,
        }
    }
}

/// Gossip propagation, peer scoring and nullifier cache retention.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GossipConfig {
    pub max_nullifiers: usize,
    pub max_age_ms: u64,
    pub prune_interval_ms: u64,
    /// Messages from peers scoring below this are silently dropped.
    pub score_threshold: i64,
    pub penalties: PenaltyConfig,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            max_nullifiers: 100_000,
            max_age_ms: 30 * 24 * 60 * 60 * 1000,
            prune_interval_ms: 60 * 60 * 1000,
            score_threshold: -50,
            penalties: PenaltyConfig::default(),
        }
    }
}

/// Score deductions per misbehavior kind.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PenaltyConfig {
    pub invalid_signature: i64,
    pub unknown_ballot: i64,
    pub invalid_proof: i64,
    pub invalid_attestation: i64,
    pub too_late: i64,
    pub double_vote: i64,
    pub duplicate: i64,
    pub wrong_phase: i64,
    pub no_matching_vote: i64,
    pub invalid_reveal: i64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        PenaltyConfig {
            invalid_signature: 10,
            unknown_ballot: 10,
            invalid_proof: 10,
            invalid_attestation: 10,
            too_late: 10,
            double_vote: 10,
            duplicate: 1,
            wrong_phase: 10,
            no_matching_vote: 10,
            invalid_reveal: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: PrestigeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.default_ballot_duration_minutes, 1440);
        assert_eq!(config.max_choices, 20);
        assert_eq!(config.voter_gate, VoterGateConfig::Freebird);
        assert_eq!(config.privacy.batch_interval_ms, 5000);
        assert_eq!(config.gossip.penalties.duplicate, 1);
        assert_eq!(config.gossip.score_threshold, -50);
    }

    #[test]
    fn gate_configs_parse_from_tagged_json() {
        let config: PrestigeConfig = serde_json::from_str(
            r#"{
                "ballot_gate": {"type": "petition", "petition_threshold": 3},
                "voter_gate": {"type": "allowlist", "allowlist": ["ab"]},
                "petition_proposal_gate": {"type": "voters"}
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.ballot_gate,
            BallotGateConfig::Petition {
                petition_threshold: 3
            }
        );
        assert_eq!(
            config.voter_gate,
            VoterGateConfig::Allowlist {
                allowlist: vec!["ab".to_string()]
            }
        );
    }

    #[test]
    fn petition_threshold_defaults_when_omitted() {
        let config: PrestigeConfig =
            serde_json::from_str(r#"{"ballot_gate": {"type": "petition"}}"#).unwrap();
        assert_eq!(
            config.ballot_gate,
            BallotGateConfig::Petition {
                petition_threshold: 10
            }
        );
    }
}
