use crate::*;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

/// A 32-byte hash value, rendered as 64 hex digits at rest and in transit.
///
/// Nullifiers, commitments, salts and attested target hashes are all
/// `Hash32` values. Equality of secrets (commitment and nullifier checks)
/// must go through [`Hash32::ct_eq`]; the derived `PartialEq` exists for
/// map keys and non-secret bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl Hash32 {
    pub const LEN: usize = 32;

    pub fn from_array(bytes: [u8; 32]) -> Self {
        Hash32(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != Self::LEN {
            return Err(Error::ValidationError(
                "expected a 32-byte value".to_string(),
            ));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(Hash32(out))
    }

    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s)
            .map_err(|_| Error::ValidationError("expected a 64-digit hex value".to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Constant-time equality.
    pub fn ct_eq(&self, other: &Hash32) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Hash32 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash32::from_hex(s)
    }
}

impl Serialize for Hash32 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hash32::from_hex(&s).map_err(de::Error::custom)
    }
}

/// SHA-256 over the raw concatenation of the parts. Strings are UTF-8.
pub fn hash_concat(parts: &[&[u8]]) -> Hash32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash32(hasher.finalize().into())
}

/// Derive the per-voter-per-ballot nullifier `H(voter_secret, ballot_id)`.
///
/// Client-side helper: the service never sees the voter secret, only the
/// nullifier derived from it.
pub fn nullifier(voter_secret: &Hash32, ballot_id: &str) -> Hash32 {
    hash_concat(&[voter_secret.as_bytes(), ballot_id.as_bytes()])
}

/// Commitment for a single choice: `H(choice, salt)`.
pub fn commit_single(choice: &str, salt: &Hash32) -> Hash32 {
    hash_concat(&[choice.as_bytes(), salt.as_bytes()])
}

/// Commitment for a structured vote: `H(serialize(vote_data), salt)` over the
/// canonical serialization, which for `Single` coincides with
/// [`commit_single`].
pub fn commit_vote_data(vote_data: &VoteData, salt: &Hash32) -> Hash32 {
    hash_concat(&[vote_data.canonical_form().as_bytes(), salt.as_bytes()])
}

/// Check a revealed vote against a stored commitment in constant time.
pub fn verify_commitment(commitment: &Hash32, vote_data: &VoteData, salt: &Hash32) -> bool {
    commit_vote_data(vote_data, salt).ct_eq(commitment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn hash32_hex_round_trip() {
        let h = hash_concat(&[b"hello"]);
        let parsed = Hash32::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
        assert!(h.ct_eq(&parsed));

        assert!(Hash32::from_hex("abcd").is_err());
        assert!(Hash32::from_hex("zz").is_err());
    }

    #[test]
    fn nullifier_binds_secret_and_ballot() {
        let secret = generate_voter_secret();
        let n1 = nullifier(&secret, "ballot-1");
        let n2 = nullifier(&secret, "ballot-2");
        assert_ne!(n1, n2);

        let other = generate_voter_secret();
        assert_ne!(nullifier(&other, "ballot-1"), n1);
    }

    #[test]
    fn single_commitment_matches_structured_form() {
        let salt = generate_salt();
        let vd = VoteData::Single {
            choice: "Red".to_string(),
        };
        assert_eq!(commit_single("Red", &salt), commit_vote_data(&vd, &salt));
    }

    #[test]
    fn approval_commitment_is_order_independent() {
        let salt = generate_salt();
        let a = VoteData::Approval {
            choices: vec!["B".to_string(), "A".to_string()],
        };
        let b = VoteData::Approval {
            choices: vec!["A".to_string(), "B".to_string()],
        };
        assert_eq!(commit_vote_data(&a, &salt), commit_vote_data(&b, &salt));
    }

    #[test]
    fn ranked_commitment_is_order_sensitive() {
        let salt = generate_salt();
        let a = VoteData::Ranked {
            rankings: vec!["A".to_string(), "B".to_string()],
        };
        let b = VoteData::Ranked {
            rankings: vec!["B".to_string(), "A".to_string()],
        };
        assert_ne!(commit_vote_data(&a, &salt), commit_vote_data(&b, &salt));
    }

    #[test]
    fn score_commitment_ignores_insertion_order() {
        let salt = generate_salt();
        let mut first = IndexMap::new();
        first.insert("B".to_string(), 3i64);
        first.insert("A".to_string(), 7i64);
        let mut second = IndexMap::new();
        second.insert("A".to_string(), 7i64);
        second.insert("B".to_string(), 3i64);

        let a = VoteData::Score { scores: first };
        let b = VoteData::Score { scores: second };
        assert_eq!(commit_vote_data(&a, &salt), commit_vote_data(&b, &salt));
    }

    #[test]
    fn verify_rejects_any_other_vote() {
        let salt = generate_salt();
        let vd = VoteData::Single {
            choice: "A".to_string(),
        };
        let commitment = commit_vote_data(&vd, &salt);
        assert!(verify_commitment(&commitment, &vd, &salt));

        let other = VoteData::Single {
            choice: "B".to_string(),
        };
        assert!(!verify_commitment(&commitment, &other, &salt));
        assert!(!verify_commitment(&commitment, &vd, &generate_salt()));
    }
}
