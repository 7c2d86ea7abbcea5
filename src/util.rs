use crate::Hash32;
use ed25519_dalek::Keypair;
use ed25519_dalek::PublicKey;
use ed25519_dalek::SecretKey;
use rand::Rng;

pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let mut csprng = rand::rngs::OsRng {};
    let Keypair { public, secret } = Keypair::generate(&mut csprng);
    (secret, public)
}

/// Generate a voter secret.
///
/// The secret stays client-side; the service only ever sees the nullifier
/// derived from it.
pub fn generate_voter_secret() -> Hash32 {
    let mut csprng = rand::rngs::OsRng {};
    Hash32::from_array(csprng.gen())
}

/// Generate a commitment salt.
pub fn generate_salt() -> Hash32 {
    let mut csprng = rand::rngs::OsRng {};
    Hash32::from_array(csprng.gen())
}
