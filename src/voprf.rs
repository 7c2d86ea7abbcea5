//! Client-side VOPRF operations over NIST P-256.
//!
//! The eligibility issuer holds the PRF key `k` and publishes `Y = k·G`. A
//! voter blinds a secret input to a point `A = r·P`, the issuer returns
//! `B = k·A` together with a Chaum-Pedersen DLEQ proof that the same `k` was
//! used in `Y` and `B`, and the voter keeps the whole response as an
//! eligibility token that any verifier can re-check later.
//!
//! Everything in this module is pure: no I/O, deterministic failures.

use sha2::{Digest, Sha256};
use thiserror::Error;

use p256::elliptic_curve::hash2curve::{ExpandMsgXmd, GroupDigest};
use p256::elliptic_curve::ops::Reduce;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::{Field, PrimeField};
use p256::{AffinePoint, EncodedPoint, FieldBytes, NistP256, ProjectivePoint, Scalar, U256};
use rand_core::OsRng;
use subtle::ConstantTimeEq;

/// Compressed SEC1 point length.
pub const POINT_LENGTH: usize = 33;
/// DLEQ proof `(c, s)`: two 32-byte big-endian scalars.
pub const DLEQ_PROOF_LENGTH: usize = 64;
/// Token bytes `A ‖ B ‖ π`.
pub const TOKEN_LENGTH: usize = 2 * POINT_LENGTH + DLEQ_PROOF_LENGTH;

const DLEQ_DST_PREFIX: &[u8] = b"DLEQ-P256-v1";
const H2C_DST_PREFIX: &[u8] = b"H2C-P256-v1";

/// Curve and proof errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("prestige: token bytes must be {TOKEN_LENGTH} bytes")]
    InvalidTokenLength,

    #[error("prestige: invalid curve point encoding")]
    InvalidPoint,

    #[error("prestige: DLEQ proof failed to verify")]
    InvalidDLEQ,

    #[error("prestige: duplicate share index in aggregation")]
    DuplicateShareIndex,

    #[error("prestige: share index zero is not a valid evaluation point")]
    InvalidShareIndex,

    #[error("prestige: no partial evaluations to aggregate")]
    NoShares,

    #[error("prestige: hash-to-curve failed")]
    HashToCurve,
}

impl CryptoError {
    pub fn code(&self) -> &'static str {
        match self {
            CryptoError::InvalidTokenLength => "invalid_token_length",
            CryptoError::InvalidPoint => "invalid_point",
            CryptoError::InvalidDLEQ => "invalid_dleq",
            CryptoError::DuplicateShareIndex => "duplicate_share_index",
            CryptoError::InvalidShareIndex => "invalid_share_index",
            CryptoError::NoShares => "no_shares",
            CryptoError::HashToCurve => "hash_to_curve",
        }
    }
}

/// Client state held between blinding and finalization: the blinding scalar
/// `r` and the hashed input point `P`.
pub struct BlindState {
    r: Scalar,
    point: ProjectivePoint,
}

impl BlindState {
    /// The blinded element `r·P` this state produced, as sent to the issuer.
    pub fn blinded_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        encode_point(&(self.point * self.r)).map(|bytes| bytes.to_vec())
    }
}

/// Blind a voter input for issuance: `A = r·hash_to_curve(input, context)`.
pub fn blind(input: &[u8], context: &[u8]) -> Result<(Vec<u8>, BlindState), CryptoError> {
    let point = hash_to_curve(input, context)?;
    let r = random_nonzero_scalar();
    let bytes = encode_point(&(point * r))?.to_vec();
    Ok((bytes, BlindState { r, point }))
}

/// Finalize an issuer response into an eligibility token.
///
/// Parses `A ‖ B ‖ π`, checks that `A` is the element we actually sent, and
/// verifies the DLEQ proof that `B = k·A` under the issuer key `Y = k·G`.
/// The token bytes are returned unchanged: the verifier re-checks the same
/// proof later, so the client has nothing secret to extract here.
pub fn finalize(
    state: &BlindState,
    token_bytes: &[u8],
    issuer_public_key: &[u8],
    context: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let (a, _b) = parse_token(token_bytes)?;
    if encode_point(&a)? != encode_point(&(state.point * state.r))? {
        return Err(CryptoError::InvalidDLEQ);
    }
    verify_token(token_bytes, issuer_public_key, context)?;
    Ok(token_bytes.to_vec())
}

/// Verify a token's DLEQ proof against the issuer public key.
///
/// Used by the client during finalization and by any later verifier; the
/// token is self-contained.
pub fn verify_token(
    token_bytes: &[u8],
    issuer_public_key: &[u8],
    context: &[u8],
) -> Result<(), CryptoError> {
    let (a, b) = parse_token(token_bytes)?;
    let y = decode_point(issuer_public_key)?;

    let proof = &token_bytes[2 * POINT_LENGTH..];
    let c = scalar_reduce(&proof[..32]);
    let s = scalar_reduce(&proof[32..]);

    // T1 = s·G − c·Y, T2 = s·A − c·B
    let t1 = ProjectivePoint::GENERATOR * s - y * c;
    let t2 = a * s - b * c;

    let expected = dleq_challenge(&y, &a, &b, &t1, &t2, context)?;
    if bool::from(c.ct_eq(&expected)) {
        Ok(())
    } else {
        Err(CryptoError::InvalidDLEQ)
    }
}

/// Issuer-side evaluation: `B = k·A` plus the DLEQ proof binding `B` to
/// `Y = k·G`. This is what the in-memory issuer runs; the production issuer
/// is an external service doing exactly the same math.
pub fn evaluate(key: &Scalar, blinded_bytes: &[u8], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let a = decode_point(blinded_bytes)?;
    let b = a * key;
    let y = ProjectivePoint::GENERATOR * key;

    // Chaum-Pedersen: commit with a fresh t, challenge from the transcript,
    // respond with s = t + c·k.
    let t = random_nonzero_scalar();
    let t1 = ProjectivePoint::GENERATOR * t;
    let t2 = a * t;
    let c = dleq_challenge(&y, &a, &b, &t1, &t2, context)?;
    let s = t + c * key;

    let mut token = Vec::with_capacity(TOKEN_LENGTH);
    token.extend_from_slice(&encode_point(&a)?);
    token.extend_from_slice(&encode_point(&b)?);
    token.extend_from_slice(c.to_repr().as_slice());
    token.extend_from_slice(s.to_repr().as_slice());
    Ok(token)
}

/// Generate a fresh issuer key.
pub fn generate_issuer_key() -> Scalar {
    random_nonzero_scalar()
}

/// Compressed encoding of the public key `k·G`.
pub fn issuer_public_key(key: &Scalar) -> Vec<u8> {
    let y = ProjectivePoint::GENERATOR * key;
    encode_point(&y)
        .expect("prestige: issuer public key cannot be the identity")
        .to_vec()
}

/// Reconstruct a full evaluation from `t` partial evaluations `(i, B_i)` of
/// key shares on a degree `t−1` polynomial, by Lagrange interpolation at
/// `x = 0`. A single partial is returned verbatim.
pub fn aggregate(partials: &[(u32, Vec<u8>)]) -> Result<Vec<u8>, CryptoError> {
    match partials {
        [] => Err(CryptoError::NoShares),
        [(index, bytes)] => {
            if *index == 0 {
                return Err(CryptoError::InvalidShareIndex);
            }
            decode_point(bytes)?;
            Ok(bytes.clone())
        }
        _ => {
            for (position, (index, _)) in partials.iter().enumerate() {
                if *index == 0 {
                    return Err(CryptoError::InvalidShareIndex);
                }
                if partials[..position].iter().any(|(other, _)| other == index) {
                    return Err(CryptoError::DuplicateShareIndex);
                }
            }

            let mut sum = ProjectivePoint::IDENTITY;
            for (index, bytes) in partials {
                let point = decode_point(bytes)?;
                let coefficient = lagrange_at_zero(*index, partials)?;
                sum += point * coefficient;
            }
            Ok(encode_point(&sum)?.to_vec())
        }
    }
}

/// `λ_i = Π_{j≠i} x_j · (x_j − x_i)^{-1} mod n`
fn lagrange_at_zero(index: u32, partials: &[(u32, Vec<u8>)]) -> Result<Scalar, CryptoError> {
    let x_i = Scalar::from(u64::from(index));
    let mut coefficient = Scalar::ONE;
    for (other, _) in partials {
        if *other == index {
            continue;
        }
        let x_j = Scalar::from(u64::from(*other));
        let denominator: Option<Scalar> = (x_j - x_i).invert().into();
        let denominator = denominator.ok_or(CryptoError::DuplicateShareIndex)?;
        coefficient *= x_j * denominator;
    }
    Ok(coefficient)
}

pub(crate) fn hash_to_curve(input: &[u8], context: &[u8]) -> Result<ProjectivePoint, CryptoError> {
    let dst = [H2C_DST_PREFIX, context].concat();
    NistP256::hash_from_bytes::<ExpandMsgXmd<Sha256>>(&[input], &[dst.as_slice()])
        .map_err(|_| CryptoError::HashToCurve)
}

/// Fiat-Shamir challenge over the fixed transcript layout:
/// `len32(dst) ‖ dst ‖ G ‖ Y ‖ A ‖ B ‖ T1 ‖ T2` with `dst = prefix ‖ context`.
fn dleq_challenge(
    y: &ProjectivePoint,
    a: &ProjectivePoint,
    b: &ProjectivePoint,
    t1: &ProjectivePoint,
    t2: &ProjectivePoint,
    context: &[u8],
) -> Result<Scalar, CryptoError> {
    let dst = [DLEQ_DST_PREFIX, context].concat();

    let mut transcript = Vec::new();
    transcript.extend_from_slice(&(dst.len() as u32).to_be_bytes());
    transcript.extend_from_slice(&dst);
    for point in [&ProjectivePoint::GENERATOR, y, a, b, t1, t2] {
        transcript.extend_from_slice(&encode_point(point)?);
    }

    let digest: [u8; 32] = Sha256::digest(&transcript).into();
    Ok(scalar_reduce(&digest))
}

fn parse_token(token_bytes: &[u8]) -> Result<(ProjectivePoint, ProjectivePoint), CryptoError> {
    if token_bytes.len() != TOKEN_LENGTH {
        return Err(CryptoError::InvalidTokenLength);
    }
    let a = decode_point(&token_bytes[..POINT_LENGTH])?;
    let b = decode_point(&token_bytes[POINT_LENGTH..2 * POINT_LENGTH])?;
    Ok((a, b))
}

fn encode_point(point: &ProjectivePoint) -> Result<[u8; POINT_LENGTH], CryptoError> {
    let encoded = point.to_affine().to_encoded_point(true);
    // The identity compresses to a single zero byte and has no place in any
    // honest transcript.
    if encoded.as_bytes().len() != POINT_LENGTH {
        return Err(CryptoError::InvalidPoint);
    }
    let mut out = [0u8; POINT_LENGTH];
    out.copy_from_slice(encoded.as_bytes());
    Ok(out)
}

fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint, CryptoError> {
    if bytes.len() != POINT_LENGTH {
        return Err(CryptoError::InvalidPoint);
    }
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| CryptoError::InvalidPoint)?;
    let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
    affine
        .map(ProjectivePoint::from)
        .ok_or(CryptoError::InvalidPoint)
}

/// Big-endian bytes reduced mod the group order.
fn scalar_reduce(bytes: &[u8]) -> Scalar {
    let field_bytes = FieldBytes::clone_from_slice(bytes);
    <Scalar as Reduce<U256>>::reduce_bytes(&field_bytes)
}

fn random_nonzero_scalar() -> Scalar {
    loop {
        let scalar = Scalar::random(&mut OsRng);
        if !bool::from(scalar.is_zero()) {
            return scalar;
        }
    }
}
