//! Message signing bound to the server's long-term identity key.
//!
//! Nonces are deterministic: r is a keyed hash of the message under the
//! server's signing-nonce key, so no fresh randomness is needed per
//! signature and the same message never reuses a nonce under two different
//! values.

use crate::group;
use crate::handshake::PublicKey;
use anyhow::{anyhow, bail, Result};
use blake2::digest::Mac;
use blake2::{Blake2b512, Blake2bMac512, Digest};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use zeroize::Zeroize;

/// R(32) ‖ s(32).
pub const SIGNATURE_LEN: usize = 64;

/// t = H(SP ‖ R ‖ m) mod q. Public data only.
fn challenge_scalar(public: &[u8; 32], big_r: &[u8; 32], message: &[u8]) -> Scalar {
    let mut hasher = Blake2b512::new();
    Digest::update(&mut hasher, public);
    Digest::update(&mut hasher, big_r);
    Digest::update(&mut hasher, message);
    let digest = hasher.finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    let t = group::reduce_wide(&wide);
    wide.zeroize();
    t
}

/// Signs `message` with the long-term scalar, nonce-keyed by `sign_key`.
pub(crate) fn sign_message(
    secret: &Scalar,
    public_bytes: &[u8; 32],
    sign_key: &[u8; 32],
    message: &[u8],
) -> Result<[u8; SIGNATURE_LEN]> {
    if message.is_empty() {
        bail!("refusing to sign an empty message");
    }

    // r = MAC(sign_key, m) mod q
    let mut mac = Blake2bMac512::new_from_slice(sign_key)
        .map_err(|_| anyhow!("signing-nonce key rejected"))?;
    mac.update(message);
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&mac.finalize().into_bytes());
    let mut r = group::reduce_wide(&wide);
    wide.zeroize();
    if r == Scalar::ZERO {
        bail!("degenerate signing nonce");
    }

    // R = r·G
    let big_r = group::encode_point(&RistrettoPoint::mul_base(&r));

    // s = t·SS + r (mod q)
    let mut t = challenge_scalar(public_bytes, &big_r, message);
    let s = t * secret + r;

    let mut signature = [0u8; SIGNATURE_LEN];
    signature[..32].copy_from_slice(&big_r);
    signature[32..].copy_from_slice(&s.to_bytes());

    r.zeroize();
    t.zeroize();
    Ok(signature)
}

/// Verifies a signature against a message and public key.
///
/// Everything here is public data, so the variable-time double-scalar
/// multiplication with the basepoint is fine.
pub fn verify(
    message: &[u8],
    public_key: &PublicKey,
    signature: &[u8; SIGNATURE_LEN],
) -> Result<()> {
    if message.is_empty() {
        bail!("refusing to verify an empty message");
    }

    let big_r_bytes: [u8; 32] = signature[..32].try_into().expect("32-byte slice");
    let s_bytes: [u8; 32] = signature[32..].try_into().expect("32-byte slice");

    let s = group::decode_scalar(&s_bytes)?;
    let big_r = group::decode_point(&big_r_bytes)?;
    let sp = group::decode_point(public_key.as_bytes())?;

    let t = challenge_scalar(public_key.as_bytes(), &big_r_bytes, message);
    if t == Scalar::ZERO {
        bail!("degenerate signature challenge");
    }

    // u = s·G - t·SP; accept iff u equals R. Ristretto is prime-order, so
    // group equality needs no cofactor clearing.
    let neg_t = -t;
    let u = RistrettoPoint::vartime_double_scalar_mul_basepoint(&neg_t, &sp, &s);
    if u != big_r {
        bail!("signature rejected");
    }
    Ok(())
}
