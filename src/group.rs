//! Group-level helpers over Ristretto255: the uniform keypair sampler and
//! the scalar/point codecs every protocol module shares.
//!
//! The sampler reduces 64 uniform bytes modulo the group order instead of
//! bit-masking 32. The order q is close to 2^252, so the wide reduction
//! leaves a per-residue bias far below 2^-32, while masked sampling skews
//! keys that later enter linear combinations like h·SS + ES.

use crate::rng::SecureRng;
use anyhow::{anyhow, bail, Result};
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use zeroize::Zeroizing;

pub(crate) const SCALAR_LEN: usize = 32;
pub(crate) const POINT_LEN: usize = 32;

/// Samples a scalar uniform in [1, q-1] together with its base-point
/// multiple. Zero draws are rejected and resampled; everything else is
/// already canonical after the wide reduction.
pub(crate) fn random_keypair(rng: &mut SecureRng) -> Result<(Scalar, RistrettoPoint)> {
    loop {
        let mut wide = Zeroizing::new([0u8; 64]);
        rng.fill_random(wide.as_mut())?;
        let scalar = Scalar::from_bytes_mod_order_wide(&wide);
        if scalar != Scalar::ZERO {
            let point = RistrettoPoint::mul_base(&scalar);
            return Ok((scalar, point));
        }
    }
}

/// Reduces a 64-byte hash output to a scalar.
pub(crate) fn reduce_wide(bytes: &[u8; 64]) -> Scalar {
    Scalar::from_bytes_mod_order_wide(bytes)
}

/// Decodes a canonical, non-zero scalar from its 32-byte encoding.
pub(crate) fn decode_scalar(bytes: &[u8; SCALAR_LEN]) -> Result<Scalar> {
    let scalar: Option<Scalar> = Scalar::from_canonical_bytes(*bytes).into();
    let scalar = scalar.ok_or_else(|| anyhow!("non-canonical scalar encoding"))?;
    if scalar == Scalar::ZERO {
        bail!("zero scalar is not a valid key");
    }
    Ok(scalar)
}

/// Decodes a point, rejecting anything that is not a valid group-element
/// encoding. Ristretto decompression is the validity gate: no small-order
/// or off-curve input survives it.
pub(crate) fn decode_point(bytes: &[u8; POINT_LEN]) -> Result<RistrettoPoint> {
    CompressedRistretto(*bytes)
        .decompress()
        .ok_or_else(|| anyhow!("invalid point encoding"))
}

pub(crate) fn encode_point(point: &RistrettoPoint) -> [u8; POINT_LEN] {
    point.compress().to_bytes()
}
