//! Seeded pseudo-random generator built on a chained 512-bit hash pool
//! with ChaCha20 output expansion.
//!
//! The generator keeps a 64-byte chaining value. Seeding keyed-hashes the
//! previous chaining value together with every platform entropy source and
//! refuses to mark the state usable unless the composed sources clear a
//! 425-bit floor. Output keys a 20-round ChaCha20 stream from the front of
//! the chain, then ratchets the chain through a one-shot hash so a captured
//! state cannot reproduce anything it already emitted.

use crate::entropy;
use anyhow::{anyhow, bail, Result};
use blake2::digest::Mac;
use blake2::{Blake2b512, Blake2bMac512, Digest};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// Tag value marking a pool that has absorbed enough entropy. Anything else
// at that position means unseeded, and every output call must refuse.
const SEEDED_TAG: [u8; 4] = *b"SEED";

// Minimum composed entropy across all sources, in bits. Verified to fail
// if set above what the source set can deliver.
const ENTROPY_FLOOR_BITS: u32 = 425;

/// Cryptographically seeded deterministic random generator.
///
/// Created by [`SecureRng::generate`] (fresh entropy from the platform) or
/// [`SecureRng::derive`] (fast fork from an existing generator). The state
/// is wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecureRng {
    chain: [u8; 64],
    tag: [u8; 4],
}

impl SecureRng {
    /// Creates a generator with no entropy behind it. Every output call
    /// fails until [`Self::seed`] succeeds.
    pub fn new_unseeded() -> Self {
        Self {
            chain: [0u8; 64],
            tag: [0u8; 4],
        }
    }

    /// Creates and seeds a generator in one step.
    ///
    /// `extra` is optional caller entropy folded in alongside the platform
    /// sources. The first call on a freshly booted system may block while
    /// the blocking randomness pool fills.
    pub fn generate(extra: Option<&[u8]>) -> Result<Self> {
        let mut rng = Self::new_unseeded();
        rng.seed(extra)?;
        Ok(rng)
    }

    /// Whether the pool has been seeded.
    pub fn is_seeded(&self) -> bool {
        self.tag == SEEDED_TAG
    }

    /// Reseeds the pool from every platform entropy source.
    ///
    /// The previous chaining value keys the composition hash, so existing
    /// entropy is never thrown away, only added to. Fails without marking
    /// the state seeded if the composed sources fall below the entropy
    /// floor or the OS randomness device stays exhausted past its retry
    /// bound.
    pub fn seed(&mut self, extra: Option<&[u8]>) -> Result<()> {
        let mut entropy_bits = 0u32;

        // Previous (or zeroed) chaining value acts as the key.
        let mut mac = Blake2bMac512::new_from_slice(&self.chain)
            .map_err(|_| anyhow!("pool hash rejected chaining key"))?;

        if let Some(extra) = extra {
            if !extra.is_empty() {
                mac.update(extra);
            }
        }

        // 1. Initial high-resolution counter sample.
        mac.update(&entropy::cycle_count().to_le_bytes());
        entropy_bits += 32;

        // 2. Operating-system randomness.
        let mut os = Zeroizing::new([0u8; 32]);
        entropy::os_random(&mut os)?;
        mac.update(os.as_ref());
        entropy_bits += 256;

        // 3. Process and thread identity.
        mac.update(&entropy::process_id().to_le_bytes());
        entropy_bits += 32;
        mac.update(&entropy::thread_id_digest().to_le_bytes());
        entropy_bits += 32;
        mac.update(&entropy::thread_handle_digest().to_le_bytes());
        entropy_bits += 32;

        // 4. Microsecond wall clock.
        mac.update(&entropy::micro_clock().to_le_bytes());
        entropy_bits += 32;

        // 5. Legacy generator, reseeded from its own previous draw.
        let draws = entropy::legacy_draws();
        mac.update(&draws[0].to_le_bytes());
        mac.update(&draws[1].to_le_bytes());
        entropy_bits += 40;

        // 6. Second counter sample plus the process-wide seed counter.
        mac.update(&entropy::cycle_count().to_le_bytes());
        entropy_bits += 9;
        mac.update(&entropy::next_counter().to_le_bytes());
        entropy_bits += 1;

        let digest = mac.finalize().into_bytes();
        self.chain.copy_from_slice(&digest);

        if entropy_bits < ENTROPY_FLOOR_BITS {
            // Tag stays cleared: the pool refuses to produce output.
            bail!("composed entropy below the seeding floor");
        }
        self.tag = SEEDED_TAG;
        Ok(())
    }

    /// Forks a child generator from `parent` without touching the OS
    /// entropy sources, for per-thread or staged use where waiting on the
    /// blocking pool is unacceptable.
    pub fn derive(parent: &mut SecureRng, extra: Option<&[u8]>) -> Result<Self> {
        let mut child = Self::new_unseeded();

        let mut mac = Blake2bMac512::new_from_slice(&child.chain)
            .map_err(|_| anyhow!("pool hash rejected chaining key"))?;
        if let Some(extra) = extra {
            if !extra.is_empty() {
                mac.update(extra);
            }
        }

        let mut feed = Zeroizing::new([0u8; 64]);
        parent.fill_random(feed.as_mut())?;
        mac.update(feed.as_ref());

        let digest = mac.finalize().into_bytes();
        child.chain.copy_from_slice(&digest);
        child.tag = SEEDED_TAG;
        Ok(child)
    }

    /// XORs `out.len()` bytes of generator output over `out`.
    ///
    /// Requires a seeded pool and a non-empty buffer. The chain ratchets
    /// forward after every call.
    pub fn fill_random(&mut self, out: &mut [u8]) -> Result<()> {
        if !self.is_seeded() {
            bail!("generator has not been seeded");
        }
        if out.is_empty() {
            bail!("output buffer is empty");
        }

        // Front of the chain keys the stream; the next 8 bytes are the
        // stream id, perturbed in place with fast-moving samples so two
        // threads racing on cloned state cannot line up.
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&self.chain[..32]);

        let mut w0 = u32::from_le_bytes(self.chain[32..36].try_into().expect("4-byte slice"));
        let mut w1 = u32::from_le_bytes(self.chain[36..40].try_into().expect("4-byte slice"));
        w0 ^= entropy::cycle_count();
        w1 ^= entropy::thread_id_digest() as u32;
        w0 = w0.wrapping_add(entropy::next_counter().rotate_left(13));
        self.chain[32..36].copy_from_slice(&w0.to_le_bytes());
        self.chain[36..40].copy_from_slice(&w1.to_le_bytes());

        let mut cipher = ChaCha20Rng::from_seed(*key);
        cipher.set_stream(u64::from(w0) | (u64::from(w1) << 32));

        let mut keystream = Zeroizing::new([0u8; 128]);
        for chunk in out.chunks_mut(128) {
            cipher.fill_bytes(&mut keystream[..chunk.len()]);
            for (dst, ks) in chunk.iter_mut().zip(keystream.iter()) {
                *dst ^= ks;
            }
        }

        // Final cycle sample folds into the second stream-id word before
        // the chain rolls forward.
        w1 = w1.wrapping_add(entropy::cycle_count());
        self.chain[36..40].copy_from_slice(&w1.to_le_bytes());

        // Ratchet. Hashing the chain onto itself erases the key that
        // produced this output.
        let digest = Blake2b512::digest(self.chain);
        self.chain.copy_from_slice(&digest);
        Ok(())
    }

    /// Returns a fixed-size array of generator output.
    pub fn random_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        self.fill_random(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseeded_pool_refuses_output() {
        let mut rng = SecureRng::new_unseeded();
        assert!(!rng.is_seeded());
        let mut buf = [0u8; 16];
        assert!(rng.fill_random(&mut buf).is_err());
    }

    #[test]
    fn test_seeded_pool_fills_any_length() {
        let mut rng = SecureRng::generate(Some(b"unit test seed")).unwrap();
        assert!(rng.is_seeded());
        for n in [1usize, 7, 32, 64, 65, 127, 128, 129, 1000] {
            let mut buf = vec![0u8; n];
            rng.fill_random(&mut buf).unwrap();
            assert_eq!(buf.len(), n);
        }
    }

    #[test]
    fn test_empty_buffer_is_misuse() {
        let mut rng = SecureRng::generate(None).unwrap();
        assert!(rng.fill_random(&mut []).is_err());
    }

    #[test]
    fn test_subsequent_outputs_differ() {
        let mut rng = SecureRng::generate(None).unwrap();
        let a: [u8; 32] = rng.random_array().unwrap();
        let b: [u8; 32] = rng.random_array().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_xor_discipline_over_existing_bytes() {
        // The same state never recurs, so XOR output over a prepared
        // buffer still has to differ from XOR over a zeroed buffer.
        let mut rng = SecureRng::generate(None).unwrap();
        let mut zeroed = [0u8; 48];
        let mut prepared = [0x5Au8; 48];
        rng.fill_random(&mut zeroed).unwrap();
        rng.fill_random(&mut prepared).unwrap();
        assert_ne!(zeroed, prepared);
    }

    #[test]
    fn test_ratchet_cannot_replay_output() {
        let mut rng = SecureRng::generate(Some(b"forward secrecy")).unwrap();
        let r1: [u8; 64] = rng.random_array().unwrap();
        let r2: [u8; 64] = rng.random_array().unwrap();

        // Rebuild a generator from the post-output state: it must not be
        // able to reproduce anything emitted before the ratchet.
        let mut replay = SecureRng {
            chain: rng.chain,
            tag: rng.tag,
        };
        let r3: [u8; 64] = replay.random_array().unwrap();
        assert_ne!(r1, r3);
        assert_ne!(r2, r3);
    }

    #[test]
    fn test_derived_child_is_independent() {
        let mut parent = SecureRng::generate(None).unwrap();
        let mut child = SecureRng::derive(&mut parent, Some(b"worker")).unwrap();
        assert!(child.is_seeded());
        let a: [u8; 32] = parent.random_array().unwrap();
        let b: [u8; 32] = child.random_array().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_reseed_keeps_pool_usable() {
        let mut rng = SecureRng::generate(None).unwrap();
        let before: [u8; 32] = rng.random_array().unwrap();
        rng.seed(Some(b"more entropy")).unwrap();
        let after: [u8; 32] = rng.random_array().unwrap();
        assert_ne!(before, after);
    }
}
