//! Compact handshake, signature, and password-proof library for securing
//! client/server sessions over untrusted networks.
//!
//! Four coupled capabilities share one elliptic-curve group (Ristretto255)
//! and one hash (BLAKE2b-512):
//!
//! - Long-term server identity: generation, 64-byte persistence blob, and
//!   deterministic-nonce signing ([`Server::sign`], [`verify`]).
//! - A one-round-trip mutually authenticated handshake yielding a shared
//!   32-byte [`SessionKey`], with the server's ephemeral key rotated by a
//!   lock-free background [`RekeyWorker`].
//! - A salted, memory-hard password proof protocol with mutual
//!   confirmation ([`password`]).
//! - The seeded generator underneath all of it ([`SecureRng`]), composed
//!   from many platform entropy sources with a hard floor.
//!
//! Transport, framing, retransmission and storage are the caller's: this
//! crate only turns byte blobs into byte blobs and keys.

use anyhow::{bail, Result};

// --- MODULE DECLARATIONS ---
mod entropy;   // Platform entropy sources
mod group;     // Uniform sampler and scalar/point codecs
pub mod handshake; // Client/server key agreement and rekey
pub mod password;  // Password stretch, verifier, challenge/response
pub mod rng;       // Seeded generator
pub mod sign;      // Identity signatures
mod wipe;      // Secure erase and constant-time compare

pub use handshake::{
    Client, PublicKey, RekeyWorker, Server, ServerSecret, SessionKey, CLIENT_REQUEST_LEN,
    NONCE_LEN, SERVER_RESPONSE_LEN, SERVER_SECRET_LEN, SESSION_KEY_LEN,
};
pub use password::{
    stretch_password, verify_client_proof, ChallengeSecret, ServerCheck, ServerProof,
    StretchParams, StretchedKey, Verifier, CHALLENGE_LEN, CHALLENGE_SECRET_LEN, CLIENT_PROOF_LEN,
    SERVER_PROOF_LEN, VERIFIER_LEN,
};
pub use rng::SecureRng;
pub use sign::{verify, SIGNATURE_LEN};
pub use wipe::wipe;

/// Compiled-in protocol version. Bumped on any wire or persistence change.
pub const PROTOCOL_VERSION: u32 = 3;

/// Version handshake: callers pass the version they were compiled against
/// and refuse to run on a mismatch.
pub fn init(expected_version: u32) -> Result<()> {
    if expected_version != PROTOCOL_VERSION {
        bail!(
            "protocol version mismatch: caller expects {expected_version}, library is {PROTOCOL_VERSION}"
        );
    }
    Ok(())
}

// Wire-layout compatibility pins.
const _: () = assert!(CLIENT_REQUEST_LEN == 32 + NONCE_LEN);
const _: () = assert!(SERVER_RESPONSE_LEN == 32 + NONCE_LEN + 32);
const _: () = assert!(SIGNATURE_LEN == 64);
const _: () = assert!(SERVER_SECRET_LEN == 64);
const _: () = assert!(CHALLENGE_SECRET_LEN == 4 + 32 + 32 + 32 + 32);
