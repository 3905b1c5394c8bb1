//! Password-authenticated proof protocol.
//!
//! A password is bound to a (username, realm) pair through a memory-hard
//! stretch and stored server-side only as the group element V = x·G. Login
//! runs a two-round challenge/response with mutual proofs: the server
//! learns whether the client knows x without ever learning x, the verifier
//! never crosses the wire, and a passive observer gains nothing usable for
//! an offline dictionary attack.
//!
//! Wire shape (all blobs framed with a 4-byte magic):
//!
//! ```text
//! server -> client   challenge      = LKC1 ‖ B            (B = b·G)
//! client -> server   client proof   = LKP1 ‖ A ‖ M1       (A = a·G)
//! server -> client   server proof   = k[32..64]
//! ```
//!
//! with u = H(dst ‖ challenge ‖ A ‖ V) mod q, S = (a + u·x)·B = b·(A + u·V),
//! and k = H(dst ‖ S ‖ A ‖ B ‖ V ‖ H(username)). M1 is k[0..32]; the halves
//! of k are the two proofs, compared in constant time on both sides.

use crate::group;
use crate::rng::SecureRng;
use crate::wipe;
use anyhow::{anyhow, bail, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use blake2::{Blake2b512, Digest};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// magic ‖ m_cost ‖ t_cost ‖ V.
pub const VERIFIER_LEN: usize = 44;
/// magic ‖ B.
pub const CHALLENGE_LEN: usize = 36;
/// magic ‖ b ‖ V ‖ B ‖ username digest.
pub const CHALLENGE_SECRET_LEN: usize = 132;
/// magic ‖ A ‖ M1.
pub const CLIENT_PROOF_LEN: usize = 68;
pub const SERVER_PROOF_LEN: usize = 32;

const VERIFIER_MAGIC: [u8; 4] = *b"LKV1";
const CHALLENGE_MAGIC: [u8; 4] = *b"LKC1";
const SECRET_MAGIC: [u8; 4] = *b"LKS1";
const PROOF_MAGIC: [u8; 4] = *b"LKP1";

const DST_SALT: &[u8] = b"latchkey.pake.salt";
const DST_SCRAMBLE: &[u8] = b"latchkey.pake.scramble";
const DST_CONFIRM: &[u8] = b"latchkey.pake.confirm";

/// Cost parameters for the password stretch.
///
/// Defaults are the production values (19 MiB, two passes, one lane);
/// raise them as hardware allows. Verifiers embed the costs they were
/// created with, so existing users keep working across an upgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StretchParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    /// Number of passes.
    pub t_cost: u32,
    /// Lanes. Kept at 1 for verifier compatibility.
    pub lanes: u32,
}

impl Default for StretchParams {
    fn default() -> Self {
        Self {
            m_cost: 19_456,
            t_cost: 2,
            lanes: 1,
        }
    }
}

/// The stretched password secret x, encoded as a canonical scalar.
///
/// A client may cache it to skip the expensive stretch at login, or
/// re-derive it from the password every time. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StretchedKey([u8; 32]);

impl StretchedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        group::decode_scalar(bytes)?;
        Ok(Self(*bytes))
    }
}

/// Derives x from (username, realm, password).
///
/// The salt is a digest of the length-framed username and the realm, so the
/// same password in two realms (or under two usernames) yields unrelated
/// verifiers. The stretch is Argon2id; expect it to take a while at the
/// default costs.
pub fn stretch_password(
    username: &[u8],
    realm: &[u8],
    password: &[u8],
    params: &StretchParams,
) -> Result<StretchedKey> {
    if username.is_empty() || realm.is_empty() || password.is_empty() {
        bail!("username, realm and password must be non-empty");
    }

    let mut hasher = Blake2b512::new();
    Digest::update(&mut hasher, DST_SALT);
    Digest::update(&mut hasher, &(username.len() as u64).to_le_bytes());
    Digest::update(&mut hasher, username);
    Digest::update(&mut hasher, realm);
    let salt = hasher.finalize();

    let argon_params = Params::new(params.m_cost, params.t_cost, params.lanes, Some(64))
        .map_err(|e| anyhow!("invalid stretch parameters: {e}"))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut wide = Zeroizing::new([0u8; 64]);
    argon
        .hash_password_into(password, &salt[..32], wide.as_mut())
        .map_err(|e| anyhow!("password stretch failed: {e}"))?;

    let mut x = group::reduce_wide(&wide);
    if x == Scalar::ZERO {
        bail!("degenerate stretched secret");
    }
    let key = StretchedKey(x.to_bytes());
    x.zeroize();
    Ok(key)
}

/// Long-term verifier V = x·G stored in the server's user database,
/// framed with the stretch costs it was generated under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verifier {
    point: [u8; 32],
    m_cost: u32,
    t_cost: u32,
}

impl Verifier {
    /// Builds the verifier for a stretched secret. Run client-side,
    /// offline; only the result is given to the server.
    pub fn generate(key: &StretchedKey, params: &StretchParams) -> Result<Self> {
        let mut x = group::decode_scalar(key.as_bytes())?;
        let v = RistrettoPoint::mul_base(&x);
        x.zeroize();
        Ok(Self {
            point: group::encode_point(&v),
            m_cost: params.m_cost,
            t_cost: params.t_cost,
        })
    }

    /// The stretch parameters this verifier was created with.
    pub fn params(&self) -> StretchParams {
        StretchParams {
            m_cost: self.m_cost,
            t_cost: self.t_cost,
            lanes: 1,
        }
    }

    pub fn to_bytes(&self) -> [u8; VERIFIER_LEN] {
        let mut out = [0u8; VERIFIER_LEN];
        out[..4].copy_from_slice(&VERIFIER_MAGIC);
        out[4..8].copy_from_slice(&self.m_cost.to_le_bytes());
        out[8..12].copy_from_slice(&self.t_cost.to_le_bytes());
        out[12..].copy_from_slice(&self.point);
        out
    }

    pub fn from_bytes(bytes: &[u8; VERIFIER_LEN]) -> Result<Self> {
        if bytes[..4] != VERIFIER_MAGIC {
            bail!("malformed verifier");
        }
        let point: [u8; 32] = bytes[12..].try_into().expect("32-byte slice");
        group::decode_point(&point)?;
        Ok(Self {
            point,
            m_cost: u32::from_le_bytes(bytes[4..8].try_into().expect("4-byte slice")),
            t_cost: u32::from_le_bytes(bytes[8..12].try_into().expect("4-byte slice")),
        })
    }

    pub(crate) fn point_bytes(&self) -> &[u8; 32] {
        &self.point
    }
}

/// Server-held state for one outstanding challenge: the ephemeral scalar
/// b plus everything the proof check must be bound to. Wiped on drop;
/// serialize with [`ChallengeSecret::to_bytes`] if it has to survive
/// between requests, and protect the blob like any other key material.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChallengeSecret {
    b: [u8; 32],
    verifier_point: [u8; 32],
    challenge_point: [u8; 32],
    username_digest: [u8; 32],
}

impl ChallengeSecret {
    pub fn to_bytes(&self) -> [u8; CHALLENGE_SECRET_LEN] {
        let mut out = [0u8; CHALLENGE_SECRET_LEN];
        out[..4].copy_from_slice(&SECRET_MAGIC);
        out[4..36].copy_from_slice(&self.b);
        out[36..68].copy_from_slice(&self.verifier_point);
        out[68..100].copy_from_slice(&self.challenge_point);
        out[100..].copy_from_slice(&self.username_digest);
        out
    }

    pub fn from_bytes(bytes: &[u8; CHALLENGE_SECRET_LEN]) -> Result<Self> {
        if bytes[..4] != SECRET_MAGIC {
            bail!("malformed challenge secret");
        }
        let b: [u8; 32] = bytes[4..36].try_into().expect("32-byte slice");
        let verifier_point: [u8; 32] = bytes[36..68].try_into().expect("32-byte slice");
        let challenge_point: [u8; 32] = bytes[68..100].try_into().expect("32-byte slice");
        group::decode_scalar(&b)?;
        group::decode_point(&verifier_point)?;
        group::decode_point(&challenge_point)?;
        Ok(Self {
            b,
            verifier_point,
            challenge_point,
            username_digest: bytes[100..].try_into().expect("32-byte slice"),
        })
    }
}

/// Client-kept half of the confirmation digest, checked against the
/// server proof at the end of the exchange.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ServerCheck([u8; 32]);

impl ServerCheck {
    /// Constant-time comparison against the server's proof. Success means
    /// the server really holds the verifier.
    pub fn confirm(&self, proof: &ServerProof) -> Result<()> {
        if !wipe::ct_eq(&self.0, &proof.0) {
            bail!("server proof rejected");
        }
        Ok(())
    }
}

/// The server's 32-byte answer to a valid client proof.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ServerProof([u8; SERVER_PROOF_LEN]);

impl ServerProof {
    pub fn as_bytes(&self) -> &[u8; SERVER_PROOF_LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8; SERVER_PROOF_LEN]) -> Self {
        Self(*bytes)
    }
}

fn username_digest(username: &[u8]) -> [u8; 32] {
    let digest = Blake2b512::digest(username);
    digest[..32].try_into().expect("32-byte slice")
}

/// u = H(dst ‖ challenge ‖ A ‖ V) mod q.
fn scramble_scalar(challenge: &[u8; CHALLENGE_LEN], a: &[u8; 32], v: &[u8; 32]) -> Scalar {
    let mut hasher = Blake2b512::new();
    Digest::update(&mut hasher, DST_SCRAMBLE);
    Digest::update(&mut hasher, challenge);
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, v);
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    let u = group::reduce_wide(&wide);
    wide.zeroize();
    u
}

/// k = H(dst ‖ S ‖ A ‖ B ‖ V ‖ U). Low half is the client proof, high half
/// the server proof.
fn confirmation_digest(
    s: &[u8; 32],
    a: &[u8; 32],
    b: &[u8; 32],
    v: &[u8; 32],
    uname: &[u8; 32],
) -> Zeroizing<[u8; 64]> {
    let mut hasher = Blake2b512::new();
    Digest::update(&mut hasher, DST_CONFIRM);
    Digest::update(&mut hasher, s);
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    Digest::update(&mut hasher, v);
    Digest::update(&mut hasher, uname);
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Opens a challenge for a login attempt against a stored verifier.
pub(crate) fn create_challenge(
    rng: &mut SecureRng,
    username: &[u8],
    verifier: &Verifier,
) -> Result<(ChallengeSecret, [u8; CHALLENGE_LEN])> {
    if username.is_empty() {
        bail!("username must be non-empty");
    }

    let (mut b, big_b) = group::random_keypair(rng)?;
    let challenge_point = group::encode_point(&big_b);

    let mut challenge = [0u8; CHALLENGE_LEN];
    challenge[..4].copy_from_slice(&CHALLENGE_MAGIC);
    challenge[4..].copy_from_slice(&challenge_point);

    let secret = ChallengeSecret {
        b: b.to_bytes(),
        verifier_point: *verifier.point_bytes(),
        challenge_point,
        username_digest: username_digest(username),
    };
    b.zeroize();
    Ok((secret, challenge))
}

/// Client answer to a challenge: the commitment A and the proof half M1,
/// plus the check value the server's own proof must match later.
pub(crate) fn create_client_proof(
    rng: &mut SecureRng,
    username: &[u8],
    challenge: &[u8; CHALLENGE_LEN],
    key: &StretchedKey,
) -> Result<(ServerCheck, [u8; CLIENT_PROOF_LEN])> {
    if username.is_empty() {
        bail!("username must be non-empty");
    }
    if challenge[..4] != CHALLENGE_MAGIC {
        bail!("malformed challenge");
    }
    let b_bytes: [u8; 32] = challenge[4..].try_into().expect("32-byte slice");
    let big_b = group::decode_point(&b_bytes)?;

    let mut x = group::decode_scalar(key.as_bytes())?;
    let v_bytes = group::encode_point(&RistrettoPoint::mul_base(&x));

    // Fresh commitment, redrawn until both derived scalars are usable.
    let (a_bytes, mut blind) = loop {
        let (mut a, big_a) = group::random_keypair(rng)?;
        let a_bytes = group::encode_point(&big_a);
        let u = scramble_scalar(challenge, &a_bytes, &v_bytes);
        if u == Scalar::ZERO {
            a.zeroize();
            continue;
        }
        // a + u·x
        let blind = a + u * x;
        a.zeroize();
        if blind == Scalar::ZERO {
            continue;
        }
        break (a_bytes, blind);
    };

    // S = (a + u·x)·B
    let mut s_point = &big_b * &blind;
    let s_bytes = Zeroizing::new(group::encode_point(&s_point));
    let k = confirmation_digest(&s_bytes, &a_bytes, &b_bytes, &v_bytes, &username_digest(username));

    let mut proof = [0u8; CLIENT_PROOF_LEN];
    proof[..4].copy_from_slice(&PROOF_MAGIC);
    proof[4..36].copy_from_slice(&a_bytes);
    proof[36..].copy_from_slice(&k[..32]);

    let mut check = [0u8; 32];
    check.copy_from_slice(&k[32..]);

    x.zeroize();
    blind.zeroize();
    s_point.zeroize();
    Ok((ServerCheck(check), proof))
}

/// Checks a client proof against the held challenge secret. Success proves
/// the client knew the stretched secret; the returned proof closes the
/// loop on the client side.
pub fn verify_client_proof(
    secret: &ChallengeSecret,
    proof: &[u8; CLIENT_PROOF_LEN],
) -> Result<ServerProof> {
    if proof[..4] != PROOF_MAGIC {
        bail!("malformed client proof");
    }
    let a_bytes: [u8; 32] = proof[4..36].try_into().expect("32-byte slice");
    let m1 = &proof[36..];

    let big_a = group::decode_point(&a_bytes)?;
    let v_point = group::decode_point(&secret.verifier_point)?;
    let mut b = group::decode_scalar(&secret.b)?;

    // Rebuild the challenge bytes the client hashed over.
    let mut challenge = [0u8; CHALLENGE_LEN];
    challenge[..4].copy_from_slice(&CHALLENGE_MAGIC);
    challenge[4..].copy_from_slice(&secret.challenge_point);

    let u = scramble_scalar(&challenge, &a_bytes, &secret.verifier_point);
    if u == Scalar::ZERO {
        b.zeroize();
        bail!("degenerate scramble value");
    }

    // S = b·(A + u·V), equal to the client's (a + u·x)·B.
    let mut s_point = (big_a + v_point * u) * b;
    let s_bytes = Zeroizing::new(group::encode_point(&s_point));
    let k = confirmation_digest(
        &s_bytes,
        &a_bytes,
        &secret.challenge_point,
        &secret.verifier_point,
        &secret.username_digest,
    );

    let accepted = wipe::ct_eq(&k[..32], m1);
    b.zeroize();
    s_point.zeroize();
    if !accepted {
        bail!("password proof rejected");
    }

    let mut out = [0u8; SERVER_PROOF_LEN];
    out.copy_from_slice(&k[32..]);
    Ok(ServerProof(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reduced costs so the stretch stays fast under test.
    fn light_params() -> StretchParams {
        StretchParams {
            m_cost: 1024,
            t_cost: 1,
            lanes: 1,
        }
    }

    fn run_login(
        verifier: &Verifier,
        username: &[u8],
        key: &StretchedKey,
    ) -> (Result<ServerProof>, ServerCheck) {
        let mut rng = SecureRng::generate(Some(b"password tests")).unwrap();
        let (secret, challenge) = create_challenge(&mut rng, username, verifier).unwrap();
        let (check, proof) = create_client_proof(&mut rng, username, &challenge, key).unwrap();
        (verify_client_proof(&secret, &proof), check)
    }

    #[test]
    fn test_full_round_trip() {
        let params = light_params();
        let username = b"alice";
        let key =
            stretch_password(username, b"APP", b"correct horse battery staple", &params).unwrap();
        let verifier = Verifier::generate(&key, &params).unwrap();

        let (proof, check) = run_login(&verifier, username, &key);
        check.confirm(&proof.unwrap()).unwrap();
    }

    #[test]
    fn test_wrong_password_is_rejected() {
        let params = light_params();
        let username = b"alice";
        let key =
            stretch_password(username, b"APP", b"correct horse battery staple", &params).unwrap();
        let verifier = Verifier::generate(&key, &params).unwrap();

        let wrong = stretch_password(username, b"APP", b"incorrect", &params).unwrap();
        let (proof, _) = run_login(&verifier, username, &wrong);
        assert!(proof.is_err());
    }

    #[test]
    fn test_realm_and_username_separate_the_stretch() {
        let params = light_params();
        let base = stretch_password(b"alice", b"APP", b"hunter2", &params).unwrap();
        let other_realm = stretch_password(b"alice", b"OTHER", b"hunter2", &params).unwrap();
        let other_user = stretch_password(b"bob", b"APP", b"hunter2", &params).unwrap();
        assert_ne!(base.as_bytes(), other_realm.as_bytes());
        assert_ne!(base.as_bytes(), other_user.as_bytes());
    }

    #[test]
    fn test_empty_inputs_are_misuse() {
        let params = light_params();
        assert!(stretch_password(b"", b"APP", b"pw", &params).is_err());
        assert!(stretch_password(b"alice", b"", b"pw", &params).is_err());
        assert!(stretch_password(b"alice", b"APP", b"", &params).is_err());
    }

    #[test]
    fn test_verifier_round_trip_and_tamper() {
        let params = light_params();
        let key = stretch_password(b"alice", b"APP", b"pw", &params).unwrap();
        let verifier = Verifier::generate(&key, &params).unwrap();

        let bytes = verifier.to_bytes();
        let restored = Verifier::from_bytes(&bytes).unwrap();
        assert_eq!(verifier, restored);
        assert_eq!(restored.params().m_cost, params.m_cost);

        // Any flipped bit in the stored verifier must fail the decode or
        // change the point (which then fails the exchange).
        let mut bad = bytes;
        bad[0] ^= 0x01;
        assert!(Verifier::from_bytes(&bad).is_err());
        let mut bad = bytes;
        bad[20] ^= 0x01;
        assert!(Verifier::from_bytes(&bad).is_err() || {
            let tampered = Verifier::from_bytes(&bad).unwrap();
            let (proof, _) = run_login(&tampered, b"alice", &key);
            proof.is_err()
        });
    }

    #[test]
    fn test_challenge_tamper_is_rejected() {
        let params = light_params();
        let username = b"alice";
        let key = stretch_password(username, b"APP", b"pw", &params).unwrap();
        let verifier = Verifier::generate(&key, &params).unwrap();

        let mut rng = SecureRng::generate(None).unwrap();
        let (secret, challenge) = create_challenge(&mut rng, username, &verifier).unwrap();

        // Magic flip dies immediately; point flips die at decode or at the
        // final proof check.
        let mut bad = challenge;
        bad[1] ^= 0x40;
        assert!(create_client_proof(&mut rng, username, &bad, &key).is_err());

        let mut bad = challenge;
        bad[10] ^= 0x04;
        let outcome = create_client_proof(&mut rng, username, &bad, &key);
        if let Ok((_, proof)) = outcome {
            assert!(verify_client_proof(&secret, &proof).is_err());
        }
    }

    #[test]
    fn test_client_proof_tamper_is_rejected() {
        let params = light_params();
        let username = b"alice";
        let key = stretch_password(username, b"APP", b"pw", &params).unwrap();
        let verifier = Verifier::generate(&key, &params).unwrap();

        let mut rng = SecureRng::generate(None).unwrap();
        let (secret, challenge) = create_challenge(&mut rng, username, &verifier).unwrap();
        let (_, proof) = create_client_proof(&mut rng, username, &challenge, &key).unwrap();

        for &byte in &[0usize, 4, 20, 35, 36, 50, 67] {
            let mut bad = proof;
            bad[byte] ^= 0x08;
            assert!(
                verify_client_proof(&secret, &bad).is_err(),
                "accepted a flip in byte {byte}"
            );
        }
    }

    #[test]
    fn test_challenge_secret_round_trip() {
        let params = light_params();
        let username = b"alice";
        let key = stretch_password(username, b"APP", b"pw", &params).unwrap();
        let verifier = Verifier::generate(&key, &params).unwrap();

        let mut rng = SecureRng::generate(None).unwrap();
        let (secret, challenge) = create_challenge(&mut rng, username, &verifier).unwrap();
        let restored = ChallengeSecret::from_bytes(&secret.to_bytes()).unwrap();

        // The restored secret still verifies the same login.
        let (check, proof) = create_client_proof(&mut rng, username, &challenge, &key).unwrap();
        let server_proof = verify_client_proof(&restored, &proof).unwrap();
        check.confirm(&server_proof).unwrap();
    }

    #[test]
    fn test_stretched_key_is_cacheable() {
        let params = light_params();
        let username = b"alice";
        let key = stretch_password(username, b"APP", b"pw", &params).unwrap();
        let verifier = Verifier::generate(&key, &params).unwrap();

        // A key restored from its cached bytes logs in like the original.
        let cached = StretchedKey::from_bytes(key.as_bytes()).unwrap();
        let (proof, check) = run_login(&verifier, username, &cached);
        check.confirm(&proof.unwrap()).unwrap();
    }
}
