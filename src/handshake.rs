//! One-round-trip mutually authenticated key agreement.
//!
//! The client sends its ephemeral public point and a nonce; the server
//! answers with its ephemeral point, its own nonce and a proof, and both
//! sides hold the same 32-byte session key. The server's ephemeral key
//! rotates through a lock-free staging slot written by a background rekey
//! worker and consumed by the next handshake.
//!
//! Lost responses are the caller's problem: replay the cached response for
//! a retransmitted request instead of running the handshake again, because
//! a second run draws a different server nonce.

use crate::group;
use crate::password::{self, ChallengeSecret, StretchedKey, Verifier, CHALLENGE_LEN, CLIENT_PROOF_LEN};
use crate::rng::SecureRng;
use crate::sign::{self, SIGNATURE_LEN};
use crate::wipe;
use anyhow::{bail, Result};
use blake2::{Blake2b512, Digest};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const NONCE_LEN: usize = 32;
/// CP(32) ‖ CN(32).
pub const CLIENT_REQUEST_LEN: usize = 64;
/// EP(32) ‖ SN(32) ‖ proof(32).
pub const SERVER_RESPONSE_LEN: usize = 96;
pub const SESSION_KEY_LEN: usize = 32;
/// SS(32) ‖ signing-nonce key(32).
pub const SERVER_SECRET_LEN: usize = 64;

// Rekey staging flag values. The worker moves 1 -> 2, the handshake moves
// 2 -> 1; nothing else touches the flag.
const NEED_REKEY: u32 = 1;
const REKEY_DONE: u32 = 2;

/// Server long-term public key, validated on construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        group::decode_point(bytes)?;
        Ok(Self(*bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Shared 32-byte session secret. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

/// Long-term server secret blob: SS ‖ signing-nonce key. Contains private
/// key material; store it in a protected keystore. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ServerSecret([u8; SERVER_SECRET_LEN]);

impl ServerSecret {
    pub fn from_bytes(bytes: &[u8; SERVER_SECRET_LEN]) -> Self {
        Self(*bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SERVER_SECRET_LEN] {
        &self.0
    }
}

/// H = BLAKE2b(CP ‖ CN ‖ EP ‖ SP ‖ SN).
fn transcript_hash(
    cp: &[u8; 32],
    cn: &[u8; NONCE_LEN],
    ep: &[u8; 32],
    sp: &[u8; 32],
    sn: &[u8; NONCE_LEN],
) -> Zeroizing<[u8; 64]> {
    let mut hasher = Blake2b512::new();
    Digest::update(&mut hasher, cp);
    Digest::update(&mut hasher, cn);
    Digest::update(&mut hasher, ep);
    Digest::update(&mut hasher, sp);
    Digest::update(&mut hasher, sn);
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&hasher.finalize());
    out
}

/// k = BLAKE2b(T ‖ H): low half is the session key, high half the proof.
fn session_digest(t_bytes: &[u8; 32], transcript: &[u8; 64]) -> Zeroizing<[u8; 64]> {
    let mut hasher = Blake2b512::new();
    Digest::update(&mut hasher, t_bytes);
    Digest::update(&mut hasher, transcript);
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Client side of the handshake: one ephemeral keypair plus the nonce that
/// went into the outstanding request.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Client {
    rng: SecureRng,
    secret: Scalar,
    public_bytes: [u8; 32],
    nonce: [u8; NONCE_LEN],
}

impl Client {
    /// Creates a client and its request blob. `extra` is optional caller
    /// entropy folded into the generator seed.
    pub fn generate(extra: Option<&[u8]>) -> Result<(Self, [u8; CLIENT_REQUEST_LEN])> {
        let mut rng = SecureRng::generate(extra)?;
        let (secret, public) = group::random_keypair(&mut rng)?;
        let nonce: [u8; NONCE_LEN] = rng.random_array()?;
        let client = Self {
            rng,
            secret,
            public_bytes: group::encode_point(&public),
            nonce,
        };
        let request = client.request();
        Ok((client, request))
    }

    /// Resets the client for a fresh connection attempt without waiting on
    /// the OS entropy sources: the generator is forked from the old one,
    /// the keypair is kept, and only the nonce is redrawn.
    pub fn reconnect(&mut self, extra: Option<&[u8]>) -> Result<[u8; CLIENT_REQUEST_LEN]> {
        let fresh = SecureRng::derive(&mut self.rng, extra)?;
        self.rng = fresh;
        self.nonce = self.rng.random_array()?;
        Ok(self.request())
    }

    fn request(&self) -> [u8; CLIENT_REQUEST_LEN] {
        let mut request = [0u8; CLIENT_REQUEST_LEN];
        request[..32].copy_from_slice(&self.public_bytes);
        request[32..].copy_from_slice(&self.nonce);
        request
    }

    /// Processes the server response. This is the first place the server's
    /// public key enters on the client side; on success the returned key
    /// matches the server's, otherwise the response was invalid or forged.
    pub fn finish(
        &self,
        server_public: &PublicKey,
        response: &[u8; SERVER_RESPONSE_LEN],
    ) -> Result<SessionKey> {
        let ep_bytes: [u8; 32] = response[..32].try_into().expect("32-byte slice");
        let sn: [u8; NONCE_LEN] = response[32..64].try_into().expect("32-byte slice");
        let proof = &response[64..];

        let ep = group::decode_point(&ep_bytes)?;
        let sp = group::decode_point(server_public.as_bytes())?;

        let transcript = transcript_hash(
            &self.public_bytes,
            &self.nonce,
            &ep_bytes,
            server_public.as_bytes(),
            &sn,
        );
        let mut h = group::reduce_wide(&transcript);
        if h == Scalar::ZERO {
            bail!("degenerate handshake transcript");
        }

        // d = h·CS
        let mut d = h * self.secret;
        if d == Scalar::ZERO {
            h.zeroize();
            bail!("degenerate handshake scalar");
        }

        // T = CS·EP + d·SP. Both scalars are secret, so no vartime here.
        let mut t_point = &ep * &self.secret + &sp * &d;
        let t_bytes = Zeroizing::new(group::encode_point(&t_point));
        let k = session_digest(&t_bytes, &transcript);

        let accepted = wipe::ct_eq(&k[32..], proof);
        h.zeroize();
        d.zeroize();
        t_point.zeroize();
        if !accepted {
            bail!("handshake proof rejected");
        }

        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&k[..32]);
        Ok(SessionKey(key))
    }

    /// Answers a password challenge. See [`crate::password`].
    pub fn password_proof(
        &mut self,
        username: &[u8],
        challenge: &[u8; CHALLENGE_LEN],
        key: &StretchedKey,
    ) -> Result<(password::ServerCheck, [u8; CLIENT_PROOF_LEN])> {
        password::create_client_proof(&mut self.rng, username, challenge, key)
    }
}

// Ephemeral material prepared by the rekey worker, waiting for a handshake
// to make it live.
#[derive(Zeroize, ZeroizeOnDrop)]
struct StagedKeys {
    secret: Scalar,
    public_bytes: [u8; 32],
    rng: SecureRng,
}

// The staging slot. `flag` assigns `slot` to exactly one side at a time:
// NEED_REKEY means the worker may write it, REKEY_DONE means the next
// handshake may read it. Writers release-store after their writes, readers
// acquire-load before their reads.
struct Staging {
    flag: AtomicU32,
    worker_taken: AtomicBool,
    slot: UnsafeCell<StagedKeys>,
}

// SAFETY: the slot is accessed by at most one writer (the single
// `RekeyWorker`) and one reader (the `Server`, behind `&mut self`), and
// each side only touches it while `flag` assigns it ownership, with
// release/acquire ordering on every hand-off.
unsafe impl Send for Staging {}
unsafe impl Sync for Staging {}

/// Server side: long-term identity, live ephemeral keypair, signing-nonce
/// key, and the rekey staging slot.
pub struct Server {
    rng: SecureRng,
    secret: Scalar,
    public_bytes: [u8; 32],
    sign_key: [u8; 32],
    eph_secret: Scalar,
    eph_public_bytes: [u8; 32],
    staging: Arc<Staging>,
}

impl Server {
    /// Generates a fresh server identity. May block on first use while the
    /// OS entropy pool fills.
    pub fn generate(extra: Option<&[u8]>) -> Result<Self> {
        let mut rng = SecureRng::generate(extra)?;
        let (secret, public) = group::random_keypair(&mut rng)?;
        let public_bytes = group::encode_point(&public);
        let sign_key: [u8; 32] = rng.random_array()?;
        Self::assemble(rng, secret, public_bytes, sign_key)
    }

    /// Restores a server from a saved secret blob. The ephemeral keypair
    /// and generator state are always fresh; only the identity persists.
    pub fn load_secret(blob: &ServerSecret, extra: Option<&[u8]>) -> Result<Self> {
        let secret_bytes: [u8; 32] = blob.as_bytes()[..32].try_into().expect("32-byte slice");
        let sign_key: [u8; 32] = blob.as_bytes()[32..].try_into().expect("32-byte slice");
        let secret = group::decode_scalar(&secret_bytes)?;
        let public_bytes = group::encode_point(&RistrettoPoint::mul_base(&secret));
        let rng = SecureRng::generate(extra)?;
        Self::assemble(rng, secret, public_bytes, sign_key)
    }

    fn assemble(
        mut rng: SecureRng,
        secret: Scalar,
        public_bytes: [u8; 32],
        sign_key: [u8; 32],
    ) -> Result<Self> {
        let (eph_secret, eph_public) = group::random_keypair(&mut rng)?;
        // The slot owns its own generator so the worker never reads live
        // state across threads; promotion swaps the two.
        let staged_rng = SecureRng::derive(&mut rng, None)?;
        let staging = Arc::new(Staging {
            flag: AtomicU32::new(NEED_REKEY),
            worker_taken: AtomicBool::new(false),
            slot: UnsafeCell::new(StagedKeys {
                secret: Scalar::ZERO,
                public_bytes: [0u8; 32],
                rng: staged_rng,
            }),
        });
        Ok(Self {
            rng,
            secret,
            public_bytes,
            sign_key,
            eph_secret,
            eph_public_bytes: group::encode_point(&eph_public),
            staging,
        })
    }

    /// Saves the long-term secret: SS ‖ signing-nonce key.
    pub fn save_secret(&self) -> ServerSecret {
        let mut blob = [0u8; SERVER_SECRET_LEN];
        blob[..32].copy_from_slice(&self.secret.to_bytes());
        blob[32..].copy_from_slice(&self.sign_key);
        ServerSecret(blob)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.public_bytes)
    }

    /// Signs a message under the long-term identity key.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        sign::sign_message(&self.secret, &self.public_bytes, &self.sign_key, message)
    }

    /// Accepts a client request and produces the response plus the shared
    /// session key.
    pub fn handshake(
        &mut self,
        request: &[u8; CLIENT_REQUEST_LEN],
    ) -> Result<([u8; SERVER_RESPONSE_LEN], SessionKey)> {
        // Promote a finished rekey. The only place staged material becomes
        // live, and the only place the flag returns to NEED_REKEY.
        if self.staging.flag.load(Ordering::Acquire) == REKEY_DONE {
            // SAFETY: REKEY_DONE assigns the slot to this side; the worker
            // does not touch it until the flag reads NEED_REKEY again.
            let slot = unsafe { &mut *self.staging.slot.get() };
            self.eph_secret = slot.secret;
            self.eph_public_bytes = slot.public_bytes;
            mem::swap(&mut self.rng, &mut slot.rng);
            self.staging.flag.store(NEED_REKEY, Ordering::Release);
        }

        let cp_bytes: [u8; 32] = request[..32].try_into().expect("32-byte slice");
        let cn: [u8; NONCE_LEN] = request[32..].try_into().expect("32-byte slice");
        let cp = group::decode_point(&cp_bytes)?;

        // Redraw the server nonce until both derived scalars are usable.
        let (transcript, mut e, sn) = loop {
            let sn: [u8; NONCE_LEN] = self.rng.random_array()?;
            let transcript = transcript_hash(
                &cp_bytes,
                &cn,
                &self.eph_public_bytes,
                &self.public_bytes,
                &sn,
            );
            let mut h = group::reduce_wide(&transcript);
            if h == Scalar::ZERO {
                continue;
            }
            // e = h·SS + ES (mod q)
            let e = h * self.secret + self.eph_secret;
            h.zeroize();
            if e == Scalar::ZERO {
                continue;
            }
            break (transcript, e, sn);
        };

        // T = e·CP
        let mut t_point = &cp * &e;
        let t_bytes = Zeroizing::new(group::encode_point(&t_point));
        let k = session_digest(&t_bytes, &transcript);

        let mut response = [0u8; SERVER_RESPONSE_LEN];
        response[..32].copy_from_slice(&self.eph_public_bytes);
        response[32..64].copy_from_slice(&sn);
        response[64..].copy_from_slice(&k[32..]);

        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&k[..32]);

        e.zeroize();
        t_point.zeroize();
        Ok((response, SessionKey(key)))
    }

    /// Hands out the single background rekey handle. Fails on a second
    /// call: the staging slot supports exactly one writer.
    pub fn rekey_worker(&self) -> Result<RekeyWorker> {
        if self.staging.worker_taken.swap(true, Ordering::AcqRel) {
            bail!("rekey worker already taken");
        }
        Ok(RekeyWorker {
            staging: Arc::clone(&self.staging),
        })
    }

    /// Opens a password challenge for a login attempt. See
    /// [`crate::password`].
    pub fn password_challenge(
        &mut self,
        username: &[u8],
        verifier: &Verifier,
    ) -> Result<(ChallengeSecret, [u8; CHALLENGE_LEN])> {
        password::create_challenge(&mut self.rng, username, verifier)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.secret.zeroize();
        self.eph_secret.zeroize();
        self.sign_key.zeroize();
    }
}

/// Writer handle for the ephemeral-key staging slot. Obtain it once with
/// [`Server::rekey_worker`], move it to a background thread, and call
/// [`RekeyWorker::rekey`] no more often than about once per minute.
pub struct RekeyWorker {
    staging: Arc<Staging>,
}

impl RekeyWorker {
    /// Prepares a fresh staged ephemeral keypair. A no-op while a finished
    /// rekey is still waiting to be consumed by a handshake.
    pub fn rekey(&mut self, extra: Option<&[u8]>) -> Result<()> {
        if self.staging.flag.load(Ordering::Acquire) != NEED_REKEY {
            return Ok(());
        }
        // SAFETY: NEED_REKEY assigns the slot to this side; the handshake
        // does not touch it until the flag reads REKEY_DONE.
        let slot = unsafe { &mut *self.staging.slot.get() };
        slot.rng.seed(extra)?;
        let (secret, public) = group::random_keypair(&mut slot.rng)?;
        slot.secret = secret;
        slot.public_bytes = group::encode_point(&public);
        self.staging.flag.store(REKEY_DONE, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_agreement() {
        let mut server = Server::generate(Some(b"serverseed")).unwrap();
        let (client, request) = Client::generate(Some(b"clientseed")).unwrap();

        let (response, server_key) = server.handshake(&request).unwrap();
        let client_key = client.finish(&server.public_key(), &response).unwrap();
        assert_eq!(server_key.as_bytes(), client_key.as_bytes());
    }

    #[test]
    fn test_session_key_is_deterministic_in_the_response() {
        let mut server = Server::generate(None).unwrap();
        let (client, request) = Client::generate(None).unwrap();
        let (response, _) = server.handshake(&request).unwrap();

        let a = client.finish(&server.public_key(), &response).unwrap();
        let b = client.finish(&server.public_key(), &response).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_response_tamper_rejected() {
        let mut server = Server::generate(None).unwrap();
        let (client, request) = Client::generate(None).unwrap();
        let (response, _) = server.handshake(&request).unwrap();
        let public = server.public_key();

        // Byte 0 complemented: tampered EP (scenario from the wire layout:
        // EP ‖ SN ‖ proof). Then one flipped bit in every section.
        let mut bad = response;
        bad[0] = !bad[0];
        assert!(client.finish(&public, &bad).is_err());

        for &byte in &[5usize, 31, 32, 63, 64, 95] {
            for bit in [0u8, 3, 7] {
                let mut bad = response;
                bad[byte] ^= 1 << bit;
                assert!(
                    client.finish(&public, &bad).is_err(),
                    "accepted a flip in byte {byte} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn test_request_tamper_splits_the_keys() {
        let mut server = Server::generate(None).unwrap();
        let (client, request) = Client::generate(None).unwrap();

        // Flip a client-nonce bit in flight: the server still answers, but
        // the client must reject the response built over the wrong nonce.
        let mut bad = request;
        bad[40] ^= 0x10;
        let (response, _) = server.handshake(&bad).unwrap();
        assert!(client.finish(&server.public_key(), &response).is_err());
    }

    #[test]
    fn test_garbage_client_point_rejected() {
        let mut server = Server::generate(None).unwrap();
        let mut request = [0xFFu8; CLIENT_REQUEST_LEN];
        request[32..].copy_from_slice(&[1u8; 32]);
        assert!(server.handshake(&request).is_err());
    }

    #[test]
    fn test_reconnect_reuses_key_with_fresh_nonce() {
        let mut server = Server::generate(None).unwrap();
        let (mut client, first) = Client::generate(None).unwrap();
        let second = client.reconnect(None).unwrap();

        assert_eq!(first[..32], second[..32]);
        assert_ne!(first[32..], second[32..]);

        let (response, server_key) = server.handshake(&second).unwrap();
        let client_key = client.finish(&server.public_key(), &response).unwrap();
        assert_eq!(server_key.as_bytes(), client_key.as_bytes());
    }

    #[test]
    fn test_rekey_rotates_the_ephemeral_key() {
        let mut server = Server::generate(None).unwrap();
        let mut worker = server.rekey_worker().unwrap();

        let (client_a, request_a) = Client::generate(None).unwrap();
        let (response_a, key_a) = server.handshake(&request_a).unwrap();

        worker.rekey(Some(b"rotation")).unwrap();

        let (client_b, request_b) = Client::generate(None).unwrap();
        let (response_b, key_b) = server.handshake(&request_b).unwrap();

        // EP section must have changed across the rekey.
        assert_ne!(response_a[..32], response_b[..32]);

        // Both sessions, before and after the rotation, still agree.
        let public = server.public_key();
        let client_key_a = client_a.finish(&public, &response_a).unwrap();
        let client_key_b = client_b.finish(&public, &response_b).unwrap();
        assert_eq!(key_a.as_bytes(), client_key_a.as_bytes());
        assert_eq!(key_b.as_bytes(), client_key_b.as_bytes());
    }

    #[test]
    fn test_rekey_without_handshake_is_idempotent() {
        let server = Server::generate(None).unwrap();
        let mut worker = server.rekey_worker().unwrap();
        worker.rekey(None).unwrap();
        // Second call lands on REKEY_DONE and must be a no-op.
        worker.rekey(None).unwrap();
    }

    #[test]
    fn test_second_worker_is_refused() {
        let server = Server::generate(None).unwrap();
        let _worker = server.rekey_worker().unwrap();
        assert!(server.rekey_worker().is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let server = Server::generate(None).unwrap();
        let blob = server.save_secret();
        let restored = Server::load_secret(&blob, None).unwrap();
        assert_eq!(server.public_key(), restored.public_key());

        let sig = server.sign(b"persisted identity").unwrap();
        crate::sign::verify(b"persisted identity", &restored.public_key(), &sig).unwrap();
    }

    #[test]
    fn test_load_rejects_zero_scalar() {
        let blob = ServerSecret::from_bytes(&[0u8; SERVER_SECRET_LEN]);
        assert!(Server::load_secret(&blob, None).is_err());
    }
}
