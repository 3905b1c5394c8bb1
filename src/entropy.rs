//! Platform entropy sources feeding the pool seeding step.
//!
//! Each function here samples one independent source of unpredictability:
//! the operating system randomness device, a monotonic high-resolution
//! counter, process and thread identity, the wall clock, a legacy
//! pseudo-random generator, and a process-wide seed counter. None of these
//! is trusted on its own; `SecureRng::seed` hashes all of them together and
//! accounts their entropy against a hard floor.

use anyhow::{bail, Context, Result};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[cfg(unix)]
const RANDOM_DEVICE: &str = "/dev/random";
#[cfg(unix)]
const URANDOM_DEVICE: &str = "/dev/urandom";

// Bounded retries for short or failed device reads.
#[cfg(unix)]
const DEVICE_READ_RETRIES: u32 = 100;

/// Process-wide seed counter. Guarantees that two near-simultaneous seed
/// calls never sample identical source sets. The only module-global
/// mutable state in the crate besides the legacy-generator chain below.
static SEED_COUNTER: AtomicU32 = AtomicU32::new(0);

// Last draw of the legacy generator, folded into the next reseed.
static LEGACY_CHAIN: AtomicU64 = AtomicU64::new(0);

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Samples the high-resolution counter: nanoseconds of monotonic time since
/// the first sample taken by this process, truncated to 32 bits.
pub(crate) fn cycle_count() -> u32 {
    PROCESS_EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u32
}

/// Increments and returns the process-wide seed counter.
pub(crate) fn next_counter() -> u32 {
    SEED_COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn process_id() -> u32 {
    std::process::id()
}

/// Digest of the current thread id.
pub(crate) fn thread_id_digest() -> u64 {
    let mut h = DefaultHasher::new();
    std::thread::current().id().hash(&mut h);
    h.finish()
}

/// Digest of the current thread handle (id plus name, when one is set).
pub(crate) fn thread_handle_digest() -> u64 {
    let current = std::thread::current();
    let mut h = DefaultHasher::new();
    current.id().hash(&mut h);
    current.name().hash(&mut h);
    h.finish()
}

/// Microsecond wall-clock sample.
pub(crate) fn micro_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Two draws from a legacy pseudo-random generator reseeded with
/// `previous ^ time`, the classic `srand(rand() ^ time(0))` trick. Worth a
/// handful of bits at most, accounted accordingly by the caller.
pub(crate) fn legacy_draws() -> [u32; 2] {
    let prev = LEGACY_CHAIN.load(Ordering::Relaxed);
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut prg = SmallRng::seed_from_u64(prev ^ time);
    let draws = [prg.next_u32(), prg.next_u32()];
    LEGACY_CHAIN.store(draws[1] as u64, Ordering::Relaxed);
    draws
}

/// Fills `out` with 32 bytes of operating-system randomness.
///
/// On unix this takes 20 bytes from the blocking pool and 12 from the
/// non-blocking pool: most systems cache roughly 20 bytes for the blocking
/// device, and asking it for the full 32 can stall for a minute while the
/// non-blocking pool still holds fresh entropy of its own.
#[cfg(unix)]
pub(crate) fn os_random(out: &mut [u8; 32]) -> Result<()> {
    read_device(RANDOM_DEVICE, &mut out[..20])?;
    read_device(URANDOM_DEVICE, &mut out[20..])?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn os_random(out: &mut [u8; 32]) -> Result<()> {
    getrandom::fill(out).context("OS randomness unavailable")?;
    Ok(())
}

#[cfg(unix)]
fn read_device(path: &str, buf: &mut [u8]) -> Result<()> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open randomness device {path}"))?;
    let mut filled = 0usize;
    let mut retries = DEVICE_READ_RETRIES;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(n) if n > 0 => filled += n,
            // Short read or transient error: retry within the bound.
            _ => {
                if retries == 0 {
                    bail!("randomness device {path} exhausted retries");
                }
                retries -= 1;
            }
        }
    }
    Ok(())
}
