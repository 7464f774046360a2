//! Hash-mixed entropy pool.
//!
//! One process-wide 320-byte pool feeds every salt and master key. It is
//! seeded from the kernel CSPRNG at start, can be enriched with caller
//! entropy (mouse/keyboard timings from the UI collaborator), and is
//! self-tested after seeding. All mixing is XOR; the hash state is created
//! fresh for every digest pass.

use std::sync::Mutex;

use lazy_static::lazy_static;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;

/// Pool size in bytes.
pub const POOL_SIZE: usize = 320;

struct RngPool {
    data: Zeroizing<[u8; POOL_SIZE]>,
    read_cursor: usize,
    write_cursor: usize,
    bytes_since_mix: usize,
    hash: HashAlgorithm,
    running: bool,
}

impl RngPool {
    fn unstarted() -> RngPool {
        RngPool {
            data: Zeroizing::new([0u8; POOL_SIZE]),
            read_cursor: 0,
            write_cursor: 0,
            bytes_since_mix: 0,
            hash: HashAlgorithm::Sha512,
            running: false,
        }
    }

    /// XOR input into the pool at the write cursor; once a full pool worth
    /// of new input has accumulated, fold it in with a hash mix.
    fn add(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.data[self.write_cursor] ^= b;
            self.write_cursor = (self.write_cursor + 1) % POOL_SIZE;
            self.bytes_since_mix += 1;
            if self.bytes_since_mix >= POOL_SIZE {
                self.mix();
                self.bytes_since_mix = 0;
            }
        }
    }

    /// Digest the whole pool and XOR the digest back in, advancing through
    /// the pool until every byte has been covered. A fresh hash state is
    /// used for each digest.
    fn mix(&mut self) {
        let digest_size = self.hash.digest_size();
        let mut offset = 0;
        while offset < POOL_SIZE {
            let mut digest = Zeroizing::new(self.hash.digest(&self.data[..]));
            for (i, d) in digest.iter().enumerate() {
                if offset + i >= POOL_SIZE {
                    break;
                }
                self.data[offset + i] ^= d;
            }
            digest.zeroize();
            offset += digest_size;
        }
    }

    fn poll_system_entropy(&mut self) -> Result<()> {
        let mut seed = Zeroizing::new([0u8; POOL_SIZE]);
        getrandom::getrandom(&mut seed[..]).map_err(|e| Error::SystemError {
            code: e.raw_os_error().unwrap_or(0),
            subject: "kernel CSPRNG".to_string(),
            message: e.to_string(),
        })?;
        self.add(&seed[..]);
        Ok(())
    }

    /// XOR pool bytes into `out`, advancing the read cursor.
    fn xor_out(&mut self, out: &mut [u8]) {
        for b in out.iter_mut() {
            *b ^= self.data[self.read_cursor];
            self.read_cursor = (self.read_cursor + 1) % POOL_SIZE;
        }
    }

    fn get(&mut self, out: &mut [u8], fast: bool) -> Result<()> {
        if out.len() > POOL_SIZE {
            return Err(Error::ParameterIncorrect(
                "RNG request larger than pool size",
            ));
        }

        self.poll_system_entropy()?;
        self.mix();
        self.xor_out(out);

        // Second pass over freshly mixed state, so an attacker who captures
        // the pool after the call cannot reconstruct the output.
        if !fast {
            self.poll_system_entropy()?;
        }
        self.mix();
        self.xor_out(out);
        Ok(())
    }
}

lazy_static! {
    static ref POOL: Mutex<RngPool> = Mutex::new(RngPool::unstarted());
}

/// Initialise the pool: pick the pool hash, seed from the kernel CSPRNG and
/// run the self-test. Idempotent.
pub fn start() -> Result<()> {
    {
        let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
        if pool.running {
            return Ok(());
        }
        pool.hash = HashAlgorithm::all()[0];
        pool.poll_system_entropy()?;
        pool.mix();
        pool.running = true;
    }
    // Self-test runs after seeding, never before.
    self_test()?;
    log::debug!("entropy pool started");
    Ok(())
}

/// Wipe and stop the pool.
pub fn stop() {
    let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
    pool.data.zeroize();
    pool.read_cursor = 0;
    pool.write_cursor = 0;
    pool.bytes_since_mix = 0;
    pool.running = false;
}

pub fn is_running() -> bool {
    POOL.lock().unwrap_or_else(|e| e.into_inner()).running
}

/// Fold caller-provided entropy (UI event timings and positions) into the
/// pool.
pub fn add_to_pool(bytes: &[u8]) {
    let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
    pool.add(bytes);
}

/// Fill `out` with pool output. `out` must not exceed [`POOL_SIZE`];
/// larger requests go through [`fill_random`].
pub fn get_data(out: &mut [u8], fast: bool) -> Result<()> {
    let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
    if !pool.running {
        return Err(Error::ParameterIncorrect("RNG pool not started"));
    }
    pool.get(out, fast)
}

/// Fill a buffer of any size, looping over pool-sized requests.
pub fn fill_random(out: &mut [u8]) -> Result<()> {
    for chunk in out.chunks_mut(POOL_SIZE) {
        get_data(chunk, false)?;
    }
    Ok(())
}

/// Post-seed self-test: two independent pool outputs must produce non-zero,
/// distinct CRC32s. Failure is fatal for the process.
pub fn self_test() -> Result<()> {
    let mut a = Zeroizing::new([0u8; POOL_SIZE]);
    let mut b = Zeroizing::new([0u8; POOL_SIZE]);
    get_data(&mut a[..], false)?;
    get_data(&mut b[..], false)?;

    let crc_a = crc32fast::hash(&a[..]);
    let crc_b = crc32fast::hash(&b[..]);
    if crc_a == 0 || crc_b == 0 {
        return Err(Error::TestFailed("RNG produced all-zero output"));
    }
    if crc_a == crc_b {
        return Err(Error::TestFailed("RNG produced repeating output"));
    }
    Ok(())
}
