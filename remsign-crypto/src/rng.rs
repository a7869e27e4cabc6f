//! Random number generation utilities.

use rand_core::impls;
pub use rand_core::{CryptoRng, RngCore};
use ring::rand::SecureRandom;

/// A succinct trait alias for a Cryptographically Secure PRNG.
pub trait Crng: RngCore + CryptoRng {
    fn gen_bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        self.fill_bytes(&mut out);
        out
    }
}

impl<R: RngCore + CryptoRng> Crng for R {}

/// A compatibility wrapper so we can use [`ring`]'s PRG with `rand` traits.
#[derive(Clone, Debug)]
pub struct SysRng(ring::rand::SystemRandom);

impl SysRng {
    pub fn new() -> Self {
        Self(ring::rand::SystemRandom::new())
    }
}

impl Default for SysRng {
    fn default() -> Self {
        Self::new()
    }
}

/// [`ring::rand::SystemRandom`] is a cryptographically secure PRG.
impl CryptoRng for SysRng {}

impl RngCore for SysRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        impls::next_u32_via_fill(self)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill(dest).expect("ring SystemRandom failed")
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// A small, fast, deterministic rng for tests. The keystream is a plain
/// xorshift64*, which has decent statistical properties but is emphatically
/// not cryptographically secure.
#[derive(Clone, Debug)]
pub struct FastRng {
    state: u64,
}

impl FastRng {
    pub fn new() -> Self {
        Self::from_u64(0xf00d_beef_dead_4477)
    }

    pub fn from_u64(seed: u64) -> Self {
        // xorshift breaks on an all-zero state
        Self {
            state: seed | 1,
        }
    }
}

impl Default for FastRng {
    fn default() -> Self {
        Self::new()
    }
}

/// Only a [`CryptoRng`] in tests, where determinism beats security.
#[cfg(any(test, feature = "test-utils"))]
impl CryptoRng for FastRng {}

impl RngCore for FastRng {
    #[inline]
    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    #[inline]
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest);
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fast_rng_is_deterministic() {
        let mut rng1 = FastRng::from_u64(42);
        let mut rng2 = FastRng::from_u64(42);
        let a: [u8; 32] = rng1.gen_bytes();
        let b: [u8; 32] = rng2.gen_bytes();
        assert_eq!(a, b);

        let mut rng3 = FastRng::from_u64(43);
        let c: [u8; 32] = rng3.gen_bytes();
        assert_ne!(a, c);
    }

    #[test]
    fn sys_rng_fills() {
        let mut rng = SysRng::new();
        let a: [u8; 32] = rng.gen_bytes();
        let b: [u8; 32] = rng.gen_bytes();
        assert_ne!(a, b);
    }
}
