//! Replay Randomness
//!
//! Xorshift128+ generator for seeded crash-point replays and tests. Its
//! output is linear over GF(2): anyone who sees enough draws can rebuild the
//! state. Live rounds draw from a CSPRNG instead (see
//! [`TieredCrashPolicy::from_entropy`](crate::game::crash::TieredCrashPolicy::from_entropy)).

use rand::{Error, RngCore};

/// Xorshift128+ PRNG.
///
/// # Example
///
/// ```
/// use crash_round::core::rng::RoundRng;
/// use rand::RngCore;
///
/// let mut a = RoundRng::new(7);
/// let mut b = RoundRng::new(7);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug)]
pub struct RoundRng {
    state: [u64; 2],
}

impl RoundRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// SplitMix64 expands the seed so weak seeds still give a good state.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Xorshift is stuck forever on the all-zero state
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    #[inline]
    fn step(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }
}

impl RngCore for RoundRng {
    fn next_u32(&mut self) -> u32 {
        (self.step() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.step()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.step().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Length of the shortest GF(2) linear recurrence that generates `bits`
/// (Berlekamp-Massey). Truly random bits score about half their length.
#[cfg(test)]
pub(crate) fn linear_complexity(bits: &[u8]) -> usize {
    let n = bits.len();
    let mut c = vec![0u8; n + 1];
    let mut b = vec![0u8; n + 1];
    c[0] = 1;
    b[0] = 1;
    let mut l = 0usize;
    let mut m = 0usize;
    let mut have_m = false;

    for i in 0..n {
        let mut d = bits[i] & 1;
        for j in 1..=l {
            d ^= c[j] & bits[i - j] & 1;
        }
        if d == 1 {
            let prev = c.clone();
            let shift = if have_m { i - m } else { i + 1 };
            for j in 0..=(n - shift.min(n)) {
                if j + shift <= n {
                    c[j + shift] ^= b[j];
                }
            }
            if 2 * l <= i {
                l = i + 1 - l;
                m = i;
                have_m = true;
                b = prev;
            }
        }
    }
    l
}

/// SplitMix64 for seed initialization.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
