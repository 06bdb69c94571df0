//! Splitting the server's 64-bit `pq` challenge into its two primes.
//!
//! Pollard's rho with Brent-style cycle detection: the walk
//! `x -> x^2 + c (mod pq)` is compared against a saved point `y` that is
//! refreshed at every power-of-two step.

use rand::Rng;

/// Number of rounds before giving up.
pub const ROUNDS: u32 = 3;

/// Iteration budget of round 0; each later round doubles it.
const BASE_BUDGET_LOG2: u32 = 18;

/// Factorize `pq` into `(p, q)` with `p <= q`.
///
/// Returns `(1, pq)` when no factor is found; callers treat that as fatal.
pub fn factorize<R: Rng + ?Sized>(pq: u64, rng: &mut R) -> (u64, u64) {
    if pq < 4 {
        return (1, pq);
    }
    if pq % 2 == 0 {
        return (2, pq / 2);
    }

    for round in 0..ROUNDS {
        let budget = 1u64 << (BASE_BUDGET_LOG2 + round);
        if let Some(p) = rho_round(pq, budget, rng) {
            let q = pq / p;
            tracing::trace!(pq, round, "factorized pq");
            return (p.min(q), p.max(q));
        }
    }

    tracing::warn!(pq, "pq factorization gave up");
    (1, pq)
}

fn rho_round<R: Rng + ?Sized>(pq: u64, budget: u64, rng: &mut R) -> Option<u64> {
    let mut c = rng.gen_range(1..pq);
    let mut x = rng.gen_range(0..pq);
    let mut y = x;
    let mut checkpoint = 1u64;
    let mut steps = 0u64;

    for _ in 0..budget {
        x = mul_add_mod(x, x, c, pq);
        steps += 1;

        let d = gcd(x.abs_diff(y), pq);
        if d == pq {
            // The walk closed on itself modulo every factor; start a new one.
            c = rng.gen_range(1..pq);
            x = rng.gen_range(0..pq);
            y = x;
            checkpoint = 1;
            steps = 0;
            continue;
        }
        if d != 1 {
            return Some(d);
        }
        if steps == checkpoint {
            y = x;
            checkpoint <<= 1;
            steps = 0;
        }
    }
    None
}

/// `(a * b + c) mod m` without overflow.
pub fn mul_add_mod(a: u64, b: u64, c: u64, m: u64) -> u64 {
    ((a as u128 * b as u128 + c as u128) % m as u128) as u64
}

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn small_semiprime() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(factorize(35, &mut rng), (5, 7));
    }

    #[test]
    fn protocol_sized_semiprime() {
        let mut rng = StdRng::seed_from_u64(0);
        let (p, q) = (1_246_778_989u64, 1_441_161_677u64);
        assert_eq!(factorize(p * q, &mut rng), (p, q));
    }

    #[test]
    fn deterministic_for_seed() {
        let pq = 0x17ED48941A08F981u64;
        let a = factorize(pq, &mut StdRng::seed_from_u64(42));
        let b = factorize(pq, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
        assert_eq!(a, (0x494C553B, 0x53911073));
    }

    #[test]
    fn prime_input_fails() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(factorize(65_537, &mut rng), (1, 65_537));
    }

    #[test]
    fn even_input() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(factorize(2 * 1_000_003, &mut rng), (2, 1_000_003));
    }

    #[test]
    fn helpers() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(0, 35), 35);
        assert_eq!(mul_add_mod(u64::MAX, u64::MAX, 1, 1_000_000_007), 114_944_270);
    }
}
