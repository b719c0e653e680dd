//! Polynomials over GF(2) with degree below 64, stored as bit vectors.
//!
//! Bit `i` holds the coefficient of `x^i`, so addition is XOR and
//! multiplication is carry-less.

use crate::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Add;

/// Degree of every polynomial the engine generates and accepts for chunking.
pub const POLYNOMIAL_DEGREE: i32 = 53;

/// Upper bound on random candidates tried before giving up.
pub const MAX_POLYNOMIAL_ATTEMPTS: usize = 1_000_000;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pol(u64);

impl Pol {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Degree of the polynomial, -1 for the zero polynomial.
    pub fn deg(self) -> i32 {
        63 - self.0.leading_zeros() as i32
    }

    pub fn div_mod(self, d: Pol) -> (Pol, Pol) {
        if self.0 == 0 || d.0 == 0 {
            return (Pol(0), self);
        }

        let d_deg = d.deg();
        let mut x = self;
        let mut q = 0u64;
        let mut diff = x.deg() - d_deg;
        while diff >= 0 {
            q |= 1 << diff;
            x = x + Pol(d.0 << diff);
            diff = x.deg() - d_deg;
        }
        (Pol(q), x)
    }

    pub fn modulo(self, d: Pol) -> Pol {
        self.div_mod(d).1
    }

    pub fn gcd(self, other: Pol) -> Pol {
        let (mut a, mut b) = (self, other);
        if a.deg() < b.deg() {
            std::mem::swap(&mut a, &mut b);
        }
        while b.0 != 0 {
            let r = a.modulo(b);
            a = b;
            b = r;
        }
        a
    }

    /// `self * f mod g`, computed by shift-and-add so the product never
    /// leaves 64 bits.
    pub fn mul_mod(self, f: Pol, g: Pol) -> Pol {
        let mut a = self.modulo(g);
        let mut b = f.0;
        let mut res = Pol(0);
        while b != 0 {
            if b & 1 == 1 {
                res = res + a;
            }
            a = Pol(a.0 << 1).modulo(g);
            b >>= 1;
        }
        res
    }

    /// Ben-Or irreducibility test: `self` is irreducible iff
    /// `gcd(self, x^(2^i) - x mod self) == 1` for every `1 <= i <= deg/2`.
    pub fn irreducible(self) -> bool {
        let deg = self.deg();
        if deg < 1 {
            return false;
        }
        (1..=deg / 2).all(|i| self.gcd(qp(i as u32, self)) == Pol(1))
    }

    /// Checks that the polynomial can drive the chunker.
    pub fn validate(self) -> Result<()> {
        if self.deg() != POLYNOMIAL_DEGREE {
            return Err(Error::InvalidPolynomial(format!(
                "{self} has degree {}, expected {POLYNOMIAL_DEGREE}",
                self.deg()
            )));
        }
        if !self.irreducible() {
            return Err(Error::InvalidPolynomial(format!("{self} is reducible")));
        }
        Ok(())
    }
}

impl Add for Pol {
    type Output = Pol;

    fn add(self, rhs: Pol) -> Pol {
        Pol(self.0 ^ rhs.0)
    }
}

/// `(x^(2^p) - x) mod g`.
fn qp(p: u32, g: Pol) -> Pol {
    let mut res = Pol(2);
    for _ in 0..p {
        res = res.mul_mod(res, g);
    }
    (res + Pol(2)).modulo(g)
}

/// Draws a fresh irreducible polynomial of degree 53 from the OS RNG.
pub fn random_polynomial() -> Result<Pol> {
    derive_polynomial(&mut rand::rngs::OsRng, MAX_POLYNOMIAL_ATTEMPTS)
}

/// Draws candidates from `rng` until one is irreducible.
pub fn derive_polynomial<R: RngCore + ?Sized>(rng: &mut R, max_attempts: usize) -> Result<Pol> {
    for _ in 0..max_attempts {
        let mut f = rng.next_u64();
        f &= (1 << (POLYNOMIAL_DEGREE + 1)) - 1;
        f |= (1 << POLYNOMIAL_DEGREE) | 1;
        let candidate = Pol(f);
        if candidate.irreducible() {
            return Ok(candidate);
        }
    }
    Err(Error::PolynomialGenerationExhausted {
        attempts: max_attempts,
    })
}

impl fmt::Display for Pol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Debug for Pol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pol(0x{:x})", self.0)
    }
}

impl Serialize for Pol {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pol {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        u64::from_str_radix(&s, 16)
            .map(Pol)
            .map_err(serde::de::Error::custom)
    }
}
