//! Split-value arithmetic: modular secret shares and the equality-proof
//! disclosure unit.
//!
//! A split value of `x` is a pair `(u, v)` with `VAL(u, v) = (u + v) mod M`
//! for the public modulus `M`. Because `u` is drawn uniformly, either half
//! on its own is a uniform residue and carries no information about `x`.
//! Re-randomization adds a blinding residue to one half and subtracts it
//! from the other, so the represented value never changes while both halves
//! become fresh uniform residues.
//!
//! Equality of two split values is demonstrated without revealing either
//! value: disclose the same half of both pairs plus the modular difference
//! of the two hidden halves. The verifier checks `t = (a2 - a1) mod M`,
//! which holds exactly when the two values are equal, and learns nothing
//! beyond two uniform residues and their blinding offset.
use crate::errors::ElectionError;
use crate::BigInt;
use crypto_bigint::rand_core::OsRng;
use crypto_bigint::{NonZero, RandomMod};
use serde::{Deserialize, Serialize};

/// The public modulus `M`. All vote values, shares and blinding factors
/// live in `[0, M)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modulus {
    m: NonZero<BigInt>,
}

impl Modulus {
    /// A modulus below 2 cannot encode even a yes/no ballot.
    pub fn new(m: BigInt) -> Result<Self, ElectionError> {
        if m < BigInt::from_u8(2) {
            return Err(ElectionError::config("modulus must be at least 2"));
        }
        return Ok(Self {
            m: NonZero::new(m).unwrap(),
        });
    }

    pub fn get(&self) -> &BigInt {
        &self.m
    }

    pub fn reduce(&self, x: &BigInt) -> BigInt {
        x % self.m
    }

    /// Sample a uniform residue in `[0, M)`.
    pub fn random_residue(&self) -> BigInt {
        BigInt::random_mod(&mut OsRng, &self.m)
    }

    pub fn add(&self, a: &BigInt, b: &BigInt) -> BigInt {
        a.add_mod(b, &self.m)
    }

    pub fn sub(&self, a: &BigInt, b: &BigInt) -> BigInt {
        a.sub_mod(b, &self.m)
    }
}

/// Which half of a split value is disclosed by an opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareHalf {
    U,
    V,
}

/// A secret share `(u, v)` of a residue. Immutable once created; blinding
/// produces a new pair rather than mutating in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitValue {
    u: BigInt,
    v: BigInt,
}

impl SplitValue {
    /// Split `x` into a uniformly random pair summing to `x` mod M.
    pub fn split(x: &BigInt, modulus: &Modulus) -> Self {
        let x = modulus.reduce(x);
        let u = modulus.random_residue();
        let v = modulus.sub(&x, &u);
        return Self { u, v };
    }

    pub fn from_halves(u: &BigInt, v: &BigInt, modulus: &Modulus) -> Self {
        Self {
            u: modulus.reduce(u),
            v: modulus.reduce(v),
        }
    }

    /// Reconstruct the represented value. Total and pure.
    pub fn val(&self, modulus: &Modulus) -> BigInt {
        modulus.add(&self.u, &self.v)
    }

    /// Value-preserving re-randomization: `(u + d, v - d)`.
    pub fn blind(&self, d: &BigInt, modulus: &Modulus) -> Self {
        Self {
            u: modulus.add(&self.u, d),
            v: modulus.sub(&self.v, d),
        }
    }

    pub fn half(&self, half: ShareHalf) -> &BigInt {
        match half {
            ShareHalf::U => &self.u,
            ShareHalf::V => &self.v,
        }
    }

    /// Produce the disclosure proving `VAL(x1) == VAL(x2)` without revealing
    /// either value. Only the chosen half of each input appears in the
    /// output; the hidden halves are disclosed solely as their modular
    /// difference, so neither input ever has both halves revealed by one
    /// triple. The per-position half choice is pinned by the public
    /// challenge draw, which keeps repeated proofs against the same input
    /// on the same half.
    pub fn prove_equal(
        x1: &SplitValue,
        x2: &SplitValue,
        half: ShareHalf,
        modulus: &Modulus,
    ) -> ProofTriple {
        let (a1, a2, t) = match half {
            ShareHalf::U => (x1.u, x2.u, modulus.sub(&x1.v, &x2.v)),
            ShareHalf::V => (x1.v, x2.v, modulus.sub(&x1.u, &x2.u)),
        };
        return ProofTriple { half, a1, a2, t };
    }
}

/// The disclosure unit for an equality proof: one half of each compared
/// split value and the modular difference of the hidden halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofTriple {
    pub half: ShareHalf,
    #[serde(with = "crate::serialize::bigint")]
    pub a1: BigInt,
    #[serde(with = "crate::serialize::bigint")]
    pub a2: BigInt,
    #[serde(with = "crate::serialize::bigint")]
    pub t: BigInt,
}

impl ProofTriple {
    /// The check relation: `u1 + v1 = u2 + v2` exactly when the difference
    /// of the disclosed halves matches the claimed difference of the hidden
    /// halves.
    pub fn verify(&self, modulus: &Modulus) -> bool {
        self.t == modulus.sub(&self.a2, &self.a1)
    }
}
