//! Keyed commitments over share halves.
//!
//! Every share half posted to the bulletin board is hidden behind a keyed
//! SHA3-256 digest. Opening a commitment reveals the residue and its key;
//! any observer recomputes the digest and compares. A sealed share is the
//! private side (the split value plus both keys) and stays inside the
//! component that owns the row; only the commitment pair is ever published
//! before an opening is called for.
use crate::splitvalue::{Modulus, ShareHalf, SplitValue};
use crate::BigInt;
use crypto_bigint::rand_core::{OsRng, RngCore};
use crypto_bigint::Encoding;
use digest::Digest;
use serde::{Deserialize, Serialize};
use sha3::Sha3_256;

pub const KEY_BYTES: usize = 16;

/// Fresh per-half commitment randomness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitKey(#[serde(with = "hex")] [u8; KEY_BYTES]);

impl CommitKey {
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        return Self(bytes);
    }
}

/// Commit to a residue under a key. Computationally hiding and binding;
/// opened by revealing `(key, value)` and recomputing.
pub fn commit(key: &CommitKey, value: &BigInt) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(key.0);
    hasher.update(value.to_be_bytes());
    return hasher.finalize().into();
}

/// Digest over a ballot's column of commitments, in row order. This is what
/// a voter's receipt binds to.
pub fn digest_commitments(commitments: &[ShareCommitment]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    for commitment in commitments {
        hasher.update(commitment.com_u);
        hasher.update(commitment.com_v);
    }
    return hasher.finalize().into();
}

/// The public side of a sealed share: one commitment per half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareCommitment {
    #[serde(with = "hex")]
    com_u: [u8; 32],
    #[serde(with = "hex")]
    com_v: [u8; 32],
}

impl ShareCommitment {
    pub fn half(&self, half: ShareHalf) -> &[u8; 32] {
        match half {
            ShareHalf::U => &self.com_u,
            ShareHalf::V => &self.com_v,
        }
    }
}

/// The private side: a split value plus the keys for both commitments.
#[derive(Debug, Clone)]
pub struct SealedShare {
    value: SplitValue,
    key_u: CommitKey,
    key_v: CommitKey,
}

impl SealedShare {
    pub fn seal(value: SplitValue) -> Self {
        Self {
            value,
            key_u: CommitKey::random(),
            key_v: CommitKey::random(),
        }
    }

    pub fn value(&self) -> &SplitValue {
        &self.value
    }

    pub fn commitment(&self) -> ShareCommitment {
        ShareCommitment {
            com_u: commit(&self.key_u, self.value.half(ShareHalf::U)),
            com_v: commit(&self.key_v, self.value.half(ShareHalf::V)),
        }
    }

    /// Re-randomize the value and refresh both keys, so the mixed share is
    /// unlinkable to its source through either the residues or the
    /// commitments.
    pub fn blind(&self, d: &BigInt, modulus: &Modulus) -> Self {
        Self::seal(self.value.blind(d, modulus))
    }

    pub fn open_half(&self, half: ShareHalf) -> ShareOpening {
        let key = match half {
            ShareHalf::U => self.key_u,
            ShareHalf::V => self.key_v,
        };
        return ShareOpening {
            half,
            value: *self.value.half(half),
            key,
        };
    }

    pub fn open_full(&self) -> FullOpening {
        FullOpening {
            u: *self.value.half(ShareHalf::U),
            v: *self.value.half(ShareHalf::V),
            key_u: self.key_u,
            key_v: self.key_v,
        }
    }

    /// Flip the stored residue without touching the published commitment,
    /// simulating a party that breaks its word after committing.
    #[cfg(test)]
    pub(crate) fn corrupt(&mut self, modulus: &Modulus) {
        self.value = SplitValue::from_halves(
            &modulus.add(self.value.half(ShareHalf::U), &BigInt::ONE),
            self.value.half(ShareHalf::V),
            modulus,
        );
    }
}

/// A single disclosed half together with its commitment key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareOpening {
    pub half: ShareHalf,
    #[serde(with = "crate::serialize::bigint")]
    pub value: BigInt,
    pub key: CommitKey,
}

impl ShareOpening {
    pub fn verify(&self, commitment: &ShareCommitment) -> bool {
        commit(&self.key, &self.value) == *commitment.half(self.half)
    }
}

/// Both halves disclosed, as posted for tally rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullOpening {
    #[serde(with = "crate::serialize::bigint")]
    pub u: BigInt,
    #[serde(with = "crate::serialize::bigint")]
    pub v: BigInt,
    pub key_u: CommitKey,
    pub key_v: CommitKey,
}

impl FullOpening {
    pub fn verify(&self, commitment: &ShareCommitment) -> bool {
        commit(&self.key_u, &self.u) == *commitment.half(ShareHalf::U)
            && commit(&self.key_v, &self.v) == *commitment.half(ShareHalf::V)
    }

    pub fn value(&self, modulus: &Modulus) -> BigInt {
        modulus.add(&self.u, &self.v)
    }
}
