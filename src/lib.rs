//! Simulation of an end-to-end verifiable election built on split-value
//! secret sharing and mix-net shuffling.
//!
//! A vote is never stored in the clear: each ballot is an r-tuple of
//! split values whose modular sum reconstructs the vote. Every row of the
//! resulting share matrix is owned by an independent mix server, the proof
//! server drives 2m re-randomized shuffles of the matrix, and a public
//! post-commitment draw decides which m shuffles prove consistency and
//! which m are opened for the tally. Everything public lands on an
//! append-only, hash-chained bulletin board that any observer can re-audit.
use std::collections::BTreeMap;

use crypto_bigint::Uint;

/// Use the same big integer type everywhere
pub const LIMBS: usize = 256 / 64;
pub type BigInt = Uint<LIMBS>;

/// Histogram of recovered vote values, as produced by a tally round.
pub type Distribution = BTreeMap<BigInt, u64>;

pub mod commitment;
pub mod config;
pub mod election;
pub mod errors;
pub mod mixer;
pub mod proof_server;
pub mod record;
pub mod sbb;
pub mod serialize;
pub mod splitvalue;
pub mod tablet;
pub mod verifier;
