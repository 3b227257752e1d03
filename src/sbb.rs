//! The secure bulletin board: an append-only, hash-chained public log.
//!
//! Every entry is immutable once appended; corrections are new entries,
//! never edits. Each posted entry records the digest of its predecessor
//! and its own digest over `(prev, seq, entry)`, so any reader can verify
//! that the history it fetched is the history that was written, in order.
//! The persisted representation is one JSON document per line.
use std::io::{BufRead, Write};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::commitment::{CommitKey, FullOpening, ShareCommitment};
use crate::errors::ElectionError;
use crate::splitvalue::ProofTriple;
use crate::{BigInt, Distribution};

/// Shared multi-reader handle. Appends go through the single writer that
/// owns the protocol step; readers may poll the history at any time.
pub type SbbHandle = Arc<RwLock<BulletinBoard>>;

/// Submission-time record tying an opaque ballot id to its column. The id
/// lets a voter find their own posting without linking it to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotRecord {
    pub ballot_id: u64,
    pub tablet_id: u64,
}

/// One bucket of the outcome distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCount {
    #[serde(with = "crate::serialize::bigint")]
    pub value: BigInt,
    pub count: u64,
}

impl VoteCount {
    pub fn from_distribution(distribution: &Distribution) -> Vec<Self> {
        distribution
            .iter()
            .map(|(value, count)| Self {
                value: *value,
                count: *count,
            })
            .collect()
    }

    pub fn to_distribution(counts: &[Self]) -> Distribution {
        counts
            .iter()
            .map(|bucket| (bucket.value, bucket.count))
            .collect()
    }
}

/// The entry kinds any component may post or read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Entry {
    /// The unmixed matrix commitment plus the ballot receipts, posted once
    /// when submissions close.
    OriginalMatrix {
        commitments: Vec<Vec<ShareCommitment>>,
        ballots: Vec<BallotRecord>,
    },
    /// One re-randomized, permuted copy of the matrix, as commitments.
    MixedMatrix {
        round: usize,
        commitments: Vec<Vec<ShareCommitment>>,
    },
    /// One equality link from original position `source` to position
    /// `target` of a proof-set round, with the keys opening the disclosed
    /// halves on both ends.
    ProofTriple {
        round: usize,
        row: usize,
        source: usize,
        target: usize,
        triple: ProofTriple,
        source_key: CommitKey,
        target_key: CommitKey,
    },
    /// One fully opened share of a tally-set round.
    TallyOpen {
        round: usize,
        row: usize,
        position: usize,
        opening: FullOpening,
    },
    /// The finalized vote-value distribution.
    Outcome { distribution: Vec<VoteCount> },
}

/// An entry as it sits on the board, welded into the hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedEntry {
    pub seq: u64,
    #[serde(with = "hex")]
    pub prev: [u8; 32],
    #[serde(with = "hex")]
    pub digest: [u8; 32],
    pub entry: Entry,
}

fn chain_digest(prev: &[u8; 32], seq: u64, entry: &Entry) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(prev);
    hasher.update(seq.to_be_bytes());
    // Serializing our own entry types cannot fail.
    hasher.update(serde_json::to_vec(entry).expect("entry serialization is infallible"));
    return hasher.finalize().into();
}

#[derive(Debug, Default)]
pub struct BulletinBoard {
    entries: Vec<PostedEntry>,
}

impl BulletinBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SbbHandle {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Append an entry and return its sequence number.
    pub fn append(&mut self, entry: Entry) -> u64 {
        let seq = self.entries.len() as u64;
        let prev = self.head();
        let digest = chain_digest(&prev, seq, &entry);
        self.entries.push(PostedEntry {
            seq,
            prev,
            digest,
            entry,
        });
        return seq;
    }

    /// The full ordered history.
    pub fn read_all(&self) -> &[PostedEntry] {
        &self.entries
    }

    /// Digest of the latest entry; all zeroes for an empty board.
    pub fn head(&self) -> [u8; 32] {
        self.entries.last().map_or([0u8; 32], |entry| entry.digest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn verify_chain(&self) -> Result<(), ElectionError> {
        verify_entries(&self.entries)
    }

    /// Persist as JSON lines.
    pub fn dump<W: Write>(&self, writer: &mut W) -> Result<(), ElectionError> {
        for entry in &self.entries {
            serde_json::to_writer(&mut *writer, entry)?;
            writeln!(writer)?;
        }
        return Ok(());
    }

    /// Read a JSON-lines transcript back and verify its chain.
    pub fn load<R: BufRead>(reader: R) -> Result<Self, ElectionError> {
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            entries.push(serde_json::from_str::<PostedEntry>(&line)?);
        }
        let board = Self { entries };
        board.verify_chain()?;
        return Ok(board);
    }
}

/// Re-derive the whole chain and compare against what is recorded. Any
/// alteration of an entry, its order or its links shows up as a digest
/// mismatch.
pub fn verify_entries(entries: &[PostedEntry]) -> Result<(), ElectionError> {
    let mut prev = [0u8; 32];
    for (index, posted) in entries.iter().enumerate() {
        if posted.seq != index as u64 {
            return Err(ElectionError::violation(format!(
                "bulletin board entry {} carries sequence number {}",
                index, posted.seq
            )));
        }
        if posted.prev != prev {
            return Err(ElectionError::violation(format!(
                "bulletin board entry {} does not chain to its predecessor",
                index
            )));
        }
        if posted.digest != chain_digest(&prev, posted.seq, &posted.entry) {
            return Err(ElectionError::violation(format!(
                "bulletin board entry {} digest mismatch",
                index
            )));
        }
        prev = posted.digest;
    }
    return Ok(());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome_entry(value: u64, count: u64) -> Entry {
        Entry::Outcome {
            distribution: vec![VoteCount {
                value: BigInt::from_u64(value),
                count,
            }],
        }
    }

    #[test]
    fn test_append_assigns_sequence_numbers() {
        let mut board = BulletinBoard::new();
        assert_eq!(board.append(outcome_entry(1, 1)), 0);
        assert_eq!(board.append(outcome_entry(2, 1)), 1);
        assert_eq!(board.len(), 2);
    }

    /// Reading twice yields identical ordered content.
    #[test]
    fn test_read_all_is_idempotent() {
        let mut board = BulletinBoard::new();
        board.append(outcome_entry(3, 2));
        board.append(outcome_entry(4, 1));
        let first: Vec<PostedEntry> = board.read_all().to_vec();
        let second: Vec<PostedEntry> = board.read_all().to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn test_chain_verifies_and_detects_tampering() {
        let mut board = BulletinBoard::new();
        for value in 0..5 {
            board.append(outcome_entry(value, value));
        }
        assert!(board.verify_chain().is_ok());

        let mut entries = board.read_all().to_vec();
        entries[2].entry = outcome_entry(9, 9);
        assert!(verify_entries(&entries).is_err());

        let mut reordered = board.read_all().to_vec();
        reordered.swap(1, 3);
        assert!(verify_entries(&reordered).is_err());
    }

    #[test]
    fn test_dump_load_round_trip() {
        let mut board = BulletinBoard::new();
        board.append(outcome_entry(7, 3));
        board.append(outcome_entry(8, 1));

        let mut buffer = Vec::new();
        board.dump(&mut buffer).unwrap();
        let loaded = BulletinBoard::load(buffer.as_slice()).unwrap();
        assert_eq!(loaded.read_all(), board.read_all());
    }

    #[test]
    fn test_load_rejects_tampered_transcript() {
        let mut board = BulletinBoard::new();
        board.append(outcome_entry(1, 1));
        board.append(outcome_entry(2, 2));

        let mut buffer = Vec::new();
        board.dump(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let tampered = text.replacen("\"count\":1", "\"count\":4", 1);
        assert!(BulletinBoard::load(tampered.as_bytes()).is_err());
    }
}
