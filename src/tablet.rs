//! Vote submission: tablets build ballots, voters keep receipts.
//!
//! A tablet turns a voter's chosen integer into a sealed vote record and
//! hands back a receipt carrying only an opaque ballot id and a digest of
//! the ballot's public commitments. The id lets the voter find their own
//! posting on the bulletin board and check it is unaltered, without the
//! board ever linking a ballot to an identity.
use crypto_bigint::rand_core::{OsRng, RngCore};

use crate::commitment::{digest_commitments, SealedShare, ShareCommitment};
use crate::errors::ElectionError;
use crate::record::VoteRecord;
use crate::sbb::{Entry, PostedEntry};
use crate::splitvalue::Modulus;
use crate::BigInt;

pub struct Tablet {
    id: u64,
    modulus: Modulus,
    rows: usize,
}

impl Tablet {
    pub fn new(modulus: Modulus, rows: usize) -> Self {
        Self {
            id: OsRng.next_u64(),
            modulus,
            rows,
        }
    }

    pub fn get_id(&self) -> u64 {
        self.id
    }

    /// Build and seal a ballot for `vote`. The record is created once and
    /// never mutated afterwards.
    pub fn cast(&self, vote: &BigInt) -> Result<(SubmittedBallot, Receipt), ElectionError> {
        if vote >= self.modulus.get() {
            return Err(ElectionError::config(
                "vote value does not fit the modulus",
            ));
        }
        let record = VoteRecord::from_vote(vote, self.rows, &self.modulus);
        let shares: Vec<SealedShare> = record
            .into_components()
            .into_iter()
            .map(SealedShare::seal)
            .collect();
        let ballot = SubmittedBallot {
            ballot_id: OsRng.next_u64(),
            tablet_id: self.id,
            shares,
        };
        let receipt = Receipt {
            ballot_id: ballot.ballot_id,
            digest: ballot.digest(),
        };
        return Ok((ballot, receipt));
    }
}

/// A sealed ballot on its way to the proof server.
pub struct SubmittedBallot {
    pub ballot_id: u64,
    pub tablet_id: u64,
    shares: Vec<SealedShare>,
}

impl SubmittedBallot {
    pub fn rows(&self) -> usize {
        self.shares.len()
    }

    pub fn commitments(&self) -> Vec<ShareCommitment> {
        self.shares.iter().map(SealedShare::commitment).collect()
    }

    pub fn digest(&self) -> [u8; 32] {
        digest_commitments(&self.commitments())
    }

    pub fn into_shares(self) -> Vec<SealedShare> {
        self.shares
    }
}

/// What the voter walks away with: enough to find and check their own
/// posting, nothing that identifies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub ballot_id: u64,
    digest: [u8; 32],
}

pub struct Voter {
    vote: BigInt,
    receipt: Option<Receipt>,
}

impl Voter {
    pub fn new(vote: BigInt) -> Self {
        Self {
            vote,
            receipt: None,
        }
    }

    pub fn get_vote(&self) -> &BigInt {
        &self.vote
    }

    pub fn cast(&mut self, tablet: &Tablet) -> Result<SubmittedBallot, ElectionError> {
        let (ballot, receipt) = tablet.cast(&self.vote)?;
        self.receipt = Some(receipt);
        return Ok(ballot);
    }

    /// Find this voter's column in the posted original matrix and check the
    /// receipt digest against the published commitments.
    pub fn verify_receipt(&self, entries: &[PostedEntry]) -> Result<(), ElectionError> {
        let receipt = self
            .receipt
            .ok_or_else(|| ElectionError::not_ready("no ballot has been cast yet"))?;
        let (commitments, ballots) = entries
            .iter()
            .find_map(|posted| match &posted.entry {
                Entry::OriginalMatrix {
                    commitments,
                    ballots,
                } => Some((commitments, ballots)),
                _ => None,
            })
            .ok_or_else(|| ElectionError::not_ready("original matrix is not posted yet"))?;
        let column = ballots
            .iter()
            .position(|record| record.ballot_id == receipt.ballot_id)
            .ok_or_else(|| {
                ElectionError::violation("ballot is missing from the original matrix")
            })?;
        let posted: Vec<ShareCommitment> = commitments
            .iter()
            .map(|row| row[column])
            .collect();
        if digest_commitments(&posted) != receipt.digest {
            return Err(ElectionError::violation(
                "posted ballot does not match the receipt",
            ));
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbb::{BallotRecord, BulletinBoard};

    const MODULUS: u64 = 10;
    const ROWS: usize = 2;

    fn modulus() -> Modulus {
        Modulus::new(BigInt::from_u64(MODULUS)).unwrap()
    }

    fn post_original(ballots: Vec<(&SubmittedBallot, u64)>) -> BulletinBoard {
        let mut rows: Vec<Vec<ShareCommitment>> = vec![Vec::new(); ROWS];
        let mut records = Vec::new();
        for (ballot, tablet_id) in ballots {
            for (row, commitment) in rows.iter_mut().zip(ballot.commitments()) {
                row.push(commitment);
            }
            records.push(BallotRecord {
                ballot_id: ballot.ballot_id,
                tablet_id,
            });
        }
        let mut board = BulletinBoard::new();
        board.append(Entry::OriginalMatrix {
            commitments: rows,
            ballots: records,
        });
        return board;
    }

    #[test]
    fn test_cast_rejects_oversized_vote() {
        let tablet = Tablet::new(modulus(), ROWS);
        assert!(tablet.cast(&BigInt::from_u64(MODULUS)).is_err());
        assert!(tablet.cast(&BigInt::from_u64(MODULUS - 1)).is_ok());
    }

    #[test]
    fn test_ballot_recombines_to_the_vote() {
        let m = modulus();
        let tablet = Tablet::new(m, ROWS);
        let (ballot, _) = tablet.cast(&BigInt::from_u64(7)).unwrap();
        let shares = ballot.into_shares();
        let mut total = BigInt::ZERO;
        for share in &shares {
            total = m.add(&total, &share.value().val(&m));
        }
        assert_eq!(total, BigInt::from_u64(7));
    }

    #[test]
    fn test_receipt_verifies_against_the_posted_matrix() {
        let tablet = Tablet::new(modulus(), ROWS);
        let mut voter = Voter::new(BigInt::from_u64(3));
        let ballot = voter.cast(&tablet).unwrap();
        let board = post_original(vec![(&ballot, tablet.get_id())]);
        assert!(voter.verify_receipt(board.read_all()).is_ok());
    }

    #[test]
    fn test_receipt_detects_a_swapped_ballot() {
        let tablet = Tablet::new(modulus(), ROWS);
        let mut voter = Voter::new(BigInt::from_u64(3));
        let ballot = voter.cast(&tablet).unwrap();
        // The board posts a different ballot under this voter's id.
        let (imposter, _) = tablet.cast(&BigInt::from_u64(3)).unwrap();
        let forged = SubmittedBallot {
            ballot_id: ballot.ballot_id,
            tablet_id: tablet.get_id(),
            shares: imposter.into_shares(),
        };
        let board = post_original(vec![(&forged, tablet.get_id())]);
        assert!(matches!(
            voter.verify_receipt(board.read_all()),
            Err(ElectionError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_receipt_missing_from_the_board() {
        let tablet = Tablet::new(modulus(), ROWS);
        let mut voter = Voter::new(BigInt::from_u64(1));
        voter.cast(&tablet).unwrap();
        let (other, _) = tablet.cast(&BigInt::from_u64(2)).unwrap();
        let board = post_original(vec![(&other, tablet.get_id())]);
        assert!(voter.verify_receipt(board.read_all()).is_err());
    }
}
