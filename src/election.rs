//! End-to-end simulation wiring: voters, tablets, proof server, audit.
//!
//! Every distributed party lives in one process here, but they only talk
//! through the same interfaces a deployment would have: ballots flow from
//! tablets into the proof server, everything public flows over the shared
//! bulletin board, and the final audit sees nothing but the board.
use tracing::info;

use crate::config::ElectionConfig;
use crate::errors::ElectionError;
use crate::proof_server::{Phase, ProofServer};
use crate::sbb::{BulletinBoard, SbbHandle};
use crate::tablet::{Tablet, Voter};
use crate::verifier;
use crate::{BigInt, Distribution};

pub struct Election {
    config: ElectionConfig,
    tablets: usize,
    sbb: SbbHandle,
}

impl Election {
    pub fn new(config: ElectionConfig, tablets: usize) -> Result<Self, ElectionError> {
        config.validate()?;
        if tablets == 0 {
            return Err(ElectionError::config("at least one tablet is required"));
        }
        return Ok(Self {
            config,
            tablets,
            sbb: BulletinBoard::shared(),
        });
    }

    /// Handle to the shared bulletin board, e.g. for dumping the transcript
    /// after the run.
    pub fn sbb(&self) -> SbbHandle {
        self.sbb.clone()
    }

    /// Run the whole election over the given votes: collect, mix,
    /// challenge, tally, then have every voter check their receipt and run
    /// the independent audit over the published record.
    pub fn run(self, votes: &[u64]) -> Result<Distribution, ElectionError> {
        let modulus = self.config.modulus()?;
        let mut server = ProofServer::new(self.config.clone(), self.sbb.clone())?;
        let tablets: Vec<Tablet> = (0..self.tablets)
            .map(|_| Tablet::new(modulus, self.config.rows))
            .collect();
        let mut voters: Vec<Voter> = votes
            .iter()
            .map(|vote| Voter::new(BigInt::from_u64(*vote)))
            .collect();

        for (index, voter) in voters.iter_mut().enumerate() {
            let tablet = &tablets[index % tablets.len()];
            server.submit(voter.cast(tablet)?)?;
        }
        server.close_submissions()?;
        if server.phase() != Phase::Finalized {
            server.run_mixing()?;
            server.run_challenge()?;
            server.run_tally()?;
        }
        let outcome = server.get_outcome()?.clone();

        let board = self.sbb.read();
        for voter in &voters {
            voter.verify_receipt(board.read_all())?;
        }
        let audited = verifier::audit(board.read_all(), &self.config)?;
        if audited != outcome {
            return Err(ElectionError::violation(
                "the audited distribution does not match the posted outcome",
            ));
        }
        info!(ballots = votes.len(), "election complete and audited");
        return Ok(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(modulus: u64, rows: usize, half_rounds: usize, ballots: usize) -> ElectionConfig {
        ElectionConfig::new(BigInt::from_u64(modulus), rows, half_rounds, ballots, modulus)
    }

    fn distribution(buckets: &[(u64, u64)]) -> Distribution {
        buckets
            .iter()
            .map(|(value, count)| (BigInt::from_u64(*value), *count))
            .collect()
    }

    /// M=10, r=2, m=1, three ballots [2, 5, 2]: the proof round verifies
    /// and the tally reports {2: 2, 5: 1}.
    #[test]
    fn test_small_election_end_to_end() {
        let election = Election::new(config(10, 2, 1, 3), 3).unwrap();
        let outcome = election.run(&[2, 5, 2]).unwrap();
        assert_eq!(outcome, distribution(&[(2, 2), (5, 1)]));
    }

    /// No ballots: the outcome is an empty distribution and the election
    /// still finalizes and audits cleanly.
    #[test]
    fn test_empty_election() {
        let election = Election::new(config(10, 2, 1, 0), 1).unwrap();
        assert!(election.run(&[]).unwrap().is_empty());
    }

    /// A modulus smaller than the number of distinct vote choices is
    /// rejected before any ballot is collected.
    #[test]
    fn test_undersized_modulus_is_rejected() {
        let mut config = config(10, 2, 1, 3);
        config.modulus = BigInt::from_u64(4);
        assert!(matches!(
            Election::new(config, 3),
            Err(ElectionError::Configuration(_))
        ));
    }

    /// A larger run with more rows, rounds and voters than tablets; the
    /// outcome must match the histogram of the submitted votes.
    #[test]
    fn test_wide_election_matches_the_submitted_votes() {
        let votes = [0u64, 3, 3, 7, 1, 3, 0, 9, 9, 9, 9, 2];
        let election = Election::new(config(10, 3, 2, votes.len()), 3).unwrap();
        let outcome = election.run(&votes).unwrap();

        let mut expected = Distribution::new();
        for vote in votes {
            *expected.entry(BigInt::from_u64(vote)).or_insert(0) += 1;
        }
        assert_eq!(outcome, expected);
    }
}
