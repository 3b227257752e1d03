//! The proof server: the orchestrator of the mixing and verification
//! protocol.
//!
//! The server owns the matrix only long enough to hand each row to its mix
//! server; afterwards every touch of a share goes through the row-isolated
//! `open_*` interface, so the orchestrator is the single coordination point
//! without ever being a single point of secret knowledge outside the
//! designated tally openings.
//!
//! The protocol is a one-way state machine: Collecting, Mixing,
//! Challenging, Tallying, Finalized. All 2m mixed matrices are committed to
//! the bulletin board before the proof/tally draw is derived from the chain
//! head, so the choice of which rounds get opened cannot be biased by a
//! server that already knows what it tampered with. A failure in any phase
//! is final; there is no retry path for a round whose validity is a
//! cryptographic fact.
use std::collections::HashSet;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use crypto_bigint::rand_core::OsRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, info};

use crate::config::ElectionConfig;
use crate::errors::ElectionError;
use crate::mixer::{MixServer, PartialProof, RoundId, RowCommand, RowReply};
use crate::record::Matrix;
use crate::sbb::{BallotRecord, Entry, SbbHandle, VoteCount};
use crate::splitvalue::{Modulus, ShareHalf};
use crate::tablet::SubmittedBallot;
use crate::{BigInt, Distribution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Collecting,
    Mixing,
    Challenging,
    Tallying,
    Finalized,
}

/// The post-commitment challenge: which rounds prove, which rounds tally,
/// and which half of every original entry the proof rounds may disclose.
///
/// Derived deterministically from the bulletin-board head at the moment the
/// last mixed matrix was posted, in a fixed order (round shuffle first,
/// then halves row-major), so any observer reproduces the draw exactly.
pub struct ChallengeDraw {
    pub proof_rounds: Vec<RoundId>,
    pub tally_rounds: Vec<RoundId>,
    pub halves: Vec<Vec<ShareHalf>>,
}

impl ChallengeDraw {
    pub fn derive(seed: [u8; 32], half_rounds: usize, rows: usize, ballots: usize) -> Self {
        let mut rng = ChaCha20Rng::from_seed(seed);
        let mut rounds: Vec<RoundId> = (0..2 * half_rounds).collect();
        rounds.shuffle(&mut rng);
        let tally_rounds = rounds.split_off(half_rounds);
        let halves = (0..rows)
            .map(|_| {
                (0..ballots)
                    .map(|_| {
                        if rng.gen::<bool>() {
                            ShareHalf::U
                        } else {
                            ShareHalf::V
                        }
                    })
                    .collect()
            })
            .collect();
        return Self {
            proof_rounds: rounds,
            tally_rounds,
            halves,
        };
    }
}

pub struct ProofServer {
    config: ElectionConfig,
    modulus: Modulus,
    sbb: SbbHandle,
    phase: Phase,
    pending: Vec<(BallotRecord, SubmittedBallot)>,
    servers: Vec<MixServer>,
    reply_tx: Sender<RowReply>,
    replies: Receiver<RowReply>,
    /// Actual ballot count, fixed when submissions close.
    ballots: usize,
    draw: Option<ChallengeDraw>,
    outcome: Option<Distribution>,
}

impl ProofServer {
    pub fn new(config: ElectionConfig, sbb: SbbHandle) -> Result<Self, ElectionError> {
        config.validate()?;
        let modulus = config.modulus()?;
        let (reply_tx, replies) = crossbeam_channel::unbounded();
        return Ok(Self {
            config,
            modulus,
            sbb,
            phase: Phase::Collecting,
            pending: Vec::new(),
            servers: Vec::new(),
            reply_tx,
            replies,
            ballots: 0,
            draw: None,
            outcome: None,
        });
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn draw(&self) -> Option<&ChallengeDraw> {
        self.draw.as_ref()
    }

    fn expect_phase(&self, phase: Phase) -> Result<(), ElectionError> {
        if self.phase != phase {
            return Err(ElectionError::not_ready(format!(
                "operation requires phase {:?}, server is in {:?}",
                phase, self.phase
            )));
        }
        return Ok(());
    }

    /// Accept one sealed ballot while collecting.
    pub fn submit(&mut self, ballot: SubmittedBallot) -> Result<(), ElectionError> {
        self.expect_phase(Phase::Collecting)?;
        if ballot.rows() != self.config.rows {
            return Err(ElectionError::violation(format!(
                "ballot carries {} components, election runs {} rows",
                ballot.rows(),
                self.config.rows
            )));
        }
        if self
            .pending
            .iter()
            .any(|(record, _)| record.ballot_id == ballot.ballot_id)
        {
            return Err(ElectionError::violation("duplicate ballot id"));
        }
        let record = BallotRecord {
            ballot_id: ballot.ballot_id,
            tablet_id: ballot.tablet_id,
        };
        self.pending.push((record, ballot));
        return Ok(());
    }

    /// Close the submission window: post the original matrix commitment and
    /// hand each row to its mix server. An election with no ballots is
    /// trivially final.
    pub fn close_submissions(&mut self) -> Result<(), ElectionError> {
        self.expect_phase(Phase::Collecting)?;
        let mut matrix = Matrix::new(self.config.rows);
        let mut records = Vec::with_capacity(self.pending.len());
        for (record, ballot) in self.pending.drain(..) {
            records.push(record);
            matrix.push_ballot(ballot.into_shares())?;
        }
        self.ballots = matrix.ballots();
        info!(ballots = self.ballots, "submissions closed");

        self.sbb.write().append(Entry::OriginalMatrix {
            commitments: matrix.commitments(),
            ballots: records,
        });

        if self.ballots == 0 {
            self.outcome = Some(Distribution::new());
            self.sbb.write().append(Entry::Outcome {
                distribution: Vec::new(),
            });
            self.phase = Phase::Finalized;
            info!("no ballots; election finalized with an empty outcome");
            return Ok(());
        }

        for (index, row) in matrix.into_rows().into_iter().enumerate() {
            self.servers
                .push(MixServer::spawn(index, self.modulus, row, self.reply_tx.clone()));
        }
        self.phase = Phase::Mixing;
        return Ok(());
    }

    /// Generate and commit all 2m mix rounds, in order, before any of them
    /// is opened.
    pub fn run_mixing(&mut self) -> Result<(), ElectionError> {
        self.expect_phase(Phase::Mixing)?;
        for round in 0..self.config.rounds() {
            let mut perm: Vec<usize> = (0..self.ballots).collect();
            perm.shuffle(&mut OsRng);
            let perm = Arc::new(perm);
            for server in &self.servers {
                let blinds = (0..self.ballots)
                    .map(|_| self.modulus.random_residue())
                    .collect();
                server.send(RowCommand::Mix {
                    round,
                    perm: Arc::clone(&perm),
                    blinds,
                })?;
            }
            let commitments = self.collect_rows(round, |reply| match reply {
                RowReply::Mixed {
                    row,
                    round: r,
                    commitments,
                } if r == round => Some((row, commitments)),
                _ => None,
            })?;
            self.sbb.write().append(Entry::MixedMatrix {
                round,
                commitments,
            });
            debug!(round, "mixed matrix committed");
        }
        self.phase = Phase::Challenging;
        return Ok(());
    }

    /// Derive the post-commitment draw, post every equality link for the
    /// proof set, and re-verify all of them.
    pub fn run_challenge(&mut self) -> Result<(), ElectionError> {
        self.expect_phase(Phase::Challenging)?;
        let seed = self.sbb.read().head();
        let draw = ChallengeDraw::derive(
            seed,
            self.config.half_rounds,
            self.config.rows,
            self.ballots,
        );
        info!(
            proof_rounds = ?draw.proof_rounds,
            tally_rounds = ?draw.tally_rounds,
            "challenge draw fixed"
        );

        for server in &self.servers {
            server.send(RowCommand::Mark {
                proof_rounds: draw.proof_rounds.clone(),
                tally_rounds: draw.tally_rounds.clone(),
            })?;
        }
        for reply in self.drain_replies()? {
            if !matches!(reply, RowReply::Marked { .. }) {
                return Err(ElectionError::violation(
                    "unexpected reply while marking round roles",
                ));
            }
        }

        for &round in &draw.proof_rounds {
            for server in &self.servers {
                server.send(RowCommand::OpenProofs {
                    round,
                    halves: draw.halves[server.index()].clone(),
                })?;
            }
            let proofs = self.collect_rows(round, |reply| match reply {
                RowReply::Proofs {
                    row,
                    round: r,
                    proofs,
                } if r == round => Some((row, proofs)),
                _ => None,
            })?;
            for (row, proofs) in proofs.iter().enumerate() {
                let mut board = self.sbb.write();
                for proof in proofs {
                    board.append(Entry::ProofTriple {
                        round,
                        row,
                        source: proof.source,
                        target: proof.target,
                        triple: proof.triple,
                        source_key: proof.source_key,
                        target_key: proof.target_key,
                    });
                }
            }
            for (row, proofs) in proofs.iter().enumerate() {
                self.verify_round_proofs(&draw, round, row, proofs)?;
            }
            debug!(round, "proof round verified");
        }
        self.draw = Some(draw);
        self.phase = Phase::Tallying;
        return Ok(());
    }

    /// Recompute the check relation for every triple of one round's row and
    /// make sure the links cover the whole row through a bijection.
    fn verify_round_proofs(
        &self,
        draw: &ChallengeDraw,
        round: RoundId,
        row: usize,
        proofs: &[PartialProof],
    ) -> Result<(), ElectionError> {
        if proofs.len() != self.ballots {
            return Err(ElectionError::violation(format!(
                "round {} row {} produced {} links over {} ballots",
                round,
                row,
                proofs.len(),
                self.ballots
            )));
        }
        let mut sources = HashSet::new();
        let mut targets = HashSet::new();
        for proof in proofs {
            if !sources.insert(proof.source) || !targets.insert(proof.target) {
                return Err(ElectionError::violation(format!(
                    "round {} row {} links are not a bijection",
                    round, row
                )));
            }
            if proof.source >= self.ballots || proof.target >= self.ballots {
                return Err(ElectionError::violation(format!(
                    "round {} row {} links an out-of-range position",
                    round, row
                )));
            }
            if proof.triple.half != draw.halves[row][proof.source] {
                return Err(ElectionError::violation(format!(
                    "round {} row {} disclosed the wrong half for position {}",
                    round, row, proof.source
                )));
            }
            if !proof.triple.verify(&self.modulus) {
                return Err(ElectionError::violation(format!(
                    "round {} row {} proof triple failed its check relation",
                    round, row
                )));
            }
        }
        return Ok(());
    }

    /// Open every tally round, recombine the columns, and reconcile the m
    /// distributions into the outcome.
    pub fn run_tally(&mut self) -> Result<(), ElectionError> {
        self.expect_phase(Phase::Tallying)?;
        let tally_rounds = self
            .draw
            .as_ref()
            .map(|draw| draw.tally_rounds.clone())
            .expect("draw exists in the tallying phase");

        let mut distributions: Vec<(RoundId, Distribution)> = Vec::new();
        for &round in &tally_rounds {
            for server in &self.servers {
                server.send(RowCommand::OpenFull { round })?;
            }
            let openings = self.collect_rows(round, |reply| match reply {
                RowReply::Openings {
                    row,
                    round: r,
                    openings,
                } if r == round => Some((row, openings)),
                _ => None,
            })?;
            {
                let mut board = self.sbb.write();
                for (row, row_openings) in openings.iter().enumerate() {
                    for (position, opening) in row_openings.iter().enumerate() {
                        board.append(Entry::TallyOpen {
                            round,
                            row,
                            position,
                            opening: *opening,
                        });
                    }
                }
            }

            if openings.iter().any(|row| row.len() != self.ballots) {
                return Err(ElectionError::violation(format!(
                    "round {} opened a row of the wrong width",
                    round
                )));
            }
            let mut distribution = Distribution::new();
            for position in 0..self.ballots {
                let mut value = BigInt::ZERO;
                for row_openings in &openings {
                    value = self
                        .modulus
                        .add(&value, &row_openings[position].value(&self.modulus));
                }
                *distribution.entry(value).or_insert(0) += 1;
            }
            debug!(round, "tally round recombined");
            distributions.push((round, distribution));
        }

        // Every tally round must report the identical distribution.
        let (_, reference) = &distributions[0];
        for (round, distribution) in &distributions[1..] {
            if distribution != reference {
                return Err(ElectionError::violation(format!(
                    "tally round {} diverges from the other tally rounds",
                    round
                )));
            }
        }

        self.sbb.write().append(Entry::Outcome {
            distribution: VoteCount::from_distribution(reference),
        });
        self.outcome = Some(reference.clone());
        self.phase = Phase::Finalized;
        info!("election finalized");
        self.shutdown_servers();
        return Ok(());
    }

    /// The outcome distribution, available only once Finalized.
    pub fn get_outcome(&self) -> Result<&Distribution, ElectionError> {
        match (&self.phase, &self.outcome) {
            (Phase::Finalized, Some(outcome)) => Ok(outcome),
            _ => Err(ElectionError::not_ready(
                "the election outcome is not finalized",
            )),
        }
    }

    /// Receive exactly one reply per mix server, surfacing any violation
    /// only after the channel is drained so later rounds stay aligned.
    fn drain_replies(&self) -> Result<Vec<RowReply>, ElectionError> {
        let mut replies = Vec::with_capacity(self.servers.len());
        for _ in 0..self.servers.len() {
            let reply = self
                .replies
                .recv()
                .map_err(|_| ElectionError::violation("a mix server disconnected mid-round"))?;
            replies.push(reply);
        }
        for reply in &replies {
            if let RowReply::Violation { row, message } = reply {
                return Err(ElectionError::violation(format!("row {}: {}", row, message)));
            }
        }
        return Ok(replies);
    }

    /// Drain one reply per server and slot the payloads into row order.
    fn collect_rows<T>(
        &self,
        round: RoundId,
        extract: impl Fn(RowReply) -> Option<(usize, T)>,
    ) -> Result<Vec<T>, ElectionError> {
        let mut slots: Vec<Option<T>> = (0..self.servers.len()).map(|_| None).collect();
        for reply in self.drain_replies()? {
            match extract(reply) {
                Some((row, payload)) if row < slots.len() && slots[row].is_none() => {
                    slots[row] = Some(payload);
                }
                _ => {
                    return Err(ElectionError::violation(format!(
                        "round {} received a misplaced mix server reply",
                        round
                    )))
                }
            }
        }
        return slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| {
                    ElectionError::violation(format!("round {} is missing a row reply", round))
                })
            })
            .collect();
    }

    fn shutdown_servers(&mut self) {
        for server in self.servers.drain(..) {
            server.shutdown();
        }
    }

    #[cfg(test)]
    pub(crate) fn corrupt_share(&self, round: RoundId, row: usize, position: usize) {
        self.servers[row]
            .send(RowCommand::Corrupt { round, position })
            .unwrap();
        match self.replies.recv().unwrap() {
            RowReply::Corrupted { .. } => {}
            _ => panic!("expected a corruption ack"),
        }
    }
}

impl Drop for ProofServer {
    fn drop(&mut self) {
        self.shutdown_servers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbb::BulletinBoard;
    use crate::tablet::Tablet;

    const MODULUS: u64 = 10;

    fn config(rows: usize, half_rounds: usize, ballots: usize) -> ElectionConfig {
        ElectionConfig::new(BigInt::from_u64(MODULUS), rows, half_rounds, ballots, MODULUS)
    }

    fn submit_votes(server: &mut ProofServer, tablet: &Tablet, votes: &[u64]) {
        for vote in votes {
            let (ballot, _) = tablet.cast(&BigInt::from_u64(*vote)).unwrap();
            server.submit(ballot).unwrap();
        }
    }

    fn distribution(buckets: &[(u64, u64)]) -> Distribution {
        buckets
            .iter()
            .map(|(value, count)| (BigInt::from_u64(*value), *count))
            .collect()
    }

    #[test]
    fn test_invalid_config_is_rejected_at_setup() {
        let bad = ElectionConfig::new(BigInt::from_u64(4), 2, 1, 3, 10);
        assert!(matches!(
            ProofServer::new(bad, BulletinBoard::shared()),
            Err(ElectionError::Configuration(_))
        ));
    }

    #[test]
    fn test_full_protocol_run() {
        let sbb = BulletinBoard::shared();
        let mut server = ProofServer::new(config(2, 1, 3), sbb.clone()).unwrap();
        let tablet = Tablet::new(server.modulus, 2);
        submit_votes(&mut server, &tablet, &[2, 5, 2]);

        server.close_submissions().unwrap();
        server.run_mixing().unwrap();
        server.run_challenge().unwrap();
        server.run_tally().unwrap();

        assert_eq!(server.phase(), Phase::Finalized);
        assert_eq!(*server.get_outcome().unwrap(), distribution(&[(2, 2), (5, 1)]));

        // The board carries the full record in commit order.
        let board = sbb.read();
        let entries = board.read_all();
        assert!(matches!(entries[0].entry, Entry::OriginalMatrix { .. }));
        let mixed = entries
            .iter()
            .filter(|e| matches!(e.entry, Entry::MixedMatrix { .. }))
            .count();
        assert_eq!(mixed, 2);
        assert!(matches!(entries.last().unwrap().entry, Entry::Outcome { .. }));
        board.verify_chain().unwrap();
    }

    #[test]
    fn test_phase_guards() {
        let mut server = ProofServer::new(config(2, 1, 1), BulletinBoard::shared()).unwrap();
        let tablet = Tablet::new(server.modulus, 2);

        assert!(matches!(
            server.get_outcome(),
            Err(ElectionError::NotReady(_))
        ));
        assert!(matches!(server.run_mixing(), Err(ElectionError::NotReady(_))));
        assert!(matches!(server.run_tally(), Err(ElectionError::NotReady(_))));

        submit_votes(&mut server, &tablet, &[1]);
        server.close_submissions().unwrap();
        let (late, _) = tablet.cast(&BigInt::from_u64(1)).unwrap();
        assert!(matches!(server.submit(late), Err(ElectionError::NotReady(_))));
    }

    #[test]
    fn test_wrong_width_ballot_is_a_violation() {
        let mut server = ProofServer::new(config(3, 1, 1), BulletinBoard::shared()).unwrap();
        let narrow_tablet = Tablet::new(server.modulus, 2);
        let (ballot, _) = narrow_tablet.cast(&BigInt::from_u64(1)).unwrap();
        assert!(matches!(
            server.submit(ballot),
            Err(ElectionError::ProtocolViolation(_))
        ));
    }

    /// Tampering with a tally-set share after mixing but before opening
    /// diverges that round's distribution; the election refuses to
    /// finalize.
    #[test]
    fn test_tampered_tally_round_is_fatal() {
        let mut server = ProofServer::new(config(2, 2, 4), BulletinBoard::shared()).unwrap();
        let tablet = Tablet::new(server.modulus, 2);
        submit_votes(&mut server, &tablet, &[1, 2, 3, 4]);
        server.close_submissions().unwrap();
        server.run_mixing().unwrap();
        server.run_challenge().unwrap();

        let round = server.draw().unwrap().tally_rounds[0];
        server.corrupt_share(round, 0, 2);

        assert!(matches!(
            server.run_tally(),
            Err(ElectionError::ProtocolViolation(_))
        ));
        assert!(matches!(
            server.get_outcome(),
            Err(ElectionError::NotReady(_))
        ));
    }

    /// No ballots: the election finalizes immediately with an empty
    /// distribution and never spawns a mix server.
    #[test]
    fn test_empty_election_is_trivially_final() {
        let sbb = BulletinBoard::shared();
        let mut server = ProofServer::new(config(2, 1, 0), sbb.clone()).unwrap();
        server.close_submissions().unwrap();
        assert_eq!(server.phase(), Phase::Finalized);
        assert!(server.get_outcome().unwrap().is_empty());
        assert!(server.servers.is_empty());
        assert_eq!(sbb.read().len(), 2);
    }

    #[test]
    fn test_duplicate_ballot_id_is_rejected() {
        let mut server = ProofServer::new(config(2, 1, 2), BulletinBoard::shared()).unwrap();
        let tablet = Tablet::new(server.modulus, 2);
        let (first, _) = tablet.cast(&BigInt::from_u64(1)).unwrap();
        let duplicate_id = first.ballot_id;
        server.submit(first).unwrap();
        let (mut second, _) = tablet.cast(&BigInt::from_u64(2)).unwrap();
        second.ballot_id = duplicate_id;
        assert!(matches!(
            server.submit(second),
            Err(ElectionError::ProtocolViolation(_))
        ));
    }
}
