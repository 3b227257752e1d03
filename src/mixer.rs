//! The mix server: the row processor of the share matrix.
//!
//! Each server owns exactly one row (one share component across all
//! ballots) and never sees another server's row, so no single server can
//! reconstruct any vote. Mixing applies a blinding residue to every entry
//! and reorders the row by the round's global permutation; opening is only
//! ever partial (one half per entry, for proof rounds) or full (for rounds
//! the draw designated as tally rounds).
//!
//! A server runs on its own thread behind a command/reply channel pair.
//! The raw row never crosses that boundary except through the defined
//! `open_*` replies, which keeps the secret-sharing invariant at the
//! component level rather than as a convention.
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::commitment::{CommitKey, FullOpening, SealedShare, ShareCommitment};
use crate::errors::ElectionError;
use crate::splitvalue::{Modulus, ProofTriple, ShareHalf, SplitValue};
use crate::BigInt;

pub type RoundId = usize;

/// What the post-commitment draw designated a round for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundRole {
    Proof,
    Tally,
}

/// One equality link produced for a proof round: the triple plus the keys
/// opening the disclosed half of the original entry (`source`) and of the
/// mixed entry (`target`).
#[derive(Debug, Clone)]
pub struct PartialProof {
    pub source: usize,
    pub target: usize,
    pub triple: ProofTriple,
    pub source_key: CommitKey,
    pub target_key: CommitKey,
}

struct MixedRow {
    shares: Vec<SealedShare>,
    perm: Vec<usize>,
}

/// The single row a mix server owns, plus every mixed copy it has
/// committed to and the roles those copies were later assigned.
pub struct RowState {
    index: usize,
    modulus: Modulus,
    original: Vec<SealedShare>,
    rounds: HashMap<RoundId, MixedRow>,
    roles: HashMap<RoundId, RoundRole>,
}

impl RowState {
    pub fn new(index: usize, modulus: Modulus, original: Vec<SealedShare>) -> Self {
        Self {
            index,
            modulus,
            original,
            rounds: HashMap::new(),
            roles: HashMap::new(),
        }
    }

    pub fn ballots(&self) -> usize {
        self.original.len()
    }

    /// Produce this row's copy for one mix round: entry `perm[j]` of the
    /// original row, re-randomized with `blinds[j]`, lands at position `j`.
    /// Returns the commitments to the mixed row; the shares stay here.
    pub fn mix(
        &mut self,
        round: RoundId,
        perm: &[usize],
        blinds: &[BigInt],
    ) -> Result<Vec<ShareCommitment>, ElectionError> {
        let n = self.original.len();
        if self.rounds.contains_key(&round) {
            return Err(ElectionError::violation(format!(
                "row {} already committed to round {}",
                self.index, round
            )));
        }
        if perm.len() != n || blinds.len() != n {
            return Err(ElectionError::violation(format!(
                "row {} received a round of width {}/{} over {} ballots",
                self.index,
                perm.len(),
                blinds.len(),
                n
            )));
        }
        let mut seen = vec![false; n];
        for &source in perm {
            if source >= n || seen[source] {
                return Err(ElectionError::violation(format!(
                    "row {} received a non-bijective permutation",
                    self.index
                )));
            }
            seen[source] = true;
        }

        let shares: Vec<SealedShare> = perm
            .iter()
            .zip(blinds)
            .map(|(&source, d)| self.original[source].blind(d, &self.modulus))
            .collect();
        let commitments = shares.iter().map(SealedShare::commitment).collect();
        self.rounds.insert(
            round,
            MixedRow {
                shares,
                perm: perm.to_vec(),
            },
        );
        debug!(row = self.index, round, "row mixed");
        return Ok(commitments);
    }

    /// Record the draw's designation for a committed round. Re-marking a
    /// round with a different role would let the orchestrator open both
    /// sides of one copy, so it is rejected.
    pub fn mark(&mut self, round: RoundId, role: RoundRole) -> Result<(), ElectionError> {
        if !self.rounds.contains_key(&round) {
            return Err(ElectionError::violation(format!(
                "row {} asked to mark unknown round {}",
                self.index, round
            )));
        }
        match self.roles.insert(round, role) {
            None => Ok(()),
            Some(previous) if previous == role => Ok(()),
            Some(_) => Err(ElectionError::violation(format!(
                "row {} round {} re-marked with a conflicting role",
                self.index, round
            ))),
        }
    }

    fn round(&self, round: RoundId, role: RoundRole) -> Result<&MixedRow, ElectionError> {
        if self.roles.get(&round) != Some(&role) {
            return Err(ElectionError::violation(format!(
                "row {} round {} opened outside its designated role",
                self.index, round
            )));
        }
        // Marking guarantees the round exists.
        return Ok(&self.rounds[&round]);
    }

    /// Fully open the row of a tally round.
    pub fn open_full(&self, round: RoundId) -> Result<Vec<FullOpening>, ElectionError> {
        let mixed = self.round(round, RoundRole::Tally)?;
        return Ok(mixed.shares.iter().map(SealedShare::open_full).collect());
    }

    /// Prove that position `target` of a proof round carries the same value
    /// as position `source` of the original row, disclosing only the drawn
    /// half of each.
    pub fn open_partial(
        &self,
        round: RoundId,
        source: usize,
        target: usize,
        half: ShareHalf,
    ) -> Result<PartialProof, ElectionError> {
        let mixed = self.round(round, RoundRole::Proof)?;
        if target >= mixed.shares.len() || mixed.perm[target] != source {
            return Err(ElectionError::violation(format!(
                "row {} round {} does not map position {} to {}",
                self.index, round, source, target
            )));
        }
        let original = &self.original[source];
        let share = &mixed.shares[target];
        let triple = SplitValue::prove_equal(original.value(), share.value(), half, &self.modulus);
        return Ok(PartialProof {
            source,
            target,
            triple,
            source_key: original.open_half(half).key,
            target_key: share.open_half(half).key,
        });
    }

    /// Produce the full set of equality links for a proof round. `halves`
    /// is indexed by original position: one fixed half per original entry,
    /// shared by every proof round, so no original share ever has both
    /// halves disclosed.
    pub fn open_proofs(
        &self,
        round: RoundId,
        halves: &[ShareHalf],
    ) -> Result<Vec<PartialProof>, ElectionError> {
        let n = self.original.len();
        if halves.len() != n {
            return Err(ElectionError::violation(format!(
                "row {} received {} half choices over {} ballots",
                self.index,
                halves.len(),
                n
            )));
        }
        let perm = self.round(round, RoundRole::Proof)?.perm.clone();
        return (0..n)
            .map(|target| {
                let source = perm[target];
                self.open_partial(round, source, target, halves[source])
            })
            .collect();
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&mut self, round: RoundId, position: usize) {
        let mixed = self.rounds.get_mut(&round).expect("round was mixed");
        mixed.shares[position].corrupt(&self.modulus);
    }
}

/// Commands a mix server accepts from the proof server.
pub enum RowCommand {
    Mix {
        round: RoundId,
        perm: Arc<Vec<usize>>,
        blinds: Vec<BigInt>,
    },
    Mark {
        proof_rounds: Vec<RoundId>,
        tally_rounds: Vec<RoundId>,
    },
    OpenProofs {
        round: RoundId,
        halves: Vec<ShareHalf>,
    },
    OpenFull {
        round: RoundId,
    },
    #[cfg(test)]
    Corrupt { round: RoundId, position: usize },
    Shutdown,
}

/// Replies, each tagged with the sending row.
pub enum RowReply {
    Mixed {
        row: usize,
        round: RoundId,
        commitments: Vec<ShareCommitment>,
    },
    Marked {
        row: usize,
    },
    Proofs {
        row: usize,
        round: RoundId,
        proofs: Vec<PartialProof>,
    },
    Openings {
        row: usize,
        round: RoundId,
        openings: Vec<FullOpening>,
    },
    #[cfg(test)]
    Corrupted { row: usize },
    Violation {
        row: usize,
        message: String,
    },
}

/// A running mix server: one row, one thread, one command channel.
pub struct MixServer {
    index: usize,
    commands: Sender<RowCommand>,
    thread: JoinHandle<()>,
}

impl MixServer {
    pub fn spawn(
        index: usize,
        modulus: Modulus,
        original: Vec<SealedShare>,
        replies: Sender<RowReply>,
    ) -> Self {
        let (commands, inbox) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name(format!("mix-row-{index}"))
            .spawn(move || run_row(RowState::new(index, modulus, original), inbox, replies))
            .expect("failed to spawn mix server thread");
        return Self {
            index,
            commands,
            thread,
        };
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn send(&self, command: RowCommand) -> Result<(), ElectionError> {
        self.commands.send(command).map_err(|_| {
            ElectionError::violation(format!("mix server for row {} hung up", self.index))
        })
    }

    pub fn shutdown(self) {
        let _ = self.commands.send(RowCommand::Shutdown);
        let _ = self.thread.join();
    }
}

fn run_row(mut state: RowState, commands: Receiver<RowCommand>, replies: Sender<RowReply>) {
    let row = state.index;
    for command in commands.iter() {
        let reply = match command {
            RowCommand::Mix {
                round,
                perm,
                blinds,
            } => match state.mix(round, &perm, &blinds) {
                Ok(commitments) => RowReply::Mixed {
                    row,
                    round,
                    commitments,
                },
                Err(err) => violation(row, err),
            },
            RowCommand::Mark {
                proof_rounds,
                tally_rounds,
            } => {
                let outcome = proof_rounds
                    .iter()
                    .try_for_each(|&round| state.mark(round, RoundRole::Proof))
                    .and_then(|_| {
                        tally_rounds
                            .iter()
                            .try_for_each(|&round| state.mark(round, RoundRole::Tally))
                    });
                match outcome {
                    Ok(()) => RowReply::Marked { row },
                    Err(err) => violation(row, err),
                }
            }
            RowCommand::OpenProofs { round, halves } => match state.open_proofs(round, &halves) {
                Ok(proofs) => RowReply::Proofs { row, round, proofs },
                Err(err) => violation(row, err),
            },
            RowCommand::OpenFull { round } => match state.open_full(round) {
                Ok(openings) => RowReply::Openings {
                    row,
                    round,
                    openings,
                },
                Err(err) => violation(row, err),
            },
            #[cfg(test)]
            RowCommand::Corrupt { round, position } => {
                state.corrupt(round, position);
                RowReply::Corrupted { row }
            }
            RowCommand::Shutdown => break,
        };
        if replies.send(reply).is_err() {
            // The orchestrator went away; nothing left to serve.
            break;
        }
    }
    debug!(row, "mix server stopped");
}

fn violation(row: usize, err: ElectionError) -> RowReply {
    RowReply::Violation {
        row,
        message: err.to_string(),
    }
}
