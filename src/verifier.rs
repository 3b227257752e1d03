//! Independent audit of a finished election from the public record alone.
//!
//! The auditor holds nothing but the bulletin-board transcript and the
//! public configuration. It re-derives the hash chain, the post-commitment
//! challenge draw, every equality link of the proof set (check relation,
//! commitment openings on both ends, bijective coverage of every round),
//! and every tally opening, then recomputes all m distributions and
//! demands they agree with each other and with the posted outcome.
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::commitment::{commit, CommitKey, FullOpening, ShareCommitment};
use crate::config::ElectionConfig;
use crate::errors::ElectionError;
use crate::proof_server::ChallengeDraw;
use crate::sbb::{self, BallotRecord, Entry, PostedEntry, VoteCount};
use crate::splitvalue::{Modulus, ProofTriple};
use crate::{BigInt, Distribution};

type TripleRecord = (usize, usize, ProofTriple, CommitKey, CommitKey);

/// Everything the walk over the transcript extracts.
struct Transcript<'a> {
    original: &'a [Vec<ShareCommitment>],
    ballots: &'a [BallotRecord],
    rounds: BTreeMap<usize, &'a Vec<Vec<ShareCommitment>>>,
    /// Chain head at the moment the last mixed matrix was posted; the seed
    /// of the challenge draw.
    commit_head: [u8; 32],
    triples: Vec<(usize, usize, TripleRecord)>,
    opens: Vec<(usize, usize, usize, FullOpening)>,
    outcome: &'a [VoteCount],
}

/// Re-verify a whole election and return its audited distribution.
pub fn audit(
    entries: &[PostedEntry],
    config: &ElectionConfig,
) -> Result<Distribution, ElectionError> {
    config.validate()?;
    let modulus = config.modulus()?;
    sbb::verify_entries(entries)?;

    let transcript = walk(entries)?;
    let rows = config.rows;
    let ballots = transcript.ballots.len();
    if transcript.original.len() != rows {
        return Err(ElectionError::violation(
            "original matrix row count does not match the configuration",
        ));
    }
    for row in transcript.original {
        if row.len() != ballots {
            return Err(ElectionError::violation(
                "original matrix width does not match the ballot receipts",
            ));
        }
    }

    if ballots == 0 {
        if !transcript.rounds.is_empty()
            || !transcript.triples.is_empty()
            || !transcript.opens.is_empty()
            || !transcript.outcome.is_empty()
        {
            return Err(ElectionError::violation(
                "an empty election posted protocol rounds",
            ));
        }
        return Ok(Distribution::new());
    }

    let total_rounds = config.rounds();
    if transcript.rounds.len() != total_rounds
        || !(0..total_rounds).all(|round| transcript.rounds.contains_key(&round))
    {
        return Err(ElectionError::violation(
            "mixed matrices do not cover every round exactly once",
        ));
    }
    for commitments in transcript.rounds.values() {
        if commitments.len() != rows || commitments.iter().any(|row| row.len() != ballots) {
            return Err(ElectionError::violation(
                "a mixed matrix has the wrong dimensions",
            ));
        }
    }

    let draw = ChallengeDraw::derive(transcript.commit_head, config.half_rounds, rows, ballots);
    verify_proof_set(&transcript, &draw, &modulus, rows, ballots)?;
    let reference = verify_tally_set(&transcript, &draw, &modulus, rows, ballots)?;

    if transcript.outcome != VoteCount::from_distribution(&reference) {
        return Err(ElectionError::violation(
            "the posted outcome does not match the recomputed tally",
        ));
    }
    return Ok(reference);
}

/// Single ordered pass over the transcript. The commit order itself is part
/// of the protocol: original matrix first, then every mixed matrix, then
/// every proof triple, then every tally opening, then the outcome.
fn walk(entries: &[PostedEntry]) -> Result<Transcript<'_>, ElectionError> {
    let mut original = None;
    let mut rounds = BTreeMap::new();
    let mut commit_head = [0u8; 32];
    let mut triples = Vec::new();
    let mut opens = Vec::new();
    let mut outcome = None;
    let mut stage = 0usize;

    fn advance(stage: &mut usize, at_most: usize) -> Result<(), ElectionError> {
        if *stage > at_most {
            return Err(ElectionError::violation(
                "bulletin board entries violate the commit order",
            ));
        }
        *stage = at_most;
        return Ok(());
    }

    for posted in entries {
        match &posted.entry {
            Entry::OriginalMatrix {
                commitments,
                ballots,
            } => {
                if original.is_some() {
                    return Err(ElectionError::violation("original matrix posted twice"));
                }
                advance(&mut stage, 0)?;
                original = Some((commitments, ballots));
            }
            Entry::MixedMatrix { round, commitments } => {
                advance(&mut stage, 1)?;
                if rounds.insert(*round, commitments).is_some() {
                    return Err(ElectionError::violation(format!(
                        "round {} posted twice",
                        round
                    )));
                }
                commit_head = posted.digest;
            }
            Entry::ProofTriple {
                round,
                row,
                source,
                target,
                triple,
                source_key,
                target_key,
            } => {
                advance(&mut stage, 2)?;
                triples.push((*round, *row, (*source, *target, *triple, *source_key, *target_key)));
            }
            Entry::TallyOpen {
                round,
                row,
                position,
                opening,
            } => {
                advance(&mut stage, 3)?;
                opens.push((*round, *row, *position, *opening));
            }
            Entry::Outcome { distribution } => {
                if outcome.is_some() {
                    return Err(ElectionError::violation("outcome posted twice"));
                }
                advance(&mut stage, 4)?;
                outcome = Some(distribution);
            }
        }
    }

    let (original, ballots) =
        original.ok_or_else(|| ElectionError::violation("no original matrix was posted"))?;
    let outcome = outcome.ok_or_else(|| ElectionError::violation("no outcome was posted"))?;
    return Ok(Transcript {
        original,
        ballots,
        rounds,
        commit_head,
        triples,
        opens,
        outcome,
    });
}

fn verify_proof_set(
    transcript: &Transcript<'_>,
    draw: &ChallengeDraw,
    modulus: &Modulus,
    rows: usize,
    ballots: usize,
) -> Result<(), ElectionError> {
    let proof_set: HashSet<usize> = draw.proof_rounds.iter().copied().collect();
    let mut by_round: HashMap<usize, Vec<Vec<TripleRecord>>> = proof_set
        .iter()
        .map(|&round| (round, vec![Vec::new(); rows]))
        .collect();
    for (round, row, record) in &transcript.triples {
        let grid = by_round.get_mut(round).ok_or_else(|| {
            ElectionError::violation(format!("round {} posted triples outside the proof set", round))
        })?;
        if *row >= rows {
            return Err(ElectionError::violation("triple posted for an unknown row"));
        }
        grid[*row].push(*record);
    }

    for (&round, grid) in &by_round {
        let round_commitments = &transcript.rounds[&round];
        for (row, links) in grid.iter().enumerate() {
            if links.len() != ballots {
                return Err(ElectionError::violation(format!(
                    "round {} row {} posted {} of {} equality links",
                    round,
                    row,
                    links.len(),
                    ballots
                )));
            }
            let mut sources = HashSet::new();
            let mut targets = HashSet::new();
            for (source, target, triple, source_key, target_key) in links {
                if *source >= ballots || *target >= ballots {
                    return Err(ElectionError::violation(
                        "equality link points outside the matrix",
                    ));
                }
                if !sources.insert(*source) || !targets.insert(*target) {
                    return Err(ElectionError::violation(format!(
                        "round {} row {} links are not a bijection",
                        round, row
                    )));
                }
                if triple.half != draw.halves[row][*source] {
                    return Err(ElectionError::violation(
                        "equality link disclosed a half the draw did not pick",
                    ));
                }
                if !triple.verify(modulus) {
                    return Err(ElectionError::violation(format!(
                        "round {} row {} equality link failed its check relation",
                        round, row
                    )));
                }
                if commit(source_key, &triple.a1)
                    != *transcript.original[row][*source].half(triple.half)
                {
                    return Err(ElectionError::violation(
                        "equality link does not open the original commitment",
                    ));
                }
                if commit(target_key, &triple.a2)
                    != *round_commitments[row][*target].half(triple.half)
                {
                    return Err(ElectionError::violation(
                        "equality link does not open the mixed commitment",
                    ));
                }
            }
        }
    }
    return Ok(());
}

fn verify_tally_set(
    transcript: &Transcript<'_>,
    draw: &ChallengeDraw,
    modulus: &Modulus,
    rows: usize,
    ballots: usize,
) -> Result<Distribution, ElectionError> {
    let tally_set: HashSet<usize> = draw.tally_rounds.iter().copied().collect();
    let mut by_round: HashMap<usize, Vec<Vec<Option<FullOpening>>>> = tally_set
        .iter()
        .map(|&round| (round, vec![vec![None; ballots]; rows]))
        .collect();
    for (round, row, position, opening) in &transcript.opens {
        let grid = by_round.get_mut(round).ok_or_else(|| {
            ElectionError::violation(format!(
                "round {} posted openings outside the tally set",
                round
            ))
        })?;
        if *row >= rows || *position >= ballots {
            return Err(ElectionError::violation(
                "tally opening points outside the matrix",
            ));
        }
        if grid[*row][*position].replace(*opening).is_some() {
            return Err(ElectionError::violation(format!(
                "round {} opened row {} position {} twice",
                round, row, position
            )));
        }
    }

    let mut reference: Option<Distribution> = None;
    for (&round, grid) in &by_round {
        let round_commitments = &transcript.rounds[&round];
        let mut distribution = Distribution::new();
        for position in 0..ballots {
            let mut value = BigInt::ZERO;
            for row in 0..rows {
                let opening = grid[row][position].as_ref().ok_or_else(|| {
                    ElectionError::violation(format!(
                        "round {} row {} position {} was never opened",
                        round, row, position
                    ))
                })?;
                if !opening.verify(&round_commitments[row][position]) {
                    return Err(ElectionError::violation(format!(
                        "round {} row {} position {} opening does not match its commitment",
                        round, row, position
                    )));
                }
                value = modulus.add(&value, &opening.value(modulus));
            }
            *distribution.entry(value).or_insert(0) += 1;
        }
        match &reference {
            None => reference = Some(distribution),
            Some(existing) if *existing == distribution => {}
            Some(_) => {
                return Err(ElectionError::violation(format!(
                    "tally round {} diverges from the other tally rounds",
                    round
                )))
            }
        }
    }
    return reference
        .ok_or_else(|| ElectionError::violation("the tally set produced no distribution"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof_server::ProofServer;
    use crate::sbb::BulletinBoard;
    use crate::tablet::Tablet;

    const MODULUS: u64 = 10;

    fn run_election(votes: &[u64], rows: usize, half_rounds: usize) -> (Vec<PostedEntry>, ElectionConfig, Distribution) {
        let config = ElectionConfig::new(
            BigInt::from_u64(MODULUS),
            rows,
            half_rounds,
            votes.len(),
            MODULUS,
        );
        let sbb = BulletinBoard::shared();
        let mut server = ProofServer::new(config.clone(), sbb.clone()).unwrap();
        let tablet = Tablet::new(config.modulus().unwrap(), rows);
        for vote in votes {
            let (ballot, _) = tablet.cast(&BigInt::from_u64(*vote)).unwrap();
            server.submit(ballot).unwrap();
        }
        server.close_submissions().unwrap();
        if !votes.is_empty() {
            server.run_mixing().unwrap();
            server.run_challenge().unwrap();
            server.run_tally().unwrap();
        }
        let outcome = server.get_outcome().unwrap().clone();
        let entries = sbb.read().read_all().to_vec();
        return (entries, config, outcome);
    }

    /// Re-weld the chain after editing entry payloads, so the audit reaches
    /// the deeper checks instead of failing on the chain digest.
    fn reweld(entries: &[PostedEntry]) -> Vec<PostedEntry> {
        let mut board = BulletinBoard::new();
        for posted in entries {
            board.append(posted.entry.clone());
        }
        return board.read_all().to_vec();
    }

    #[test]
    fn test_audit_confirms_an_honest_election() {
        let (entries, config, outcome) = run_election(&[2, 5, 2, 9], 3, 2);
        let audited = audit(&entries, &config).unwrap();
        assert_eq!(audited, outcome);
    }

    #[test]
    fn test_audit_of_an_empty_election() {
        let (entries, config, outcome) = run_election(&[], 2, 1);
        assert!(outcome.is_empty());
        assert!(audit(&entries, &config).unwrap().is_empty());
    }

    /// Every entry kind survives the JSON-lines dump and re-audits from the
    /// loaded transcript.
    #[test]
    fn test_transcript_survives_dump_and_load() {
        let (entries, config, outcome) = run_election(&[0, 1, 1], 2, 1);
        let mut board = BulletinBoard::new();
        for posted in &entries {
            board.append(posted.entry.clone());
        }
        let mut buffer = Vec::new();
        board.dump(&mut buffer).unwrap();
        let loaded = BulletinBoard::load(buffer.as_slice()).unwrap();
        assert_eq!(loaded.read_all(), &entries[..]);
        assert_eq!(audit(loaded.read_all(), &config).unwrap(), outcome);
    }

    #[test]
    fn test_audit_rejects_chain_tampering() {
        let (mut entries, config, _) = run_election(&[1, 2, 3], 2, 1);
        if let Entry::Outcome { distribution } = &mut entries.last_mut().unwrap().entry {
            distribution[0].count += 1;
        } else {
            panic!("last entry is the outcome");
        }
        assert!(matches!(
            audit(&entries, &config),
            Err(ElectionError::ProtocolViolation(_))
        ));
    }

    /// A transcript with a consistent chain but a falsified tally opening
    /// fails against the posted round commitments.
    #[test]
    fn test_audit_rejects_a_falsified_opening() {
        let (mut entries, config, _) = run_election(&[1, 2, 3], 2, 1);
        let modulus = config.modulus().unwrap();
        let slot = entries
            .iter_mut()
            .find(|posted| matches!(posted.entry, Entry::TallyOpen { .. }))
            .unwrap();
        if let Entry::TallyOpen { opening, .. } = &mut slot.entry {
            opening.u = modulus.add(&opening.u, &BigInt::ONE);
        }
        let rewelded = reweld(&entries);
        assert!(matches!(
            audit(&rewelded, &config),
            Err(ElectionError::ProtocolViolation(_))
        ));
    }

    /// A rewelded transcript with a falsified outcome count survives the
    /// chain check but not the recomputed tally.
    #[test]
    fn test_audit_rejects_a_falsified_outcome() {
        let (mut entries, config, _) = run_election(&[4, 4, 1], 2, 1);
        if let Entry::Outcome { distribution } = &mut entries.last_mut().unwrap().entry {
            distribution[0].count += 1;
        }
        let rewelded = reweld(&entries);
        assert!(matches!(
            audit(&rewelded, &config),
            Err(ElectionError::ProtocolViolation(_))
        ));
    }

    /// Dropping a proof triple leaves a round without full coverage.
    #[test]
    fn test_audit_rejects_incomplete_proof_coverage() {
        let (entries, config, _) = run_election(&[1, 2, 3], 2, 1);
        let pruned: Vec<PostedEntry> = entries
            .iter()
            .scan(false, |dropped, posted| {
                if !*dropped && matches!(posted.entry, Entry::ProofTriple { .. }) {
                    *dropped = true;
                    return Some(None);
                }
                Some(Some(posted.clone()))
            })
            .flatten()
            .collect();
        let rewelded = reweld(&pruned);
        assert!(matches!(
            audit(&rewelded, &config),
            Err(ElectionError::ProtocolViolation(_))
        ));
    }
}
