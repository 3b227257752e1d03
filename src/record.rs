//! Vote records and the share matrix.
//!
//! A vote record is an ordered r-tuple of split values whose reconstructed
//! values sum to the vote mod M. No proper subset of fewer than r
//! components reveals anything: the first r-1 component values are drawn
//! uniformly and the last balances the sum.
use crate::commitment::{SealedShare, ShareCommitment};
use crate::errors::ElectionError;
use crate::splitvalue::{Modulus, SplitValue};
use crate::BigInt;

/// One ballot, as built by a tablet at submission time. Immutable once
/// created.
#[derive(Debug, Clone)]
pub struct VoteRecord {
    components: Vec<SplitValue>,
}

impl VoteRecord {
    /// Split `vote` into `rows` components. Zero rows is a programmer
    /// error; the configuration layer rejects it before any record exists.
    pub fn from_vote(vote: &BigInt, rows: usize, modulus: &Modulus) -> Self {
        assert!(rows > 0, "a vote record needs at least one row");
        let mut components = Vec::with_capacity(rows);
        let mut total = BigInt::ZERO;
        for _ in 0..rows - 1 {
            let x = modulus.random_residue();
            total = modulus.add(&total, &x);
            components.push(SplitValue::split(&x, modulus));
        }
        let last = modulus.sub(&modulus.reduce(vote), &total);
        components.push(SplitValue::split(&last, modulus));
        return Self { components };
    }

    pub fn components(&self) -> &[SplitValue] {
        &self.components
    }

    pub fn into_components(self) -> Vec<SplitValue> {
        self.components
    }

    pub fn rows(&self) -> usize {
        self.components.len()
    }

    /// Reconstruct the vote: the modular sum over all component values.
    pub fn value(&self, modulus: &Modulus) -> BigInt {
        let mut total = BigInt::ZERO;
        for component in &self.components {
            total = modulus.add(&total, &component.val(modulus));
        }
        return total;
    }
}

/// The r x N grid of sealed shares. Row `i`, column `j` holds the `i`-th
/// component of ballot `j`. Rows are handed out to mix servers exactly
/// once, after which the proof server keeps only the commitments.
#[derive(Debug)]
pub struct Matrix {
    rows: Vec<Vec<SealedShare>>,
}

impl Matrix {
    pub fn new(rows: usize) -> Self {
        Self {
            rows: (0..rows).map(|_| Vec::new()).collect(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    pub fn ballots(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    /// Append one ballot as a new column.
    pub fn push_ballot(&mut self, shares: Vec<SealedShare>) -> Result<(), ElectionError> {
        if shares.len() != self.rows.len() {
            return Err(ElectionError::violation(format!(
                "ballot carries {} components, matrix has {} rows",
                shares.len(),
                self.rows.len()
            )));
        }
        for (row, share) in self.rows.iter_mut().zip(shares) {
            row.push(share);
        }
        return Ok(());
    }

    /// The public matrix commitment, row-major.
    pub fn commitments(&self) -> Vec<Vec<ShareCommitment>> {
        self.rows
            .iter()
            .map(|row| row.iter().map(SealedShare::commitment).collect())
            .collect()
    }

    pub fn into_rows(self) -> Vec<Vec<SealedShare>> {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULUS: u64 = 10;
    const ROWS: usize = 3;

    fn modulus() -> Modulus {
        Modulus::new(BigInt::from_u64(MODULUS)).unwrap()
    }

    /// The component values of a record sum to the vote mod M.
    #[test]
    fn test_components_sum_to_vote() {
        let m = modulus();
        for vote in 0..MODULUS {
            let vote = BigInt::from_u64(vote);
            let record = VoteRecord::from_vote(&vote, ROWS, &m);
            assert_eq!(record.rows(), ROWS);
            assert_eq!(record.value(&m), vote);
        }
    }

    #[test]
    fn test_single_row_record() {
        let m = modulus();
        let vote = BigInt::from_u64(7);
        let record = VoteRecord::from_vote(&vote, 1, &m);
        assert_eq!(record.components()[0].val(&m), vote);
    }

    #[test]
    fn test_matrix_rejects_wrong_width_ballot() {
        let m = modulus();
        let mut matrix = Matrix::new(ROWS);
        let record = VoteRecord::from_vote(&BigInt::from_u64(2), ROWS - 1, &m);
        let shares = record
            .into_components()
            .into_iter()
            .map(SealedShare::seal)
            .collect();
        assert!(matrix.push_ballot(shares).is_err());
    }

    #[test]
    fn test_matrix_layout() {
        let m = modulus();
        let mut matrix = Matrix::new(ROWS);
        for vote in [2u64, 5, 2] {
            let record = VoteRecord::from_vote(&BigInt::from_u64(vote), ROWS, &m);
            let shares = record
                .into_components()
                .into_iter()
                .map(SealedShare::seal)
                .collect();
            matrix.push_ballot(shares).unwrap();
        }
        assert_eq!(matrix.ballots(), 3);
        let commitments = matrix.commitments();
        assert_eq!(commitments.len(), ROWS);
        assert!(commitments.iter().all(|row| row.len() == 3));

        // Columns still recombine to the submitted votes.
        let rows = matrix.into_rows();
        for (column, expected) in [2u64, 5, 2].iter().enumerate() {
            let mut total = BigInt::ZERO;
            for row in &rows {
                total = m.add(&total, &row[column].value().val(&m));
            }
            assert_eq!(total, BigInt::from_u64(*expected));
        }
    }
}
