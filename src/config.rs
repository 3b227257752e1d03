//! Election parameters, validated once at setup.
//!
//! The core exposes no defaults: `M`, `r`, `m` and `N` are required inputs
//! to the proof server, and anything optional belongs to the driver layer.
use crate::errors::ElectionError;
use crate::splitvalue::Modulus;
use crate::BigInt;

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// The public modulus `M`; every vote value and share lives in `[0, M)`.
    pub modulus: BigInt,
    /// Row count `r`: how many split-value components each ballot carries,
    /// and therefore how many mix servers run.
    pub rows: usize,
    /// Half the number of mix rounds: `m` proof rounds and `m` tally rounds.
    pub half_rounds: usize,
    /// Expected number of ballots.
    pub ballots: usize,
    /// Number of distinct vote choices; valid votes are `0..choices`.
    pub choices: u64,
}

impl ElectionConfig {
    pub fn new(
        modulus: BigInt,
        rows: usize,
        half_rounds: usize,
        ballots: usize,
        choices: u64,
    ) -> Self {
        Self {
            modulus,
            rows,
            half_rounds,
            ballots,
            choices,
        }
    }

    /// Reject unusable parameters before any ballot is collected.
    pub fn validate(&self) -> Result<(), ElectionError> {
        self.modulus()?;
        if self.choices == 0 {
            return Err(ElectionError::config("a ballot needs at least one choice"));
        }
        if BigInt::from_u64(self.choices) > self.modulus {
            return Err(ElectionError::config(
                "modulus cannot encode every vote choice",
            ));
        }
        if self.rows == 0 {
            return Err(ElectionError::config(
                "at least one split-value row is required",
            ));
        }
        if self.half_rounds == 0 {
            // m = 0 would degrade the protocol to unverifiable plaintext
            // tallying.
            return Err(ElectionError::config(
                "at least one proof/tally round pair is required",
            ));
        }
        return Ok(());
    }

    pub fn modulus(&self) -> Result<Modulus, ElectionError> {
        Modulus::new(self.modulus)
    }

    /// Total number of mix rounds generated before the draw.
    pub fn rounds(&self) -> usize {
        2 * self.half_rounds
    }
}
