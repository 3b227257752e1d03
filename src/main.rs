//! Command-line driver for simulated electronic elections.
use std::fs::File;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use crypto_bigint::Encoding;
use rand::rngs::OsRng;
use rand::Rng;
use tracing_subscriber::EnvFilter;

use splitvote::config::ElectionConfig;
use splitvote::election::Election;
use splitvote::BigInt;

/// Run simulated electronic elections
#[derive(Debug, Parser)]
#[command(name = "splitvote")]
struct Args {
    /// Number of voters casting random ballots
    #[arg(short, long, default_value_t = 5)]
    voters: usize,

    /// Split-value rows per ballot (one mix server per row)
    #[arg(long, default_value_t = 3)]
    rows: usize,

    /// Proof/tally round pairs; 2 * ROUNDS mix rounds are generated
    #[arg(long, default_value_t = 2)]
    rounds: usize,

    /// Number of distinct vote choices on the ballot
    #[arg(long, default_value_t = 8)]
    choices: u64,

    /// Modulus M; defaults to the number of choices
    #[arg(long)]
    modulus: Option<u64>,

    /// Number of vote-submission tablets
    #[arg(long, default_value_t = 3)]
    tablets: usize,

    /// Write the bulletin-board transcript to this file as JSON lines
    #[arg(long)]
    sbb_out: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let modulus = BigInt::from_u64(args.modulus.unwrap_or(args.choices));
    let config = ElectionConfig::new(modulus, args.rows, args.rounds, args.voters, args.choices);
    let election = Election::new(config, args.tablets).context("invalid election setup")?;
    let sbb = election.sbb();

    let votes: Vec<u64> = (0..args.voters)
        .map(|_| OsRng.gen_range(0..args.choices))
        .collect();
    let outcome = election.run(&votes).context("election failed")?;

    println!(
        "election finished; distribution over {} ballot(s):",
        args.voters
    );
    for (value, count) in &outcome {
        println!("  choice {:>4}: {} vote(s)", choice_label(value), count);
    }

    if let Some(path) = args.sbb_out {
        let mut file =
            File::create(&path).with_context(|| format!("cannot create {}", path.display()))?;
        sbb.read().dump(&mut file)?;
        println!("bulletin board transcript written to {}", path.display());
    }
    return Ok(());
}

/// Small values print as integers, anything wider falls back to hex.
fn choice_label(value: &BigInt) -> String {
    let words = value.as_words();
    if words[1..].iter().all(|word| *word == 0) {
        return words[0].to_string();
    }
    return format!("0x{}", hex::encode(value.to_be_bytes()));
}
