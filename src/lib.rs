#![doc = include_str!("../readme.md")]

pub mod ast;

pub mod config;

pub mod corpus;

pub mod execute;

pub mod grammar_tree;

pub mod select;

pub mod transform;

use std::error::Error;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::execute::Exec;
use crate::grammar_tree::GrammarRules;

pub fn begin() -> Result<(), Box<dyn Error>> {
    // configure paths and initial state
    let mut cfg: Config = Config::parse_args()?;
    cfg.load_env();

    // one explicitly seeded engine for the whole run, so a fixed seed
    // reproduces the search
    let seed = cfg.seed.unwrap_or_else(|| rand::thread_rng().gen());
    println!("random seed: {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let grammar = cfg.grammar.clone();
    let executor = Exec::new(cfg)?;

    match grammar {
        Some(path) => {
            let rules = GrammarRules::from_file(&path)?;
            println!("loaded {} grammar rules from {}", rules.len(), path.display());
            executor.run_grammar_loop(&rules, &mut rng)?;
        }
        None => executor.run_valid_loop(&mut rng)?,
    }

    Ok(())
}
