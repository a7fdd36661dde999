//! Search and model configuration.

use crate::error::SindirError;
use std::fmt;
use std::str::FromStr;

/// A topology-search strategy. `None` ends the configured sequence early.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SearchMethod {
    Greedy,
    Mcmc,
    Exhaustive,
    None,
}

impl FromStr for SearchMethod {
    type Err = SindirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greedy" => Ok(SearchMethod::Greedy),
            "mcmc" => Ok(SearchMethod::Mcmc),
            "exhaustive" => Ok(SearchMethod::Exhaustive),
            "none" => Ok(SearchMethod::None),
            other => Err(SindirError::UnknownSearch(other.to_string())),
        }
    }
}

impl fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SearchMethod::Greedy => "greedy",
            SearchMethod::Mcmc => "mcmc",
            SearchMethod::Exhaustive => "exhaustive",
            SearchMethod::None => "none",
        };
        f.write_str(name)
    }
}

/// Knobs for scoring and search.
///
/// `dupprob` and `lossprob` enter the score as `ln(p)` per duplication /
/// loss event. `errorcost` multiplies the least-squares residual and is
/// *added* to the log-likelihood, so a penalizing value is negative.
/// `speedup` is a bonus per consecutive cache re-visit that pushes MCMC
/// chains away from attractors. The MCMC loop stops after `maxiters`
/// round-robin steps or once the visited cache holds `iters` topologies.
#[derive(Clone, Debug)]
pub struct Config {
    pub dupprob: f64,
    pub lossprob: f64,
    pub errorcost: f64,
    /// Probability that an MCMC proposal reroots before the NNI.
    pub rerootprob: f64,
    pub speedup: f64,
    pub nchains: usize,
    pub maxiters: usize,
    pub iters: usize,
    /// Recursion depth of the exhaustive NNI walk.
    pub depth: usize,
    pub search: Vec<SearchMethod>,
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dupprob: 1.0,
            lossprob: 1.0,
            errorcost: 0.0,
            rerootprob: 0.05,
            speedup: 0.0,
            nchains: 4,
            maxiters: 5000,
            iters: 1000,
            depth: 2,
            search: vec![SearchMethod::Mcmc],
            seed: 0,
        }
    }
}
