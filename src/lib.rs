//! Crate root: lightweight module orchestration and public re-exports.
//!
//! Reconstructs the maximum-likelihood gene tree for a set of homologous
//! genes from a pairwise distance matrix, a fixed species tree, a
//! gene→species mapping, and a pre-trained model of per-branch
//! substitution rates.
//!
//! Modules:
//! - `tree`: arena-allocated rooted labeled trees, Newick in/out.
//! - `bitset`: compact bitsets over leaf indices.
//! - `splits`: edge bipartitions and the canonical topology key.
//! - `recon`: gene↔species reconciliation, event labeling, loss counts.
//! - `fit`: neighbor-joining seed and least-squares branch fitting.
//! - `stats`: normal-distribution primitives.
//! - `likelihood`: the branch-rate likelihood engine.
//! - `search`: NNI / MCMC / exhaustive / greedy drivers + orchestrator.
//! - `config`: search and model configuration.
//! - `io`: parameter, label, species-map, matrix, and tree files.
//! - `error`: crate-wide error type.

pub mod bitset;
pub mod config;
pub mod error;
pub mod fit;
pub mod io;
pub mod likelihood;
pub mod recon;
pub mod search;
pub mod splits;
pub mod stats;
pub mod tree;

// Re-export frequently used types & functions
pub use config::{Config, SearchMethod};
pub use error::{Result, SindirError};
pub use likelihood::{Params, tree_log_likelihood};
pub use recon::SpeciesMap;
pub use search::{Visited, sindir};
pub use splits::TopologyKey;
pub use tree::Tree;
