//! Crate-wide error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SindirError>;

/// Everything that can go wrong while reconstructing a gene tree.
///
/// Configuration and input-file problems fail fast; numerical problems
/// during scoring are generally *not* routed through here — a topology that
/// cannot be scored gets a `-inf` log-likelihood and loses the search
/// instead (see `search`).
#[derive(Debug, Error)]
pub enum SindirError {
    #[error("unknown search '{0}'")]
    UnknownSearch(String),

    #[error("no search or tree topologies given")]
    NoTopologies,

    #[error("gene '{0}' matches no species mapping")]
    UnmappedGene(String),

    #[error("missing parameters for species branch '{0}'")]
    MissingParams(String),

    #[error("failed to parse tree: {0}")]
    TreeParse(String),

    #[error("tree has no node named '{0}'")]
    UnknownNode(String),

    #[error("invalid distance matrix: {0}")]
    DistMatrix(String),

    #[error("invalid parameter file: {0}")]
    ParamFile(String),

    #[error("invalid species map: {0}")]
    SpeciesMapFile(String),

    #[error("least-squares fit failed: {0}")]
    LeastSquares(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
