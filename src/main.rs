use clap::Parser;
use sindir::config::{Config, SearchMethod};
use sindir::io::{
    DebugLog, read_dist_matrix, read_labels, read_params, read_species_map, read_tree_file,
    write_tree_file,
};
use sindir::search::sindir;
use sindir::tree::Tree;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Reconstruct a maximum-likelihood gene tree from a pairwise distance
/// matrix, a species tree, a gene→species map, and a trained branch-rate
/// model. Writes `<out>.tree` and a search trace to `<out>.debug`.
#[derive(Parser, Debug)]
#[command(name = "sindir", version, about = "Gene-tree reconstruction with a species-informed rate model")]
struct Args {
    /// Phylip square distance matrix (.gz supported)
    #[arg(short = 'd', long = "distmat")]
    distmat: PathBuf,

    /// Gene labels: plain text or FASTA (.fasta/.fa/.align); defaults to
    /// the distance-matrix row labels
    #[arg(short = 'l', long = "labels")]
    labels: Option<PathBuf>,

    /// Species tree (Newick)
    #[arg(short = 's', long = "stree")]
    stree: PathBuf,

    /// Gene-to-species map (pattern TAB species, `*` suffix wildcard)
    #[arg(short = 'S', long = "smap")]
    smap: PathBuf,

    /// Trained model parameters
    #[arg(short = 'p', long = "params")]
    params: PathBuf,

    /// Output prefix
    #[arg(short = 'o', long = "out", default_value = "sindir")]
    out: String,

    /// Search strategies, run in order: greedy | mcmc | exhaustive | none
    #[arg(long = "search", value_delimiter = ',', default_value = "mcmc")]
    search: Vec<String>,

    /// Additional candidate trees to fit and score
    #[arg(short = 't', long = "tree")]
    trees: Vec<PathBuf>,

    /// Duplication prior probability
    #[arg(long, default_value_t = 1.0)]
    dupprob: f64,

    /// Loss prior probability
    #[arg(long, default_value_t = 1.0)]
    lossprob: f64,

    /// Multiplier on the least-squares error term (negative penalizes)
    #[arg(long, default_value_t = 0.0)]
    errorcost: f64,

    /// Probability an MCMC proposal reroots before the NNI
    #[arg(long, default_value_t = 0.05)]
    rerootprob: f64,

    /// Score bonus per consecutive revisit, to escape attractors
    #[arg(long, default_value_t = 0.0)]
    speedup: f64,

    /// Number of MCMC chains
    #[arg(long, default_value_t = 4)]
    nchains: usize,

    /// Hard cap on MCMC sweeps
    #[arg(long, default_value_t = 5000)]
    maxiters: usize,

    /// Stop once this many topologies have been visited
    #[arg(long, default_value_t = 1000)]
    iters: usize,

    /// Exhaustive NNI recursion depth
    #[arg(long, default_value_t = 2)]
    depth: usize,

    /// RNG seed; a fixed seed reproduces a run exactly
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Quiet mode: suppresses progress messages
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,
}

fn build_config(args: &Args) -> sindir::Result<Config> {
    let search = args
        .search
        .iter()
        .map(|name| name.parse::<SearchMethod>())
        .collect::<sindir::Result<Vec<_>>>()?;
    Ok(Config {
        dupprob: args.dupprob,
        lossprob: args.lossprob,
        errorcost: args.errorcost,
        rerootprob: args.rerootprob,
        speedup: args.speedup,
        nchains: args.nchains,
        maxiters: args.maxiters,
        iters: args.iters,
        depth: args.depth,
        search,
        seed: args.seed,
    })
}

fn main() {
    let args = Args::parse();

    let default_level = if args.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let conf = match build_config(&args) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    // read inputs
    let t0 = Instant::now();
    let inputs = (|| -> sindir::Result<_> {
        let (matrix_labels, distmat) = read_dist_matrix(&args.distmat)?;
        let labels = match &args.labels {
            Some(path) => read_labels(path)?,
            None => matrix_labels,
        };
        let stree = read_tree_file(&args.stree)?;
        let smap = read_species_map(&args.smap)?;
        let params = read_params(&args.params)?;
        let user_trees = args
            .trees
            .iter()
            .map(|path| read_tree_file(path))
            .collect::<sindir::Result<Vec<Tree>>>()?;
        Ok((distmat, labels, stree, smap, params, user_trees))
    })();
    let (distmat, labels, stree, smap, params, user_trees) = match inputs {
        Ok(inputs) => inputs,
        Err(e) => {
            eprintln!("failed to read inputs: {e}");
            std::process::exit(2);
        }
    };
    info!(
        genes = labels.len(),
        species = stree.leaf_names().len(),
        "read inputs in {:.3}s",
        t0.elapsed().as_secs_f64()
    );

    let debug = match DebugLog::create(format!("{}.debug", args.out)) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("failed to open debug log: {e}");
            std::process::exit(4);
        }
    };

    // search
    let t1 = Instant::now();
    let (tree, logl) = match sindir(
        &conf, &distmat, &labels, &stree, &smap, &params, &user_trees, debug,
    ) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("search failed: {e}");
            std::process::exit(3);
        }
    };
    info!(logl, "search finished in {:.3}s", t1.elapsed().as_secs_f64());

    let out_tree = format!("{}.tree", args.out);
    if let Err(e) = write_tree_file(&out_tree, &tree) {
        eprintln!("failed to write {out_tree}: {e}");
        std::process::exit(4);
    }
    info!(path = %out_tree, "wrote best tree");
}
