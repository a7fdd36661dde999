//! Topology search: NNI proposals, multi-chain MCMC, bounded exhaustive
//! walks, greedy stepwise addition, and the orchestrator tying them
//! together.
//!
//! All drivers share a [`Visited`] cache keyed by the canonical topology
//! key: the first time a topology is seen it is fit and scored, afterwards
//! the cached score and tree are reused. The final answer is always the
//! best entry in the cache.

use crate::config::{Config, SearchMethod};
use crate::error::{Result, SindirError};
use crate::fit::{fit_branches, neighbor_join};
use crate::io::DebugLog;
use crate::likelihood::{Params, tree_log_likelihood};
use crate::recon::{SpeciesMap, recon_root};
use crate::splits::TopologyKey;
use crate::tree::{NodeId, Tree};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::info;

/// Number of unrooted binary topologies over `n` leaves, `(2n−3)!!`,
/// counted the way the debug summary reports it (rooted placements of the
/// last leaf included).
pub fn num_possible_trees(nleaves: usize) -> f64 {
    if nleaves < 2 {
        return 1.0;
    }
    let mut count = 1.0;
    let mut i = 3;
    while i + 5 <= 2 * nleaves {
        count *= i as f64;
        i += 2;
    }
    (2 * nleaves - 3) as f64 * count
}

/// A scored topology in the cache.
#[derive(Clone, Debug)]
pub struct VisitedEntry {
    pub logl: f64,
    pub tree: Tree,
    pub count: u64,
}

/// Cache of every topology any driver has evaluated, keyed by the
/// root-invariant [`TopologyKey`].
#[derive(Debug, Default)]
pub struct Visited {
    map: HashMap<TopologyKey, VisitedEntry>,
}

impl Visited {
    pub fn new() -> Self {
        Visited::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &TopologyKey) -> Option<&VisitedEntry> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &TopologyKey) -> Option<&mut VisitedEntry> {
        self.map.get_mut(key)
    }

    /// First sighting of a fresh topology.
    pub fn insert(&mut self, key: TopologyKey, logl: f64, tree: Tree) {
        self.map.insert(
            key,
            VisitedEntry {
                logl,
                tree,
                count: 1,
            },
        );
    }

    /// Records a (re-)evaluation: replaces the stored score and tree and
    /// bumps the visit count.
    pub fn record(&mut self, key: TopologyKey, logl: f64, tree: &Tree) {
        let count = self.map.get(&key).map_or(0, |entry| entry.count);
        self.map.insert(
            key,
            VisitedEntry {
                logl,
                tree: tree.copy(),
                count: count + 1,
            },
        );
    }

    pub fn best(&self) -> Option<&VisitedEntry> {
        self.map.values().max_by(|a, b| {
            a.logl
                .partial_cmp(&b.logl)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = &VisitedEntry> {
        self.map.values()
    }
}

/// Everything a search driver needs: the problem instance, the scoring
/// model, the seeded RNG, and the debug sink.
pub struct SearchEnv<'a> {
    pub conf: &'a Config,
    pub distmat: &'a [Vec<f64>],
    pub labels: &'a [String],
    pub stree: &'a Tree,
    pub smap: &'a SpeciesMap,
    pub params: &'a Params,
    pub rng: SmallRng,
    pub debug: DebugLog,
}

impl<'a> SearchEnv<'a> {
    pub fn new(
        conf: &'a Config,
        distmat: &'a [Vec<f64>],
        labels: &'a [String],
        stree: &'a Tree,
        smap: &'a SpeciesMap,
        params: &'a Params,
        debug: DebugLog,
    ) -> Self {
        SearchEnv {
            conf,
            distmat,
            labels,
            stree,
            smap,
            params,
            rng: SmallRng::seed_from_u64(conf.seed),
            debug,
        }
    }

    /// Fits branch lengths and scores against the full instance.
    fn score(&self, tree: &mut Tree) -> Result<f64> {
        self.score_with(tree, self.distmat, self.labels)
    }

    /// Fits and scores against a caller-chosen (sub-)instance.
    fn score_with(&self, tree: &mut Tree, distmat: &[Vec<f64>], labels: &[String]) -> Result<f64> {
        fit_branches(tree, distmat, labels)?;
        tree_log_likelihood(self.conf, tree, self.stree, self.smap, self.params, None)
    }
}

/// Edges eligible for NNI: `(child, parent)` for every internal non-root
/// child. The parent side may be the root.
pub fn nni_edges(tree: &Tree) -> Vec<(NodeId, NodeId)> {
    tree.preorder()
        .into_iter()
        .filter(|&id| id != tree.root() && !tree.is_leaf(id))
        .map(|id| (id, tree.node(id).parent.expect("non-root node")))
        .collect()
}

/// Nearest-neighbor interchange across the edge `(node1, node2)`.
///
/// With `node2` the parent, `node1.children[change]` trades places with
/// the other child of `node2` (the uncle):
///
/// ```text
///     node2                    node2
///    /     \                  /     \
///  uncle    node1    ==>   child0    node1
///           /   \                    /   \
///      child0   child1          uncle    child1
/// ```
///
/// Branch lengths are untouched and therefore stale; refit before
/// scoring. Applying the same interchange twice restores the topology.
pub fn propose_nni(tree: &mut Tree, node1: NodeId, node2: NodeId, change: usize) {
    let (child_end, parent_end) = if tree.node(node1).parent == Some(node2) {
        (node1, node2)
    } else {
        (node2, node1)
    };
    debug_assert_eq!(tree.node(child_end).parent, Some(parent_end));
    debug_assert!(!tree.is_leaf(child_end));

    let uncle_pos = tree
        .node(parent_end)
        .children
        .iter()
        .position(|&c| c != child_end)
        .expect("parent has another child");
    let uncle = tree.node(parent_end).children[uncle_pos];
    let moved = tree.node(child_end).children[change];

    tree.node_mut(child_end).children[change] = uncle;
    tree.node_mut(parent_end).children[uncle_pos] = moved;
    tree.node_mut(uncle).parent = Some(child_end);
    tree.node_mut(moved).parent = Some(parent_end);
}

/// Random proposal: maybe reroot at a uniformly chosen node, then apply a
/// uniformly chosen NNI. Trees too small for NNI come back as plain
/// copies.
pub fn propose_tree(conf: &Config, tree: &Tree, rng: &mut SmallRng) -> Tree {
    let mut proposal = tree.copy();

    if rng.random::<f64>() < conf.rerootprob {
        let ids = proposal.node_ids();
        let target = ids[rng.random_range(0..ids.len())];
        if target != proposal.root() {
            proposal.reroot(target);
        }
    }

    let edges = nni_edges(&proposal);
    if edges.is_empty() {
        return proposal;
    }
    let (node, parent) = edges[rng.random_range(0..edges.len())];
    let change = rng.random_range(0..2usize);
    propose_nni(&mut proposal, node, parent, change);
    proposal
}

fn nj_seed(env: &SearchEnv) -> Result<Tree> {
    let seed = neighbor_join(env.distmat, env.labels);
    recon_root(&seed, env.stree, env.smap)
}

/// Multi-chain Metropolis search.
///
/// Each chain proposes, looks the proposal up in the shared cache (a hit
/// reuses the cached score and bumps the consecutive-revisit counter), and
/// accepts if the proposal scores higher or by the Metropolis coin.
/// `speedup · nold` is added to the proposed score first, rewarding chains
/// that leave well-trodden ground. Stops after `maxiters` round-robin
/// sweeps or once the cache holds `iters` topologies.
pub fn search_mcmc(
    env: &mut SearchEnv,
    init: Option<Tree>,
    visited: &mut Visited,
) -> Result<(Tree, f64)> {
    let mut tree = match init {
        Some(tree) => tree,
        None => {
            let mut seed = nj_seed(env)?;
            fit_branches(&mut seed, env.distmat, env.labels)?;
            seed
        }
    };
    let init_logl =
        tree_log_likelihood(env.conf, &mut tree, env.stree, env.smap, env.params, None)?;
    visited.record(TopologyKey::of(&tree), init_logl, &tree);

    let mut toplogl = init_logl;
    let mut toptree = tree.copy();
    let mut nold: u64 = 0;

    let mut chains: Vec<(Tree, f64)> = (0..env.conf.nchains)
        .map(|_| (tree.copy(), init_logl))
        .collect();

    for step in 1..env.conf.maxiters {
        if visited.len() >= env.conf.iters {
            break;
        }
        for chain in 0..chains.len() {
            let mut proposal = propose_tree(env.conf, &chains[chain].0, &mut env.rng);
            let key = TopologyKey::of(&proposal);

            let logl = if visited.get(&key).is_some() {
                let entry = visited.get_mut(&key).expect("present");
                entry.count += 1;
                nold += 1;
                proposal = entry.tree.copy();
                entry.logl
            } else {
                let logl = env.score(&mut proposal)?;
                nold = 0;
                visited.insert(key, logl, proposal.copy());
                logl
            };

            if logl > toplogl {
                toplogl = logl;
                toptree = proposal.copy();
                env.debug.line(&format!(
                    "chain {chain} step {step}: best logl {logl:.6}  {}",
                    toptree.to_newick()
                ));
                env.debug.tree_report(&toptree);
                info!(chain, step, logl, visited = visited.len(), "new best tree");
            }

            let adjusted = logl + env.conf.speedup * nold as f64;
            let coin: f64 = env.rng.random();
            let state = &mut chains[chain];
            if adjusted > state.1 || adjusted - state.1 > coin.ln() {
                state.0 = proposal;
                state.1 = adjusted;
            }
        }
    }

    Ok((toptree, toplogl))
}

fn exhaustive_walk(
    env: &SearchEnv,
    tree: &mut Tree,
    distmat: &[Vec<f64>],
    labels: &[String],
    depth: usize,
    visited: &mut Visited,
) -> Result<()> {
    let key = TopologyKey::of(tree);
    if visited.get(&key).is_none() {
        let logl = env.score_with(tree, distmat, labels)?;
        visited.insert(key, logl, tree.copy());
    }

    for (node, parent) in nni_edges(tree) {
        for change in 0..2 {
            propose_nni(tree, node, parent, change);
            let key = TopologyKey::of(tree);
            if visited.get(&key).is_none() {
                let logl = env.score_with(tree, distmat, labels)?;
                visited.insert(key, logl, tree.copy());
                if depth > 1 {
                    exhaustive_walk(env, tree, distmat, labels, depth - 1, visited)?;
                }
            }
            // switch the branch back
            propose_nni(tree, node, parent, change);
        }
    }
    Ok(())
}

/// Bounded-depth exhaustive NNI walk from `tree`, returning the cache-wide
/// best topology.
pub fn search_exhaustive(
    env: &SearchEnv,
    tree: &mut Tree,
    depth: usize,
    visited: &mut Visited,
) -> Result<(Tree, f64)> {
    exhaustive_walk(env, tree, env.distmat, env.labels, depth, visited)?;
    let best = visited.best().ok_or(SindirError::NoTopologies)?;
    Ok((best.tree.copy(), best.logl))
}

/// Depth of the NNI polish pass after each greedy placement.
const GREEDY_POLISH_DEPTH: usize = 2;

/// Greedy stepwise addition: grow the tree one gene at a time, trying
/// every attachment point (including above the root), then polish with a
/// shallow exhaustive pass. Only the final, full-leaf-set polish shares
/// the caller's cache; partial trees stay in throwaway caches.
pub fn search_greedy(env: &mut SearchEnv, visited: &mut Visited) -> Result<(Tree, f64)> {
    let labels = env.labels;
    let total = labels.len();

    let mut tree = Tree::new();
    let root = tree.add_node(None, 0.0);
    tree.set_root(root);
    for label in &labels[..2.min(total)] {
        let leaf = tree.add_node(Some(label.clone()), 0.0);
        tree.add_child(root, leaf);
    }

    if total < 3 {
        let logl = env.score(&mut tree)?;
        visited.record(TopologyKey::of(&tree), logl, &tree);
        return Ok((tree, logl));
    }

    let mut result_logl = f64::NEG_INFINITY;
    for ngenes in 2..total {
        let label = &labels[ngenes];
        env.debug.line(&format!("adding {label}"));

        let sub_labels: Vec<String> = labels[..ngenes + 1].to_vec();
        let sub_distmat: Vec<Vec<f64>> = env.distmat[..ngenes + 1]
            .iter()
            .map(|row| row[..ngenes + 1].to_vec())
            .collect();

        // place the new gene on every branch and above the root; scores
        // are only comparable within one round, so the running best resets
        let mut toplogl = f64::NEG_INFINITY;
        let mut toptree: Option<Tree> = None;
        let names: Vec<String> = tree
            .preorder()
            .into_iter()
            .map(|id| tree.node(id).name.clone())
            .collect();
        for name in names {
            let mut candidate = tree.copy();
            let node = candidate.node_by_name(&name).expect("names survive copies");
            let leaf = candidate.add_node(Some(label.clone()), 0.0);
            if node == candidate.root() {
                let new_root = candidate.add_node(None, 0.0);
                candidate.add_child(new_root, node);
                candidate.set_root(new_root);
                candidate.add_child(new_root, leaf);
            } else {
                let parent = candidate.node(node).parent.expect("non-root node");
                candidate.detach(node);
                let mid = candidate.add_node(None, 0.0);
                candidate.add_child(parent, mid);
                candidate.add_child(mid, node);
                candidate.add_child(mid, leaf);
            }

            let logl = env.score_with(&mut candidate, &sub_distmat, &sub_labels)?;
            if logl >= toplogl {
                toplogl = logl;
                toptree = Some(candidate);
            }
        }
        tree = toptree.expect("at least one placement");

        let is_last = ngenes == total - 1;
        let (polished, polished_logl) = if is_last {
            exhaustive_walk(
                env,
                &mut tree,
                &sub_distmat,
                &sub_labels,
                GREEDY_POLISH_DEPTH,
                visited,
            )?;
            let best = visited.best().ok_or(SindirError::NoTopologies)?;
            (best.tree.copy(), best.logl)
        } else {
            let mut scratch = Visited::new();
            exhaustive_walk(
                env,
                &mut tree,
                &sub_distmat,
                &sub_labels,
                GREEDY_POLISH_DEPTH,
                &mut scratch,
            )?;
            let best = scratch.best().ok_or(SindirError::NoTopologies)?;
            (best.tree.copy(), best.logl)
        };
        if polished_logl >= toplogl {
            toplogl = polished_logl;
            tree = polished;
        }
        result_logl = toplogl;
    }

    Ok((tree, result_logl))
}

/// Runs the configured search sequence, scores any user-supplied candidate
/// trees, and returns the best topology across everything evaluated.
///
/// The surviving best tree of each phase seeds the next; all phases share
/// one visited cache. Fails with [`SindirError::NoTopologies`] when no
/// search ran and no candidates were given.
pub fn sindir(
    conf: &Config,
    distmat: &[Vec<f64>],
    labels: &[String],
    stree: &Tree,
    smap: &SpeciesMap,
    params: &Params,
    user_trees: &[Tree],
    debug: DebugLog,
) -> Result<(Tree, f64)> {
    let mut env = SearchEnv::new(conf, distmat, labels, stree, smap, params, debug);
    let mut visited = Visited::new();
    let mut tree: Option<Tree> = None;

    for &method in &conf.search {
        info!(%method, "search phase");
        match method {
            SearchMethod::Greedy => {
                let (best, _) = search_greedy(&mut env, &mut visited)?;
                tree = Some(best);
            }
            SearchMethod::Mcmc => {
                let (best, _) = search_mcmc(&mut env, tree.take(), &mut visited)?;
                tree = Some(best);
            }
            SearchMethod::Exhaustive => {
                let mut seed = match tree.take() {
                    Some(tree) => tree,
                    None => nj_seed(&env)?,
                };
                let (best, _) = search_exhaustive(&env, &mut seed, conf.depth, &mut visited)?;
                tree = Some(best);
            }
            SearchMethod::None => break,
        }
        env.debug.visited_summary(&visited);
    }

    for user in user_trees {
        let mut candidate = user.copy();
        let logl = env.score(&mut candidate)?;
        env.debug
            .line(&format!("user tree: logl {logl:.6}  {}", candidate.to_newick()));
        env.debug.tree_report(&candidate);
        visited.record(TopologyKey::of(&candidate), logl, &candidate);
    }

    let best = visited.best().ok_or(SindirError::NoTopologies)?;
    Ok((best.tree.copy(), best.logl))
}
