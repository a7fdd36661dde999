//! Log-likelihood of a gene tree under the branch-rate model.
//!
//! Every species branch carries the mean and standard deviation of the
//! length a unit-rate gene edge accrues while crossing it; independent
//! branches sum. A gene tree is scored subtree by subtree: duplications
//! keep paths inside one species branch, so the paths from a duplication
//! down to its speciation (or leaf) descendants share a common prefix, and
//! the shared prefix is corrected for with a conditional Gaussian
//! truncation term. A per-tree base rate rescales all branch lengths to
//! unit-rate units before the densities are evaluated.
//!
//! The total score adds log-priors for duplication and loss events and the
//! (signed) least-squares error term from the branch fit.

use crate::config::Config;
use crate::error::{Result, SindirError};
use crate::recon::{Event, SpeciesMap, count_losses, label_events, reconcile};
use crate::stats::{normal_cdf, normal_pdf, safe_ln};
use crate::tree::{NodeId, Tree};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Trained model parameters: per-species-branch `(μ, σ)` of a unit-rate
/// crossing, plus the gamma `(α, β)` hyperparameters of the base-rate
/// prior.
#[derive(Clone, Debug)]
pub struct Params {
    branches: HashMap<String, (f64, f64)>,
    pub baserate: (f64, f64),
}

impl Params {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Params {
            branches: HashMap::new(),
            baserate: (alpha, beta),
        }
    }

    pub fn set_branch(&mut self, name: impl Into<String>, mu: f64, sigma: f64) {
        self.branches.insert(name.into(), (mu, sigma));
    }

    pub fn branch(&self, name: &str) -> Result<(f64, f64)> {
        self.branches
            .get(name)
            .copied()
            .ok_or_else(|| SindirError::MissingParams(name.to_string()))
    }

    pub fn branches(&self) -> impl Iterator<Item = (&str, (f64, f64))> {
        self.branches.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

/// Marks branches hanging below a species-root duplication: they carry no
/// species-branch information and are allowed to shrink during scoring.
fn mark_extra(
    tree: &mut Tree,
    stree: &Tree,
    recon: &HashMap<NodeId, NodeId>,
    events: &HashMap<NodeId, Event>,
) {
    for id in tree.preorder() {
        if recon[&id] == stree.root() && events[&id] == Event::Dup {
            for child in tree.node(id).children.clone() {
                if recon[&child] != stree.root() {
                    tree.node_mut(child).diag.extra = true;
                }
            }
        }
    }
}

/// Sums `(Σμ, Σσ²)` over the species branches from `snode` up to, but not
/// including, `sroot` (stopping at the species root either way).
fn species_path(
    stree: &Tree,
    params: &Params,
    mut snode: NodeId,
    sroot: NodeId,
) -> Result<(f64, f64)> {
    let mut mu = 0.0;
    let mut sigma2 = 0.0;
    while snode != sroot && snode != stree.root() {
        let (m, s) = params.branch(&stree.node(snode).name)?;
        mu += m;
        sigma2 += s * s;
        snode = stree.node(snode).parent.expect("species root terminates the walk");
    }
    Ok((mu, sigma2))
}

/// Closed-form MLE of the per-tree base rate from the reconciled branch
/// segments: `r̂ = Σ(ℓᵢ²/σᵢ²) / Σ(μᵢℓᵢ/σᵢ²)`.
///
/// Branches below a species-root duplication and branches crossing no
/// species branch are uninformative and skipped. A tree with no
/// informative segments falls back to rate 1.
pub fn estimate_baserate(
    tree: &mut Tree,
    stree: &Tree,
    smap: &SpeciesMap,
    params: &Params,
) -> Result<f64> {
    let recon = reconcile(tree, stree, smap)?;
    let events = label_events(tree, &recon);
    mark_extra(tree, stree, &recon, &events);
    baserate_from(tree, stree, &recon, &events, params)
}

fn baserate_from(
    tree: &Tree,
    stree: &Tree,
    recon: &HashMap<NodeId, NodeId>,
    events: &HashMap<NodeId, Event>,
    params: &Params,
) -> Result<f64> {
    let groot = recon[&tree.root()];
    let mut num = 0.0;
    let mut den = 0.0;
    let mut samples = 0usize;

    // (node, path length above it, species top of its subtree, tainted)
    let mut stack: Vec<(NodeId, f64, NodeId, bool)> = tree
        .node(tree.root())
        .children
        .iter()
        .rev()
        .map(|&c| (c, 0.0, groot, false))
        .collect();

    while let Some((id, above, sroot, extra)) = stack.pop() {
        let node = tree.node(id);
        // free branches at the gene-tree root add no length
        let depth = if recon[&id] != groot {
            node.dist + above
        } else {
            above
        };
        let extra = extra || node.diag.extra;

        if events[&id] == Event::Dup {
            for &child in node.children.iter().rev() {
                stack.push((child, depth, sroot, extra));
            }
            continue;
        }

        let snode = recon[&id];
        if snode != sroot && !extra {
            let (mu, sigma2) = species_path(stree, params, snode, sroot)?;
            assert!(sigma2.abs() > 1e-8, "sigma too small");
            num += depth * depth / sigma2;
            den += mu * depth / sigma2;
            samples += 1;
        }
        for &child in node.children.iter().rev() {
            stack.push((child, 0.0, snode, false));
        }
    }

    if samples == 0 || den <= 0.0 {
        warn!(samples, den, "no informative branches; using base rate 1");
        return Ok(1.0);
    }
    Ok(num / den)
}

/// Log-likelihood of all paths from `subroot`'s parent down through the
/// duplication-only subtree at `subroot`.
///
/// Each path ends at the first non-duplication descendant and is scored as
/// `ln N(dist/r; μ, σ) − ln(1 − Φ(cond/r; μ, σ))`, where `cond` is the
/// prefix shared with a previously scored path: the paths of a duplication
/// subtree are not independent, and without the truncation term the shared
/// prefix would be counted once per path.
fn subtree_logl(
    tree: &mut Tree,
    stree: &Tree,
    recon: &HashMap<NodeId, NodeId>,
    events: &HashMap<NodeId, Event>,
    params: &Params,
    baserate: f64,
    subroot: NodeId,
) -> Result<f64> {
    let top = tree.node(subroot).parent.expect("subtree hangs off a parent");
    let sroot = recon[&top];
    let groot = recon[&tree.root()];

    let mut depths: HashMap<NodeId, f64> = HashMap::from([(top, 0.0)]);
    let mut marks: HashSet<NodeId> = HashSet::from([top]);
    let mut total = 0.0f64;

    let mut stack: Vec<(NodeId, Option<NodeId>)> = vec![(subroot, None)];
    while let Some((id, mut extra)) = stack.pop() {
        let parent = tree.node(id).parent.expect("walk stays below the top");
        let depth = if recon[&id] != groot {
            tree.node(id).dist + depths[&parent]
        } else {
            depths[&parent]
        };
        depths.insert(id, depth);
        if tree.node(id).diag.extra {
            extra = Some(id);
        }

        if events[&id] == Event::Dup {
            for &child in tree.node(id).children.iter().rev() {
                stack.push((child, extra));
            }
            continue;
        }

        // a subtree leaf: score the path from here up to the top
        let snode = recon[&id];
        if snode == sroot {
            continue; // no species branch crossed, nothing to score
        }
        let (mu, sigma2) = species_path(stree, params, snode, sroot)?;
        assert!(sigma2.abs() > 1e-8, "sigma too small");
        let sigma = sigma2.sqrt();

        // how much of the path was already accounted for by an earlier
        // path through a shared ancestor
        let mut ptr = id;
        while !marks.contains(&ptr) {
            marks.insert(ptr);
            ptr = tree.node(ptr).parent.expect("the top is always marked");
        }
        debug_assert_ne!(ptr, id);
        let mut cond_dist = depths[&ptr];
        let mut dist = depth.max(cond_dist);

        // paths through an extra branch may shed its length
        if let Some(extra_id) = extra {
            let target = mu.min((dist / baserate).max(0.0)) * baserate;
            let shrink = (dist - target).min(tree.node(extra_id).dist.max(0.0));
            if cond_dist == 0.0 {
                dist -= shrink;
            } else {
                cond_dist -= shrink;
            }
        }

        let lognom = safe_ln(normal_pdf(dist / baserate, mu, sigma));
        let logdenom = if cond_dist == 0.0 {
            0.0
        } else {
            safe_ln(1.0 - normal_cdf(cond_dist / baserate, mu, sigma))
        };

        let contrib = if !lognom.is_finite() || !logdenom.is_finite() {
            total = f64::NEG_INFINITY;
            f64::NEG_INFINITY
        } else {
            let c = lognom - logdenom;
            if total.is_finite() {
                total += c;
            }
            c
        };

        let diag = &mut tree.node_mut(id).diag;
        diag.logl = Some(contrib);
        diag.params = Some((mu, sigma));
        diag.fracs = vec![1.0];
    }

    Ok(total)
}

/// Total log-likelihood of a gene tree: subtree path densities, event
/// log-priors for duplications and losses, and the least-squares error
/// term. Writes the per-tree and per-node diagnostics as a side effect.
///
/// `baserate` overrides the estimated per-tree rate; pass `None` outside
/// of tests.
pub fn tree_log_likelihood(
    conf: &Config,
    tree: &mut Tree,
    stree: &Tree,
    smap: &SpeciesMap,
    params: &Params,
    baserate: Option<f64>,
) -> Result<f64> {
    tree.clear_diagnostics();
    let recon = reconcile(tree, stree, smap)?;
    let events = label_events(tree, &recon);
    mark_extra(tree, stree, &recon, &events);

    let baserate = match baserate {
        Some(rate) => rate,
        None => baserate_from(tree, stree, &recon, &events, params)?,
    };

    // flag a top branch that unfolds over the species root
    let root = tree.root();
    if recon[&root] == stree.root() && events[&root] == Event::Dup {
        for child in tree.node(root).children.clone() {
            if recon[&child] != stree.root() {
                tree.node_mut(child).diag.unfold = true;
            }
        }
    }

    let mut logl = 0.0;
    for id in tree.preorder() {
        if events[&id] == Event::Spec || id == root {
            for child in tree.node(id).children.clone() {
                logl += subtree_logl(tree, stree, &recon, &events, params, baserate, child)?;
            }
        }
    }

    let ndup = events.values().filter(|&&e| e == Event::Dup).count();
    let nloss = count_losses(tree, stree, &recon);
    let eventlogl =
        ndup as f64 * safe_ln(conf.dupprob) + nloss as f64 * safe_ln(conf.lossprob);
    logl += eventlogl;

    let errorlogl = tree.data.error * conf.errorcost;
    logl += errorlogl;

    tree.data.eventlogl = eventlogl;
    tree.data.errorlogl = errorlogl;
    tree.data.baserate = baserate;
    tree.data.logl = Some(logl);
    tracing::debug!(logl, baserate, ndup, nloss, "scored topology");
    Ok(logl)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-4;

    fn setup() -> (Tree, SpeciesMap, Params, Config) {
        let stree = Tree::from_newick("(A,B);").unwrap();
        let smap = SpeciesMap::from_pairs([("a*", "A"), ("b*", "B")]);
        let mut params = Params::new(1.0, 1.0);
        params.set_branch("A", 4.0, 2.0);
        params.set_branch("B", 3.0, 1.0);
        let conf = Config {
            dupprob: 0.5,
            lossprob: 1.0,
            errorcost: 0.0,
            ..Config::default()
        };
        (stree, smap, params, conf)
    }

    fn ln_pdf(x: f64, mu: f64, sigma: f64) -> f64 {
        normal_pdf(x, mu, sigma).ln()
    }

    fn ln_tail(x: f64, mu: f64, sigma: f64) -> f64 {
        (1.0 - normal_cdf(x, mu, sigma)).ln()
    }

    #[test]
    fn two_leaf_tree_is_a_product_of_densities() {
        let (stree, smap, params, conf) = setup();
        let mut tree = Tree::from_newick("(a:3, b:2);").unwrap();

        let logl =
            tree_log_likelihood(&conf, &mut tree, &stree, &smap, &params, Some(1.0)).unwrap();
        let expect = ln_pdf(3.0, 4.0, 2.0) + ln_pdf(2.0, 3.0, 1.0);
        assert!((logl - expect).abs() < TOL, "{logl} vs {expect}");
    }

    #[test]
    fn duplication_paths_share_a_truncated_prefix() {
        let (stree, smap, params, conf) = setup();
        let mut tree = Tree::from_newick("((a1:2.5, a2:2):1, b:2);").unwrap();

        let logl =
            tree_log_likelihood(&conf, &mut tree, &stree, &smap, &params, Some(1.0)).unwrap();
        let expect = ln_pdf(3.5, 4.0, 2.0)
            + ln_pdf(3.0, 4.0, 2.0)
            - ln_tail(1.0, 4.0, 2.0)
            + ln_pdf(2.0, 3.0, 1.0)
            + 0.5f64.ln(); // one duplication
        assert!((logl - expect).abs() < TOL, "{logl} vs {expect}");
    }

    #[test]
    fn nested_duplications_condition_on_each_shared_ancestor() {
        let (stree, smap, params, conf) = setup();
        let mut tree = Tree::from_newick("(((a1:2.5, a2:2):1, a3:1.5):1.2, b:2);").unwrap();

        let logl =
            tree_log_likelihood(&conf, &mut tree, &stree, &smap, &params, Some(1.0)).unwrap();
        let expect = ln_pdf(4.7, 4.0, 2.0)
            + ln_pdf(4.2, 4.0, 2.0)
            - ln_tail(2.2, 4.0, 2.0)
            + ln_pdf(2.7, 4.0, 2.0)
            - ln_tail(1.2, 4.0, 2.0)
            + ln_pdf(2.0, 3.0, 1.0)
            + 2.0 * 0.5f64.ln(); // two nested duplications
        assert!((logl - expect).abs() < TOL, "{logl} vs {expect}");
    }

    #[test]
    fn deterministic_at_fixed_baserate() {
        let (stree, smap, params, conf) = setup();
        let mut tree = Tree::from_newick("((a1:2.5, a2:2):1, b:2);").unwrap();

        let l1 =
            tree_log_likelihood(&conf, &mut tree, &stree, &smap, &params, Some(1.0)).unwrap();
        let l2 =
            tree_log_likelihood(&conf, &mut tree, &stree, &smap, &params, Some(1.0)).unwrap();
        assert_eq!(l1, l2);
    }

    #[test]
    fn closed_form_baserate_matches_hand_computation() {
        let (stree, smap, params, _) = setup();
        let mut tree = Tree::from_newick("(a:3, b:2);").unwrap();

        // segments: (l=3, mu=4, s=2) and (l=2, mu=3, s=1)
        // r = (9/4 + 4) / (12/4 + 6) = 6.25 / 9
        let rate = estimate_baserate(&mut tree, &stree, &smap, &params).unwrap();
        assert!((rate - 6.25 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn species_root_duplication_marks_extra_and_unfold() {
        let (stree, smap, params, conf) = setup();
        // the root duplicates above the speciation: one copy speciates
        // into a1/b1, the other survives only in A
        let mut tree = Tree::from_newick("((a1:1, b1:1):2, a2:1);").unwrap();

        let logl =
            tree_log_likelihood(&conf, &mut tree, &stree, &smap, &params, Some(1.0)).unwrap();

        let a2 = tree.node_by_name("a2").unwrap();
        assert!(tree.node(a2).diag.extra);
        assert!(tree.node(a2).diag.unfold);
        let inner = tree.node_by_name("a1").map(|id| tree.node(id).parent.unwrap()).unwrap();
        assert!(!tree.node(inner).diag.extra);

        // free top branch, two unit paths in A, one in B, one duplication
        // and one loss (lossprob 1 contributes nothing)
        let expect = 2.0 * ln_pdf(1.0, 4.0, 2.0) + ln_pdf(1.0, 3.0, 1.0) + 0.5f64.ln();
        assert!((logl - expect).abs() < TOL, "{logl} vs {expect}");
    }

    #[test]
    fn per_node_diagnostics_are_written() {
        let (stree, smap, params, conf) = setup();
        let mut tree = Tree::from_newick("((a1:2.5, a2:2):1, b:2);").unwrap();
        tree_log_likelihood(&conf, &mut tree, &stree, &smap, &params, Some(1.0)).unwrap();

        assert_eq!(tree.data.baserate, 1.0);
        assert!((tree.data.eventlogl - 0.5f64.ln()).abs() < 1e-12);
        assert_eq!(tree.data.errorlogl, 0.0);
        for name in ["a1", "a2", "b"] {
            let id = tree.node_by_name(name).unwrap();
            let diag = &tree.node(id).diag;
            assert!(diag.logl.is_some(), "{name} has a path contribution");
            assert!(diag.params.is_some());
            assert_eq!(diag.fracs, vec![1.0]);
        }
    }
}
