//! Branch-length fitting against a pairwise distance matrix.
//!
//! [`neighbor_join`] builds the seed topology; [`fit_branches`] turns any
//! topology into branch lengths by least squares: each edge's bipartition
//! says which leaf pairs the edge separates, giving a 0/1 system
//! `A·b ≈ d` between edge lengths and pairwise path distances. The solve
//! is an SVD least-squares (least-norm on rank deficiency), lengths are
//! clamped at zero, and the normalized residual is recorded on the tree.

use crate::bitset::Bitset;
use crate::error::{Result, SindirError};
use crate::splits::subtree_leaf_sets;
use crate::tree::{NodeId, Tree};
use itertools::Itertools;
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;

/// Neighbor-joining topology from a square distance matrix.
///
/// Clusters are merged by the Saitou–Nei criterion
/// `d(i,j) − r(i) − r(j)` with `r(i) = Σₖ d(i,k) / (n−2)`. The final join
/// leaves a trifurcating root, i.e. an unrooted tree; root it with
/// [`crate::recon::recon_root`] before reconciling.
pub fn neighbor_join(distmat: &[Vec<f64>], labels: &[String]) -> Tree {
    let mut tree = Tree::new();
    let mut active: Vec<NodeId> = labels
        .iter()
        .map(|label| tree.add_node(Some(label.clone()), 0.0))
        .collect();
    let mut dist: Vec<Vec<f64>> = distmat.iter().map(|row| row.clone()).collect();

    if active.len() == 1 {
        tree.set_root(active[0]);
        return tree;
    }

    while active.len() > 2 {
        let m = active.len();
        let rest: Vec<f64> = (0..m)
            .map(|i| dist[i].iter().sum::<f64>() / (m as f64 - 2.0))
            .collect();

        // closest pair under the join criterion
        let (mut besti, mut bestj, mut low) = (0, 1, f64::INFINITY);
        for (i, j) in (0..m).tuple_combinations() {
            let q = dist[i][j] - rest[i] - rest[j];
            if q < low {
                (besti, bestj, low) = (i, j, q);
            }
        }

        let parent = tree.add_node(None, 0.0);
        tree.add_child(parent, active[besti]);
        tree.add_child(parent, active[bestj]);
        let di = (dist[besti][bestj] + rest[besti] - rest[bestj]) / 2.0;
        tree.node_mut(active[besti]).dist = di;
        tree.node_mut(active[bestj]).dist = dist[besti][bestj] - di;

        // fold the pair into one cluster; row order: merged cluster first,
        // then the survivors in their old order
        let mut next_active = vec![parent];
        let mut keep = Vec::with_capacity(m - 2);
        for k in 0..m {
            if k != besti && k != bestj {
                next_active.push(active[k]);
                keep.push(k);
            }
        }
        let mut next_dist = vec![vec![0.0; m - 1]; m - 1];
        for (col, &k) in keep.iter().enumerate() {
            let duk = (dist[besti][k] + dist[bestj][k] - dist[besti][bestj]) / 2.0;
            next_dist[0][col + 1] = duk;
            next_dist[col + 1][0] = duk;
        }
        for (a, &ka) in keep.iter().enumerate() {
            for (b, &kb) in keep.iter().enumerate() {
                next_dist[a + 1][b + 1] = dist[ka][kb];
            }
        }
        active = next_active;
        dist = next_dist;
    }

    // last two clusters join on a single edge; the internal one (if any)
    // becomes the root, leaving a trifurcation there
    let (a, b) = (active[0], active[1]);
    let (root, child) = if !tree.is_leaf(a) { (a, b) } else { (b, a) };
    tree.add_child(root, child);
    tree.node_mut(child).dist = dist[0][1];
    tree.node_mut(root).dist = 0.0;
    tree.set_root(root);
    tree
}

/// Pair row index for leaves `i < j` out of `n`:
/// `i·n − i(i+1)/2 + j − i − 1`, the row-major upper triangle.
#[inline]
fn pair_index(i: usize, j: usize, n: usize) -> usize {
    i * n - i * (i + 1) / 2 + j - i - 1
}

/// Fits non-negative branch lengths so the induced pairwise path sums
/// best approximate `distmat` in the L2 sense, and records the normalized
/// residual `‖A·b − d‖₂ / Σ dist` in `tree.data.error`.
///
/// Rank-deficient systems take the least-norm solution; negative fitted
/// lengths are clamped to zero.
pub fn fit_branches(tree: &mut Tree, distmat: &[Vec<f64>], labels: &[String]) -> Result<()> {
    let n = labels.len();
    if n < 2 {
        tree.data.error = 0.0;
        return Ok(());
    }
    let index: HashMap<String, usize> = labels
        .iter()
        .enumerate()
        .map(|(i, label)| (label.clone(), i))
        .collect();
    for id in tree.leaves() {
        let name = &tree.node(id).name;
        if !index.contains_key(name) {
            return Err(SindirError::DistMatrix(format!(
                "leaf '{name}' is not among the distance-matrix labels"
            )));
        }
    }
    let words = Bitset::words_for(n.max(1));
    let sets = subtree_leaf_sets(tree, &index, words);

    let edges: Vec<NodeId> = tree
        .preorder()
        .into_iter()
        .filter(|&id| id != tree.root())
        .collect();

    let npairs = n * (n - 1) / 2;
    let mut a = DMatrix::<f64>::zeros(npairs, edges.len());
    for (e, id) in edges.iter().enumerate() {
        let bits = &sets[id];
        for (i, j) in (0..n).tuple_combinations() {
            if bits.get(i) != bits.get(j) {
                a[(pair_index(i, j, n), e)] = 1.0;
            }
        }
    }
    let d = DVector::<f64>::from_iterator(
        npairs,
        (0..n).tuple_combinations().map(|(i, j)| distmat[i][j]),
    );

    let svd = a.clone().svd(true, true);
    let b = svd
        .solve(&d, 1e-10)
        .map_err(|e| SindirError::LeastSquares(e.to_string()))?;

    let mut total = 0.0;
    let mut fitted = DVector::<f64>::zeros(edges.len());
    for (e, &id) in edges.iter().enumerate() {
        let len = b[e].max(0.0);
        tree.node_mut(id).dist = len;
        fitted[e] = len;
        total += len;
    }
    tree.node_mut(tree.root()).dist = 0.0;

    let residual = (&a * &fitted - &d).norm();
    tree.data.error = if total > 0.0 {
        residual / total
    } else if residual == 0.0 {
        0.0
    } else {
        f64::INFINITY
    };
    Ok(())
}
