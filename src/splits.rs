//! Edge bipartitions and the canonical topology key.
//!
//! Removing an edge splits the leaves in two. The least-squares fitter
//! needs the split of every edge against a caller-chosen leaf ordering
//! (the distance-matrix row order); the search cache needs the *set* of
//! non-trivial splits against a canonical ordering, because that set
//! identifies the unrooted topology regardless of where the root sits or
//! how siblings are ordered.
//!
//! On a rooted tree every edge is owned by its child node, and the child's
//! subtree leaf set is one side of the split, so a single bottom-up pass
//! yields all bipartitions.

use crate::bitset::Bitset;
use crate::tree::{NodeId, Tree};
use std::collections::HashMap;

/// Leaf set below each node, as a bitset over `index` positions.
///
/// `index` must cover every leaf name in the tree.
pub fn subtree_leaf_sets(
    tree: &Tree,
    index: &HashMap<String, usize>,
    words: usize,
) -> HashMap<NodeId, Bitset> {
    let mut sets: HashMap<NodeId, Bitset> = HashMap::new();
    for id in tree.postorder() {
        let mut bits = Bitset::zeros(words);
        let node = tree.node(id);
        if node.children.is_empty() {
            bits.set(index[&node.name]);
        } else {
            for child in &node.children {
                bits.or_assign(&sets[child]);
            }
        }
        sets.insert(id, bits);
    }
    sets
}

/// Identity of an unrooted topology: the sorted canonical set of its
/// non-trivial leaf splits, plus the sorted leaf labels themselves.
///
/// Canonicalization stores, for each split, the side that does *not*
/// contain the alphabetically first leaf, so both sides of a bipartition
/// and both root-incident edges of a rooted tree collapse to one entry.
/// Trees with the same leaf-split sets compare (and hash) equal; rerooting
/// and sibling swaps cannot change the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopologyKey {
    leaves: Vec<String>,
    splits: Vec<Bitset>,
}

impl TopologyKey {
    pub fn of(tree: &Tree) -> TopologyKey {
        let mut leaves = tree.leaf_names();
        leaves.sort();
        let n = leaves.len();
        let words = Bitset::words_for(n.max(1));
        let index: HashMap<String, usize> = leaves
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let sets = subtree_leaf_sets(tree, &index, words);
        let mut splits: Vec<Bitset> = Vec::new();
        for id in tree.node_ids() {
            if id == tree.root() {
                continue;
            }
            let bits = &sets[&id];
            let size = bits.count_ones();
            if size <= 1 || size + 1 >= n {
                continue; // trivial: a single leaf on one side
            }
            let canonical = if bits.get(0) {
                bits.complement(n)
            } else {
                bits.clone()
            };
            splits.push(canonical);
        }
        splits.sort();
        splits.dedup();

        TopologyKey { leaves, splits }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_under_reroot() {
        let tree = Tree::from_newick("((a:1,b:1):1,(c:1,d:1):1);").unwrap();
        let key = TopologyKey::of(&tree);

        for name in ["a", "b", "c", "d"] {
            let mut rerooted = tree.copy();
            let id = rerooted.node_by_name(name).unwrap();
            rerooted.reroot(id);
            assert_eq!(TopologyKey::of(&rerooted), key, "reroot at {name}");
        }
    }

    #[test]
    fn invariant_under_sibling_swap() {
        let t1 = Tree::from_newick("((a:1,b:1):1,(c:1,d:1):1);").unwrap();
        let t2 = Tree::from_newick("((d:1,c:1):1,(b:1,a:1):1);").unwrap();
        assert_eq!(TopologyKey::of(&t1), TopologyKey::of(&t2));
    }

    #[test]
    fn distinguishes_topologies() {
        let t1 = Tree::from_newick("((a:1,b:1):1,(c:1,d:1):1);").unwrap();
        let t2 = Tree::from_newick("((a:1,c:1):1,(b:1,d:1):1);").unwrap();
        let t3 = Tree::from_newick("((a:1,d:1):1,(b:1,c:1):1);").unwrap();
        assert_ne!(TopologyKey::of(&t1), TopologyKey::of(&t2));
        assert_ne!(TopologyKey::of(&t1), TopologyKey::of(&t3));
        assert_ne!(TopologyKey::of(&t2), TopologyKey::of(&t3));
    }

    #[test]
    fn distinguishes_leaf_sets() {
        let t1 = Tree::from_newick("(a:1,b:1);").unwrap();
        let t2 = Tree::from_newick("(a:1,c:1);").unwrap();
        assert_ne!(TopologyKey::of(&t1), TopologyKey::of(&t2));
    }

    #[test]
    fn three_leaves_have_one_topology() {
        // all rooted shapes over {a, b, c} reduce to the same unrooted tree
        let t1 = Tree::from_newick("((a:1,b:1):1,c:1);").unwrap();
        let t2 = Tree::from_newick("((b:1,c:1):1,a:1);").unwrap();
        assert_eq!(TopologyKey::of(&t1), TopologyKey::of(&t2));
    }

    #[test]
    fn leaf_sets_accumulate_bottom_up() {
        let tree = Tree::from_newick("((a:1,b:1)ab:1,c:1);").unwrap();
        let names = ["a", "b", "c"];
        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i))
            .collect();
        let sets = subtree_leaf_sets(&tree, &index, 1);

        let ab = tree.node_by_name("ab").unwrap();
        assert_eq!(sets[&ab].0[0], 0b011);
        assert_eq!(sets[&tree.root()].0[0], 0b111);
    }
}
