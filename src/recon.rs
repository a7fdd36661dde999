//! Reconciliation of gene trees against a species tree.
//!
//! Every gene-tree node is mapped to the species-tree node that hosted it:
//! leaves by the gene→species labeling, internal nodes by the LCA of their
//! children's images. The map classifies internal nodes into speciations
//! (children diverge into different species branches) and duplications
//! (some child stays on the same species branch), and implies loss events
//! wherever a reconciled edge skips past a species lineage with no
//! surviving descendant.

use crate::error::{Result, SindirError};
use crate::tree::{NodeId, Tree};
use std::collections::{HashMap, HashSet};

/// Classification of a gene-tree node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Spec,
    Dup,
    Leaf,
}

/// Gene-label → species-label mapping: exact entries plus trailing-`*`
/// prefix patterns, checked in that order.
#[derive(Clone, Debug, Default)]
pub struct SpeciesMap {
    exact: HashMap<String, String>,
    prefixes: Vec<(String, String)>,
}

impl SpeciesMap {
    pub fn new() -> Self {
        SpeciesMap::default()
    }

    /// Adds one mapping entry. A pattern ending in `*` matches any gene
    /// label starting with the part before the `*`.
    pub fn add(&mut self, pattern: &str, species: &str) {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.prefixes.push((prefix.to_string(), species.to_string())),
            None => {
                self.exact.insert(pattern.to_string(), species.to_string());
            }
        }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut map = SpeciesMap::new();
        for (pattern, species) in pairs {
            map.add(pattern, species);
        }
        map
    }

    pub fn species_of(&self, gene: &str) -> Result<&str> {
        if let Some(species) = self.exact.get(gene) {
            return Ok(species);
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| gene.starts_with(prefix.as_str()))
            .map(|(_, species)| species.as_str())
            .ok_or_else(|| SindirError::UnmappedGene(gene.to_string()))
    }
}

/// Depth of every species node below the root.
fn species_depths(stree: &Tree) -> HashMap<NodeId, usize> {
    let mut depths = HashMap::new();
    for id in stree.preorder() {
        let d = match stree.node(id).parent {
            Some(parent) => depths[&parent] + 1,
            None => 0,
        };
        depths.insert(id, d);
    }
    depths
}

fn lca(stree: &Tree, depths: &HashMap<NodeId, usize>, mut a: NodeId, mut b: NodeId) -> NodeId {
    while depths[&a] > depths[&b] {
        a = stree.node(a).parent.expect("depth > 0 implies a parent");
    }
    while depths[&b] > depths[&a] {
        b = stree.node(b).parent.expect("depth > 0 implies a parent");
    }
    while a != b {
        a = stree.node(a).parent.expect("diverged nodes sit below the root");
        b = stree.node(b).parent.expect("diverged nodes sit below the root");
    }
    a
}

/// Maps every gene-tree node to its hosting species-tree node.
///
/// Leaves map through `smap`; an internal node maps to the LCA of its
/// children's images.
pub fn reconcile(
    gtree: &Tree,
    stree: &Tree,
    smap: &SpeciesMap,
) -> Result<HashMap<NodeId, NodeId>> {
    let depths = species_depths(stree);
    let species_by_name: HashMap<&str, NodeId> = stree
        .leaves()
        .into_iter()
        .map(|id| (stree.node(id).name.as_str(), id))
        .collect();

    let mut recon = HashMap::new();
    for id in gtree.postorder() {
        let node = gtree.node(id);
        let snode = if node.children.is_empty() {
            let species = smap.species_of(&node.name)?;
            *species_by_name
                .get(species)
                .ok_or_else(|| SindirError::UnknownNode(species.to_string()))?
        } else {
            let mut images = node.children.iter().map(|c| recon[c]);
            let first = images.next().expect("internal node has children");
            images.fold(first, |acc, s| lca(stree, &depths, acc, s))
        };
        recon.insert(id, snode);
    }
    Ok(recon)
}

/// Labels every gene-tree node with its event type.
pub fn label_events(gtree: &Tree, recon: &HashMap<NodeId, NodeId>) -> HashMap<NodeId, Event> {
    let mut events = HashMap::new();
    for id in gtree.preorder() {
        let node = gtree.node(id);
        let event = if node.children.is_empty() {
            Event::Leaf
        } else if node.children.iter().any(|c| recon[c] == recon[&id]) {
            Event::Dup
        } else {
            Event::Spec
        };
        events.insert(id, event);
    }
    events
}

/// Number of implied loss events: for each gene-tree node, every species
/// lineage branching off the reconciled child paths with no surviving
/// descendant counts once.
pub fn count_losses(gtree: &Tree, stree: &Tree, recon: &HashMap<NodeId, NodeId>) -> usize {
    let mut losses = 0;
    for id in gtree.preorder() {
        let node = gtree.node(id);
        if node.children.is_empty() {
            continue;
        }
        let top = recon[&id];
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut inner: HashSet<NodeId> = HashSet::new();
        for child in &node.children {
            let mut ptr = recon[child];
            seen.insert(ptr);
            while ptr != top {
                ptr = stree.node(ptr).parent.expect("top is an ancestor");
                seen.insert(ptr);
                inner.insert(ptr);
            }
        }
        for &snode in &inner {
            for schild in &stree.node(snode).children {
                if !seen.contains(schild) {
                    losses += 1;
                }
            }
        }
    }
    losses
}

/// Reroots a gene tree on the edge that minimizes duplications + losses.
///
/// Every edge is tried; ties keep the first minimum in preorder.
pub fn recon_root(gtree: &Tree, stree: &Tree, smap: &SpeciesMap) -> Result<Tree> {
    let mut best: Option<(usize, Tree)> = None;
    for name in gtree
        .preorder()
        .into_iter()
        .filter(|&id| id != gtree.root())
        .map(|id| gtree.node(id).name.clone())
        .collect::<Vec<_>>()
    {
        let mut candidate = gtree.copy();
        let id = candidate
            .node_by_name(&name)
            .expect("names survive copies");
        candidate.reroot(id);

        let recon = reconcile(&candidate, stree, smap)?;
        let events = label_events(&candidate, &recon);
        let dups = events.values().filter(|&&e| e == Event::Dup).count();
        let cost = dups + count_losses(&candidate, stree, &recon);

        if best.as_ref().is_none_or(|(low, _)| cost < *low) {
            best = Some((cost, candidate));
        }
    }
    Ok(best.map(|(_, tree)| tree).unwrap_or_else(|| gtree.copy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_letter_map() -> SpeciesMap {
        SpeciesMap::from_pairs([("a*", "A"), ("b*", "B"), ("c*", "C")])
    }

    #[test]
    fn species_map_prefers_exact_over_prefix() {
        let mut map = SpeciesMap::new();
        map.add("a*", "A");
        map.add("a9", "B");
        assert_eq!(map.species_of("a1").unwrap(), "A");
        assert_eq!(map.species_of("a9").unwrap(), "B");
        assert!(map.species_of("zz").is_err());
    }

    #[test]
    fn species_shaped_tree_is_all_speciations() {
        let stree = Tree::from_newick("((A:1,B:1):1,C:1);").unwrap();
        let gtree = Tree::from_newick("((a:1,b:1):1,c:1);").unwrap();
        let smap = first_letter_map();

        let recon = reconcile(&gtree, &stree, &smap).unwrap();
        let events = label_events(&gtree, &recon);

        assert_eq!(recon[&gtree.root()], stree.root());
        for id in gtree.preorder() {
            if gtree.is_leaf(id) {
                assert_eq!(events[&id], Event::Leaf);
            } else {
                assert_eq!(events[&id], Event::Spec);
            }
        }
        assert_eq!(count_losses(&gtree, &stree, &recon), 0);
    }

    #[test]
    fn in_species_duplication_is_labeled() {
        let stree = Tree::from_newick("(A:1,B:1);").unwrap();
        let gtree = Tree::from_newick("((a1:1,a2:1):1,b:1);").unwrap();
        let smap = first_letter_map();

        let recon = reconcile(&gtree, &stree, &smap).unwrap();
        let events = label_events(&gtree, &recon);

        let a_node = stree.node_by_name("A").unwrap();
        let inner = gtree.node(gtree.root()).children[0];
        assert_eq!(recon[&inner], a_node);
        assert_eq!(events[&inner], Event::Dup);
        assert_eq!(events[&gtree.root()], Event::Spec);
        assert_eq!(count_losses(&gtree, &stree, &recon), 0);
    }

    #[test]
    fn skipped_species_lineage_counts_one_loss() {
        // gene tree pairs a with c, skipping the (A,B) ancestor's B side
        let stree = Tree::from_newick("((A:1,B:1)ab:1,C:1);").unwrap();
        let gtree = Tree::from_newick("(a:1,c:1);").unwrap();
        let smap = first_letter_map();

        let recon = reconcile(&gtree, &stree, &smap).unwrap();
        assert_eq!(recon[&gtree.root()], stree.root());
        assert_eq!(count_losses(&gtree, &stree, &recon), 1);
    }

    #[test]
    fn root_duplication_implies_losses() {
        // two gene copies, one surviving only in A, the other only in B
        let stree = Tree::from_newick("(A:1,B:1);").unwrap();
        let gtree = Tree::from_newick("(a:1,b:1);").unwrap();
        let smap = first_letter_map();

        let recon = reconcile(&gtree, &stree, &smap).unwrap();
        let events = label_events(&gtree, &recon);
        // root maps to the species root but neither child does
        assert_eq!(events[&gtree.root()], Event::Spec);
        assert_eq!(count_losses(&gtree, &stree, &recon), 0);

        // a duplication above the root speciation loses one copy per side
        let gtree2 = Tree::from_newick("((a1:1,b1:1):1,a2:1);").unwrap();
        let recon2 = reconcile(&gtree2, &stree, &smap).unwrap();
        let events2 = label_events(&gtree2, &recon2);
        assert_eq!(events2[&gtree2.root()], Event::Dup);
        assert_eq!(count_losses(&gtree2, &stree, &recon2), 1);
    }

    #[test]
    fn recon_root_recovers_species_rooting() {
        let stree = Tree::from_newick("((A:1,B:1):1,C:1);").unwrap();
        let smap = first_letter_map();
        // mis-rooted gene tree: correct unrooted topology, root on the
        // wrong edge implies spurious duplications
        let gtree = Tree::from_newick("((b:1,c:1):1,a:1);").unwrap();

        let rooted = recon_root(&gtree, &stree, &smap).unwrap();
        let recon = reconcile(&rooted, &stree, &smap).unwrap();
        let events = label_events(&rooted, &recon);
        let dups = events.values().filter(|&&e| e == Event::Dup).count();
        assert_eq!(dups, 0);
        assert_eq!(count_losses(&rooted, &stree, &recon), 0);
    }
}
