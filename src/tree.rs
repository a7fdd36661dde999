//! Arena-allocated rooted labeled trees.
//!
//! Gene trees and species trees share one representation: nodes live in a
//! slab indexed by [`NodeId`], the parent slot of the root is `None`, and
//! each non-root node carries the length `dist` of the edge to its parent.
//! Node names are unique within a tree and survive copies; `NodeId`s do not
//! survive copies (a copy is compacted).
//!
//! Newick input goes through the `phylotree` parser and is converted into
//! the arena; unnamed nodes receive fresh integer names in preorder, which
//! is also the convention the parameter file keys internal species nodes by.

use crate::error::{Result, SindirError};
use std::fmt::Write as _;

pub type NodeId = usize;

/// Scratch fields written by the likelihood engine, one bag per node.
///
/// `params` caches the (μ, σ) of the species path crossed by the node's
/// subtree-leaf path and `fracs` the mixture weights over that cache
/// (currently always a single 1.0). `extra` and `unfold` flag branches
/// below a species-root duplication.
#[derive(Clone, Debug, Default)]
pub struct NodeDiag {
    pub logl: Option<f64>,
    pub extra: bool,
    pub unfold: bool,
    pub params: Option<(f64, f64)>,
    pub fracs: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct TreeNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Length of the edge to the parent; 0 for the root.
    pub dist: f64,
    pub diag: NodeDiag,
}

/// Per-tree results of fitting and scoring.
#[derive(Clone, Debug)]
pub struct TreeData {
    /// Normalized least-squares residual; 0 until the tree has been fit.
    pub error: f64,
    pub logl: Option<f64>,
    pub eventlogl: f64,
    pub errorlogl: f64,
    pub baserate: f64,
}

impl Default for TreeData {
    fn default() -> Self {
        TreeData {
            error: 0.0,
            logl: None,
            eventlogl: 0.0,
            errorlogl: 0.0,
            baserate: 1.0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Tree {
    nodes: Vec<Option<TreeNode>>,
    root: Option<NodeId>,
    next_name: u64,
    pub data: TreeData,
}

impl Tree {
    /// An empty tree; add nodes and call [`Tree::set_root`].
    pub fn new() -> Self {
        Tree::default()
    }

    /// The root id. The tree must be non-empty.
    pub fn root(&self) -> NodeId {
        self.root.expect("tree has no root")
    }

    pub fn set_root(&mut self, id: NodeId) {
        debug_assert!(self.nodes[id].is_some());
        self.root = Some(id);
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        self.nodes[id].as_ref().expect("stale node id")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        self.nodes[id].as_mut().expect("stale node id")
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.node(id).children.is_empty()
    }

    /// Ids of all live nodes, in slab order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].is_some())
            .collect()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Adds a detached node. `None` synthesizes a fresh integer name.
    pub fn add_node(&mut self, name: Option<String>, dist: f64) -> NodeId {
        let name = match name {
            Some(name) => name,
            None => self.fresh_name(),
        };
        let id = self.nodes.len();
        self.nodes.push(Some(TreeNode {
            name,
            parent: None,
            children: Vec::new(),
            dist,
            diag: NodeDiag::default(),
        }));
        id
    }

    fn fresh_name(&mut self) -> String {
        loop {
            self.next_name += 1;
            let candidate = self.next_name.to_string();
            if self.node_by_name(&candidate).is_none() {
                return candidate;
            }
        }
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        (0..self.nodes.len()).find(|&i| {
            self.nodes[i]
                .as_ref()
                .is_some_and(|node| node.name == name)
        })
    }

    /// Links `child` under `parent`. `child` must currently be detached.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        debug_assert!(self.node(child).parent.is_none());
        self.node_mut(parent).children.push(child);
        self.node_mut(child).parent = Some(parent);
    }

    /// Unlinks `child` from its parent, keeping its subtree intact.
    pub fn detach(&mut self, child: NodeId) {
        if let Some(parent) = self.node(child).parent {
            self.node_mut(parent).children.retain(|&c| c != child);
            self.node_mut(child).parent = None;
        }
    }

    /// Deletes a node that has no children; detaches it first if linked.
    pub fn remove(&mut self, id: NodeId) {
        debug_assert!(self.node(id).children.is_empty());
        self.detach(id);
        self.nodes[id] = None;
    }

    /// Leaves in depth-first order.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.preorder()
            .into_iter()
            .filter(|&id| self.is_leaf(id))
            .collect()
    }

    pub fn leaf_names(&self) -> Vec<String> {
        self.leaves()
            .into_iter()
            .map(|id| self.node(id).name.clone())
            .collect()
    }

    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.num_nodes());
        let Some(root) = self.root else {
            return order;
        };
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            order.push(id);
            for &child in self.node(id).children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    pub fn postorder(&self) -> Vec<NodeId> {
        let mut order = self.preorder();
        order.reverse();
        order
    }

    /// Sum of all edge lengths.
    pub fn total_length(&self) -> f64 {
        self.preorder().iter().map(|&id| self.node(id).dist).sum()
    }

    /// Resets all per-node diagnostic fields.
    pub fn clear_diagnostics(&mut self) {
        for slot in self.nodes.iter_mut().flatten() {
            slot.diag = NodeDiag::default();
        }
    }

    /// A compacted deep copy. Names, distances, diagnostics, and per-tree
    /// data survive; node ids do not.
    pub fn copy(&self) -> Tree {
        let mut out = Tree {
            nodes: Vec::with_capacity(self.num_nodes()),
            root: None,
            next_name: self.next_name,
            data: self.data.clone(),
        };
        let Some(root) = self.root else {
            return out;
        };
        let mut map = vec![usize::MAX; self.nodes.len()];
        for &id in &self.preorder() {
            let node = self.node(id);
            let new_id = out.nodes.len();
            out.nodes.push(Some(TreeNode {
                name: node.name.clone(),
                parent: node.parent.map(|p| map[p]),
                children: Vec::with_capacity(node.children.len()),
                dist: node.dist,
                diag: node.diag.clone(),
            }));
            map[id] = new_id;
            if let Some(p) = node.parent {
                out.nodes[map[p]]
                    .as_mut()
                    .expect("parent precedes child in preorder")
                    .children
                    .push(new_id);
            }
        }
        out.root = Some(map[root]);
        out
    }

    /// Reroots on the edge above `node`: a fresh root takes over the edge,
    /// with `node` on one side and the rest of the tree, parent pointers
    /// reversed along the old root path, on the other. The edge length is
    /// split evenly. A former root left with a single child is collapsed.
    ///
    /// Rerooting at the root, or on an edge the binary root already sits
    /// on, is a no-op.
    pub fn reroot(&mut self, node: NodeId) {
        let root = self.root();
        if node == root {
            return;
        }
        let parent = self.node(node).parent.expect("non-root has a parent");
        if parent == root && self.node(root).children.len() == 2 {
            return;
        }

        // chain of ancestors from the old parent up to the old root
        let mut chain = vec![parent];
        while let Some(up) = self.node(*chain.last().unwrap()).parent {
            chain.push(up);
        }
        let old_dists: Vec<f64> = chain.iter().map(|&id| self.node(id).dist).collect();

        for i in 0..chain.len() - 1 {
            self.detach(chain[i]);
        }
        self.detach(node);

        let half = self.node(node).dist / 2.0;
        let new_root = self.add_node(None, 0.0);
        self.add_child(new_root, node);
        self.add_child(new_root, chain[0]);
        self.node_mut(node).dist = half;
        self.node_mut(chain[0]).dist = half;

        // reverse the chain: each former parent becomes the child on the
        // same edge, inheriting that edge's length
        for i in 0..chain.len() - 1 {
            self.add_child(chain[i], chain[i + 1]);
            self.node_mut(chain[i + 1]).dist = old_dists[i];
        }

        let old_root = *chain.last().unwrap();
        if self.node(old_root).children.len() == 1 {
            let only = self.node(old_root).children[0];
            let up = self.node(old_root).parent.expect("old root was rewired");
            let extra = self.node(old_root).dist;
            self.detach(only);
            self.node_mut(only).dist += extra;
            self.remove(old_root);
            self.add_child(up, only);
        }

        self.set_root(new_root);
    }

    /// Parses a Newick string. Unnamed nodes get fresh integer names in
    /// preorder.
    pub fn from_newick(text: &str) -> Result<Tree> {
        let parsed = phylotree::tree::Tree::from_newick(text.trim())
            .map_err(|e| SindirError::TreeParse(e.to_string()))?;
        let proot = parsed
            .get_root()
            .map_err(|e| SindirError::TreeParse(e.to_string()))?;

        let mut tree = Tree::new();
        let mut stack = vec![(proot, None::<NodeId>)];
        while let Some((pid, parent)) = stack.pop() {
            let pnode = parsed
                .get(&pid)
                .map_err(|e| SindirError::TreeParse(e.to_string()))?;
            let name = pnode.name.clone().filter(|n| !n.is_empty());
            let dist = pnode.parent_edge.unwrap_or(0.0);
            let id = tree.add_node(name, dist);
            match parent {
                Some(parent) => tree.add_child(parent, id),
                None => tree.set_root(id),
            }
            for &child in pnode.children.iter().rev() {
                stack.push((child, Some(id)));
            }
        }
        Ok(tree)
    }

    /// Serializes to Newick. Every node keeps its name; non-root nodes get
    /// their edge length.
    pub fn to_newick(&self) -> String {
        fn write_node(tree: &Tree, id: NodeId, out: &mut String) {
            let node = tree.node(id);
            if !node.children.is_empty() {
                out.push('(');
                for (i, &child) in node.children.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_node(tree, child, out);
                }
                out.push(')');
            }
            out.push_str(&node.name);
            if node.parent.is_some() {
                let _ = write!(out, ":{}", node.dist);
            }
        }

        let mut out = String::new();
        if self.root.is_some() {
            write_node(self, self.root(), &mut out);
        }
        out.push(';');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn newick_round_trip() {
        let tree = Tree::from_newick("((a1:2.5,a2:2):1,b:2);").unwrap();
        assert_eq!(
            sorted(tree.leaf_names()),
            vec!["a1".to_string(), "a2".to_string(), "b".to_string()]
        );
        assert_eq!(tree.node(tree.root()).children.len(), 2);

        let text = tree.to_newick();
        let again = Tree::from_newick(&text).unwrap();
        assert_eq!(sorted(again.leaf_names()), sorted(tree.leaf_names()));
        assert!((again.total_length() - tree.total_length()).abs() < 1e-12);
    }

    #[test]
    fn unnamed_internals_get_integer_names() {
        let tree = Tree::from_newick("((a:1,b:1):1,c:1);").unwrap();
        let root_name = &tree.node(tree.root()).name;
        assert!(root_name.parse::<u64>().is_ok());
        // synthetic names never collide with leaf labels
        let names: Vec<_> = tree
            .node_ids()
            .iter()
            .map(|&id| tree.node(id).name.clone())
            .collect();
        let mut uniq = names.clone();
        uniq.sort();
        uniq.dedup();
        assert_eq!(uniq.len(), names.len());
    }

    #[test]
    fn copy_compacts_and_preserves() {
        let mut tree = Tree::from_newick("((a:1,b:2):3,c:4);").unwrap();
        let a = tree.node_by_name("a").unwrap();
        tree.node_mut(a).diag.logl = Some(-1.5);
        tree.data.error = 0.25;

        let copy = tree.copy();
        assert_eq!(copy.num_nodes(), tree.num_nodes());
        assert_eq!(sorted(copy.leaf_names()), sorted(tree.leaf_names()));
        let a2 = copy.node_by_name("a").unwrap();
        assert_eq!(copy.node(a2).diag.logl, Some(-1.5));
        assert_eq!(copy.data.error, 0.25);
        assert!((copy.total_length() - tree.total_length()).abs() < 1e-12);
    }

    #[test]
    fn detach_and_remove() {
        let mut tree = Tree::from_newick("((a:1,b:2):3,c:4);").unwrap();
        let c = tree.node_by_name("c").unwrap();
        tree.detach(c);
        assert_eq!(tree.node(tree.root()).children.len(), 1);
        assert!(tree.node(c).parent.is_none());

        tree.remove(c);
        assert_eq!(
            sorted(tree.leaf_names()),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn reroot_preserves_leaves_and_length() {
        let mut tree = Tree::from_newick("((a:1,b:2):3,(c:4,d:5):6);").unwrap();
        let total = tree.total_length();
        let c = tree.node_by_name("c").unwrap();
        tree.reroot(c);

        assert_eq!(
            sorted(tree.leaf_names()),
            vec!["a", "b", "c", "d"].into_iter().map(String::from).collect::<Vec<_>>()
        );
        assert_eq!(tree.node(tree.root()).children.len(), 2);
        assert!((tree.total_length() - total).abs() < 1e-9);

        // every non-root node points back at a parent that lists it
        for id in tree.node_ids() {
            match tree.node(id).parent {
                Some(p) => assert!(tree.node(p).children.contains(&id)),
                None => assert_eq!(id, tree.root()),
            }
        }
    }

    #[test]
    fn reroot_on_root_edge_is_noop() {
        let mut tree = Tree::from_newick("((a:1,b:2):3,c:4);").unwrap();
        let before = tree.to_newick();
        let top = tree.node(tree.root()).children[0];
        tree.reroot(top);
        assert_eq!(tree.to_newick(), before);
    }

    #[test]
    fn reroot_collapses_the_old_root() {
        // the former root ends up with one child and is merged away, so
        // the rerooted tree has no degree-2 internal node
        let mut tree = Tree::from_newick("((a:1,b:2)x:3,(c:4,d:5)y:6);").unwrap();
        let c = tree.node_by_name("c").unwrap();
        tree.reroot(c);

        for id in tree.node_ids() {
            if id != tree.root() && !tree.is_leaf(id) {
                assert_eq!(tree.node(id).children.len(), 2);
            }
        }
        // x now hangs off y on the merged 3 + 6 edge
        let x = tree.node_by_name("x").unwrap();
        let y = tree.node_by_name("y").unwrap();
        assert_eq!(tree.node(x).parent, Some(y));
        assert!((tree.node(x).dist - 9.0).abs() < 1e-12);
    }
}
