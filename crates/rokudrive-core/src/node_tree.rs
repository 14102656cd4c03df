//! Scene graph reconstruction from the device's flat node listing.
//!
//! The on-device component reports the scene graph as a flat array of
//! [`NodeDescriptor`]s, each carrying its own `ref` and its parent's
//! `parentRef` instead of nested children. [`NodeTree::build`] links them back
//! into ordered trees.
//!
//! The tree is an arena: descriptors stay in their original flat order and
//! children are stored as index lists, so both the flat and the nested view
//! are available without cloning.
//!
//! # Example
//!
//! ```
//! use rokudrive_core::node_tree::{NodeDescriptor, NodeTree};
//!
//! let flat = vec![
//!     NodeDescriptor::new("Scene", "scene", 0, -1, 0),
//!     NodeDescriptor::new("Label", "b", 1, 0, 1),
//!     NodeDescriptor::new("Label", "a", 2, 0, 0),
//! ];
//! let tree = NodeTree::build(flat).unwrap();
//! let scene = tree.roots().next().unwrap();
//! let ids: Vec<_> = scene.children().map(|c| c.descriptor().id.clone()).collect();
//! assert_eq!(ids, ["a", "b"]);
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// `parentRef` value marking a root node.
pub const NO_PARENT: i64 = -1;

/// Errors raised when the flat listing violates the parent/ref contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// A node references a parent that is not in the listing.
    #[error("node {node_ref} references missing parent {parent_ref}")]
    DanglingParent { node_ref: i64, parent_ref: i64 },

    /// Two nodes share the same ref.
    #[error("duplicate node ref {0}")]
    DuplicateRef(i64),

    /// A node uses a negative ref; -1 is reserved for "no parent".
    #[error("invalid node ref {0}")]
    InvalidRef(i64),

    /// The node's parent chain never reaches a root.
    #[error("node {0} is not reachable from any root (parent cycle)")]
    Unrooted(i64),
}

/// One entry of the device's flat scene graph listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    /// Node subtype, e.g. `Group`, `Label`, `RowList`.
    pub subtype: String,

    /// The node's `id` field (may be empty).
    #[serde(default)]
    pub id: String,

    #[serde(rename = "ref")]
    pub node_ref: i64,

    /// Ref of the parent node, or [`NO_PARENT`] for roots.
    pub parent_ref: i64,

    /// Order among siblings.
    #[serde(default)]
    pub position: i64,

    /// Any further fields the device reports (key paths, bounds, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeDescriptor {
    pub fn new(
        subtype: impl Into<String>,
        id: impl Into<String>,
        node_ref: i64,
        parent_ref: i64,
        position: i64,
    ) -> Self {
        Self {
            subtype: subtype.into(),
            id: id.into(),
            node_ref,
            parent_ref,
            position,
            extra: Map::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_ref == NO_PARENT
    }
}

/// A reconstructed scene graph.
#[derive(Debug, Clone)]
pub struct NodeTree {
    nodes: Vec<NodeDescriptor>,
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
    by_ref: HashMap<i64, usize>,
}

impl NodeTree {
    /// Link a flat listing into trees.
    ///
    /// Parents are resolved through a `ref` lookup, never through array
    /// position. Roots keep their order from the listing; every child list is
    /// sorted by `position`.
    pub fn build(mut nodes: Vec<NodeDescriptor>) -> Result<Self, TreeError> {
        let mut by_ref = HashMap::with_capacity(nodes.len());
        for (index, node) in nodes.iter_mut().enumerate() {
            if node.node_ref < 0 {
                return Err(TreeError::InvalidRef(node.node_ref));
            }
            // A device-supplied children array is superseded by the links below.
            node.extra.remove("children");
            if by_ref.insert(node.node_ref, index).is_some() {
                return Err(TreeError::DuplicateRef(node.node_ref));
            }
        }

        let mut children = vec![Vec::new(); nodes.len()];
        let mut roots = Vec::new();
        for (index, node) in nodes.iter().enumerate() {
            if node.is_root() {
                roots.push(index);
                continue;
            }
            let parent = by_ref
                .get(&node.parent_ref)
                .copied()
                .ok_or(TreeError::DanglingParent {
                    node_ref: node.node_ref,
                    parent_ref: node.parent_ref,
                })?;
            children[parent].push(index);
        }

        for list in &mut children {
            list.sort_by_key(|&i| nodes[i].position);
        }

        let tree = Self {
            nodes,
            children,
            roots,
            by_ref,
        };
        tree.check_rooted()?;
        Ok(tree)
    }

    /// Every node must hang off some root; a parent cycle would otherwise
    /// vanish from the nested view.
    fn check_rooted(&self) -> Result<(), TreeError> {
        let mut reached = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = self.roots.clone();
        while let Some(index) = stack.pop() {
            if std::mem::replace(&mut reached[index], true) {
                continue;
            }
            stack.extend(&self.children[index]);
        }
        match reached.iter().position(|r| !r) {
            Some(index) => Err(TreeError::Unrooted(self.nodes[index].node_ref)),
            None => Ok(()),
        }
    }

    /// Descriptors in their original listing order.
    pub fn flat(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    pub fn into_flat(self) -> Vec<NodeDescriptor> {
        self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Root nodes (`parentRef == -1`) in listing order.
    pub fn roots(&self) -> impl Iterator<Item = NodeView<'_>> + '_ {
        self.roots.iter().map(move |&index| NodeView { tree: self, index })
    }

    /// Look up a node by its `ref`.
    pub fn get(&self, node_ref: i64) -> Option<NodeView<'_>> {
        self.by_ref
            .get(&node_ref)
            .map(|&index| NodeView { tree: self, index })
    }

    /// Depth-first search (pre-order, sibling order) for the first node with
    /// the given `id`.
    pub fn find_by_id(&self, id: &str) -> Option<NodeView<'_>> {
        fn search<'a>(node: NodeView<'a>, id: &str) -> Option<NodeView<'a>> {
            if node.descriptor().id == id {
                return Some(node);
            }
            node.children().find_map(|child| search(child, id))
        }
        self.roots().find_map(|root| search(root, id))
    }

    /// Owned nested copy, e.g. for JSON output.
    pub fn to_nested(&self) -> Vec<TreeNode> {
        self.roots().map(|root| root.to_nested()).collect()
    }
}

/// A borrowed handle to one node of a [`NodeTree`].
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    tree: &'a NodeTree,
    index: usize,
}

impl<'a> NodeView<'a> {
    pub fn descriptor(&self) -> &'a NodeDescriptor {
        &self.tree.nodes[self.index]
    }

    /// Children in ascending `position` order.
    pub fn children(&self) -> impl Iterator<Item = NodeView<'a>> + 'a {
        let tree = self.tree;
        tree.children[self.index]
            .iter()
            .map(move |&index| NodeView { tree, index })
    }

    pub fn child_count(&self) -> usize {
        self.tree.children[self.index].len()
    }

    pub fn parent(&self) -> Option<NodeView<'a>> {
        self.tree.get(self.descriptor().parent_ref)
    }

    pub fn to_nested(&self) -> TreeNode {
        TreeNode {
            node: self.descriptor().clone(),
            children: self.children().map(|c| c.to_nested()).collect(),
        }
    }
}

/// Owned nested form of a node and its descendants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub node: NodeDescriptor,
    pub children: Vec<TreeNode>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, node_ref: i64, parent_ref: i64, position: i64) -> NodeDescriptor {
        NodeDescriptor::new("Group", id, node_ref, parent_ref, position)
    }

    fn child_ids(view: NodeView<'_>) -> Vec<String> {
        view.children().map(|c| c.descriptor().id.clone()).collect()
    }

    #[test]
    fn children_sorted_by_position() {
        let tree = NodeTree::build(vec![
            node("scene", 0, -1, 0),
            node("b", 1, 0, 1),
            node("a", 2, 0, 0),
        ])
        .unwrap();

        let roots: Vec<_> = tree.roots().collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].descriptor().id, "scene");
        assert_eq!(child_ids(roots[0]), ["a", "b"]);
    }

    #[test]
    fn parents_resolved_by_ref_not_index() {
        // refs deliberately differ from array positions
        let tree = NodeTree::build(vec![
            node("leaf", 7, 42, 0),
            node("root", 42, -1, 0),
            node("sibling", 3, 42, 1),
        ])
        .unwrap();

        let root = tree.roots().next().unwrap();
        assert_eq!(root.descriptor().id, "root");
        assert_eq!(child_ids(root), ["leaf", "sibling"]);
        assert_eq!(tree.get(3).unwrap().parent().unwrap().descriptor().id, "root");
    }

    #[test]
    fn multiple_roots_keep_listing_order() {
        let tree = NodeTree::build(vec![
            node("second-root", 5, -1, 9),
            node("first-root", 1, -1, 0),
        ])
        .unwrap();
        let ids: Vec<_> = tree.roots().map(|r| r.descriptor().id.clone()).collect();
        assert_eq!(ids, ["second-root", "first-root"]);
    }

    #[test]
    fn dangling_parent_is_an_error() {
        let err = NodeTree::build(vec![node("scene", 0, -1, 0), node("lost", 1, 99, 0)])
            .unwrap_err();
        assert_eq!(
            err,
            TreeError::DanglingParent {
                node_ref: 1,
                parent_ref: 99
            }
        );
    }

    #[test]
    fn duplicate_ref_is_an_error() {
        let err = NodeTree::build(vec![node("a", 0, -1, 0), node("b", 0, -1, 1)]).unwrap_err();
        assert_eq!(err, TreeError::DuplicateRef(0));
    }

    #[test]
    fn reserved_ref_is_an_error() {
        let err = NodeTree::build(vec![node("a", -1, -1, 0)]).unwrap_err();
        assert_eq!(err, TreeError::InvalidRef(-1));
    }

    #[test]
    fn parent_cycle_is_an_error() {
        let err = NodeTree::build(vec![
            node("scene", 0, -1, 0),
            node("x", 1, 2, 0),
            node("y", 2, 1, 0),
        ])
        .unwrap_err();
        assert!(matches!(err, TreeError::Unrooted(1) | TreeError::Unrooted(2)));
    }

    #[test]
    fn empty_listing_builds_empty_tree() {
        let tree = NodeTree::build(Vec::new()).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.roots().count(), 0);
    }

    #[test]
    fn deep_nesting_and_find_by_id() {
        let tree = NodeTree::build(vec![
            node("grandchild", 2, 1, 0),
            node("child", 1, 0, 0),
            node("scene", 0, -1, 0),
            node("other", 3, 0, 1),
        ])
        .unwrap();

        let found = tree.find_by_id("grandchild").unwrap();
        assert_eq!(found.descriptor().node_ref, 2);
        assert_eq!(found.parent().unwrap().descriptor().id, "child");
        assert_eq!(tree.get(0).unwrap().child_count(), 2);
        assert!(tree.find_by_id("missing").is_none());
    }

    #[test]
    fn descriptor_deserializes_from_device_json() {
        let descriptor: NodeDescriptor = serde_json::from_value(json!({
            "subtype": "Label",
            "id": "title",
            "ref": 4,
            "parentRef": 0,
            "position": 2,
            "keyPath": "#title",
            "children": []
        }))
        .unwrap();
        assert_eq!(descriptor.node_ref, 4);
        assert_eq!(descriptor.extra["keyPath"], "#title");

        let tree = NodeTree::build(vec![node("scene", 0, -1, 0), descriptor]).unwrap();
        assert!(!tree.get(4).unwrap().descriptor().extra.contains_key("children"));
    }

    #[test]
    fn nested_serialization() {
        let tree = NodeTree::build(vec![
            node("scene", 0, -1, 0),
            node("b", 1, 0, 1),
            node("a", 2, 0, 0),
        ])
        .unwrap();
        let value = serde_json::to_value(tree.to_nested()).unwrap();
        assert_eq!(value[0]["id"], "scene");
        assert_eq!(value[0]["children"][0]["id"], "a");
        assert_eq!(value[0]["children"][1]["id"], "b");
        assert_eq!(value[0]["children"][1]["children"], json!([]));
    }
}
