//! Bounded loop-node tree
//!
//! Nodes live in an arena keyed by uid; parents and children refer to each
//! other by uid only, so the tree holds no reference cycles and any node can
//! be serialized without following a back-edge.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use jam_utils::{short_id, JamError, Result};

/// One switchable loop slot of the composition
#[derive(Debug, Clone)]
pub struct LoopNode {
    uid: String,
    parent: Option<String>,
    children: Vec<String>,
    selected_index: usize,
    sound_uids: BTreeSet<String>,
}

impl LoopNode {
    fn new(uid: String, parent: Option<String>) -> Self {
        Self {
            uid,
            parent,
            children: Vec::new(),
            selected_index: 0,
            sound_uids: BTreeSet::new(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn selected_index(&self) -> usize {
        self.selected_index
    }

    /// The child named by `selected_index`, if any
    pub fn selected_child(&self) -> Option<&str> {
        self.children.get(self.selected_index).map(String::as_str)
    }

    pub fn sound_uids(&self) -> &BTreeSet<String> {
        &self.sound_uids
    }

    /// Abbreviated form sent to clients
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            uid: self.uid.clone(),
            parent_uid: self.parent.clone(),
            children_uids: self.children.clone(),
            selected_index: self.selected_index,
            sound_uids: self.sound_uids.iter().cloned().collect(),
        }
    }
}

/// Wire form of a node: ids only
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub uid: String,
    pub parent_uid: Option<String>,
    pub children_uids: Vec<String>,
    pub selected_index: usize,
    pub sound_uids: Vec<String>,
}

/// What `delete_node` took out of the tree
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedSubtree {
    /// Parent the subtree hung from
    pub parent: String,
    /// Every removed uid, subtree root first
    pub removed: Vec<String>,
    /// Sounds that were owned by removed nodes
    pub orphaned_sounds: Vec<String>,
}

/// Tree of loop nodes with depth and width limits
#[derive(Debug)]
pub struct LoopTree {
    nodes: HashMap<String, LoopNode>,
    root: String,
    max_depth: usize,
    max_width: usize,
}

impl LoopTree {
    /// Create a tree holding only the root
    pub fn new(max_depth: usize, max_width: usize) -> Self {
        let root = short_id();
        let mut nodes = HashMap::new();
        nodes.insert(root.clone(), LoopNode::new(root.clone(), None));
        Self {
            nodes,
            root,
            max_depth,
            max_width,
        }
    }

    pub fn root_uid(&self) -> &str {
        &self.root
    }

    pub fn root(&self) -> &LoopNode {
        &self.nodes[&self.root]
    }

    pub fn get(&self, uid: &str) -> Option<&LoopNode> {
        self.nodes.get(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.nodes.contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn max_width(&self) -> usize {
        self.max_width
    }

    fn node(&self, uid: &str) -> Result<&LoopNode> {
        self.nodes
            .get(uid)
            .ok_or_else(|| JamError::NodeNotFound(uid.to_string()))
    }

    fn node_mut(&mut self, uid: &str) -> Result<&mut LoopNode> {
        self.nodes
            .get_mut(uid)
            .ok_or_else(|| JamError::NodeNotFound(uid.to_string()))
    }

    /// Distance from the root (root is 0)
    pub fn depth(&self, uid: &str) -> Result<usize> {
        let mut depth = 0;
        let mut current = self.node(uid)?;
        while let Some(parent) = current.parent.as_deref() {
            depth += 1;
            current = self.node(parent)?;
        }
        Ok(depth)
    }

    /// Attach a new empty node under `parent` (the root when `None`)
    pub fn add_node(&mut self, parent: Option<&str>) -> Result<String> {
        let parent_uid = parent.unwrap_or(&self.root).to_string();

        if self.depth(&parent_uid)? >= self.max_depth {
            return Err(JamError::DepthExceeded {
                max: self.max_depth,
            });
        }
        if self.node(&parent_uid)?.children.len() >= self.max_width {
            return Err(JamError::WidthExceeded {
                max: self.max_width,
            });
        }

        let uid = self.fresh_uid();
        self.nodes
            .insert(uid.clone(), LoopNode::new(uid.clone(), Some(parent_uid.clone())));
        self.node_mut(&parent_uid)?.children.push(uid.clone());
        Ok(uid)
    }

    /// Remove a node together with its subtree
    pub fn delete_node(&mut self, uid: &str) -> Result<RemovedSubtree> {
        let parent_uid = self
            .node(uid)?
            .parent
            .clone()
            .ok_or_else(|| JamError::validation("node", "the root node cannot be deleted"))?;

        let parent = self.node_mut(&parent_uid)?;
        if let Some(index) = parent.children.iter().position(|c| c == uid) {
            parent.children.remove(index);
            if parent.selected_index > index {
                parent.selected_index -= 1;
            } else if parent.selected_index >= parent.children.len() {
                parent.selected_index = parent.children.len().saturating_sub(1);
            }
        }

        let mut removed = Vec::new();
        let mut orphaned_sounds = Vec::new();
        let mut stack = vec![uid.to_string()];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                stack.extend(node.children.iter().rev().cloned());
                orphaned_sounds.extend(node.sound_uids);
                removed.push(next);
            }
        }

        Ok(RemovedSubtree {
            parent: parent_uid,
            removed,
            orphaned_sounds,
        })
    }

    /// Make `uid` the selected child of its parent; returns the parent uid
    pub fn select_node(&mut self, uid: &str) -> Result<String> {
        let parent_uid = self
            .node(uid)?
            .parent
            .clone()
            .ok_or_else(|| JamError::validation("node", "the root node cannot be selected"))?;
        let parent = self.node_mut(&parent_uid)?;
        let index = parent
            .children
            .iter()
            .position(|c| c == uid)
            .ok_or_else(|| JamError::internal(format!("{} missing from its parent", uid)))?;
        parent.selected_index = index;
        Ok(parent_uid)
    }

    /// Active composition: the root, then each selected child in turn
    pub fn chain(&self) -> Vec<&LoopNode> {
        let mut chain = Vec::new();
        let mut current = self.nodes.get(&self.root);
        while let Some(node) = current {
            chain.push(node);
            current = node.selected_child().and_then(|c| self.nodes.get(c));
        }
        chain
    }

    /// Sounds heard at `uid`: ancestors' sets root first, then its own
    pub fn effective_sounds(&self, uid: &str) -> Result<Vec<String>> {
        let mut lineage = vec![self.node(uid)?];
        while let Some(parent) = lineage[lineage.len() - 1].parent.as_deref() {
            lineage.push(self.node(parent)?);
        }
        Ok(lineage
            .iter()
            .rev()
            .flat_map(|node| node.sound_uids.iter().cloned())
            .collect())
    }

    /// All nodes in pre-order, root first
    pub fn summaries(&self) -> Vec<NodeSummary> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root.as_str()];
        while let Some(uid) = stack.pop() {
            if let Some(node) = self.nodes.get(uid) {
                out.push(node.summary());
                stack.extend(node.children.iter().rev().map(String::as_str));
            }
        }
        out
    }

    pub(crate) fn insert_sound(&mut self, node: &str, sound: &str) -> Result<()> {
        self.node_mut(node)?.sound_uids.insert(sound.to_string());
        Ok(())
    }

    pub(crate) fn remove_sound(&mut self, node: &str, sound: &str) -> bool {
        self.nodes
            .get_mut(node)
            .map(|n| n.sound_uids.remove(sound))
            .unwrap_or(false)
    }

    fn fresh_uid(&self) -> String {
        loop {
            let uid = short_id();
            if !self.nodes.contains_key(&uid) {
                return uid;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> LoopTree {
        LoopTree::new(4, 4)
    }

    #[test]
    fn test_new_tree_has_only_root() {
        let tree = tree();
        assert_eq!(tree.len(), 1);
        assert!(tree.root().parent().is_none());
        assert_eq!(tree.depth(tree.root_uid()).unwrap(), 0);
    }

    #[test]
    fn test_add_node_defaults_to_root() {
        let mut tree = tree();
        let uid = tree.add_node(None).unwrap();
        assert_eq!(tree.root().children(), &[uid.clone()]);
        assert_eq!(tree.get(&uid).unwrap().parent(), Some(tree.root_uid()));
        assert!(tree.get(&uid).unwrap().sound_uids().is_empty());
    }

    #[test]
    fn test_width_limit() {
        let mut tree = tree();
        for _ in 0..4 {
            tree.add_node(None).unwrap();
        }
        assert!(matches!(
            tree.add_node(None),
            Err(JamError::WidthExceeded { max: 4 })
        ));
        assert_eq!(tree.root().children().len(), 4);
    }

    #[test]
    fn test_depth_limit_applies_regardless_of_width() {
        let mut tree = tree();
        let mut parent = tree.root_uid().to_string();
        for _ in 0..4 {
            parent = tree.add_node(Some(&parent)).unwrap();
        }
        assert_eq!(tree.depth(&parent).unwrap(), 4);
        // The depth-4 node has no children, so only depth can refuse it
        assert!(matches!(
            tree.add_node(Some(&parent)),
            Err(JamError::DepthExceeded { max: 4 })
        ));
    }

    #[test]
    fn test_add_node_unknown_parent() {
        let mut tree = tree();
        assert!(matches!(
            tree.add_node(Some("nope")),
            Err(JamError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_delete_node_really_removes() {
        let mut tree = tree();
        let a = tree.add_node(None).unwrap();
        let b = tree.add_node(None).unwrap();
        let a_child = tree.add_node(Some(&a)).unwrap();

        let removed = tree.delete_node(&a).unwrap();
        assert_eq!(removed.parent, tree.root_uid());
        assert_eq!(removed.removed, vec![a.clone(), a_child.clone()]);
        assert_eq!(tree.root().children(), &[b]);
        assert!(tree.get(&a).is_none());
        assert!(tree.get(&a_child).is_none());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_delete_node_not_found() {
        let mut tree = tree();
        assert!(matches!(
            tree.delete_node("missing"),
            Err(JamError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_delete_root_is_refused() {
        let mut tree = tree();
        let root = tree.root_uid().to_string();
        assert!(matches!(
            tree.delete_node(&root),
            Err(JamError::Validation { .. })
        ));
    }

    #[test]
    fn test_delete_keeps_selection_on_same_node() {
        let mut tree = tree();
        let a = tree.add_node(None).unwrap();
        let b = tree.add_node(None).unwrap();
        let c = tree.add_node(None).unwrap();
        tree.select_node(&c).unwrap();

        tree.delete_node(&a).unwrap();
        assert_eq!(tree.root().selected_child(), Some(c.as_str()));

        tree.delete_node(&c).unwrap();
        assert_eq!(tree.root().selected_child(), Some(b.as_str()));

        tree.delete_node(&b).unwrap();
        assert_eq!(tree.root().selected_index(), 0);
        assert!(tree.root().selected_child().is_none());
    }

    #[test]
    fn test_delete_reports_orphaned_sounds() {
        let mut tree = tree();
        let a = tree.add_node(None).unwrap();
        let child = tree.add_node(Some(&a)).unwrap();
        tree.insert_sound(&child, "kick").unwrap();

        let removed = tree.delete_node(&a).unwrap();
        assert_eq!(removed.orphaned_sounds, vec!["kick".to_string()]);
    }

    #[test]
    fn test_chain_follows_selected_children() {
        let mut tree = tree();
        let a = tree.add_node(None).unwrap();
        let b = tree.add_node(None).unwrap();
        let b1 = tree.add_node(Some(&b)).unwrap();
        let _b2 = tree.add_node(Some(&b)).unwrap();
        let _a1 = tree.add_node(Some(&a)).unwrap();

        let uids = |tree: &LoopTree| -> Vec<String> {
            tree.chain().iter().map(|n| n.uid().to_string()).collect()
        };

        // Default selection is the first child
        assert_eq!(uids(&tree)[1], a);

        tree.select_node(&b1).unwrap();
        tree.select_node(&b).unwrap();
        assert_eq!(uids(&tree), vec![tree.root_uid().to_string(), b, b1]);
        // Restartable: same answer twice
        assert_eq!(uids(&tree), uids(&tree));
    }

    #[test]
    fn test_chain_of_empty_tree_is_root() {
        let tree = tree();
        let chain = tree.chain();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].uid(), tree.root_uid());
    }

    #[test]
    fn test_effective_sounds_inherit_root_first() {
        let mut tree = tree();
        let root = tree.root_uid().to_string();
        let a = tree.add_node(None).unwrap();
        let a1 = tree.add_node(Some(&a)).unwrap();
        tree.insert_sound(&root, "drone").unwrap();
        tree.insert_sound(&a, "bass").unwrap();
        tree.insert_sound(&a1, "hat").unwrap();

        assert_eq!(
            tree.effective_sounds(&a1).unwrap(),
            vec!["drone".to_string(), "bass".to_string(), "hat".to_string()]
        );
        // Inheritance does not copy anything into the node itself
        assert_eq!(tree.get(&a1).unwrap().sound_uids().len(), 1);
    }

    #[test]
    fn test_summaries_are_preorder_and_acyclic() {
        let mut tree = tree();
        let a = tree.add_node(None).unwrap();
        let a1 = tree.add_node(Some(&a)).unwrap();
        let b = tree.add_node(None).unwrap();

        let order: Vec<String> = tree.summaries().into_iter().map(|s| s.uid).collect();
        assert_eq!(order, vec![tree.root_uid().to_string(), a, a1, b]);

        let root = &tree.summaries()[0];
        assert!(root.parent_uid.is_none());
        assert_eq!(root.children_uids.len(), 2);
    }
}
