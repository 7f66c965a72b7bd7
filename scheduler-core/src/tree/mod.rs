//! A pool tree: the live mutable structure and the immutable snapshots the
//! fair-share updater and scheduling state machine operate on (spec §3
//! "Pool tree", §4.1 step 1 "Clone", §9 "Shared mutable state").
//!
//! Elements are keyed by id in a `BTreeMap` for deterministic iteration
//! order (child ordering affects FIFO tie-breaks and test reproducibility),
//! then flattened into a `tree_index`-addressed array on every clone so the
//! update passes and the per-heartbeat dynamic-attributes vector can be
//! plain `Vec` indexing instead of map lookups.

use std::collections::BTreeMap;

use crate::element::attributes::DynamicAttributes;
use crate::element::{Element, OperationElement, PoolElement, RootElement};
use crate::error::ConfigError;

/// The mutable tree as maintained by the tree host between updates (spec
/// §9 "the live tree and its snapshot are two logical data structures").
#[derive(Debug, Clone)]
pub struct LiveTree {
    pub tree_id: String,
    elements: BTreeMap<String, Element>,
}

impl LiveTree {
    pub fn new(tree_id: impl Into<String>) -> Self {
        let tree_id = tree_id.into();
        let mut elements = BTreeMap::new();
        elements.insert(tree_id.clone(), Element::Root(RootElement::new(tree_id.clone())));
        Self { tree_id, elements }
    }

    pub fn insert_pool(&mut self, pool: PoolElement) -> Result<(), ConfigError> {
        if self.elements.contains_key(&pool.common.id) {
            return Err(ConfigError::DuplicatePool(pool.common.id.clone()));
        }
        let parent = pool.common.parent.clone();
        let id = pool.common.id.clone();
        self.elements.insert(id.clone(), Element::Pool(pool));
        self.attach_child(&id, parent)
    }

    pub fn insert_operation(&mut self, operation: OperationElement) -> Result<(), ConfigError> {
        if self.elements.contains_key(&operation.common.id) {
            return Err(ConfigError::DuplicatePool(operation.common.id.clone()));
        }
        let parent = operation.common.parent.clone();
        let id = operation.common.id.clone();
        self.elements.insert(id.clone(), Element::Operation(Box::new(operation)));
        self.attach_child(&id, parent)
    }

    pub fn remove(&mut self, id: &str) -> Option<Element> {
        if let Some(element) = self.elements.get(id) {
            if let Some(parent) = element.parent().map(str::to_string) {
                if let Some(Element::Root(r)) = self.elements.get_mut(&parent) {
                    r.children.retain(|c| c != id);
                } else if let Some(Element::Pool(p)) = self.elements.get_mut(&parent) {
                    p.children.retain(|c| c != id);
                }
            }
        }
        self.elements.remove(id)
    }

    fn attach_child(&mut self, id: &str, parent: Option<String>) -> Result<(), ConfigError> {
        let Some(parent_id) = parent else { return Ok(()) };
        match self.elements.get_mut(&parent_id) {
            Some(Element::Root(r)) => {
                r.children.push(id.to_string());
                Ok(())
            }
            Some(Element::Pool(p)) => {
                p.children.push(id.to_string());
                Ok(())
            }
            Some(Element::Operation(_)) => Err(ConfigError::InvalidField {
                field: "parent".into(),
                reason: format!("'{parent_id}' is an operation, which cannot have children"),
            }),
            None => Err(ConfigError::UnknownParent(parent_id)),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Element> {
        self.elements.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Clone into an immutable, `tree_index`-addressed working copy (spec
    /// §4.1 step 1). Cycles are rejected here rather than at insertion time
    /// since a cycle can only be introduced by a dangling parent rewrite
    /// that insertion's per-call checks don't see in isolation.
    pub fn snapshot(&self) -> Result<TreeSnapshot, ConfigError> {
        let mut tree_index = BTreeMap::new();
        let mut elements = Vec::with_capacity(self.elements.len());
        let mut parent = Vec::with_capacity(self.elements.len());
        let mut children: Vec<Vec<usize>> = Vec::with_capacity(self.elements.len());

        let mut visiting = std::collections::HashSet::new();
        let mut stack = vec![self.tree_id.clone()];
        let mut order = Vec::new();
        while let Some(id) = stack.pop() {
            if !visiting.insert(id.clone()) {
                return Err(ConfigError::Cycle(id));
            }
            order.push(id.clone());
            if let Some(element) = self.elements.get(&id) {
                for child in element.children().iter().rev() {
                    stack.push(child.clone());
                }
            }
        }

        for id in &order {
            let element = self.elements.get(id).cloned().ok_or_else(|| ConfigError::UnknownParent(id.clone()))?;
            tree_index.insert(id.clone(), elements.len());
            elements.push(element);
            children.push(Vec::new());
        }
        for (idx, id) in order.iter().enumerate() {
            let element = &elements[idx];
            let parent_idx = element.parent().and_then(|p| tree_index.get(p)).copied();
            parent.push(parent_idx);
            if let Some(p) = parent_idx {
                children[p].push(idx);
            }
        }

        let attributes = vec![DynamicAttributes::default(); elements.len()];
        let root_index = *tree_index.get(&self.tree_id).expect("root always present");

        Ok(TreeSnapshot {
            tree_id: self.tree_id.clone(),
            elements,
            parent,
            children,
            attributes,
            index_of: tree_index,
            root_index,
        })
    }
}

/// An immutable, `tree_index`-addressed clone of a [`LiveTree`], produced
/// once per fair-share update (spec §4.1 step 1) and read by every
/// subsequent heartbeat until the next update publishes a new one.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    pub tree_id: String,
    pub elements: Vec<Element>,
    pub parent: Vec<Option<usize>>,
    pub children: Vec<Vec<usize>>,
    pub attributes: Vec<DynamicAttributes>,
    index_of: BTreeMap<String, usize>,
    pub root_index: usize,
}

impl TreeSnapshot {
    pub fn tree_size(&self) -> usize {
        self.elements.len()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index_of.get(id).copied()
    }

    /// Post-order traversal (children before parent), used by the
    /// bottom-up update pass (spec §4.1 step 3).
    pub fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.elements.len());
        let mut stack = vec![(self.root_index, false)];
        while let Some((idx, expanded)) = stack.pop() {
            if expanded {
                order.push(idx);
            } else {
                stack.push((idx, true));
                for &child in self.children[idx].iter().rev() {
                    stack.push((child, false));
                }
            }
        }
        order
    }

    /// Pre-order traversal (parent before children), used by the top-down
    /// update pass (spec §4.1 step 4).
    pub fn pre_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.elements.len());
        let mut stack = vec![self.root_index];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            for &child in self.children[idx].iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    pub fn ancestors(&self, mut idx: usize) -> Vec<usize> {
        let mut result = Vec::new();
        while let Some(p) = self.parent[idx] {
            result.push(p);
            idx = p;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> LiveTree {
        let mut tree = LiveTree::new("tree1");
        tree.insert_pool(PoolElement::new("research", "tree1")).unwrap();
        tree.insert_pool(PoolElement::new("gpu_team", "research")).unwrap();
        tree.insert_operation(OperationElement::new("op1", "gpu_team")).unwrap();
        tree
    }

    #[test]
    fn snapshot_assigns_parent_before_children_in_pre_order() {
        let tree = sample_tree();
        let snap = tree.snapshot().unwrap();
        assert_eq!(snap.tree_size(), 4);
        let pre = snap.pre_order();
        let pos = |id: &str| pre.iter().position(|&i| snap.elements[i].id() == id).unwrap();
        assert!(pos("tree1") < pos("research"));
        assert!(pos("research") < pos("gpu_team"));
        assert!(pos("gpu_team") < pos("op1"));
    }

    #[test]
    fn post_order_visits_children_before_parent() {
        let tree = sample_tree();
        let snap = tree.snapshot().unwrap();
        let post = snap.post_order();
        let pos = |id: &str| post.iter().position(|&i| snap.elements[i].id() == id).unwrap();
        assert!(pos("op1") < pos("gpu_team"));
        assert!(pos("gpu_team") < pos("research"));
        assert!(pos("research") < pos("tree1"));
    }

    #[test]
    fn ancestors_walk_to_root() {
        let tree = sample_tree();
        let snap = tree.snapshot().unwrap();
        let op_idx = snap.index_of("op1").unwrap();
        let ancestor_ids: Vec<&str> = snap.ancestors(op_idx).iter().map(|&i| snap.elements[i].id()).collect();
        assert_eq!(ancestor_ids, vec!["gpu_team", "research", "tree1"]);
    }

    #[test]
    fn unknown_parent_is_rejected_on_insert() {
        let mut tree = LiveTree::new("tree1");
        let err = tree.insert_pool(PoolElement::new("orphan", "nonexistent")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownParent(_)));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut tree = sample_tree();
        let err = tree.insert_pool(PoolElement::new("research", "tree1")).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePool(_)));
    }

    #[test]
    fn remove_detaches_from_parent_children_list() {
        let mut tree = sample_tree();
        tree.remove("op1");
        let snap = tree.snapshot().unwrap();
        assert_eq!(snap.tree_size(), 3);
    }
}
