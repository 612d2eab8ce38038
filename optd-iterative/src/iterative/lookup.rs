// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::sync::Arc;

use crate::error::MemoResult;
use crate::nodes::{ArcPlanNode, GroupReference, NodeType, PlanNodeOrGroup};

/// Resolves group references for rule code, one level at a time.
pub trait Lookup<T: NodeType> {
    /// Returns the node the group currently holds. Children of the returned node are still group
    /// references. A group that was collapsed into another one resolves to the content of the
    /// group it forwards to.
    fn resolve_group(&self, group: &GroupReference) -> MemoResult<ArcPlanNode<T>>;

    /// Like [`Lookup::resolve_group`], but materialized nodes are returned as they are.
    fn resolve(&self, node: &PlanNodeOrGroup<T>) -> MemoResult<ArcPlanNode<T>> {
        match node {
            PlanNodeOrGroup::PlanNode(node) => Ok(node.clone()),
            PlanNodeOrGroup::Group(group) => self.resolve_group(group),
        }
    }
}

/// Replace every group reference below `node` with the content of its group, producing a plan with
/// no references left.
pub fn resolve_group_references<T: NodeType, L: Lookup<T> + ?Sized>(
    node: &PlanNodeOrGroup<T>,
    lookup: &L,
) -> MemoResult<ArcPlanNode<T>> {
    let node = lookup.resolve(node)?;
    if node.children.is_empty() {
        return Ok(node);
    }
    let children = node
        .children
        .iter()
        .map(|child| resolve_group_references(child, lookup).map(PlanNodeOrGroup::PlanNode))
        .collect::<MemoResult<Vec<_>>>()?;
    Ok(Arc::new(node.with_children(children)))
}

/// Resolve `depth` levels of group references starting at `node`. References deeper than that are
/// left in place, so a rule only pays for the part of the plan it inspects.
pub fn expand<T: NodeType, L: Lookup<T> + ?Sized>(
    node: &PlanNodeOrGroup<T>,
    lookup: &L,
    depth: usize,
) -> MemoResult<PlanNodeOrGroup<T>> {
    if depth == 0 {
        return Ok(node.clone());
    }
    let node = lookup.resolve(node)?;
    let children = node
        .children
        .iter()
        .map(|child| expand(child, lookup, depth - 1))
        .collect::<MemoResult<Vec<_>>>()?;
    Ok(node.with_children(children).into())
}
