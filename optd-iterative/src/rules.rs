// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use anyhow::Result;

use crate::error::MemoResult;
use crate::iterative::{expand, GroupId, Lookup};
use crate::nodes::{ArcPlanNode, IdAllocator, NodeType, PlanNodeOrGroup};

/// What a rule can see besides the node it is applied to.
pub struct RuleContext<'a, T: NodeType> {
    group_id: GroupId,
    lookup: &'a dyn Lookup<T>,
    id_allocator: &'a dyn IdAllocator,
}

impl<'a, T: NodeType> RuleContext<'a, T> {
    pub fn new(
        group_id: GroupId,
        lookup: &'a dyn Lookup<T>,
        id_allocator: &'a dyn IdAllocator,
    ) -> Self {
        Self {
            group_id,
            lookup,
            id_allocator,
        }
    }

    /// The group holding the node the rule is applied to.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn id_allocator(&self) -> &'a dyn IdAllocator {
        self.id_allocator
    }

    pub fn resolve(&self, node: &PlanNodeOrGroup<T>) -> MemoResult<ArcPlanNode<T>> {
        self.lookup.resolve(node)
    }

    /// Resolve `depth` levels below `node`, see [`expand`].
    pub fn expand(
        &self,
        node: &PlanNodeOrGroup<T>,
        depth: usize,
    ) -> MemoResult<PlanNodeOrGroup<T>> {
        expand(node, self.lookup, depth)
    }
}

/// A local rewrite. The node handed to `apply` is the current expression of a group, so its
/// children are group references; a rule resolves the ones it needs to look into.
///
/// Returning `Some` proposes a replacement for the whole group. The replacement may reuse the
/// group references it was given, and may be a bare group reference to declare the group
/// equivalent to another one. It must produce the same set of outputs as `node`.
pub trait Rule<T: NodeType>: 'static + Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        node: &ArcPlanNode<T>,
        ctx: &RuleContext<'_, T>,
    ) -> Result<Option<PlanNodeOrGroup<T>>>;
}
