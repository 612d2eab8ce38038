// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;

use itertools::Itertools;
use tracing::trace;

use super::lookup::{resolve_group_references, Lookup};
use crate::cost::{Cost, Statistics};
use crate::error::{MemoError, MemoResult};
use crate::nodes::{
    ArcPlanNode, GroupReference, IdAllocator, NodeType, PlanNode, PlanNodeOrGroup, Symbol,
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct GroupId(pub(crate) usize);

impl GroupId {
    /// The referrer recorded on the root group so that it is never collected. No group has this id.
    pub const ROOT_REFERENCE: GroupId = GroupId(0);
}

impl Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "!{}", self.0)
    }
}

struct Group<T: NodeType> {
    /// The current expression of the group. Either a node whose children are all group references,
    /// or a bare group reference when the group was found to be equivalent to another group.
    membership: PlanNodeOrGroup<T>,
    /// Referencing group -> number of references it holds on this group.
    incoming_references: HashMap<GroupId, usize>,
    statistics: Option<Arc<Statistics>>,
    cost: Option<Cost>,
}

impl<T: NodeType> Group<T> {
    fn with_member(membership: PlanNodeOrGroup<T>) -> Self {
        Self {
            membership,
            incoming_references: HashMap::new(),
            statistics: None,
            cost: None,
        }
    }

    fn add_reference(&mut self, from: GroupId) {
        *self.incoming_references.entry(from).or_default() += 1;
    }

    /// Returns false if `from` holds no reference on this group.
    fn remove_reference(&mut self, from: GroupId) -> bool {
        match self.incoming_references.entry(from) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    fn evict_statistics_and_cost(&mut self) {
        self.statistics = None;
        self.cost = None;
    }
}

/// Groups referenced by a membership, one entry per occurrence.
fn references<T: NodeType>(membership: &PlanNodeOrGroup<T>) -> Vec<GroupId> {
    match membership {
        PlanNodeOrGroup::Group(group) => vec![group.group_id],
        PlanNodeOrGroup::PlanNode(node) => node
            .children
            .iter()
            .filter_map(PlanNodeOrGroup::as_group_reference)
            .map(|group| group.group_id)
            .collect(),
    }
}

/// Group references reachable from `node` without crossing another reference.
fn collect_group_references<T: NodeType>(node: &PlanNodeOrGroup<T>, out: &mut Vec<GroupId>) {
    match node {
        PlanNodeOrGroup::Group(group) => out.push(group.group_id),
        PlanNodeOrGroup::PlanNode(node) => {
            for child in &node.children {
                collect_group_references(child, out);
            }
        }
    }
}

fn output_set(outputs: &[Symbol]) -> BTreeSet<&Symbol> {
    outputs.iter().collect()
}

/// Stores a plan in a form that is cheap to mutate locally: rewriting a node does not require
/// rebuilding its ancestors.
///
/// Every node of the plan is placed in its own group, and its children are replaced with references
/// to the corresponding groups. For example, the plan
///
/// ```text
/// A -> B -> C -> D
///        \> E -> F
/// ```
///
/// is stored as
///
/// ```text
/// root: !1
///
/// !1: (A !2)
/// !2: (B !3 !5)
/// !3: (C !4)
/// !4: (D)
/// !5: (E !6)
/// !6: (F)
/// ```
///
/// Groups are reference-counted, and groups that become unreachable from the root after a rewrite
/// are garbage-collected.
pub struct Memo<T: NodeType> {
    id_allocator: Arc<dyn IdAllocator>,
    root_group: GroupId,
    groups: HashMap<GroupId, Group<T>>,
    next_group_id: usize,
    /// Set when a mutation failed halfway. The table can no longer be trusted after that.
    poisoned: bool,
}

impl<T: NodeType> Memo<T> {
    pub fn new(
        id_allocator: Arc<dyn IdAllocator>,
        plan: impl Into<PlanNodeOrGroup<T>>,
    ) -> MemoResult<Self> {
        let mut memo = Self {
            id_allocator,
            root_group: GroupId::ROOT_REFERENCE,
            groups: HashMap::new(),
            next_group_id: GroupId::ROOT_REFERENCE.0 + 1,
            poisoned: false,
        };
        let root_group = memo.insert_recursive(&plan.into())?;
        memo.root_group = root_group;
        memo.group_mut(root_group)?
            .add_reference(GroupId::ROOT_REFERENCE);
        memo.verify_integrity();
        Ok(memo)
    }

    pub fn root_group(&self) -> GroupId {
        self.root_group
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn id_allocator(&self) -> &dyn IdAllocator {
        self.id_allocator.as_ref()
    }

    /// Get all group IDs in the memo table, sorted.
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().sorted().collect()
    }

    fn check_poisoned(&self) -> MemoResult<()> {
        if self.poisoned {
            return Err(MemoError::Poisoned);
        }
        Ok(())
    }

    fn group(&self, group_id: GroupId) -> MemoResult<&Group<T>> {
        self.check_poisoned()?;
        self.groups
            .get(&group_id)
            .ok_or(MemoError::UnknownGroup(group_id))
    }

    fn group_mut(&mut self, group_id: GroupId) -> MemoResult<&mut Group<T>> {
        self.check_poisoned()?;
        self.groups
            .get_mut(&group_id)
            .ok_or(MemoError::UnknownGroup(group_id))
    }

    /// The current expression of a group, with its children left as group references.
    pub fn get_node(&self, group_id: GroupId) -> MemoResult<PlanNodeOrGroup<T>> {
        Ok(self.group(group_id)?.membership.clone())
    }

    /// Resolve a reference to the node it designates. Groups that were collapsed into another group
    /// are followed until a plan node is found; the result's children are group references.
    pub fn resolve(&self, group: &GroupReference) -> MemoResult<ArcPlanNode<T>> {
        let mut group_id = group.group_id;
        loop {
            match &self.group(group_id)?.membership {
                PlanNodeOrGroup::PlanNode(node) => return Ok(node.clone()),
                PlanNodeOrGroup::Group(forward) => group_id = forward.group_id,
            }
        }
    }

    /// Mint a new reference to a group, for rules that want to say "this subtree is equivalent to
    /// that group".
    pub fn group_reference(&self, group_id: GroupId) -> MemoResult<GroupReference> {
        let outputs = self.group(group_id)?.membership.outputs();
        Ok(GroupReference {
            id: self.id_allocator.next_id(),
            group_id,
            outputs: outputs.into(),
        })
    }

    /// Materialize the whole plan starting at the root group.
    pub fn extract(&self) -> MemoResult<ArcPlanNode<T>> {
        let root = self.get_node(self.root_group)?;
        resolve_group_references(&root, self)
    }

    /// Install `node` as the new expression of `group_id` and return the expression actually
    /// stored: children of `node` that are not group references yet are inserted into new groups.
    ///
    /// `node` must produce the same set of outputs as the current expression, and must not make the
    /// group reachable from itself. Either violation leaves the memo untouched. `reason` (usually the
    /// rule name) is attached to the error.
    pub fn replace(
        &mut self,
        group_id: GroupId,
        node: impl Into<PlanNodeOrGroup<T>>,
        reason: &str,
    ) -> MemoResult<PlanNodeOrGroup<T>> {
        let node = node.into();
        let old = self.group(group_id)?.membership.clone();

        let expected = old.outputs();
        let actual = node.outputs();
        if output_set(&expected) != output_set(&actual) {
            return Err(MemoError::OutputContractViolation {
                group_id,
                reason: reason.to_string(),
                expected,
                actual,
            });
        }
        self.check_acyclic(group_id, &node, reason)?;

        let node = self.poison_on_error(|memo| {
            let node = match node {
                PlanNodeOrGroup::Group(target) => {
                    trace!(event = "alias_group", group_id = %group_id, target = %target.group_id);
                    PlanNodeOrGroup::Group(target)
                }
                PlanNodeOrGroup::PlanNode(node) => memo.insert_children_and_rewrite(&node)?.into(),
            };
            // Increment first: a group referenced by both the old and the new expression must not
            // drop to zero in between.
            memo.increment_reference_counts(&node, group_id)?;
            memo.group_mut(group_id)?.membership = node.clone();
            memo.decrement_reference_counts(&old, group_id)?;
            Ok(node)
        })?;
        trace!(event = "replace", group_id = %group_id, reason = reason, old = %old, new = %node);
        self.evict_statistics_and_cost(group_id);
        self.verify_integrity();
        Ok(node)
    }

    fn poison_on_error<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> MemoResult<R>,
    ) -> MemoResult<R> {
        let result = f(self);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// Rejects `node` if any group it references can reach `group_id`, which would close a cycle
    /// once `node` is installed in `group_id`.
    fn check_acyclic(
        &self,
        group_id: GroupId,
        node: &PlanNodeOrGroup<T>,
        reason: &str,
    ) -> MemoResult<()> {
        let mut targets = Vec::new();
        collect_group_references(node, &mut targets);
        let mut visited = HashSet::new();
        for target in targets {
            let mut stack = vec![target];
            while let Some(current) = stack.pop() {
                if current == group_id {
                    return Err(MemoError::AcyclicityViolation {
                        group_id,
                        target,
                        reason: reason.to_string(),
                    });
                }
                if !visited.insert(current) {
                    continue;
                }
                stack.extend(references(&self.group(current)?.membership));
            }
        }
        Ok(())
    }

    /// Clear the cached estimates of a group and of every group that (transitively) references it.
    fn evict_statistics_and_cost(&mut self, group_id: GroupId) {
        let mut visited = HashSet::new();
        let mut stack = vec![group_id];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(group) = self.groups.get_mut(&current) else {
                continue;
            };
            trace!(event = "evict_group_cache", group_id = %current);
            group.evict_statistics_and_cost();
            stack.extend(
                group
                    .incoming_references
                    .keys()
                    .copied()
                    .filter(|referrer| *referrer != GroupId::ROOT_REFERENCE),
            );
        }
    }

    fn increment_reference_counts(
        &mut self,
        from_node: &PlanNodeOrGroup<T>,
        from_group: GroupId,
    ) -> MemoResult<()> {
        for group_id in references(from_node) {
            self.group_mut(group_id)?.add_reference(from_group);
        }
        Ok(())
    }

    fn decrement_reference_counts(
        &mut self,
        from_node: &PlanNodeOrGroup<T>,
        from_group: GroupId,
    ) -> MemoResult<()> {
        for group_id in references(from_node) {
            let group = self.group_mut(group_id)?;
            if !group.remove_reference(from_group) {
                return Err(MemoError::ReferenceAccountingViolation {
                    group_id,
                    detail: format!("reference from {} to remove not found", from_group),
                });
            }
            if group.incoming_references.is_empty() {
                self.delete_group(group_id)?;
            }
        }
        Ok(())
    }

    fn delete_group(&mut self, group_id: GroupId) -> MemoResult<()> {
        let referrers = &self.group(group_id)?.incoming_references;
        if !referrers.is_empty() {
            return Err(MemoError::ReferenceAccountingViolation {
                group_id,
                detail: format!(
                    "cannot delete group that is still referenced by {}",
                    referrers.keys().sorted().join(", ")
                ),
            });
        }
        let group = self
            .groups
            .remove(&group_id)
            .ok_or(MemoError::UnknownGroup(group_id))?;
        trace!(event = "delete_group", group_id = %group_id, node = %group.membership);
        self.decrement_reference_counts(&group.membership, group_id)
    }

    fn insert_children_and_rewrite(&mut self, node: &PlanNode<T>) -> MemoResult<PlanNode<T>> {
        let mut children = Vec::with_capacity(node.children.len());
        for child in &node.children {
            let group_id = self.insert_recursive(child)?;
            let outputs = self.group(group_id)?.membership.outputs();
            children.push(PlanNodeOrGroup::Group(GroupReference {
                id: self.id_allocator.next_id(),
                group_id,
                outputs: outputs.into(),
            }));
        }
        Ok(node.with_children(children))
    }

    fn insert_recursive(&mut self, node: &PlanNodeOrGroup<T>) -> MemoResult<GroupId> {
        let node = match node {
            PlanNodeOrGroup::Group(group) => {
                self.group(group.group_id)?;
                return Ok(group.group_id);
            }
            PlanNodeOrGroup::PlanNode(node) => node,
        };
        let group_id = self.next_group_id();
        let rewritten: PlanNodeOrGroup<T> = self.insert_children_and_rewrite(node)?.into();
        trace!(event = "insert_group", group_id = %group_id, node = %rewritten);
        self.groups
            .insert(group_id, Group::with_member(rewritten.clone()));
        self.increment_reference_counts(&rewritten, group_id)?;
        Ok(group_id)
    }

    fn next_group_id(&mut self) -> GroupId {
        let id = self.next_group_id;
        self.next_group_id += 1;
        GroupId(id)
    }

    /// Referencing groups and the number of references each holds, sorted by referrer. The root
    /// group reports one reference from [`GroupId::ROOT_REFERENCE`].
    pub fn incoming_references(&self, group_id: GroupId) -> MemoResult<Vec<(GroupId, usize)>> {
        Ok(self
            .group(group_id)?
            .incoming_references
            .iter()
            .map(|(referrer, count)| (*referrer, *count))
            .sorted()
            .collect())
    }

    pub fn reference_count(&self, group_id: GroupId) -> MemoResult<usize> {
        Ok(self.group(group_id)?.incoming_references.values().sum())
    }

    pub fn statistics(&self, group_id: GroupId) -> MemoResult<Option<Arc<Statistics>>> {
        Ok(self.group(group_id)?.statistics.clone())
    }

    pub fn store_statistics(
        &mut self,
        group_id: GroupId,
        statistics: Arc<Statistics>,
    ) -> MemoResult<()> {
        self.group_mut(group_id)?.statistics = Some(statistics);
        Ok(())
    }

    pub fn cost(&self, group_id: GroupId) -> MemoResult<Option<Cost>> {
        Ok(self.group(group_id)?.cost.clone())
    }

    pub fn store_cost(&mut self, group_id: GroupId, cost: Cost) -> MemoResult<()> {
        self.group_mut(group_id)?.cost = Some(cost);
        Ok(())
    }

    /// Recompute the reference counts from the group expressions and check them against the
    /// recorded ones, together with the shape of the group graph: every expression fully grouped,
    /// every group reachable from the root, no cycles.
    pub fn check_integrity(&self) -> MemoResult<()> {
        self.check_poisoned()?;
        let mut expected: HashMap<GroupId, HashMap<GroupId, usize>> = HashMap::new();
        expected
            .entry(self.root_group)
            .or_default()
            .insert(GroupId::ROOT_REFERENCE, 1);
        for (&group_id, group) in &self.groups {
            if group.membership.children().iter().any(|x| x.is_materialized()) {
                return Err(MemoError::ReferenceAccountingViolation {
                    group_id,
                    detail: format!("expression {} is not fully grouped", group.membership),
                });
            }
            for target in references(&group.membership) {
                if !self.groups.contains_key(&target) {
                    return Err(MemoError::UnknownGroup(target));
                }
                *expected
                    .entry(target)
                    .or_default()
                    .entry(group_id)
                    .or_default() += 1;
            }
        }
        for (&group_id, group) in &self.groups {
            let expected = expected.remove(&group_id).unwrap_or_default();
            if expected != group.incoming_references {
                return Err(MemoError::ReferenceAccountingViolation {
                    group_id,
                    detail: format!(
                        "recorded references {:?} but expressions hold {:?}",
                        group.incoming_references.iter().sorted().collect_vec(),
                        expected.iter().sorted().collect_vec()
                    ),
                });
            }
        }

        // false: on the current path, true: done
        let mut state = HashMap::new();
        self.visit_acyclic(self.root_group, &mut state)?;
        if let Some(unreachable) = self.group_ids().into_iter().find(|x| !state.contains_key(x)) {
            return Err(MemoError::ReferenceAccountingViolation {
                group_id: unreachable,
                detail: "group is not reachable from the root".to_string(),
            });
        }
        Ok(())
    }

    fn visit_acyclic(
        &self,
        group_id: GroupId,
        state: &mut HashMap<GroupId, bool>,
    ) -> MemoResult<()> {
        match state.get(&group_id) {
            Some(true) => return Ok(()),
            Some(false) => {
                return Err(MemoError::AcyclicityViolation {
                    group_id,
                    target: group_id,
                    reason: "integrity check".to_string(),
                })
            }
            None => {}
        }
        state.insert(group_id, false);
        for child in references(&self.group(group_id)?.membership) {
            self.visit_acyclic(child, state)?;
        }
        state.insert(group_id, true);
        Ok(())
    }

    fn verify_integrity(&self) {
        if cfg!(debug_assertions) {
            if let Err(err) = self.check_integrity() {
                panic!("memo integrity violated: {}\n{}", err, self);
            }
        }
    }
}

impl<T: NodeType> Lookup<T> for Memo<T> {
    fn resolve_group(&self, group: &GroupReference) -> MemoResult<ArcPlanNode<T>> {
        self.resolve(group)
    }
}

impl<T: NodeType> Display for Memo<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "root: {}", self.root_group)?;
        for group_id in self.group_ids() {
            let group = &self.groups[&group_id];
            let referrers = group
                .incoming_references
                .iter()
                .sorted()
                .map(|(referrer, count)| {
                    let referrer = if *referrer == GroupId::ROOT_REFERENCE {
                        "root".to_string()
                    } else {
                        referrer.to_string()
                    };
                    if *count > 1 {
                        format!("{referrer}x{count}")
                    } else {
                        referrer
                    }
                })
                .join(", ");
            writeln!(f, "{}: {} <- [{}]", group_id, group.membership, referrers)?;
        }
        Ok(())
    }
}
