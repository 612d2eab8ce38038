// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The plan node is the basic data structure of the optimizer. Plan nodes are immutable, and a
//! child is either a materialized plan node or a reference to a group of the memo.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use itertools::Itertools;

use crate::iterative::GroupId;

/// Constants carried by predicates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Int64(i64),
    String(Arc<str>),
    Bool(bool),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int64(x) => write!(f, "{x}(i64)"),
            Self::String(x) => write!(f, "\"{x}\""),
            Self::Bool(x) => write!(f, "{x}"),
        }
    }
}

/// The `as_*()` functions do not perform conversions.
impl Value {
    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Int64(i) => *i,
            _ => panic!("Value is not an i64"),
        }
    }

    pub fn as_str(&self) -> Arc<str> {
        match self {
            Value::String(i) => i.clone(),
            _ => panic!("Value is not a string"),
        }
    }
}

/// The name of a column produced by a plan node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The node kinds of the planner. The memo treats node kinds opaquely: all it needs is the ability
/// to derive the outputs of a node.
pub trait NodeType:
    PartialEq + Eq + Hash + Clone + 'static + Display + Debug + Send + Sync
{
    type PredType: PartialEq + Eq + Hash + Clone + 'static + Display + Debug + Send + Sync;

    /// Derive the output symbols of a node of this type from its predicates and the outputs of its
    /// children, in child order. The result must only depend on the arguments: a node whose
    /// children are swapped for equivalent ones produces the same outputs.
    fn derive_outputs(&self, predicates: &[ArcPredNode<Self>], children: &[Vec<Symbol>])
        -> Vec<Symbol>;
}

/// Identity of a synthesized plan node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct PlanNodeId(pub usize);

impl Display for PlanNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out plan node ids. Shared by everything that synthesizes nodes for the same query, so
/// every call must return an id that was never returned before.
pub trait IdAllocator: 'static + Send + Sync {
    fn next_id(&self) -> PlanNodeId;
}

/// An [`IdAllocator`] backed by an atomic counter.
#[derive(Debug, Default)]
pub struct SequenceIdAllocator {
    next: AtomicUsize,
}

impl SequenceIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
        }
    }
}

impl IdAllocator for SequenceIdAllocator {
    fn next_id(&self) -> PlanNodeId {
        PlanNodeId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A pointer to a plan node
pub type ArcPlanNode<T> = Arc<PlanNode<T>>;

/// A pointer to a predicate node
pub type ArcPredNode<T> = Arc<PredNode<T>>;

/// Stands in for the current content of a memo group. Only the memo mints these; rules hand them
/// back to say "this subtree is equivalent to that group".
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct GroupReference {
    pub id: PlanNodeId,
    pub group_id: GroupId,
    /// Outputs of the group, cached so that rules can inspect them without a lookup.
    pub outputs: Arc<[Symbol]>,
}

impl Display for GroupReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.group_id)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum PlanNodeOrGroup<T: NodeType> {
    PlanNode(ArcPlanNode<T>),
    Group(GroupReference),
}

impl<T: NodeType> PlanNodeOrGroup<T> {
    pub fn is_materialized(&self) -> bool {
        match self {
            PlanNodeOrGroup::PlanNode(_) => true,
            PlanNodeOrGroup::Group(_) => false,
        }
    }

    pub fn unwrap_plan_node(&self) -> ArcPlanNode<T> {
        match self {
            PlanNodeOrGroup::PlanNode(node) => node.clone(),
            PlanNodeOrGroup::Group(_) => panic!("Expected PlanNode, found Group"),
        }
    }

    pub fn unwrap_group(&self) -> GroupId {
        match self {
            PlanNodeOrGroup::PlanNode(_) => panic!("Expected Group, found PlanNode"),
            PlanNodeOrGroup::Group(group) => group.group_id,
        }
    }

    pub fn as_group_reference(&self) -> Option<&GroupReference> {
        match self {
            PlanNodeOrGroup::PlanNode(_) => None,
            PlanNodeOrGroup::Group(group) => Some(group),
        }
    }

    /// A group reference has no children.
    pub fn children(&self) -> &[PlanNodeOrGroup<T>] {
        match self {
            PlanNodeOrGroup::PlanNode(node) => &node.children,
            PlanNodeOrGroup::Group(_) => &[],
        }
    }

    pub fn outputs(&self) -> Vec<Symbol> {
        match self {
            PlanNodeOrGroup::PlanNode(node) => node.outputs(),
            PlanNodeOrGroup::Group(group) => group.outputs.to_vec(),
        }
    }

    pub fn with_children(&self, children: Vec<PlanNodeOrGroup<T>>) -> Self {
        match self {
            PlanNodeOrGroup::PlanNode(node) => node.with_children(children).into(),
            PlanNodeOrGroup::Group(group) => {
                assert!(
                    children.is_empty(),
                    "group reference {} cannot take children",
                    group
                );
                self.clone()
            }
        }
    }
}

impl<T: NodeType> std::fmt::Display for PlanNodeOrGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanNodeOrGroup::PlanNode(node) => write!(f, "{}", node),
            PlanNodeOrGroup::Group(group) => write!(f, "{}", group),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PlanNode<T: NodeType> {
    /// A generic plan node type
    pub typ: T,
    /// Child plan nodes, which may be materialized or references to memo groups
    pub children: Vec<PlanNodeOrGroup<T>>,
    /// Predicate nodes, which are always materialized
    pub predicates: Vec<ArcPredNode<T>>,
}

impl<T: NodeType> std::fmt::Display for PlanNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.typ)?;
        for child in &self.children {
            write!(f, " {}", child)?;
        }
        for pred in &self.predicates {
            write!(f, " {}", pred)?;
        }
        write!(f, ")")
    }
}

impl<T: NodeType> PlanNode<T> {
    pub fn child(&self, idx: usize) -> PlanNodeOrGroup<T> {
        self.children[idx].clone()
    }

    pub fn child_rel(&self, idx: usize) -> ArcPlanNode<T> {
        self.child(idx).unwrap_plan_node()
    }

    pub fn predicate(&self, idx: usize) -> ArcPredNode<T> {
        self.predicates[idx].clone()
    }

    pub fn outputs(&self) -> Vec<Symbol> {
        let children = self
            .children
            .iter()
            .map(PlanNodeOrGroup::outputs)
            .collect_vec();
        self.typ.derive_outputs(&self.predicates, &children)
    }

    /// Swap the children 1:1 by position. Type and predicates are kept.
    pub fn with_children(&self, children: Vec<PlanNodeOrGroup<T>>) -> Self {
        assert_eq!(
            children.len(),
            self.children.len(),
            "children size unmatched when rewriting {}",
            self
        );
        Self {
            typ: self.typ.clone(),
            children,
            predicates: self.predicates.clone(),
        }
    }
}

impl<T: NodeType> From<PlanNode<T>> for PlanNodeOrGroup<T> {
    fn from(value: PlanNode<T>) -> Self {
        Self::PlanNode(value.into())
    }
}

impl<T: NodeType> From<ArcPlanNode<T>> for PlanNodeOrGroup<T> {
    fn from(value: ArcPlanNode<T>) -> Self {
        Self::PlanNode(value)
    }
}

impl<T: NodeType> From<GroupReference> for PlanNodeOrGroup<T> {
    fn from(value: GroupReference) -> Self {
        Self::Group(value)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PredNode<T: NodeType> {
    /// A generic predicate node type
    pub typ: T::PredType,
    /// Child predicate nodes, always materialized
    pub children: Vec<ArcPredNode<T>>,
    /// Data associated with the predicate, if any
    pub data: Option<Value>,
}

impl<T: NodeType> std::fmt::Display for PredNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.typ)?;
        for child in &self.children {
            write!(f, " {}", child)?;
        }
        if let Some(data) = &self.data {
            write!(f, " {}", data)?;
        }
        write!(f, ")")
    }
}

impl<T: NodeType> PredNode<T> {
    pub fn unwrap_data(&self) -> Value {
        self.data.clone().unwrap()
    }
}
