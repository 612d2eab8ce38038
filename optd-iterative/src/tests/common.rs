// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::sync::Arc;

use itertools::Itertools;

use crate::nodes::{
    ArcPlanNode, ArcPredNode, NodeType, PlanNode, PlanNodeOrGroup, PredNode, Symbol, Value,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TestNodeTyp {
    Scan,
    Filter,
    Project,
    Join,
    Aggregate,
    Limit,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TestPredTyp {
    List,
    Expr,
    TableName,
    ColumnRef,
}

impl std::fmt::Display for TestNodeTyp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for TestPredTyp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn column_names(list: &ArcPredNode<TestNodeTyp>) -> Vec<Symbol> {
    assert_eq!(list.typ, TestPredTyp::List);
    list.children
        .iter()
        .map(|column| Symbol::new(column.unwrap_data().as_str()))
        .collect()
}

impl NodeType for TestNodeTyp {
    type PredType = TestPredTyp;

    fn derive_outputs(
        &self,
        predicates: &[ArcPredNode<Self>],
        children: &[Vec<Symbol>],
    ) -> Vec<Symbol> {
        match self {
            Self::Scan => column_names(&predicates[1]),
            Self::Filter | Self::Limit => children[0].clone(),
            Self::Project | Self::Aggregate => column_names(&predicates[0]),
            Self::Join => children.iter().flatten().cloned().collect(),
        }
    }
}

/// `Scan` reading `columns` from `table`.
pub(crate) fn scan(table: &str, columns: &[&str]) -> ArcPlanNode<TestNodeTyp> {
    Arc::new(PlanNode {
        typ: TestNodeTyp::Scan,
        children: vec![],
        predicates: vec![table_name(table), column_list(columns)],
    })
}

pub(crate) fn filter(
    input: impl Into<PlanNodeOrGroup<TestNodeTyp>>,
    cond: ArcPredNode<TestNodeTyp>,
) -> ArcPlanNode<TestNodeTyp> {
    Arc::new(PlanNode {
        typ: TestNodeTyp::Filter,
        children: vec![input.into()],
        predicates: vec![cond],
    })
}

pub(crate) fn project(
    input: impl Into<PlanNodeOrGroup<TestNodeTyp>>,
    columns: &[&str],
) -> ArcPlanNode<TestNodeTyp> {
    Arc::new(PlanNode {
        typ: TestNodeTyp::Project,
        children: vec![input.into()],
        predicates: vec![column_list(columns)],
    })
}

pub(crate) fn join(
    left: impl Into<PlanNodeOrGroup<TestNodeTyp>>,
    right: impl Into<PlanNodeOrGroup<TestNodeTyp>>,
    cond: ArcPredNode<TestNodeTyp>,
) -> ArcPlanNode<TestNodeTyp> {
    Arc::new(PlanNode {
        typ: TestNodeTyp::Join,
        children: vec![left.into(), right.into()],
        predicates: vec![cond],
    })
}

/// Produces exactly `outputs`, group keys and aggregates alike.
pub(crate) fn aggregate(
    input: impl Into<PlanNodeOrGroup<TestNodeTyp>>,
    outputs: &[&str],
) -> ArcPlanNode<TestNodeTyp> {
    Arc::new(PlanNode {
        typ: TestNodeTyp::Aggregate,
        children: vec![input.into()],
        predicates: vec![column_list(outputs)],
    })
}

pub(crate) fn limit(
    input: impl Into<PlanNodeOrGroup<TestNodeTyp>>,
    count: i64,
) -> ArcPlanNode<TestNodeTyp> {
    Arc::new(PlanNode {
        typ: TestNodeTyp::Limit,
        children: vec![input.into()],
        predicates: vec![expr(Value::Int64(count))],
    })
}

pub(crate) fn list(items: Vec<ArcPredNode<TestNodeTyp>>) -> ArcPredNode<TestNodeTyp> {
    Arc::new(PredNode {
        typ: TestPredTyp::List,
        children: items,
        data: None,
    })
}

pub(crate) fn column_list(columns: &[&str]) -> ArcPredNode<TestNodeTyp> {
    list(columns.iter().map(|x| column_ref(x)).collect_vec())
}

pub(crate) fn expr(data: Value) -> ArcPredNode<TestNodeTyp> {
    Arc::new(PredNode {
        typ: TestPredTyp::Expr,
        children: vec![],
        data: Some(data),
    })
}

pub(crate) fn column_ref(name: &str) -> ArcPredNode<TestNodeTyp> {
    Arc::new(PredNode {
        typ: TestPredTyp::ColumnRef,
        children: vec![],
        data: Some(Value::String(name.into())),
    })
}

pub(crate) fn table_name(table: &str) -> ArcPredNode<TestNodeTyp> {
    Arc::new(PredNode {
        typ: TestPredTyp::TableName,
        children: vec![],
        data: Some(Value::String(table.into())),
    })
}
