// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::sync::Arc;

use anyhow::{bail, Result};
use pretty_assertions::assert_eq;

use super::common::{column_ref, expr, filter, join, limit, project, scan, TestNodeTyp};
use crate::error::MemoError;
use crate::iterative::{IterativeOptimizer, IterativeOptimizerOptions, Memo};
use crate::nodes::{ArcPlanNode, PlanNode, PlanNodeOrGroup, SequenceIdAllocator, Value};
use crate::optimizer::Optimizer;
use crate::rules::{Rule, RuleContext};

struct RemoveTrueFilter;

impl Rule<TestNodeTyp> for RemoveTrueFilter {
    fn name(&self) -> &'static str {
        "remove_true_filter"
    }

    fn apply(
        &self,
        node: &ArcPlanNode<TestNodeTyp>,
        _ctx: &RuleContext<'_, TestNodeTyp>,
    ) -> Result<Option<PlanNodeOrGroup<TestNodeTyp>>> {
        if node.typ != TestNodeTyp::Filter || node.predicate(0).data != Some(Value::Bool(true)) {
            return Ok(None);
        }
        Ok(Some(node.child(0)))
    }
}

struct MergeLimits;

impl Rule<TestNodeTyp> for MergeLimits {
    fn name(&self) -> &'static str {
        "merge_limits"
    }

    fn apply(
        &self,
        node: &ArcPlanNode<TestNodeTyp>,
        ctx: &RuleContext<'_, TestNodeTyp>,
    ) -> Result<Option<PlanNodeOrGroup<TestNodeTyp>>> {
        if node.typ != TestNodeTyp::Limit {
            return Ok(None);
        }
        let child = ctx.resolve(&node.child(0))?;
        if child.typ != TestNodeTyp::Limit {
            return Ok(None);
        }
        let count = node
            .predicate(0)
            .unwrap_data()
            .as_i64()
            .min(child.predicate(0).unwrap_data().as_i64());
        Ok(Some(limit(child.child(0), count).into()))
    }
}

struct PushLimitThroughProject;

impl Rule<TestNodeTyp> for PushLimitThroughProject {
    fn name(&self) -> &'static str {
        "push_limit_through_project"
    }

    fn apply(
        &self,
        node: &ArcPlanNode<TestNodeTyp>,
        ctx: &RuleContext<'_, TestNodeTyp>,
    ) -> Result<Option<PlanNodeOrGroup<TestNodeTyp>>> {
        if node.typ != TestNodeTyp::Limit {
            return Ok(None);
        }
        let child = ctx.resolve(&node.child(0))?;
        if child.typ != TestNodeTyp::Project {
            return Ok(None);
        }
        let pushed = PlanNode {
            typ: TestNodeTyp::Limit,
            children: vec![child.child(0)],
            predicates: node.predicates.clone(),
        };
        Ok(Some(
            PlanNode {
                typ: TestNodeTyp::Project,
                children: vec![pushed.into()],
                predicates: child.predicates.clone(),
            }
            .into(),
        ))
    }
}

/// Never converges on its own.
struct CommuteJoin;

impl Rule<TestNodeTyp> for CommuteJoin {
    fn name(&self) -> &'static str {
        "commute_join"
    }

    fn apply(
        &self,
        node: &ArcPlanNode<TestNodeTyp>,
        _ctx: &RuleContext<'_, TestNodeTyp>,
    ) -> Result<Option<PlanNodeOrGroup<TestNodeTyp>>> {
        if node.typ != TestNodeTyp::Join {
            return Ok(None);
        }
        Ok(Some(
            join(node.child(1), node.child(0), node.predicate(0)).into(),
        ))
    }
}

struct DropLastColumn;

impl Rule<TestNodeTyp> for DropLastColumn {
    fn name(&self) -> &'static str {
        "drop_last_column"
    }

    fn apply(
        &self,
        node: &ArcPlanNode<TestNodeTyp>,
        _ctx: &RuleContext<'_, TestNodeTyp>,
    ) -> Result<Option<PlanNodeOrGroup<TestNodeTyp>>> {
        if node.typ != TestNodeTyp::Project {
            return Ok(None);
        }
        Ok(Some(project(node.child(0), &["ts"]).into()))
    }
}

struct Failing;

impl Rule<TestNodeTyp> for Failing {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn apply(
        &self,
        node: &ArcPlanNode<TestNodeTyp>,
        ctx: &RuleContext<'_, TestNodeTyp>,
    ) -> Result<Option<PlanNodeOrGroup<TestNodeTyp>>> {
        bail!("cannot rewrite {} in group {}", node.typ, ctx.group_id())
    }
}

fn cpu() -> ArcPlanNode<TestNodeTyp> {
    scan("cpu", &["ts", "host", "usage"])
}

fn mem() -> ArcPlanNode<TestNodeTyp> {
    scan("mem", &["mem_ts", "mem_host", "used"])
}

fn optimizer(rules: Vec<Arc<dyn Rule<TestNodeTyp>>>) -> IterativeOptimizer<TestNodeTyp> {
    IterativeOptimizer::new(rules, Arc::new(SequenceIdAllocator::new()))
}

fn limit_rules() -> Vec<Arc<dyn Rule<TestNodeTyp>>> {
    vec![
        Arc::new(RemoveTrueFilter),
        Arc::new(MergeLimits),
        Arc::new(PushLimitThroughProject),
    ]
}

#[test]
fn no_rules_keeps_plan() {
    let plan = limit(filter(cpu(), expr(Value::Bool(true))), 10);
    let mut optimizer = optimizer(vec![]);
    assert_eq!(optimizer.optimize(plan.clone()).unwrap(), plan);
    assert_eq!(optimizer.ctx.rules_applied, 0);
}

#[test]
fn rewrites_until_fixpoint() {
    let plan = limit(
        limit(
            project(filter(cpu(), expr(Value::Bool(true))), &["ts", "usage"]),
            5,
        ),
        10,
    );
    let mut optimizer = optimizer(limit_rules());
    let optimized = optimizer.optimize(plan).unwrap();
    assert_eq!(optimized, project(limit(cpu(), 5), &["ts", "usage"]));
    assert_eq!(optimizer.ctx.rules_applied, 3);
    assert!(!optimizer.ctx.budget_used);
}

#[test]
fn collapsed_root_is_extracted() {
    let mut optimizer = optimizer(limit_rules());
    let optimized = optimizer
        .optimize(filter(cpu(), expr(Value::Bool(true))))
        .unwrap();
    assert_eq!(optimized, cpu());
}

#[test]
fn optimize_memo_keeps_memo_consistent() {
    let mut memo = Memo::new(
        Arc::new(SequenceIdAllocator::new()),
        limit(
            join(
                filter(cpu(), expr(Value::Bool(true))),
                filter(mem(), expr(Value::Bool(true))),
                column_ref("host"),
            ),
            10,
        ),
    )
    .unwrap();
    let mut optimizer = optimizer(limit_rules());
    optimizer.optimize_memo(&mut memo).unwrap();
    memo.check_integrity().unwrap();
    assert_eq!(
        memo.extract().unwrap(),
        limit(join(cpu(), mem(), column_ref("host")), 10)
    );
    // both filters survive as aliases of their scans
    assert_eq!(memo.group_count(), 6);
}

#[test]
fn budget_stops_rewrites() {
    let mut optimizer = IterativeOptimizer::new_with_options(
        vec![Arc::new(CommuteJoin)],
        Arc::new(SequenceIdAllocator::new()),
        IterativeOptimizerOptions {
            max_rule_applications: Some(5),
            ..Default::default()
        },
    );
    let optimized = optimizer
        .optimize(join(cpu(), mem(), column_ref("host")))
        .unwrap();
    assert!(optimizer.ctx.budget_used);
    assert_eq!(optimizer.ctx.rules_applied, 5);
    assert_eq!(optimized, join(mem(), cpu(), column_ref("host")));
}

#[test]
#[should_panic(expected = "rule application budget used")]
fn panic_on_budget() {
    let mut optimizer = IterativeOptimizer::new_with_options(
        vec![Arc::new(CommuteJoin)],
        Arc::new(SequenceIdAllocator::new()),
        IterativeOptimizerOptions {
            max_rule_applications: Some(1),
            panic_on_budget: true,
        },
    );
    let _ = optimizer.optimize(join(cpu(), mem(), column_ref("host")));
}

#[test]
fn output_contract_violation_is_reported() {
    let mut optimizer = optimizer(vec![Arc::new(DropLastColumn)]);
    let err = optimizer
        .optimize(project(cpu(), &["ts", "usage"]))
        .unwrap_err();
    match err.root_cause().downcast_ref::<MemoError>() {
        Some(MemoError::OutputContractViolation { reason, .. }) => {
            assert_eq!(reason, "drop_last_column")
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn rule_errors_are_propagated() {
    let mut optimizer = optimizer(vec![Arc::new(Failing)]);
    let err = optimizer.optimize(cpu()).unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("rule failing failed on group !1"), "{message}");
    assert!(message.contains("cannot rewrite Scan in group !1"), "{message}");
}
