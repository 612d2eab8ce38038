// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{trace, warn};

use super::memo::{GroupId, Memo};
use crate::nodes::{ArcPlanNode, IdAllocator, NodeType, PlanNodeOrGroup};
use crate::optimizer::Optimizer;
use crate::rules::{Rule, RuleContext};

#[derive(Default, Clone, Debug)]
pub struct OptimizerContext {
    pub budget_used: bool,
    pub rules_applied: usize,
}

#[derive(Default, Clone, Debug)]
pub struct IterativeOptimizerOptions {
    /// Stop applying rules once this many rewrites were installed. The plan built so far is kept.
    pub max_rule_applications: Option<usize>,
    pub panic_on_budget: bool,
}

/// Applies rules to every group of a [`Memo`], top-down, until no rule changes anything.
pub struct IterativeOptimizer<T: NodeType> {
    rules: Arc<[Arc<dyn Rule<T>>]>,
    id_allocator: Arc<dyn IdAllocator>,
    pub ctx: OptimizerContext,
    pub prop: IterativeOptimizerOptions,
}

impl<T: NodeType> IterativeOptimizer<T> {
    pub fn new(rules: Vec<Arc<dyn Rule<T>>>, id_allocator: Arc<dyn IdAllocator>) -> Self {
        Self::new_with_options(rules, id_allocator, Default::default())
    }

    pub fn new_with_options(
        rules: Vec<Arc<dyn Rule<T>>>,
        id_allocator: Arc<dyn IdAllocator>,
        prop: IterativeOptimizerOptions,
    ) -> Self {
        Self {
            rules: rules.into(),
            id_allocator,
            ctx: OptimizerContext::default(),
            prop,
        }
    }

    /// Run the rules over `memo` until a full pass makes no change or the budget runs out.
    pub fn optimize_memo(&mut self, memo: &mut Memo<T>) -> Result<()> {
        loop {
            let mut explored = HashSet::new();
            let progress = self.explore_group(memo, memo.root_group(), &mut explored)?;
            if !progress || self.ctx.budget_used {
                break;
            }
        }
        Ok(())
    }

    fn explore_group(
        &mut self,
        memo: &mut Memo<T>,
        group_id: GroupId,
        explored: &mut HashSet<GroupId>,
    ) -> Result<bool> {
        let group_id = forwarded_group(memo, group_id)?;
        if !explored.insert(group_id) {
            return Ok(false);
        }
        let mut progress = false;
        while self.explore_node(memo, group_id)? {
            progress = true;
        }
        let forwarded = forwarded_group(memo, group_id)?;
        if forwarded != group_id {
            // collapsed into another group: continue there
            return Ok(self.explore_group(memo, forwarded, explored)? || progress);
        }
        if self.explore_children(memo, group_id, explored)? {
            progress = true;
        }
        Ok(progress)
    }

    fn explore_children(
        &mut self,
        memo: &mut Memo<T>,
        group_id: GroupId,
        explored: &mut HashSet<GroupId>,
    ) -> Result<bool> {
        let children = memo
            .get_node(group_id)?
            .children()
            .iter()
            .filter_map(PlanNodeOrGroup::as_group_reference)
            .map(|group| group.group_id)
            .collect::<Vec<_>>();
        let mut progress = false;
        for child in children {
            if self.explore_group(memo, child, explored)? {
                progress = true;
            }
        }
        Ok(progress)
    }

    /// Try every rule on the current expression of `group_id` and install the first rewrite.
    fn explore_node(&mut self, memo: &mut Memo<T>, group_id: GroupId) -> Result<bool> {
        let PlanNodeOrGroup::PlanNode(node) = memo.get_node(group_id)? else {
            return Ok(false);
        };
        for rule in self.rules.clone().iter() {
            if self.budget_exhausted() {
                return Ok(false);
            }
            let ctx = RuleContext::new(group_id, &*memo, memo.id_allocator());
            let candidate = rule
                .apply(&node, &ctx)
                .with_context(|| format!("rule {} failed on group {}", rule.name(), group_id))?;
            let Some(candidate) = candidate else {
                continue;
            };
            if candidate == PlanNodeOrGroup::PlanNode(node.clone()) {
                continue;
            }
            let installed = memo
                .replace(group_id, candidate, rule.name())
                .with_context(|| format!("failed to install the result of rule {}", rule.name()))?;
            self.ctx.rules_applied += 1;
            trace!(
                event = "apply_rule",
                rule = rule.name(),
                group_id = %group_id,
                output = %installed
            );
            return Ok(true);
        }
        Ok(false)
    }

    fn budget_exhausted(&mut self) -> bool {
        if self.ctx.budget_used {
            return true;
        }
        let Some(max_rule_applications) = self.prop.max_rule_applications else {
            return false;
        };
        if self.ctx.rules_applied < max_rule_applications {
            return false;
        }
        warn!(
            event = "budget_used",
            rules_applied = self.ctx.rules_applied,
            "rule application budget used, not applying rules any more"
        );
        self.ctx.budget_used = true;
        if self.prop.panic_on_budget {
            panic!("rule application budget used");
        }
        true
    }
}

/// The group whose expression stands for `group_id`, following collapsed groups.
fn forwarded_group<T: NodeType>(memo: &Memo<T>, mut group_id: GroupId) -> Result<GroupId> {
    let mut seen = HashSet::new();
    while let PlanNodeOrGroup::Group(target) = memo.get_node(group_id)? {
        if !seen.insert(group_id) {
            anyhow::bail!("group {} forwards to itself", group_id);
        }
        group_id = target.group_id;
    }
    Ok(group_id)
}

impl<T: NodeType> Optimizer<T> for IterativeOptimizer<T> {
    fn optimize(&mut self, root_rel: ArcPlanNode<T>) -> Result<ArcPlanNode<T>> {
        let mut memo = Memo::new(self.id_allocator.clone(), root_rel)
            .context("failed to build the memo")?;
        self.optimize_memo(&mut memo)?;
        Ok(memo.extract()?)
    }
}
