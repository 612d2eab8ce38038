// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Estimates cached on memo groups. They are computed by the planner's statistics and cost
//! calculators; the memo only stores them and drops them when a group's subtree changes.

/// The statistics of a group.
#[derive(Clone, Debug)]
pub struct Statistics(pub value_bag::OwnedValueBag);

/// The cost of an operation. The cost is represented as a vector of double values.
/// For example, it can be represented as `[cpu_cost, io_cost, network_cost]`.
/// A lower value means a better cost.
#[derive(Default, Clone, Debug, PartialOrd, PartialEq)]
pub struct Cost(pub Vec<f64>);
