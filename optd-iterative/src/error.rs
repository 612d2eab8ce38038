// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use itertools::Itertools;
use thiserror::Error;

use crate::iterative::GroupId;
use crate::nodes::Symbol;

pub type MemoResult<T> = Result<T, MemoError>;

/// Violations of the memo invariants. None of them is transient: the optimization attempt that hit
/// one should be abandoned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoError {
    #[error("invalid group: {0}")]
    UnknownGroup(GroupId),
    #[error(
        "{reason}: transformed expression doesn't produce same outputs in group {group_id}: [{}] vs [{}]",
        .expected.iter().join(", "),
        .actual.iter().join(", ")
    )]
    OutputContractViolation {
        group_id: GroupId,
        reason: String,
        expected: Vec<Symbol>,
        actual: Vec<Symbol>,
    },
    #[error("reference accounting violated on group {group_id}: {detail}")]
    ReferenceAccountingViolation { group_id: GroupId, detail: String },
    #[error("{reason}: group {group_id} would become reachable from itself through group {target}")]
    AcyclicityViolation {
        group_id: GroupId,
        target: GroupId,
        reason: String,
    },
    #[error("memo is unusable after a failed mutation")]
    Poisoned,
}
