// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Incident state machine.
//!
//! An incident tracks one sustained failure streak for a (project, check)
//! pair. At most one incident per pair is open at a time; resolving is
//! terminal, a later failure opens a fresh incident. The transition logic
//! here is pure; the store applies the chosen transition inside the same
//! transaction that persists the triggering run.

use uuid::Uuid;

use crate::envelope::RunStatus;
use crate::store::IncidentRecord;

/// Incident state column values.
pub const STATE_OPEN: &str = "open";
/// Terminal state; a resolved incident is never reopened.
pub const STATE_RESOLVED: &str = "resolved";

/// What a new run's status means for the pair's open incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// fail/error with nothing open: open a new incident.
    Open,
    /// fail/error while open: extend the streak.
    Extend,
    /// pass while open: resolve.
    Resolve,
    /// warn (always neutral), or pass with nothing open.
    None,
}

/// Decide the transition for a run's status given the currently open
/// incident, if any.
pub fn plan_transition(open: Option<&IncidentRecord>, status: RunStatus) -> Transition {
    match (open, status.is_failure(), status) {
        (None, true, _) => Transition::Open,
        (Some(_), true, _) => Transition::Extend,
        (Some(_), false, RunStatus::Pass) => Transition::Resolve,
        _ => Transition::None,
    }
}

/// Title for a newly-opened incident.
pub fn title_for(check_name: &str) -> String {
    format!("{check_name} failing")
}

/// Description for a newly-opened incident.
pub fn description_for(run_id: Uuid) -> String {
    format!("Auto-opened by run {run_id}")
}
