use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;

use crate::apply::{AppliedOperation, apply_plan};
use crate::config::RegistryRules;
use crate::detect::{Discrepancy, detect_drift};
use crate::error::ReconcileError;
use crate::layout::LayoutMap;
use crate::plan::{PlannedOperation, SkippedRepair, plan_repairs};
use crate::reader::{list_codes, read_facts};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Read, detect, and plan; never touch the store.
    Check,
    /// Apply the plan transactionally.
    Apply,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    DryRun,
    Applied,
    Aborted,
}

/// Everything that happened for one code in one run. Ephemeral: built
/// fresh each invocation and handed to whatever renders it.
#[derive(Debug, Clone, Serialize)]
pub struct CodeReport {
    pub code: String,
    pub discrepancies: Vec<Discrepancy>,
    pub operations: Vec<PlannedOperation>,
    pub skipped: Vec<SkippedRepair>,
    pub applied: Vec<AppliedOperation>,
    pub outcome: Outcome,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub role: String,
    pub codes: Vec<CodeReport>,
}

impl RunReport {
    /// The invocation exit contract: success only when no code aborted and
    /// no error was recorded anywhere in the run.
    pub fn success(&self) -> bool {
        self.codes
            .iter()
            .all(|code| code.outcome != Outcome::Aborted && code.errors.is_empty())
    }
}

/// Reconcile one code: read ground truth, detect drift, plan repairs, and
/// either stop there (`Check`) or apply them in one transaction (`Apply`).
/// Failures abort this code only and are recorded in its report; batch
/// callers keep going.
pub fn reconcile_code(
    connection: &mut Connection,
    code: &str,
    mode: RunMode,
    rules: &RegistryRules,
    layout: &LayoutMap,
) -> CodeReport {
    let mut report = CodeReport {
        code: code.to_string(),
        discrepancies: Vec::new(),
        operations: Vec::new(),
        skipped: Vec::new(),
        applied: Vec::new(),
        outcome: match mode {
            RunMode::Check => Outcome::DryRun,
            RunMode::Apply => Outcome::Applied,
        },
        errors: Vec::new(),
    };

    let facts = match read_facts(connection, code, &rules.role) {
        Ok(facts) => facts,
        Err(error) => {
            report.outcome = Outcome::Aborted;
            report.errors.push(format!("{error:#}"));
            return report;
        }
    };
    if facts.permission_set.is_none() {
        // Permission checks cannot run for this role; everything else still
        // proceeds.
        report
            .errors
            .push(ReconcileError::RoleNotFound(rules.role.clone()).to_string());
    }

    report.discrepancies = detect_drift(&facts, rules);
    let plan = plan_repairs(&report.discrepancies, rules, layout);
    report.operations = plan.operations;
    report.skipped = plan.skipped;

    if mode == RunMode::Apply {
        match apply_plan(connection, &report.operations) {
            Ok(applied) => report.applied = applied,
            Err(error) => {
                report.outcome = Outcome::Aborted;
                report.errors.push(error.to_string());
            }
        }
    }

    report
}

/// Reconcile a target code or LIKE pattern. A pattern fans out to every
/// matching code known to any fact table; each code gets its own
/// transaction, so one aborted code never blocks the rest.
pub fn reconcile(
    connection: &mut Connection,
    target: &str,
    mode: RunMode,
    rules: &RegistryRules,
    layout: &LayoutMap,
) -> Result<RunReport> {
    let codes = if is_pattern(target) {
        list_codes(connection, Some(target))?
    } else {
        vec![target.to_string()]
    };

    let mut report = RunReport {
        mode,
        role: rules.role.clone(),
        codes: Vec::with_capacity(codes.len()),
    };
    for code in &codes {
        report
            .codes
            .push(reconcile_code(connection, code, mode, rules, layout));
    }
    Ok(report)
}

/// Underscores are ordinary in extension codes, so only `%` marks a
/// LIKE pattern.
fn is_pattern(target: &str) -> bool {
    target.contains('%')
}
