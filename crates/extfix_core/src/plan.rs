use serde::Serialize;

use crate::config::RegistryRules;
use crate::detect::{Discrepancy, PermissionSetKind, strip_deprecated_prefix};
use crate::layout::LayoutMap;

/// A corrective write. Conservative by design: the registry is shared
/// mutable state also written by the host application, so the planner only
/// inserts missing companions and rewrites malformed path strings. It never
/// deletes and never overwrites unrelated fields.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RepairOperation {
    RewritePath {
        extension_path_id: i64,
        old: String,
        new: String,
    },
    InsertExtension {
        extension_type: String,
        code: String,
    },
    InsertPath {
        path: String,
    },
    AddPermissionKey {
        role: String,
        set: PermissionSetKind,
        key: String,
    },
}

impl RepairOperation {
    pub fn describe(&self) -> String {
        match self {
            Self::RewritePath {
                extension_path_id,
                old,
                new,
            } => format!("rewrite path #{extension_path_id} '{old}' -> '{new}'"),
            Self::InsertExtension {
                extension_type,
                code,
            } => format!("insert extension ({extension_type}, {code})"),
            Self::InsertPath { path } => format!("insert path '{path}'"),
            Self::AddPermissionKey { role, set, key } => {
                format!("grant {} key '{key}' to role '{role}'", set.as_str())
            }
        }
    }
}

/// Snapshot of the affected row cell at planning time (current value, or
/// absence), re-checked immediately before execution to catch external
/// modification between planning and applying.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "expect", rename_all = "snake_case")]
pub enum Precondition {
    PathEquals {
        extension_path_id: i64,
        path: String,
    },
    ExtensionAbsent {
        extension_type: String,
        code: String,
    },
    PathAbsent {
        path: String,
    },
    PermissionKeyAbsent {
        role: String,
        set: PermissionSetKind,
        key: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlannedOperation {
    pub operation: RepairOperation,
    pub precondition: Precondition,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The store alone cannot tell where the plugin's artifact lives and no
    /// layout signal was supplied; a guessed path is worse than none.
    AmbiguousLayer,
    /// Repairing would require information only a human can supply (a legacy
    /// module row needs a display name).
    ReportOnly,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkippedRepair {
    pub discrepancy: Discrepancy,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct RepairPlan {
    pub operations: Vec<PlannedOperation>,
    pub skipped: Vec<SkippedRepair>,
}

/// Map each discrepancy to at most one corrective operation, preserving the
/// detector's order.
pub fn plan_repairs(
    discrepancies: &[Discrepancy],
    rules: &RegistryRules,
    layout: &LayoutMap,
) -> RepairPlan {
    let mut plan = RepairPlan::default();

    for discrepancy in discrepancies {
        match discrepancy {
            Discrepancy::MissingExtensionRecord {
                code,
                extension_type,
            } => {
                let extension_type = layout
                    .get(code)
                    .map(|placement| placement.category.clone())
                    .unwrap_or_else(|| extension_type.clone());
                plan.operations.push(PlannedOperation {
                    operation: RepairOperation::InsertExtension {
                        extension_type: extension_type.clone(),
                        code: code.clone(),
                    },
                    precondition: Precondition::ExtensionAbsent {
                        extension_type,
                        code: code.clone(),
                    },
                });
            }
            Discrepancy::MissingModuleRecord { .. } => {
                plan.skipped.push(SkippedRepair {
                    discrepancy: discrepancy.clone(),
                    reason: SkipReason::ReportOnly,
                });
            }
            Discrepancy::StalePathNamespace {
                extension_path_id,
                path,
                deprecated_prefix,
            } => {
                // Replace only the leading deprecated segments; a token
                // repeating deeper in the path stays untouched, and the
                // prefix may be configured with or without a trailing slash.
                let Some(rest) = strip_deprecated_prefix(path, deprecated_prefix) else {
                    continue;
                };
                let new = format!("{}/{}", rules.current_namespace, rest);
                plan.operations.push(PlannedOperation {
                    operation: RepairOperation::RewritePath {
                        extension_path_id: *extension_path_id,
                        old: path.clone(),
                        new,
                    },
                    precondition: Precondition::PathEquals {
                        extension_path_id: *extension_path_id,
                        path: path.clone(),
                    },
                });
            }
            Discrepancy::MissingPathRecord { code } => match layout.get(code) {
                Some(placement) => {
                    let path = format!(
                        "{}/{}/{}/{}",
                        rules.current_namespace, placement.layer, placement.category, code
                    );
                    plan.operations.push(PlannedOperation {
                        operation: RepairOperation::InsertPath { path: path.clone() },
                        precondition: Precondition::PathAbsent { path },
                    });
                }
                None => {
                    plan.skipped.push(SkippedRepair {
                        discrepancy: discrepancy.clone(),
                        reason: SkipReason::AmbiguousLayer,
                    });
                }
            },
            Discrepancy::PermissionGap { role, set, key, .. } => {
                plan.operations.push(PlannedOperation {
                    operation: RepairOperation::AddPermissionKey {
                        role: role.clone(),
                        set: *set,
                        key: key.clone(),
                    },
                    precondition: Precondition::PermissionKeyAbsent {
                        role: role.clone(),
                        set: *set,
                        key: key.clone(),
                    },
                });
            }
        }
    }

    plan
}
