use std::time::Instant;

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Serialize;
use serde_json::Value;

use crate::error::ReconcileError;
use crate::plan::{PlannedOperation, Precondition, RepairOperation};

/// An operation that made it into the committed transaction.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppliedOperation {
    pub operation: RepairOperation,
    pub elapsed_ms: u64,
}

enum PreconditionCheck {
    Holds,
    Mismatch { found: String },
}

/// Execute the plan inside a single all-or-nothing transaction, strictly in
/// list order. Each operation's precondition snapshot is re-read first; any
/// mismatch or rejected write rolls the whole transaction back. A partial
/// registry update is worse than no update, so there is no partial commit,
/// no silent skip, and no automatic retry.
pub fn apply_plan(
    connection: &mut Connection,
    plan: &[PlannedOperation],
) -> Result<Vec<AppliedOperation>, ReconcileError> {
    if plan.is_empty() {
        return Ok(Vec::new());
    }

    let transaction = connection
        .transaction()
        .map_err(|error| ReconcileError::StoreUnavailable(error.to_string()))?;

    let mut applied = Vec::with_capacity(plan.len());
    for (index, planned) in plan.iter().enumerate() {
        let check = check_precondition(&transaction, &planned.precondition).map_err(|error| {
            ReconcileError::ApplyFailed {
                index,
                operation: planned.operation.describe(),
                cause: error.to_string(),
            }
        })?;
        if let PreconditionCheck::Mismatch { found } = check {
            // Dropping the transaction rolls it back.
            return Err(ReconcileError::ConcurrentModification {
                index,
                expected: describe_expectation(&planned.precondition),
                found,
            });
        }

        let started = Instant::now();
        execute_operation(&transaction, &planned.operation).map_err(|cause| {
            ReconcileError::ApplyFailed {
                index,
                operation: planned.operation.describe(),
                cause,
            }
        })?;
        applied.push(AppliedOperation {
            operation: planned.operation.clone(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });
    }

    transaction
        .commit()
        .map_err(|error| ReconcileError::ApplyFailed {
            index: plan.len(),
            operation: "commit".to_string(),
            cause: error.to_string(),
        })?;

    Ok(applied)
}

fn check_precondition(
    transaction: &Transaction<'_>,
    precondition: &Precondition,
) -> rusqlite::Result<PreconditionCheck> {
    match precondition {
        Precondition::PathEquals {
            extension_path_id,
            path,
        } => {
            let current: Option<String> = transaction
                .query_row(
                    "SELECT path FROM extension_path WHERE extension_path_id = ?1",
                    [extension_path_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(match current {
                Some(current) if current == *path => PreconditionCheck::Holds,
                Some(current) => PreconditionCheck::Mismatch {
                    found: format!("'{current}'"),
                },
                None => PreconditionCheck::Mismatch {
                    found: "row deleted".to_string(),
                },
            })
        }
        Precondition::ExtensionAbsent {
            extension_type,
            code,
        } => {
            let count: i64 = transaction.query_row(
                "SELECT COUNT(*) FROM extension WHERE type = ?1 AND code = ?2",
                params![extension_type, code],
                |row| row.get(0),
            )?;
            Ok(if count == 0 {
                PreconditionCheck::Holds
            } else {
                PreconditionCheck::Mismatch {
                    found: "row already present".to_string(),
                }
            })
        }
        Precondition::PathAbsent { path } => {
            let count: i64 = transaction.query_row(
                "SELECT COUNT(*) FROM extension_path WHERE path = ?1",
                [path],
                |row| row.get(0),
            )?;
            Ok(if count == 0 {
                PreconditionCheck::Holds
            } else {
                PreconditionCheck::Mismatch {
                    found: "row already present".to_string(),
                }
            })
        }
        Precondition::PermissionKeyAbsent { role, set, key } => {
            let raw: Option<String> = transaction
                .query_row(
                    "SELECT permission FROM user_group WHERE name = ?1",
                    [role],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(raw) = raw else {
                return Ok(PreconditionCheck::Mismatch {
                    found: "role deleted".to_string(),
                });
            };
            let document: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
            let present = document
                .get(set.as_str())
                .and_then(Value::as_array)
                .is_some_and(|keys| keys.iter().any(|entry| entry.as_str() == Some(key)));
            Ok(if present {
                PreconditionCheck::Mismatch {
                    found: "key already granted".to_string(),
                }
            } else {
                PreconditionCheck::Holds
            })
        }
    }
}

fn describe_expectation(precondition: &Precondition) -> String {
    match precondition {
        Precondition::PathEquals {
            extension_path_id,
            path,
        } => format!("path #{extension_path_id} = '{path}'"),
        Precondition::ExtensionAbsent {
            extension_type,
            code,
        } => format!("no extension row ({extension_type}, {code})"),
        Precondition::PathAbsent { path } => format!("no path row '{path}'"),
        Precondition::PermissionKeyAbsent { role, set, key } => {
            format!("role '{role}' without '{key}' in {}", set.as_str())
        }
    }
}

fn execute_operation(
    transaction: &Transaction<'_>,
    operation: &RepairOperation,
) -> Result<(), String> {
    match operation {
        RepairOperation::RewritePath {
            extension_path_id,
            new,
            ..
        } => transaction
            .execute(
                "UPDATE extension_path SET path = ?1 WHERE extension_path_id = ?2",
                params![new, extension_path_id],
            )
            .map(|_| ())
            .map_err(|error| error.to_string()),
        RepairOperation::InsertExtension {
            extension_type,
            code,
        } => transaction
            .execute(
                "INSERT INTO extension (type, code, status) VALUES (?1, ?2, 1)",
                params![extension_type, code],
            )
            .map(|_| ())
            .map_err(|error| error.to_string()),
        RepairOperation::InsertPath { path } => transaction
            .execute("INSERT INTO extension_path (path) VALUES (?1)", [path])
            .map(|_| ())
            .map_err(|error| error.to_string()),
        RepairOperation::AddPermissionKey { role, set, key } => {
            add_permission_key(transaction, role, set.as_str(), key)
        }
    }
}

// The permission column may carry keys beyond access/modify; edit the JSON
// document in place instead of re-serializing a fixed shape.
fn add_permission_key(
    transaction: &Transaction<'_>,
    role: &str,
    set: &str,
    key: &str,
) -> Result<(), String> {
    let raw: String = transaction
        .query_row(
            "SELECT permission FROM user_group WHERE name = ?1",
            [role],
            |row| row.get(0),
        )
        .map_err(|error| error.to_string())?;
    let mut document: Value =
        serde_json::from_str(&raw).map_err(|error| format!("malformed permission JSON: {error}"))?;

    let object = document
        .as_object_mut()
        .ok_or_else(|| "permission JSON is not an object".to_string())?;
    let keys = object
        .entry(set.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let keys = keys
        .as_array_mut()
        .ok_or_else(|| format!("permission '{set}' is not an array"))?;
    if !keys.iter().any(|entry| entry.as_str() == Some(key)) {
        keys.push(Value::String(key.to_string()));
    }

    let rendered = serde_json::to_string(&document).map_err(|error| error.to_string())?;
    transaction
        .execute(
            "UPDATE user_group SET permission = ?1 WHERE name = ?2",
            params![rendered, role],
        )
        .map(|_| ())
        .map_err(|error| error.to_string())
}
