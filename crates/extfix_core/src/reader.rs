use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

/// One row of the extension table: the current registration mechanism.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExtensionRecord {
    pub extension_id: i64,
    pub extension_type: String,
    pub code: String,
    pub enabled: bool,
}

/// One row of the extension_path table: the routing fact mapping a code to
/// its runtime location string.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExtensionPathRecord {
    pub extension_path_id: i64,
    pub path: String,
    pub extension_install_id: Option<i64>,
}

/// One row of the legacy module table (pre-path-table registration).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModuleRecord {
    pub module_id: i64,
    pub name: String,
    pub code: String,
    pub enabled: bool,
}

/// A role's permission keys, decoded from the user_group JSON column.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PermissionSet {
    pub user_group_id: i64,
    pub role: String,
    pub access: Vec<String>,
    pub modify: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct PermissionColumn {
    #[serde(default)]
    access: Vec<String>,
    #[serde(default)]
    modify: Vec<String>,
}

/// Everything the store knows about one code, read in a single pass.
/// Empty fact vectors are valid results, not errors: the absence itself is
/// the discrepancy to report. `permission_set` is `None` when the named
/// role does not exist.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FactSet {
    pub code: String,
    pub extensions: Vec<ExtensionRecord>,
    pub paths: Vec<ExtensionPathRecord>,
    pub modules: Vec<ModuleRecord>,
    pub permission_set: Option<PermissionSet>,
}

/// Per-table row counts for the `status` command.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub extensions: usize,
    pub paths: usize,
    pub modules: usize,
    pub roles: usize,
    pub extensions_by_type: BTreeMap<String, usize>,
}

/// Read the three fact-sets for `code` plus the permission set of `role`.
/// Strictly read-only.
pub fn read_facts(connection: &Connection, code: &str, role: &str) -> Result<FactSet> {
    Ok(FactSet {
        code: code.to_string(),
        extensions: read_extensions(connection, code)?,
        paths: read_paths(connection, code)?,
        modules: read_modules(connection, code)?,
        permission_set: read_permission_set(connection, role)?,
    })
}

fn read_extensions(connection: &Connection, code: &str) -> Result<Vec<ExtensionRecord>> {
    let mut statement = connection
        .prepare(
            "SELECT extension_id, type, code, status
             FROM extension
             WHERE code = ?1
             ORDER BY type ASC, extension_id ASC",
        )
        .context("failed to prepare extension query")?;
    let rows = statement
        .query_map([code], |row| {
            Ok(ExtensionRecord {
                extension_id: row.get(0)?,
                extension_type: row.get(1)?,
                code: row.get(2)?,
                enabled: row.get::<_, i64>(3)? == 1,
            })
        })
        .context("failed to run extension query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode extension row")?);
    }
    Ok(out)
}

fn read_paths(connection: &Connection, code: &str) -> Result<Vec<ExtensionPathRecord>> {
    let mut statement = connection
        .prepare(
            "SELECT extension_path_id, path, extension_install_id
             FROM extension_path
             WHERE path LIKE '%' || ?1 || '%'
             ORDER BY path ASC, extension_path_id ASC",
        )
        .context("failed to prepare extension_path query")?;
    let rows = statement
        .query_map([code], |row| {
            Ok(ExtensionPathRecord {
                extension_path_id: row.get(0)?,
                path: row.get(1)?,
                extension_install_id: row.get(2)?,
            })
        })
        .context("failed to run extension_path query")?;

    let mut out = Vec::new();
    for row in rows {
        let record = row.context("failed to decode extension_path row")?;
        // LIKE over-matches substrings; keep only paths whose final segment
        // actually encodes the code.
        if path_code(&record.path) == Some(code) {
            out.push(record);
        }
    }
    Ok(out)
}

fn read_modules(connection: &Connection, code: &str) -> Result<Vec<ModuleRecord>> {
    let mut statement = connection
        .prepare(
            "SELECT module_id, name, code, status
             FROM module
             WHERE code = ?1
             ORDER BY module_id ASC",
        )
        .context("failed to prepare module query")?;
    let rows = statement
        .query_map([code], |row| {
            Ok(ModuleRecord {
                module_id: row.get(0)?,
                name: row.get(1)?,
                code: row.get(2)?,
                enabled: row.get::<_, i64>(3)? == 1,
            })
        })
        .context("failed to run module query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode module row")?);
    }
    Ok(out)
}

/// Look up a role's permission set. Returns `None` when the role does not
/// exist; a malformed JSON column is an error, not an empty set.
pub fn read_permission_set(connection: &Connection, role: &str) -> Result<Option<PermissionSet>> {
    let mut statement = connection
        .prepare("SELECT user_group_id, name, permission FROM user_group WHERE name = ?1 LIMIT 1")
        .context("failed to prepare user_group query")?;
    let mut rows = statement
        .query([role])
        .context("failed to run user_group query")?;
    let row = match rows.next().context("failed to read user_group row")? {
        Some(row) => row,
        None => return Ok(None),
    };

    let user_group_id: i64 = row.get(0).context("failed to decode user_group_id")?;
    let name: String = row.get(1).context("failed to decode user_group name")?;
    let raw: String = row.get(2).context("failed to decode permission column")?;
    let column: PermissionColumn = serde_json::from_str(&raw)
        .with_context(|| format!("malformed permission JSON for role '{name}'"))?;

    Ok(Some(PermissionSet {
        user_group_id,
        role: name,
        access: column.access,
        modify: column.modify,
    }))
}

/// The code a path encodes: the final segment with any file suffix removed.
/// `"extension/admin/controller/module/trendyol.php"` encodes `"trendyol"`.
pub fn path_code(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next()?;
    let stem = segment.split('.').next().unwrap_or(segment);
    if stem.is_empty() { None } else { Some(stem) }
}

/// Every code known to any of the three fact tables, deduplicated and
/// sorted. `pattern` uses SQL LIKE semantics; `None` lists everything.
pub fn list_codes(connection: &Connection, pattern: Option<&str>) -> Result<Vec<String>> {
    let mut codes = BTreeSet::new();

    for (table, sql_all, sql_like) in [
        (
            "extension",
            "SELECT DISTINCT code FROM extension",
            "SELECT DISTINCT code FROM extension WHERE code LIKE ?1",
        ),
        (
            "module",
            "SELECT DISTINCT code FROM module",
            "SELECT DISTINCT code FROM module WHERE code LIKE ?1",
        ),
    ] {
        let mut statement = connection
            .prepare(if pattern.is_some() { sql_like } else { sql_all })
            .with_context(|| format!("failed to prepare {table} code query"))?;
        // A fn pointer keeps the two query_map calls the same type.
        let decode: fn(&rusqlite::Row<'_>) -> rusqlite::Result<String> = |row| row.get(0);
        let rows = match pattern {
            Some(pattern) => statement.query_map([pattern], decode),
            None => statement.query_map([], decode),
        }
        .with_context(|| format!("failed to run {table} code query"))?;
        for row in rows {
            codes.insert(row.with_context(|| format!("failed to decode {table} code"))?);
        }
    }

    let mut statement = connection
        .prepare("SELECT path FROM extension_path ORDER BY path ASC")
        .context("failed to prepare path listing query")?;
    let rows = statement
        .query_map([], |row| row.get::<_, String>(0))
        .context("failed to run path listing query")?;
    for row in rows {
        let path = row.context("failed to decode path row")?;
        let Some(code) = path_code(&path) else {
            continue;
        };
        let matched = match pattern {
            Some(pattern) => sql_like_match(connection, code, pattern)?,
            None => true,
        };
        if matched {
            codes.insert(code.to_string());
        }
    }

    Ok(codes.into_iter().collect())
}

pub fn registry_stats(connection: &Connection) -> Result<RegistryStats> {
    let extensions = crate::store::count_query(connection, "SELECT COUNT(*) FROM extension")?;
    let paths = crate::store::count_query(connection, "SELECT COUNT(*) FROM extension_path")?;
    let modules = crate::store::count_query(connection, "SELECT COUNT(*) FROM module")?;
    let roles = crate::store::count_query(connection, "SELECT COUNT(*) FROM user_group")?;

    let mut statement = connection
        .prepare(
            "SELECT type, COUNT(*) FROM extension
             GROUP BY type
             ORDER BY type ASC",
        )
        .context("failed to prepare extension type aggregation")?;
    let rows = statement
        .query_map([], |row| {
            let extension_type: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((extension_type, count))
        })
        .context("failed to run extension type aggregation")?;

    let mut extensions_by_type = BTreeMap::new();
    for row in rows {
        let (extension_type, count) = row.context("failed to decode type aggregation row")?;
        let count = usize::try_from(count).context("type count does not fit into usize")?;
        extensions_by_type.insert(extension_type, count);
    }

    Ok(RegistryStats {
        extensions,
        paths,
        modules,
        roles,
        extensions_by_type,
    })
}

// Delegates LIKE matching to the store so code-derived-from-path filtering
// follows the same pattern semantics as the SQL queries.
fn sql_like_match(connection: &Connection, value: &str, pattern: &str) -> Result<bool> {
    let matched: i64 = connection
        .query_row("SELECT ?1 LIKE ?2", params![value, pattern], |row| {
            row.get(0)
        })
        .context("failed to evaluate LIKE pattern")?;
    Ok(matched == 1)
}
