use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use walkdir::WalkDir;

/// Where a plugin's source artifact physically resides, relative to the
/// application root: `admin/controller` + `module` for
/// `admin/controller/module/<code>.php`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Placement {
    pub layer: String,
    pub category: String,
}

/// Caller-supplied mapping from code to physical placement, used to fill in
/// new path records. A code observed at conflicting placements stays
/// ambiguous and resolves to `None` so the planner skips it rather than
/// guessing.
#[derive(Debug, Clone, Default)]
pub struct LayoutMap {
    entries: BTreeMap<String, Placement>,
    ambiguous: BTreeSet<String>,
}

impl LayoutMap {
    pub fn get(&self, code: &str) -> Option<&Placement> {
        if self.ambiguous.contains(code) {
            return None;
        }
        self.entries.get(code)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.ambiguous.is_empty()
    }

    pub fn observe(&mut self, code: &str, placement: Placement) {
        if self.ambiguous.contains(code) {
            return;
        }
        match self.entries.get(code) {
            Some(existing) if *existing != placement => {
                self.entries.remove(code);
                self.ambiguous.insert(code.to_string());
            }
            Some(_) => {}
            None => {
                self.entries.insert(code.to_string(), placement);
            }
        }
    }

    /// Explicit placements win over anything observed by scanning.
    pub fn set(&mut self, code: &str, placement: Placement) {
        self.ambiguous.remove(code);
        self.entries.insert(code.to_string(), placement);
    }
}

/// Walk a plugin artifact tree and derive placements. A file at
/// `<root>/<layer...>/<category>/<code>.<ext>` places `code` at
/// `(<layer...>, <category>)`; files directly under the root or one level
/// deep carry no category and are ignored.
pub fn scan_layout(root: &Path) -> Result<LayoutMap> {
    let mut map = LayoutMap::default();
    if !root.exists() {
        return Ok(map);
    }

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .context("walked entry escapes scan root")?;
        let components: Vec<String> = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().to_string())
            .collect();
        if components.len() < 3 {
            continue;
        }

        let file_name = &components[components.len() - 1];
        let code = match file_name.split('.').next() {
            Some(stem) if !stem.is_empty() => stem.to_string(),
            _ => continue,
        };
        let category = components[components.len() - 2].clone();
        let layer = components[..components.len() - 2].join("/");
        map.observe(&code, Placement { layer, category });
    }

    Ok(map)
}

/// Parse a CLI `code=layer/category` override.
pub fn parse_placement_override(value: &str) -> Result<(String, Placement)> {
    let Some((code, location)) = value.split_once('=') else {
        bail!("layout override must look like code=layer/category, got '{value}'");
    };
    let code = code.trim();
    let location = location.trim().trim_matches('/');
    let Some((layer, category)) = location.rsplit_once('/') else {
        bail!("layout override location needs at least layer/category, got '{location}'");
    };
    if code.is_empty() || layer.is_empty() || category.is_empty() {
        bail!("layout override must look like code=layer/category, got '{value}'");
    }
    Ok((
        code.to_string(),
        Placement {
            layer: layer.to_string(),
            category: category.to_string(),
        },
    ))
}
