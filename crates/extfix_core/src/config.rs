use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NAMESPACE: &str = "extension";
pub const DEFAULT_ROLE: &str = "Administrator";
pub const DEFAULT_DB_FILENAME: &str = "registry.db";

/// On-disk configuration (`extfix.toml`). Every section is optional; a
/// missing file yields the defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FileConfig {
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub layout: LayoutSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RegistrySection {
    pub current_namespace: Option<String>,
    /// Leading path segments retired by earlier application versions,
    /// e.g. `["meschain_sync/"]`. Matched as exact prefixes only.
    #[serde(default)]
    pub deprecated_prefixes: Vec<String>,
    pub role: Option<String>,
    /// Whether the legacy module table is still consulted for registration.
    pub legacy_modules: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StoreSection {
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LayoutSection {
    /// Root of the plugin artifact tree to scan for physical placement.
    pub scan_root: Option<PathBuf>,
    /// Explicit `code = "layer/category"` placements; these win over the scan.
    #[serde(default)]
    pub codes: BTreeMap<String, String>,
}

/// Load and parse a FileConfig from a TOML file. Returns defaults if the file
/// does not exist.
pub fn load_config(config_path: &Path) -> Result<FileConfig> {
    if !config_path.exists() {
        return Ok(FileConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: FileConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Effective rules for one reconciliation run. Built once from config plus
/// caller overrides and passed into every stage; the engine holds no
/// process-wide state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRules {
    pub current_namespace: String,
    pub deprecated_prefixes: Vec<String>,
    pub role: String,
    pub legacy_modules: bool,
}

impl Default for RegistryRules {
    fn default() -> Self {
        Self {
            current_namespace: DEFAULT_NAMESPACE.to_string(),
            deprecated_prefixes: Vec::new(),
            role: DEFAULT_ROLE.to_string(),
            legacy_modules: true,
        }
    }
}

impl RegistryRules {
    pub fn from_config(config: &FileConfig) -> Self {
        Self {
            current_namespace: config
                .registry
                .current_namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            deprecated_prefixes: config.registry.deprecated_prefixes.clone(),
            role: config
                .registry
                .role
                .clone()
                .unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            legacy_modules: config.registry.legacy_modules.unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/extfix.toml")).expect("load config");
        assert!(config.registry.deprecated_prefixes.is_empty());
        assert!(config.store.db_path.is_none());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("extfix.toml");
        fs::write(
            &config_path,
            r#"
[registry]
current_namespace = "extension"
deprecated_prefixes = ["meschain_sync/", "oldns/"]
role = "Administrator"
legacy_modules = false

[store]
db_path = "/srv/opencart/registry.db"

[layout]
scan_root = "/srv/opencart/upload"

[layout.codes]
meschain_trendyol = "admin/controller/module"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.registry.deprecated_prefixes,
            vec!["meschain_sync/".to_string(), "oldns/".to_string()]
        );
        assert_eq!(config.registry.legacy_modules, Some(false));
        assert_eq!(
            config.store.db_path.as_deref(),
            Some(Path::new("/srv/opencart/registry.db"))
        );
        assert_eq!(
            config
                .layout
                .codes
                .get("meschain_trendyol")
                .map(String::as_str),
            Some("admin/controller/module")
        );
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("extfix.toml");
        fs::write(&config_path, "[registry]\nrole = \"Editors\"\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.registry.role.as_deref(), Some("Editors"));
        assert!(config.layout.codes.is_empty());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("extfix.toml");
        fs::write(&config_path, "[registry\nrole = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn rules_fall_back_to_defaults() {
        let rules = RegistryRules::from_config(&FileConfig::default());
        assert_eq!(rules.current_namespace, "extension");
        assert_eq!(rules.role, "Administrator");
        assert!(rules.legacy_modules);
        assert!(rules.deprecated_prefixes.is_empty());
    }
}
