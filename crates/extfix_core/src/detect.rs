use serde::Serialize;

use crate::config::RegistryRules;
use crate::reader::FactSet;

/// Which half of a role's permission column a key lives in.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PermissionSetKind {
    Access,
    Modify,
}

impl PermissionSetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Modify => "modify",
        }
    }
}

/// One observed disagreement between the registry facts and the shape of a
/// correctly registered extension. Variant order is the report order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    MissingExtensionRecord {
        code: String,
        extension_type: String,
    },
    MissingModuleRecord {
        code: String,
    },
    StalePathNamespace {
        extension_path_id: i64,
        path: String,
        deprecated_prefix: String,
    },
    MissingPathRecord {
        code: String,
    },
    PermissionGap {
        code: String,
        role: String,
        set: PermissionSetKind,
        key: String,
    },
}

/// The permission key the host application grants for an extension.
pub fn permission_key(category: &str, code: &str) -> String {
    format!("extension/{category}/{code}")
}

/// Compare the fact-set for one code against the expected registration
/// shape. Pure and deterministic: identical inputs yield an identical,
/// identically ordered list. No store access.
pub fn detect_drift(facts: &FactSet, rules: &RegistryRules) -> Vec<Discrepancy> {
    let code = facts.code.as_str();
    let category = expected_category(facts);
    let mut out = Vec::new();

    if facts.extensions.is_empty() {
        out.push(Discrepancy::MissingExtensionRecord {
            code: code.to_string(),
            extension_type: category.clone(),
        });
    }

    if rules.legacy_modules && !facts.extensions.is_empty() && facts.modules.is_empty() {
        out.push(Discrepancy::MissingModuleRecord {
            code: code.to_string(),
        });
    }

    let mut stale = Vec::new();
    for path in &facts.paths {
        if let Some(prefix) = rules
            .deprecated_prefixes
            .iter()
            .find(|prefix| strip_deprecated_prefix(&path.path, prefix).is_some())
        {
            stale.push(Discrepancy::StalePathNamespace {
                extension_path_id: path.extension_path_id,
                path: path.path.clone(),
                deprecated_prefix: prefix.clone(),
            });
        }
    }
    stale.sort_by(|left, right| match (left, right) {
        (
            Discrepancy::StalePathNamespace {
                path: left_path,
                extension_path_id: left_id,
                ..
            },
            Discrepancy::StalePathNamespace {
                path: right_path,
                extension_path_id: right_id,
                ..
            },
        ) => (left_path, left_id).cmp(&(right_path, right_id)),
        _ => std::cmp::Ordering::Equal,
    });
    out.extend(stale);

    let has_enabled_extension = facts.extensions.iter().any(|extension| extension.enabled);
    if has_enabled_extension && facts.paths.is_empty() {
        out.push(Discrepancy::MissingPathRecord {
            code: code.to_string(),
        });
    }

    if let Some(permission) = &facts.permission_set {
        let expected = permission_key(&category, code);
        let mut gaps = Vec::new();
        if !permission.access.iter().any(|key| key == &expected) {
            gaps.push((PermissionSetKind::Access, expected.clone()));
        }
        if !permission.modify.iter().any(|key| key == &expected) {
            gaps.push((PermissionSetKind::Modify, expected.clone()));
        }
        // A key granted in modify is practically needed in access too; keys
        // outside this code's scope are left to their own runs.
        for key in &permission.modify {
            if key_references_code(key, code)
                && !permission.access.iter().any(|access_key| access_key == key)
                && !gaps.contains(&(PermissionSetKind::Access, key.clone()))
            {
                gaps.push((PermissionSetKind::Access, key.clone()));
            }
        }
        gaps.sort();
        out.extend(
            gaps.into_iter()
                .map(|(set, key)| Discrepancy::PermissionGap {
                    code: code.to_string(),
                    role: permission.role.clone(),
                    set,
                    key,
                }),
        );
    }

    out
}

/// The category segment for the code's permission key and any new path:
/// the registered extension type when present, otherwise the
/// second-to-last segment of an existing path, otherwise "module".
fn expected_category(facts: &FactSet) -> String {
    if let Some(extension) = facts.extensions.first() {
        return extension.extension_type.clone();
    }
    for path in &facts.paths {
        let segments: Vec<&str> = path.path.split('/').collect();
        if segments.len() >= 2 {
            return segments[segments.len() - 2].to_string();
        }
    }
    "module".to_string()
}

fn key_references_code(key: &str, code: &str) -> bool {
    key == code || key.ends_with(&format!("/{code}"))
}

/// Match a deprecated prefix against the path's leading segments only,
/// whether or not the prefix was configured with a trailing slash:
/// `oldns` and `oldns/` both match `oldns/admin/...`, neither matches
/// `oldnsfoo/admin/...`. Returns the remainder after the separator.
pub(crate) fn strip_deprecated_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    path.strip_prefix(prefix)?.strip_prefix('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{ExtensionPathRecord, ExtensionRecord, ModuleRecord, PermissionSet};

    fn facts(code: &str) -> FactSet {
        FactSet {
            code: code.to_string(),
            extensions: Vec::new(),
            paths: Vec::new(),
            modules: Vec::new(),
            permission_set: None,
        }
    }

    fn extension(code: &str, enabled: bool) -> ExtensionRecord {
        ExtensionRecord {
            extension_id: 1,
            extension_type: "module".to_string(),
            code: code.to_string(),
            enabled,
        }
    }

    fn path(id: i64, path: &str) -> ExtensionPathRecord {
        ExtensionPathRecord {
            extension_path_id: id,
            path: path.to_string(),
            extension_install_id: None,
        }
    }

    fn rules_with_prefixes(prefixes: &[&str]) -> RegistryRules {
        RegistryRules {
            deprecated_prefixes: prefixes.iter().map(|prefix| prefix.to_string()).collect(),
            ..RegistryRules::default()
        }
    }

    #[test]
    fn missing_extension_record_is_detected() {
        let mut input = facts("trendyol");
        input.paths.push(path(
            1,
            "extension/admin/controller/module/trendyol.php",
        ));
        let out = detect_drift(&input, &RegistryRules::default());
        assert_eq!(
            out,
            vec![Discrepancy::MissingExtensionRecord {
                code: "trendyol".to_string(),
                extension_type: "module".to_string(),
            }]
        );
    }

    #[test]
    fn missing_module_record_requires_extension_and_legacy_mode() {
        let mut input = facts("trendyol");
        input.extensions.push(extension("trendyol", true));
        input.paths.push(path(
            1,
            "extension/admin/controller/module/trendyol.php",
        ));

        let out = detect_drift(&input, &RegistryRules::default());
        assert_eq!(
            out,
            vec![Discrepancy::MissingModuleRecord {
                code: "trendyol".to_string(),
            }]
        );

        let no_legacy = RegistryRules {
            legacy_modules: false,
            ..RegistryRules::default()
        };
        assert!(detect_drift(&input, &no_legacy).is_empty());
    }

    #[test]
    fn stale_prefix_matches_leading_segment_only() {
        let mut input = facts("foo");
        input.extensions.push(extension("foo", true));
        input.modules.push(ModuleRecord {
            module_id: 1,
            name: "Foo".to_string(),
            code: "foo".to_string(),
            enabled: true,
        });
        input
            .paths
            .push(path(1, "oldns/admin/controller/module/foo.php"));
        input.paths.push(path(2, "extension/admin/oldns/foo.php"));

        let out = detect_drift(&input, &rules_with_prefixes(&["oldns/"]));
        assert_eq!(
            out,
            vec![Discrepancy::StalePathNamespace {
                extension_path_id: 1,
                path: "oldns/admin/controller/module/foo.php".to_string(),
                deprecated_prefix: "oldns/".to_string(),
            }]
        );
    }

    #[test]
    fn slashless_prefix_matches_whole_segments_only() {
        let mut input = facts("helper");
        input.extensions.push(extension("helper", true));
        input.modules.push(ModuleRecord {
            module_id: 1,
            name: "Helper".to_string(),
            code: "helper".to_string(),
            enabled: true,
        });
        input
            .paths
            .push(path(1, "oldns/admin/controller/module/helper.php"));
        input
            .paths
            .push(path(2, "oldnsfoo/admin/controller/module/helper.php"));

        // "oldnsfoo" is a different namespace, not a stale "oldns" path.
        let out = detect_drift(&input, &rules_with_prefixes(&["oldns"]));
        assert_eq!(
            out,
            vec![Discrepancy::StalePathNamespace {
                extension_path_id: 1,
                path: "oldns/admin/controller/module/helper.php".to_string(),
                deprecated_prefix: "oldns".to_string(),
            }]
        );
    }

    #[test]
    fn missing_path_record_only_for_enabled_extensions() {
        let mut enabled = facts("trendyol_importer");
        enabled.extensions.push(extension("trendyol_importer", true));
        enabled.modules.push(ModuleRecord {
            module_id: 1,
            name: "Trendyol Importer".to_string(),
            code: "trendyol_importer".to_string(),
            enabled: true,
        });
        let out = detect_drift(&enabled, &RegistryRules::default());
        assert_eq!(
            out,
            vec![Discrepancy::MissingPathRecord {
                code: "trendyol_importer".to_string(),
            }]
        );

        let mut disabled = enabled.clone();
        disabled.extensions[0].enabled = false;
        assert!(detect_drift(&disabled, &RegistryRules::default()).is_empty());
    }

    #[test]
    fn stale_path_suppresses_missing_path_record() {
        let mut input = facts("meschain_trendyol");
        input.extensions.push(extension("meschain_trendyol", true));
        input.modules.push(ModuleRecord {
            module_id: 1,
            name: "Trendyol".to_string(),
            code: "meschain_trendyol".to_string(),
            enabled: true,
        });
        input.paths.push(path(
            7,
            "meschain_sync/admin/controller/module/meschain_trendyol.php",
        ));

        let out = detect_drift(&input, &rules_with_prefixes(&["meschain_sync/"]));
        assert_eq!(
            out,
            vec![Discrepancy::StalePathNamespace {
                extension_path_id: 7,
                path: "meschain_sync/admin/controller/module/meschain_trendyol.php".to_string(),
                deprecated_prefix: "meschain_sync/".to_string(),
            }]
        );
    }

    #[test]
    fn permission_gaps_cover_both_sets_in_order() {
        let mut input = facts("trendyol_importer");
        input.extensions.push(extension("trendyol_importer", true));
        input.modules.push(ModuleRecord {
            module_id: 1,
            name: "Trendyol Importer".to_string(),
            code: "trendyol_importer".to_string(),
            enabled: true,
        });
        input.paths.push(path(
            1,
            "extension/admin/controller/module/trendyol_importer.php",
        ));
        input.permission_set = Some(PermissionSet {
            user_group_id: 1,
            role: "Administrator".to_string(),
            access: Vec::new(),
            modify: Vec::new(),
        });

        let out = detect_drift(&input, &RegistryRules::default());
        assert_eq!(
            out,
            vec![
                Discrepancy::PermissionGap {
                    code: "trendyol_importer".to_string(),
                    role: "Administrator".to_string(),
                    set: PermissionSetKind::Access,
                    key: "extension/module/trendyol_importer".to_string(),
                },
                Discrepancy::PermissionGap {
                    code: "trendyol_importer".to_string(),
                    role: "Administrator".to_string(),
                    set: PermissionSetKind::Modify,
                    key: "extension/module/trendyol_importer".to_string(),
                },
            ]
        );
    }

    #[test]
    fn modify_key_without_access_is_a_gap() {
        let mut input = facts("trendyol");
        input.extensions.push(extension("trendyol", true));
        input.modules.push(ModuleRecord {
            module_id: 1,
            name: "Trendyol".to_string(),
            code: "trendyol".to_string(),
            enabled: true,
        });
        input.paths.push(path(
            1,
            "extension/admin/controller/module/trendyol.php",
        ));
        input.permission_set = Some(PermissionSet {
            user_group_id: 1,
            role: "Administrator".to_string(),
            access: vec!["extension/module/trendyol".to_string()],
            modify: vec![
                "extension/module/trendyol".to_string(),
                "extension/payment/trendyol".to_string(),
                "extension/module/unrelated".to_string(),
            ],
        });

        let out = detect_drift(&input, &RegistryRules::default());
        assert_eq!(
            out,
            vec![Discrepancy::PermissionGap {
                code: "trendyol".to_string(),
                role: "Administrator".to_string(),
                set: PermissionSetKind::Access,
                key: "extension/payment/trendyol".to_string(),
            }]
        );
    }

    #[test]
    fn detection_is_deterministic() {
        let mut input = facts("meschain_trendyol");
        input.paths.push(path(
            2,
            "meschain_sync/admin/controller/module/meschain_trendyol.php",
        ));
        input.paths.push(path(
            1,
            "meschain_sync/admin/language/module/meschain_trendyol.php",
        ));
        let rules = rules_with_prefixes(&["meschain_sync/"]);

        let first = detect_drift(&input, &rules);
        let second = detect_drift(&input, &rules);
        assert_eq!(first, second);
        // Ordered by kind, then path lexicographically.
        assert!(matches!(
            first[0],
            Discrepancy::MissingExtensionRecord { .. }
        ));
        assert!(matches!(
            &first[1],
            Discrepancy::StalePathNamespace { path, .. }
                if path == "meschain_sync/admin/controller/module/meschain_trendyol.php"
        ));
    }
}
