use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use extfix_core::config::{DEFAULT_DB_FILENAME, FileConfig, RegistryRules, load_config};
use extfix_core::detect::Discrepancy;
use extfix_core::engine::{CodeReport, Outcome, RunMode, RunReport, reconcile};
use extfix_core::layout::{LayoutMap, parse_placement_override, scan_layout};
use extfix_core::plan::SkipReason;
use extfix_core::reader::{RegistryStats, list_codes, registry_stats};
use extfix_core::store::{Connection, init_schema, open_existing_store, open_store, table_exists};

#[derive(Debug, Parser)]
#[command(
    name = "extfix",
    version,
    about = "Detect and repair drift in an extension registry"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Registry SQLite file")]
    db: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Config file (extfix.toml)")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "NAME", help = "Role whose permissions are checked")]
    role: Option<String>,
    #[arg(
        long = "deprecated-prefix",
        global = true,
        value_name = "PREFIX",
        help = "Additional retired path prefix (repeatable)"
    )]
    deprecated_prefixes: Vec<String>,
    #[arg(long, global = true, value_name = "PATH", help = "Plugin artifact tree to scan")]
    scan_root: Option<PathBuf>,
    #[arg(
        long = "layout",
        global = true,
        value_name = "CODE=LAYER/CATEGORY",
        help = "Explicit placement override (repeatable)"
    )]
    layout_overrides: Vec<String>,
    #[arg(long, global = true, help = "Emit the report as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    db: Option<PathBuf>,
    config: Option<PathBuf>,
    role: Option<String>,
    deprecated_prefixes: Vec<String>,
    scan_root: Option<PathBuf>,
    layout_overrides: Vec<String>,
    json: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            db: cli.db.clone(),
            config: cli.config.clone(),
            role: cli.role.clone(),
            deprecated_prefixes: cli.deprecated_prefixes.clone(),
            scan_root: cli.scan_root.clone(),
            layout_overrides: cli.layout_overrides.clone(),
            json: cli.json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Report drift without touching the store")]
    Check(TargetArgs),
    #[command(about = "Repair drift transactionally")]
    Apply(TargetArgs),
    #[command(about = "List codes known to any fact table")]
    List(ListArgs),
    #[command(about = "Show store location and per-table row counts")]
    Status,
    #[command(name = "init-store", about = "Create the registry schema")]
    InitStore,
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[arg(value_name = "CODE", help = "Extension code, or a LIKE pattern containing %")]
    target: String,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(value_name = "PATTERN", help = "Optional LIKE pattern filter")]
    pattern: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Check(args)) => run_reconcile(&runtime, &args.target, RunMode::Check),
        Some(Commands::Apply(args)) => run_reconcile(&runtime, &args.target, RunMode::Apply),
        Some(Commands::List(args)) => run_list(&runtime, args.pattern.as_deref()),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::InitStore) => run_init_store(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Effective settings for one invocation: flag beats environment beats
/// config file beats built-in default.
struct ResolvedRuntime {
    db_path: PathBuf,
    rules: RegistryRules,
    layout: LayoutMap,
}

fn resolve_runtime(runtime: &RuntimeOptions) -> Result<ResolvedRuntime> {
    dotenvy::dotenv().ok();

    let config_path = runtime
        .config
        .clone()
        .or_else(|| env::var_os("EXTFIX_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("extfix.toml"));
    let config = load_config(&config_path)?;

    let db_path = runtime
        .db
        .clone()
        .or_else(|| env::var_os("EXTFIX_DB").map(PathBuf::from))
        .or_else(|| config.store.db_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILENAME));

    let mut rules = RegistryRules::from_config(&config);
    if let Some(role) = runtime
        .role
        .clone()
        .or_else(|| env::var("EXTFIX_ROLE").ok())
    {
        rules.role = role;
    }
    rules
        .deprecated_prefixes
        .extend(runtime.deprecated_prefixes.iter().cloned());

    let layout = resolve_layout(runtime, &config)?;

    Ok(ResolvedRuntime {
        db_path,
        rules,
        layout,
    })
}

fn resolve_layout(runtime: &RuntimeOptions, config: &FileConfig) -> Result<LayoutMap> {
    let mut layout = match runtime
        .scan_root
        .as_deref()
        .or(config.layout.scan_root.as_deref())
    {
        Some(root) => scan_layout(root)?,
        None => LayoutMap::default(),
    };
    for (code, location) in &config.layout.codes {
        let (code, placement) = parse_placement_override(&format!("{code}={location}"))
            .with_context(|| format!("invalid [layout.codes] entry for '{code}'"))?;
        layout.set(&code, placement);
    }
    for value in &runtime.layout_overrides {
        let (code, placement) = parse_placement_override(value)?;
        layout.set(&code, placement);
    }
    Ok(layout)
}

fn run_reconcile(runtime: &RuntimeOptions, target: &str, mode: RunMode) -> Result<()> {
    let resolved = resolve_runtime(runtime)?;
    let mut connection = open_existing_store(&resolved.db_path)?;
    ensure_schema_present(&connection, &resolved.db_path)?;

    let report = reconcile(
        &mut connection,
        target,
        mode,
        &resolved.rules,
        &resolved.layout,
    )?;

    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_report(&resolved, target, &report);
    }

    if !report.success() {
        bail!("reconciliation finished with errors (see report above)");
    }
    Ok(())
}

fn run_list(runtime: &RuntimeOptions, pattern: Option<&str>) -> Result<()> {
    let resolved = resolve_runtime(runtime)?;
    let connection = open_existing_store(&resolved.db_path)?;
    ensure_schema_present(&connection, &resolved.db_path)?;

    let codes = list_codes(&connection, pattern)?;
    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&codes)?);
        return Ok(());
    }

    println!("registry codes");
    println!("db_path: {}", normalize_path(&resolved.db_path));
    println!("pattern: {}", pattern.unwrap_or("<none>"));
    println!("codes.count: {}", codes.len());
    for code in &codes {
        println!("  - {code}");
    }
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let resolved = resolve_runtime(runtime)?;
    // Status is a pure read; probing first keeps a mistyped --db from
    // leaving an empty database file behind.
    let store_present = resolved.db_path.exists();
    let connection = if store_present {
        Some(open_existing_store(&resolved.db_path)?)
    } else {
        None
    };
    let schema_present = match &connection {
        Some(connection) => table_exists(connection, "extension")?,
        None => false,
    };

    if runtime.json {
        let stats = match &connection {
            Some(connection) if schema_present => Some(registry_stats(connection)?),
            _ => None,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "db_path": resolved.db_path,
                "store_present": store_present,
                "schema_present": schema_present,
                "role": resolved.rules.role,
                "stats": stats,
            }))?
        );
        return Ok(());
    }

    println!("registry status");
    println!("db_path: {}", normalize_path(&resolved.db_path));
    println!("store_present: {}", format_flag(store_present));
    println!("schema_present: {}", format_flag(schema_present));
    println!("role: {}", resolved.rules.role);
    println!(
        "deprecated_prefixes: {}",
        if resolved.rules.deprecated_prefixes.is_empty() {
            "<none>".to_string()
        } else {
            resolved.rules.deprecated_prefixes.join(", ")
        }
    );
    match &connection {
        Some(connection) if schema_present => print_registry_stats(&registry_stats(connection)?),
        Some(_) => println!("stats: <no schema> (run `extfix init-store`)"),
        None => println!("stats: <no store> (run `extfix init-store`)"),
    }
    Ok(())
}

fn run_init_store(runtime: &RuntimeOptions) -> Result<()> {
    let resolved = resolve_runtime(runtime)?;
    let connection = open_store(&resolved.db_path)?;
    init_schema(&connection)?;

    println!("initialized registry store");
    println!("db_path: {}", normalize_path(&resolved.db_path));
    Ok(())
}

fn ensure_schema_present(connection: &Connection, db_path: &Path) -> Result<()> {
    if !table_exists(connection, "extension")? {
        bail!(
            "no registry schema at {} (run `extfix init-store`)",
            normalize_path(db_path)
        );
    }
    Ok(())
}

fn print_run_report(resolved: &ResolvedRuntime, target: &str, report: &RunReport) {
    println!(
        "{}",
        match report.mode {
            RunMode::Check => "drift check",
            RunMode::Apply => "drift repair",
        }
    );
    println!("db_path: {}", normalize_path(&resolved.db_path));
    println!("target: {target}");
    println!("role: {}", report.role);
    println!("codes.count: {}", report.codes.len());
    for code in &report.codes {
        print_code_report(code);
    }
}

fn print_code_report(report: &CodeReport) {
    println!("code: {}", report.code);
    println!(
        "  outcome: {}",
        match report.outcome {
            Outcome::DryRun => "dry-run",
            Outcome::Applied => "applied",
            Outcome::Aborted => "aborted",
        }
    );
    println!("  discrepancies: {}", report.discrepancies.len());
    for discrepancy in &report.discrepancies {
        println!("    - {}", describe_discrepancy(discrepancy));
    }
    println!("  planned: {}", report.operations.len());
    for planned in &report.operations {
        println!("    - {}", planned.operation.describe());
    }
    for skipped in &report.skipped {
        println!(
            "  skipped: {} ({})",
            describe_discrepancy(&skipped.discrepancy),
            match skipped.reason {
                SkipReason::AmbiguousLayer => "ambiguous layer",
                SkipReason::ReportOnly => "report only",
            }
        );
    }
    if !report.applied.is_empty() {
        println!("  applied: {}", report.applied.len());
        for applied in &report.applied {
            println!(
                "    - {} ({} ms)",
                applied.operation.describe(),
                applied.elapsed_ms
            );
        }
    }
    for error in &report.errors {
        println!("  error: {error}");
    }
}

fn describe_discrepancy(discrepancy: &Discrepancy) -> String {
    match discrepancy {
        Discrepancy::MissingExtensionRecord {
            code,
            extension_type,
        } => format!("missing extension record ({extension_type}, {code})"),
        Discrepancy::MissingModuleRecord { code } => {
            format!("missing legacy module record for '{code}'")
        }
        Discrepancy::StalePathNamespace {
            extension_path_id,
            path,
            deprecated_prefix,
        } => format!("stale namespace '{deprecated_prefix}' in path #{extension_path_id} '{path}'"),
        Discrepancy::MissingPathRecord { code } => format!("no path record for '{code}'"),
        Discrepancy::PermissionGap {
            role, set, key, ..
        } => format!("role '{role}' lacks {} key '{key}'", set.as_str()),
    }
}

fn print_registry_stats(stats: &RegistryStats) {
    println!("stats.extensions: {}", stats.extensions);
    println!("stats.paths: {}", stats.paths);
    println!("stats.modules: {}", stats.modules);
    println!("stats.roles: {}", stats.roles);
    if stats.extensions_by_type.is_empty() {
        println!("stats.by_type: <empty>");
    } else {
        for (extension_type, count) in &stats.extensions_by_type {
            println!("stats.type.{extension_type}: {count}");
        }
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
