use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use lmp_trace_core::{Invocation, InvocationId, TimeRange, TraceStore, VersionId};
use lmp_trace_store_sqlite::SqliteStore;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "lmpt.v1";

#[derive(Debug, Parser)]
#[command(name = "lmpt")]
#[command(about = "Inspect recorded LMP versions and invocations")]
struct Cli {
    #[arg(long, default_value = "./lmp_trace.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Version {
        #[command(subcommand)]
        command: Box<VersionCommand>,
    },
    Invocation {
        #[command(subcommand)]
        command: Box<InvocationCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum VersionCommand {
    Show(VersionIdArgs),
    List(VersionListArgs),
    Diff(VersionDiffArgs),
    DiffPrevious(VersionIdArgs),
    Dependents(VersionIdArgs),
}

#[derive(Debug, Args)]
struct VersionIdArgs {
    #[arg(long, value_parser = parse_version_id)]
    id: VersionId,
}

#[derive(Debug, Args)]
struct VersionListArgs {
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Args)]
struct VersionDiffArgs {
    #[arg(long, value_parser = parse_version_id)]
    from: VersionId,
    #[arg(long, value_parser = parse_version_id)]
    to: VersionId,
}

#[derive(Debug, Subcommand)]
enum InvocationCommand {
    Show(InvocationIdArgs),
    List(InvocationListArgs),
    Lineage(InvocationIdArgs),
    Tree(InvocationIdArgs),
}

#[derive(Debug, Args)]
struct InvocationIdArgs {
    #[arg(long, value_parser = parse_invocation_id)]
    id: InvocationId,
}

#[derive(Debug, Args)]
struct InvocationListArgs {
    #[arg(long, value_parser = parse_version_id)]
    version_id: VersionId,
    #[arg(long, value_parser = parse_rfc3339)]
    since: Option<OffsetDateTime>,
    #[arg(long, value_parser = parse_rfc3339)]
    until: Option<OffsetDateTime>,
}

fn parse_version_id(raw: &str) -> Result<VersionId, String> {
    VersionId::parse(raw).map_err(|err| err.to_string())
}

fn parse_invocation_id(raw: &str) -> Result<InvocationId, String> {
    raw.parse::<InvocationId>().map_err(|err| err.to_string())
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| format!("invalid RFC3339 timestamp `{raw}`: {err}"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &store),
        Command::Version { command } => {
            store.migrate()?;
            run_version(*command, &store)
        }
        Command::Invocation { command } => {
            store.migrate()?;
            run_invocation(*command, &store)
        }
    }
}

fn run_db(command: DbCommand, store: &SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &SqliteStore) -> Result<()> {
    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_version(command: VersionCommand, store: &SqliteStore) -> Result<()> {
    match command {
        VersionCommand::Show(args) => {
            let version = store
                .get_version(&args.id)?
                .ok_or_else(|| anyhow!("version not found: {}", args.id))?;
            emit_json(serde_json::json!({ "version": version }))
        }
        VersionCommand::List(args) => {
            let versions = match args.name.as_deref() {
                Some(name) => store.list_versions(name)?,
                None => store.list_all_versions()?,
            };
            let summaries = versions
                .iter()
                .map(|version| {
                    serde_json::json!({
                        "version_id": version.version_id,
                        "name": version.name,
                        "created_at": rfc3339(version.created_at),
                        "dependencies": version.dependencies.len(),
                        "best_effort": version.best_effort
                    })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({
                "name": args.name,
                "count": summaries.len(),
                "versions": summaries
            }))
        }
        VersionCommand::Diff(args) => {
            let diff = store.diff(&args.from, &args.to)?;
            emit_json(serde_json::json!({
                "changed_components": diff.changed_components(),
                "diff": diff
            }))
        }
        VersionCommand::DiffPrevious(args) => {
            let Some(previous) = store.previous_version(&args.id)? else {
                return emit_json(serde_json::json!({
                    "version_id": args.id,
                    "previous_version_id": Value::Null,
                    "diff": Value::Null
                }));
            };
            let diff = store.diff(&previous.version_id, &args.id)?;
            emit_json(serde_json::json!({
                "version_id": args.id,
                "previous_version_id": previous.version_id,
                "changed_components": diff.changed_components(),
                "diff": diff
            }))
        }
        VersionCommand::Dependents(args) => {
            let dependents = store.list_dependents(&args.id)?;
            let ids = dependents
                .iter()
                .map(|version| serde_json::json!({ "version_id": version.version_id, "name": version.name }))
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({
                "version_id": args.id,
                "count": ids.len(),
                "dependents": ids
            }))
        }
    }
}

fn run_invocation(command: InvocationCommand, store: &SqliteStore) -> Result<()> {
    match command {
        InvocationCommand::Show(args) => {
            let invocation = store
                .get_invocation(args.id)?
                .ok_or_else(|| anyhow!("invocation not found: {}", args.id))?;
            emit_json(serde_json::json!({
                "duration_ms": invocation
                    .duration()
                    .and_then(|duration| i64::try_from(duration.whole_milliseconds()).ok()),
                "invocation": invocation
            }))
        }
        InvocationCommand::List(args) => {
            let range = TimeRange { start: args.since, end: args.until };
            let invocations = store.list_invocations(&args.version_id, &range)?;
            emit_json(serde_json::json!({
                "version_id": args.version_id,
                "since": args.since.map(rfc3339),
                "until": args.until.map(rfc3339),
                "count": invocations.len(),
                "invocations": invocations
            }))
        }
        InvocationCommand::Lineage(args) => {
            let lineage = store.get_lineage(args.id)?;
            emit_json(serde_json::json!({
                "invocation_id": args.id,
                "depth": lineage.len(),
                "lineage": lineage
            }))
        }
        InvocationCommand::Tree(args) => {
            let root = store
                .get_invocation(args.id)?
                .ok_or_else(|| anyhow!("invocation not found: {}", args.id))?;
            let descendants = store.get_descendants(args.id)?;
            let size = descendants.len() + 1;
            emit_json(serde_json::json!({
                "invocation_id": args.id,
                "size": size,
                "tree": call_tree(root, descendants)
            }))
        }
    }
}

/// Nest `descendants` under `root` by parent id.
fn call_tree(root: Invocation, descendants: Vec<Invocation>) -> Value {
    let mut children: BTreeMap<InvocationId, Vec<Invocation>> = BTreeMap::new();
    for invocation in descendants {
        if let Some(parent) = invocation.parent_invocation_id {
            children.entry(parent).or_default().push(invocation);
        }
    }
    tree_node(root, &mut children)
}

fn tree_node(invocation: Invocation, children: &mut BTreeMap<InvocationId, Vec<Invocation>>) -> Value {
    let nested = children
        .remove(&invocation.invocation_id)
        .unwrap_or_default()
        .into_iter()
        .map(|child| tree_node(child, children))
        .collect::<Vec<_>>();
    serde_json::json!({
        "invocation_id": invocation.invocation_id,
        "version_id": invocation.version_id,
        "status": invocation.status,
        "started_at": rfc3339(invocation.started_at),
        "error": invocation.error,
        "children": nested
    })
}

fn rfc3339(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}
