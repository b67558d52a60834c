use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lmp_trace_core::{
    Finalization, Invocation, InvocationError, InvocationId, InvocationStatus, SerializedValue,
    TimeRange, TraceError, TraceStore, Version, VersionId,
};
use parking_lot::Mutex;
use rusqlite::{
    params, Connection, DatabaseName, ErrorCode, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const VERSIONS_FILE: &str = "versions.ndjson";
const INVOCATIONS_FILE: &str = "invocations.ndjson";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS versions (
  version_id TEXT PRIMARY KEY CHECK (length(version_id) = 64),
  name TEXT NOT NULL,
  source_text TEXT NOT NULL,
  dependencies_json TEXT NOT NULL,
  free_variables_json TEXT NOT NULL,
  best_effort INTEGER NOT NULL CHECK (best_effort IN (0, 1)),
  cycle_seal TEXT,
  created_at TEXT NOT NULL,
  created_at_ns INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS invocations (
  invocation_id TEXT PRIMARY KEY,
  version_id TEXT NOT NULL,
  parent_invocation_id TEXT,
  inputs_json TEXT NOT NULL,
  output_json TEXT,
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
  error_kind TEXT,
  error_message TEXT,
  started_at TEXT NOT NULL,
  started_at_ns INTEGER NOT NULL,
  ended_at TEXT,
  ended_at_ns INTEGER,
  CHECK (ended_at_ns IS NULL OR ended_at_ns >= started_at_ns),
  CHECK ((status = 'running') = (ended_at_ns IS NULL)),
  CHECK ((status = 'failed') = (error_kind IS NOT NULL)),
  CHECK (parent_invocation_id IS NULL OR parent_invocation_id <> invocation_id),
  FOREIGN KEY (version_id) REFERENCES versions(version_id),
  FOREIGN KEY (parent_invocation_id) REFERENCES invocations(invocation_id)
);

CREATE INDEX IF NOT EXISTS idx_versions_name ON versions(name, created_at_ns);
CREATE INDEX IF NOT EXISTS idx_invocations_version ON invocations(version_id, started_at_ns);
CREATE INDEX IF NOT EXISTS idx_invocations_parent ON invocations(parent_invocation_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS version_dependencies (
  version_id TEXT NOT NULL,
  dependency_version_id TEXT NOT NULL,
  PRIMARY KEY (version_id, dependency_version_id),
  FOREIGN KEY (version_id) REFERENCES versions(version_id)
);

CREATE INDEX IF NOT EXISTS idx_version_dependencies_dependency
  ON version_dependencies(dependency_version_id);
";

const VERSION_COLUMNS: &str = "version_id, name, source_text, dependencies_json, \
     free_variables_json, best_effort, cycle_seal, created_at";

const INVOCATION_COLUMNS: &str = "invocation_id, version_id, parent_invocation_id, inputs_json, \
     output_json, status, error_kind, error_message, metadata_json, started_at, ended_at";

/// Bounded retry for transient `SQLITE_BUSY` / `SQLITE_LOCKED` failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff_ms: 25 }
    }
}

impl RetryPolicy {
    /// Linear backoff: the n-th retry waits `n * backoff_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// SQLite-backed [`TraceStore`].
///
/// One connection guarded by a mutex; several `SqliteStore`s may open the
/// same file from different threads or processes and rely on WAL plus the
/// busy timeout for coordination.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_versions: usize,
    pub skipped_existing_versions: usize,
    pub imported_invocations: usize,
    pub skipped_existing_invocations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

struct VersionRow {
    version_id: String,
    name: String,
    source_text: String,
    dependencies_json: String,
    free_variables_json: String,
    best_effort: bool,
    cycle_seal: Option<String>,
    created_at: String,
}

impl VersionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            version_id: row.get(0)?,
            name: row.get(1)?,
            source_text: row.get(2)?,
            dependencies_json: row.get(3)?,
            free_variables_json: row.get(4)?,
            best_effort: row.get(5)?,
            cycle_seal: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_version(self) -> Result<Version> {
        Ok(Version {
            version_id: VersionId::parse(&self.version_id)?,
            dependencies: serde_json::from_str(&self.dependencies_json).with_context(|| {
                format!("invalid dependencies_json for version {}", self.version_id)
            })?,
            free_variables: serde_json::from_str(&self.free_variables_json).with_context(|| {
                format!("invalid free_variables_json for version {}", self.version_id)
            })?,
            name: self.name,
            source_text: self.source_text,
            best_effort: self.best_effort,
            cycle_seal: self.cycle_seal,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

struct InvocationRow {
    invocation_id: String,
    version_id: String,
    parent_invocation_id: Option<String>,
    inputs_json: String,
    output_json: Option<String>,
    status: String,
    error_kind: Option<String>,
    error_message: Option<String>,
    metadata_json: String,
    started_at: String,
    ended_at: Option<String>,
}

impl InvocationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            invocation_id: row.get(0)?,
            version_id: row.get(1)?,
            parent_invocation_id: row.get(2)?,
            inputs_json: row.get(3)?,
            output_json: row.get(4)?,
            status: row.get(5)?,
            error_kind: row.get(6)?,
            error_message: row.get(7)?,
            metadata_json: row.get(8)?,
            started_at: row.get(9)?,
            ended_at: row.get(10)?,
        })
    }

    fn into_invocation(self) -> Result<Invocation> {
        let status = InvocationStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("invalid invocation status: {}", self.status))?;
        let error = match (self.error_kind, self.error_message) {
            (Some(kind), message) => Some(InvocationError { kind, message: message.unwrap_or_default() }),
            (None, _) => None,
        };
        let output = self
            .output_json
            .as_deref()
            .map(serde_json::from_str::<SerializedValue>)
            .transpose()
            .with_context(|| format!("invalid output_json for invocation {}", self.invocation_id))?;

        Ok(Invocation {
            invocation_id: InvocationId::from_str(&self.invocation_id)?,
            version_id: VersionId::parse(&self.version_id)?,
            parent_invocation_id: self
                .parent_invocation_id
                .as_deref()
                .map(InvocationId::from_str)
                .transpose()?,
            inputs: serde_json::from_str(&self.inputs_json).with_context(|| {
                format!("invalid inputs_json for invocation {}", self.invocation_id)
            })?,
            output,
            started_at: parse_rfc3339(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_rfc3339).transpose()?,
            status,
            error,
            metadata: serde_json::from_str(&self.metadata_json).with_context(|| {
                format!("invalid metadata_json for invocation {}", self.invocation_id)
            })?,
        })
    }
}

impl SqliteStore {
    /// Open a SQLite-backed trace store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn), retry: RetryPolicy::default() })
    }

    /// Open and migrate in one step.
    ///
    /// # Errors
    /// Returns an error when opening or migrating fails.
    pub fn open_and_migrate(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Override how long SQLite itself waits on a locked database before
    /// reporting `SQLITE_BUSY`.
    ///
    /// # Errors
    /// Returns an error when the pragma cannot be applied.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.lock().busy_timeout(timeout).context("failed to set sqlite busy timeout")
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.conn.lock();
        schema_status(&conn)
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or any migration step fails.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; this build supports up to {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            apply_migration_1(&mut conn)?;
            version = 1;
        }

        if version < 2 {
            apply_migration_2(&mut conn)?;
            version = current_schema_version(&conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Every version in the store ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_all_versions(&self) -> Result<Vec<Version>> {
        let conn = self.conn.lock();
        select_all_versions(&conn)
    }

    /// Every invocation ordered by start time, then id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_all_invocations(&self) -> Result<Vec<Invocation>> {
        let conn = self.conn.lock();
        select_all_invocations(&conn)
    }

    /// Export versions and invocations as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let (versions, invocations) = {
            let mut conn = self.conn.lock();
            // One read transaction so every exported invocation has its version.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Deferred)
                .context("failed to start export read transaction")?;
            let versions = select_all_versions(&tx)?;
            let invocations = select_all_invocations(&tx)?;
            tx.commit().context("failed to close export read transaction")?;
            (versions, invocations)
        };

        let (versions_sha256, version_count) = write_ndjson_file(&out_dir.join(VERSIONS_FILE), &versions)?;
        let (invocations_sha256, invocation_count) =
            write_ndjson_file(&out_dir.join(INVOCATIONS_FILE), &invocations)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: VERSIONS_FILE.to_string(),
                    sha256: versions_sha256,
                    records: version_count,
                },
                ExportFileDigest {
                    path: INVOCATIONS_FILE.to_string(),
                    sha256: invocations_sha256,
                    records: invocation_count,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        tracing::debug!(versions = version_count, invocations = invocation_count, "exported snapshot");
        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// Parents are always inserted before their children regardless of file order.
    ///
    /// # Errors
    /// Returns an error when the manifest does not match the files, when a row
    /// already exists and `skip_existing` is false, or when a write fails.
    pub fn import_snapshot(&self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut summary = ImportSummary::default();

        for version in read_ndjson_file::<Version>(&in_dir.join(VERSIONS_FILE))? {
            if self.version_exists(&version.version_id)? {
                if skip_existing {
                    summary.skipped_existing_versions += 1;
                    continue;
                }
                return Err(anyhow!("version already exists: {}", version.version_id));
            }
            self.put_version(&version)?;
            summary.imported_versions += 1;
        }

        let mut pending = read_ndjson_file::<Invocation>(&in_dir.join(INVOCATIONS_FILE))?;
        let mut present = HashSet::new();
        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for invocation in pending {
                let parent_ready = match invocation.parent_invocation_id {
                    None => true,
                    Some(parent) => present.contains(&parent) || self.invocation_exists(parent)?,
                };
                if !parent_ready {
                    deferred.push(invocation);
                    continue;
                }

                if self.invocation_exists(invocation.invocation_id)? {
                    if !skip_existing {
                        return Err(anyhow!(
                            "invocation already exists: {}",
                            invocation.invocation_id
                        ));
                    }
                    summary.skipped_existing_invocations += 1;
                } else {
                    self.put_invocation(&invocation)?;
                    summary.imported_invocations += 1;
                }
                present.insert(invocation.invocation_id);
            }

            if deferred.len() == before {
                let orphans = deferred
                    .iter()
                    .map(|invocation| invocation.invocation_id.to_string())
                    .collect::<Vec<_>>();
                return Err(anyhow!("invocations reference missing parents: {}", orphans.join(", ")));
            }
            pending = deferred;
        }

        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .lock()
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .lock()
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| format!("failed to restore sqlite backup from {}", in_file.display()))?;

        self.migrate()
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.conn.lock();
        let quick_check_message: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }
        drop(stmt);

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status: schema_status(&conn)?,
        })
    }

    fn version_exists(&self, version_id: &VersionId) -> Result<bool> {
        let conn = self.conn.lock();
        exists(&conn, "SELECT EXISTS(SELECT 1 FROM versions WHERE version_id = ?1)", version_id.as_str())
    }

    fn invocation_exists(&self, invocation_id: InvocationId) -> Result<bool> {
        let conn = self.conn.lock();
        exists(
            &conn,
            "SELECT EXISTS(SELECT 1 FROM invocations WHERE invocation_id = ?1)",
            &invocation_id.to_string(),
        )
    }

    fn run<T>(
        &self,
        access: Access,
        operation: &'static str,
        mut attempt: impl FnMut(&mut Connection) -> Result<T>,
    ) -> Result<T, TraceError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            let result = {
                let mut conn = self.conn.lock();
                attempt(&mut conn)
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let Some(domain) = err.chain().find_map(|cause| cause.downcast_ref::<TraceError>()) {
                return Err(domain.clone());
            }
            if !is_transient(&err) {
                return Err(TraceError::Backend(format!("{operation}: {err:#}")));
            }
            if attempts >= max_attempts {
                return Err(match access {
                    Access::Write => TraceError::StoreWrite { attempts, message: format!("{operation}: {err:#}") },
                    Access::Read => TraceError::Backend(format!("{operation}: {err:#}")),
                });
            }

            tracing::warn!(operation, attempt = attempts, error = %err, "transient sqlite failure; retrying");
            std::thread::sleep(self.retry.delay_for(attempts));
        }
    }
}

impl TraceStore for SqliteStore {
    fn put_version(&self, version: &Version) -> Result<(), TraceError> {
        version.validate()?;
        let inserted = self.run(Access::Write, "put_version", |conn| {
            let tx = begin_write(conn)?;
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO versions(
                        version_id, name, source_text, dependencies_json, free_variables_json,
                        best_effort, cycle_seal, created_at, created_at_ns
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        version.version_id.as_str(),
                        version.name,
                        version.source_text,
                        serde_json::to_string(&version.dependencies)
                            .context("failed to serialize dependencies")?,
                        serde_json::to_string(&version.free_variables)
                            .context("failed to serialize free variables")?,
                        version.best_effort,
                        version.cycle_seal,
                        rfc3339(version.created_at)?,
                        unix_nanos(version.created_at)?,
                    ],
                )
                .context("failed to insert version")?;

            if inserted == 1 {
                for dependency in &version.dependencies {
                    tx.execute(
                        "INSERT OR IGNORE INTO version_dependencies(version_id, dependency_version_id)
                         VALUES (?1, ?2)",
                        params![version.version_id.as_str(), dependency.as_str()],
                    )
                    .context("failed to insert version dependency")?;
                }
            }

            tx.commit().context("failed to commit version")?;
            Ok(inserted == 1)
        })?;

        if inserted {
            tracing::debug!(version_id = %version.version_id, name = %version.name, "persisted version");
        }
        Ok(())
    }

    fn put_invocation(&self, invocation: &Invocation) -> Result<(), TraceError> {
        invocation.validate()?;
        self.run(Access::Write, "put_invocation", |conn| {
            let tx = begin_write(conn)?;
            let invocation_id = invocation.invocation_id.to_string();

            if exists(&tx, "SELECT EXISTS(SELECT 1 FROM invocations WHERE invocation_id = ?1)", &invocation_id)? {
                return Err(TraceError::Conflict(format!("invocation {invocation_id} already exists")).into());
            }
            if !exists(
                &tx,
                "SELECT EXISTS(SELECT 1 FROM versions WHERE version_id = ?1)",
                invocation.version_id.as_str(),
            )? {
                return Err(TraceError::NotFound(format!("version {}", invocation.version_id)).into());
            }
            if let Some(parent) = invocation.parent_invocation_id {
                if !exists(
                    &tx,
                    "SELECT EXISTS(SELECT 1 FROM invocations WHERE invocation_id = ?1)",
                    &parent.to_string(),
                )? {
                    return Err(TraceError::NotFound(format!("parent invocation {parent}")).into());
                }
            }

            let (error_kind, error_message) = match &invocation.error {
                Some(error) => (Some(error.kind.as_str()), Some(error.message.as_str())),
                None => (None, None),
            };
            tx.execute(
                "INSERT INTO invocations(
                    invocation_id, version_id, parent_invocation_id, inputs_json, output_json,
                    status, error_kind, error_message, metadata_json,
                    started_at, started_at_ns, ended_at, ended_at_ns
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    invocation_id,
                    invocation.version_id.as_str(),
                    invocation.parent_invocation_id.map(|parent| parent.to_string()),
                    serde_json::to_string(&invocation.inputs).context("failed to serialize inputs")?,
                    invocation
                        .output
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()
                        .context("failed to serialize output")?,
                    invocation.status.as_str(),
                    error_kind,
                    error_message,
                    serde_json::to_string(&invocation.metadata).context("failed to serialize metadata")?,
                    rfc3339(invocation.started_at)?,
                    unix_nanos(invocation.started_at)?,
                    invocation.ended_at.map(rfc3339).transpose()?,
                    invocation.ended_at.map(unix_nanos).transpose()?,
                ],
            )
            .context("failed to insert invocation")?;

            tx.commit().context("failed to commit invocation")?;
            Ok(())
        })
    }

    fn finalize_invocation(
        &self,
        invocation_id: InvocationId,
        finalization: &Finalization,
    ) -> Result<(), TraceError> {
        self.run(Access::Write, "finalize_invocation", |conn| {
            let tx = begin_write(conn)?;
            let mut invocation = fetch_invocation(&tx, invocation_id)?
                .ok_or_else(|| TraceError::NotFound(format!("invocation {invocation_id}")))?;
            invocation.finalize(finalization)?;

            let (error_kind, error_message) = match &invocation.error {
                Some(error) => (Some(error.kind.as_str()), Some(error.message.as_str())),
                None => (None, None),
            };
            let updated = tx
                .execute(
                    "UPDATE invocations
                     SET status = ?2, output_json = ?3, error_kind = ?4, error_message = ?5,
                         metadata_json = ?6, ended_at = ?7, ended_at_ns = ?8
                     WHERE invocation_id = ?1 AND status = 'running'",
                    params![
                        invocation_id.to_string(),
                        invocation.status.as_str(),
                        invocation
                            .output
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()
                            .context("failed to serialize output")?,
                        error_kind,
                        error_message,
                        serde_json::to_string(&invocation.metadata)
                            .context("failed to serialize metadata")?,
                        invocation.ended_at.map(rfc3339).transpose()?,
                        invocation.ended_at.map(unix_nanos).transpose()?,
                    ],
                )
                .context("failed to finalize invocation")?;
            if updated != 1 {
                return Err(TraceError::Conflict(format!(
                    "invocation {invocation_id} was finalized concurrently"
                ))
                .into());
            }

            tx.commit().context("failed to commit finalization")?;
            Ok(())
        })
    }

    fn get_version(&self, version_id: &VersionId) -> Result<Option<Version>, TraceError> {
        self.run(Access::Read, "get_version", |conn| fetch_version(conn, version_id))
    }

    fn get_invocation(&self, invocation_id: InvocationId) -> Result<Option<Invocation>, TraceError> {
        self.run(Access::Read, "get_invocation", |conn| fetch_invocation(conn, invocation_id))
    }

    fn list_invocations(
        &self,
        version_id: &VersionId,
        range: &TimeRange,
    ) -> Result<Vec<Invocation>, TraceError> {
        self.run(Access::Read, "list_invocations", |conn| {
            let start = range.start.map(unix_nanos).transpose()?;
            let end = range.end.map(unix_nanos).transpose()?;
            query_invocations(
                conn,
                &format!(
                    "SELECT {INVOCATION_COLUMNS} FROM invocations
                     WHERE version_id = ?1
                       AND (?2 IS NULL OR started_at_ns >= ?2)
                       AND (?3 IS NULL OR started_at_ns < ?3)
                     ORDER BY started_at_ns ASC, invocation_id ASC"
                ),
                params![version_id.as_str(), start, end],
            )
        })
    }

    fn get_lineage(&self, invocation_id: InvocationId) -> Result<Vec<Invocation>, TraceError> {
        self.run(Access::Read, "get_lineage", |conn| {
            let mut lineage = Vec::new();
            let mut visited = HashSet::new();
            let mut next = Some(invocation_id);
            while let Some(current) = next {
                if !visited.insert(current) {
                    return Err(anyhow!("parent chain of {invocation_id} loops at {current}"));
                }
                let invocation = fetch_invocation(conn, current)?
                    .ok_or_else(|| TraceError::NotFound(format!("invocation {current}")))?;
                next = invocation.parent_invocation_id;
                lineage.push(invocation);
            }
            Ok(lineage)
        })
    }

    fn list_children(&self, invocation_id: InvocationId) -> Result<Vec<Invocation>, TraceError> {
        self.run(Access::Read, "list_children", |conn| fetch_children(conn, invocation_id))
    }

    fn get_descendants(&self, invocation_id: InvocationId) -> Result<Vec<Invocation>, TraceError> {
        self.run(Access::Read, "get_descendants", |conn| {
            if fetch_invocation(conn, invocation_id)?.is_none() {
                return Err(TraceError::NotFound(format!("invocation {invocation_id}")).into());
            }
            let mut descendants = Vec::new();
            let mut seen = HashSet::from([invocation_id]);
            let mut queue = VecDeque::from([invocation_id]);
            while let Some(current) = queue.pop_front() {
                for child in fetch_children(conn, current)? {
                    if seen.insert(child.invocation_id) {
                        queue.push_back(child.invocation_id);
                        descendants.push(child);
                    }
                }
            }
            Ok(descendants)
        })
    }

    fn list_versions(&self, name: &str) -> Result<Vec<Version>, TraceError> {
        self.run(Access::Read, "list_versions", |conn| {
            query_versions(
                conn,
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versions
                     WHERE name = ?1 ORDER BY created_at_ns ASC, version_id ASC"
                ),
                params![name],
            )
        })
    }

    fn previous_version(&self, version_id: &VersionId) -> Result<Option<Version>, TraceError> {
        self.run(Access::Read, "previous_version", |conn| {
            let anchor = conn
                .query_row(
                    "SELECT name, created_at_ns FROM versions WHERE version_id = ?1",
                    params![version_id.as_str()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()
                .context("failed to load version anchor")?
                .ok_or_else(|| TraceError::NotFound(format!("version {version_id}")))?;

            let mut previous = query_versions(
                conn,
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versions
                     WHERE name = ?1
                       AND (created_at_ns < ?2 OR (created_at_ns = ?2 AND version_id < ?3))
                     ORDER BY created_at_ns DESC, version_id DESC
                     LIMIT 1"
                ),
                params![anchor.0, anchor.1, version_id.as_str()],
            )?;
            Ok(previous.pop())
        })
    }

    fn list_dependents(&self, version_id: &VersionId) -> Result<Vec<Version>, TraceError> {
        self.run(Access::Read, "list_dependents", |conn| {
            query_versions(
                conn,
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versions
                     WHERE version_id <> ?1
                       AND version_id IN (
                         SELECT version_id FROM version_dependencies
                         WHERE dependency_version_id = ?1
                       )
                     ORDER BY created_at_ns ASC, version_id ASC"
                ),
                params![version_id.as_str()],
            )
        })
    }
}

/// Writers take the lock up front so a read-then-write transaction never
/// fails on a stale WAL snapshot.
fn begin_write(conn: &mut Connection) -> Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to start write transaction")
}

fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    })
}

fn exists(conn: &Connection, sql: &str, key: &str) -> Result<bool> {
    let found = conn
        .query_row(sql, params![key], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed existence check for {key}"))?;
    Ok(found == 1)
}

fn fetch_version(conn: &Connection, version_id: &VersionId) -> Result<Option<Version>> {
    let mut versions = query_versions(
        conn,
        &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE version_id = ?1"),
        params![version_id.as_str()],
    )?;
    Ok(versions.pop())
}

fn fetch_invocation(conn: &Connection, invocation_id: InvocationId) -> Result<Option<Invocation>> {
    let mut invocations = query_invocations(
        conn,
        &format!("SELECT {INVOCATION_COLUMNS} FROM invocations WHERE invocation_id = ?1"),
        params![invocation_id.to_string()],
    )?;
    Ok(invocations.pop())
}

fn fetch_children(conn: &Connection, invocation_id: InvocationId) -> Result<Vec<Invocation>> {
    query_invocations(
        conn,
        &format!(
            "SELECT {INVOCATION_COLUMNS} FROM invocations
             WHERE parent_invocation_id = ?1
             ORDER BY started_at_ns ASC, invocation_id ASC"
        ),
        params![invocation_id.to_string()],
    )
}

fn select_all_versions(conn: &Connection) -> Result<Vec<Version>> {
    query_versions(conn, &format!("SELECT {VERSION_COLUMNS} FROM versions ORDER BY version_id ASC"), [])
}

fn select_all_invocations(conn: &Connection) -> Result<Vec<Invocation>> {
    query_invocations(
        conn,
        &format!(
            "SELECT {INVOCATION_COLUMNS} FROM invocations
             ORDER BY started_at_ns ASC, invocation_id ASC"
        ),
        [],
    )
}

fn query_versions<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Version>> {
    let mut stmt = conn.prepare(sql).context("failed to prepare version query")?;
    let rows = stmt.query_map(params, VersionRow::from_row)?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row.context("failed to read version row")?.into_version()?);
    }
    Ok(versions)
}

fn query_invocations<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Invocation>> {
    let mut stmt = conn.prepare(sql).context("failed to prepare invocation query")?;
    let rows = stmt.query_map(params, InvocationRow::from_row)?;
    let mut invocations = Vec::new();
    for row in rows {
        invocations.push(row.context("failed to read invocation row")?.into_invocation()?);
    }
    Ok(invocations)
}

fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

fn apply_migration_1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction().context("failed to start migration v1 transaction")?;
    tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(&tx, 1)?;
    tx.commit().context("failed to commit migration v1")
}

/// Adds the reverse-dependency table, backfilled from `dependencies_json`,
/// and per-invocation metadata.
fn apply_migration_2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction().context("failed to start migration v2 transaction")?;
    tx.execute_batch(MIGRATION_002_SQL).context("failed to create version_dependencies")?;

    if !table_has_column(&tx, "invocations", "metadata_json")? {
        tx.execute_batch("ALTER TABLE invocations ADD COLUMN metadata_json TEXT NOT NULL DEFAULT '{}';")
            .context("failed to add invocations.metadata_json")?;
    }

    let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    {
        let mut stmt = tx
            .prepare("SELECT version_id, dependencies_json FROM versions ORDER BY version_id ASC")
            .context("failed to read versions for dependency backfill")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (version_id, dependencies_json) = row?;
            let dependencies: BTreeSet<String> = serde_json::from_str(&dependencies_json)
                .with_context(|| format!("invalid dependencies_json for version {version_id}"))?;
            edges.insert(version_id, dependencies);
        }
    }
    for (version_id, dependencies) in &edges {
        for dependency in dependencies {
            tx.execute(
                "INSERT OR IGNORE INTO version_dependencies(version_id, dependency_version_id)
                 VALUES (?1, ?2)",
                params![version_id, dependency],
            )
            .context("failed to backfill version dependency")?;
        }
    }

    record_schema_version(&tx, 2)?;
    tx.commit().context("failed to commit migration v2")
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    exists(conn, "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)", table_name)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp outside the storable range: {value}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [VERSIONS_FILE, INVOCATIONS_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use lmp_trace_core::{DependencyHasher, LmpDefinition, LmpRegistry, Metadata};
    use time::Duration as TimeDuration;
    use ulid::Ulid;

    use super::*;

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lmp-trace-{label}-{}.sqlite3", Ulid::new()))
    }

    fn cleanup_db(path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let candidate = PathBuf::from(format!("{}{}", path.display(), suffix));
            if candidate.exists() {
                fs::remove_file(&candidate)
                    .with_context(|| format!("failed to cleanup sqlite file {}", candidate.display()))?;
            }
        }
        Ok(())
    }

    fn memory_store() -> Result<SqliteStore> {
        SqliteStore::open_and_migrate(Path::new(":memory:"))
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + TimeDuration::seconds(1_700_000_000)
    }

    fn fixture_version(name: &str, source: &str) -> Version {
        let registry = LmpRegistry::new();
        registry.define(LmpDefinition::new(name).with_source(source));
        let mut version = DependencyHasher::new().hash_lmp(&name.into(), &registry);
        version.created_at = fixture_time();
        version
    }

    fn running(version: &Version, parent: Option<InvocationId>, offset_ms: i64) -> Invocation {
        Invocation::start(
            version.version_id.clone(),
            parent,
            SerializedValue::List(vec![SerializedValue::int(offset_ms)]),
            Metadata::new(),
            fixture_time() + TimeDuration::milliseconds(offset_ms),
        )
    }

    fn completed(version: &Version, parent: Option<InvocationId>, offset_ms: i64) -> Invocation {
        let mut invocation = running(version, parent, offset_ms);
        invocation
            .finalize(&Finalization::completed(
                invocation.started_at + TimeDuration::milliseconds(1),
                SerializedValue::int(1),
            ))
            .unwrap_or_else(|err| panic!("fixture finalize failed: {err}"));
        invocation
    }

    #[test]
    fn migrate_creates_latest_schema() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        assert_eq!(store.schema_status()?.pending_versions, vec![1, 2]);
        store.migrate()?;
        store.migrate()?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn migrate_v1_backfills_dependencies_and_metadata() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let helper = fixture_version("helper", "fn helper() { 1 }");
        let mut outer = fixture_version("outer", "fn outer() { helper() }");
        outer.dependencies.insert(helper.version_id.clone());

        {
            let mut conn = store.conn.lock();
            conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
            apply_migration_1(&mut conn)?;
            for version in [&helper, &outer] {
                conn.execute(
                    "INSERT INTO versions(version_id, name, source_text, dependencies_json,
                        free_variables_json, best_effort, cycle_seal, created_at, created_at_ns)
                     VALUES (?1, ?2, ?3, ?4, '{}', 0, NULL, ?5, ?6)",
                    params![
                        version.version_id.as_str(),
                        version.name,
                        version.source_text,
                        serde_json::to_string(&version.dependencies)?,
                        rfc3339(version.created_at)?,
                        unix_nanos(version.created_at)?,
                    ],
                )?;
            }
        }

        store.migrate()?;
        let dependents = store.list_dependents(&helper.version_id)?;
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].name, "outer");

        let invocation = running(&helper, None, 0);
        store.put_invocation(&invocation)?;
        assert_eq!(store.get_invocation(invocation.invocation_id)?, Some(invocation));
        Ok(())
    }

    #[test]
    fn migrate_rejects_newer_schema() -> Result<()> {
        let store = memory_store()?;
        record_schema_version(&store.conn.lock(), LATEST_SCHEMA_VERSION + 1)?;
        assert!(store.migrate().is_err());
        Ok(())
    }

    #[test]
    fn sqlite_checks_reject_invalid_rows() -> Result<()> {
        let store = memory_store()?;
        let version = fixture_version("a", "return 1");
        store.put_version(&version)?;

        let conn = store.conn.lock();
        let bad_status = conn.execute(
            "INSERT INTO invocations(invocation_id, version_id, inputs_json, status,
                started_at, started_at_ns) VALUES ('x', ?1, '[]', 'paused', 't', 0)",
            params![version.version_id.as_str()],
        );
        assert!(bad_status.is_err());

        let ended_before_start = conn.execute(
            "INSERT INTO invocations(invocation_id, version_id, inputs_json, status,
                started_at, started_at_ns, ended_at, ended_at_ns)
             VALUES ('y', ?1, '[]', 'completed', 't', 10, 't', 5)",
            params![version.version_id.as_str()],
        );
        assert!(ended_before_start.is_err());

        let failed_without_error = conn.execute(
            "INSERT INTO invocations(invocation_id, version_id, inputs_json, status,
                started_at, started_at_ns, ended_at, ended_at_ns)
             VALUES ('z', ?1, '[]', 'failed', 't', 0, 't', 1)",
            params![version.version_id.as_str()],
        );
        assert!(failed_without_error.is_err());

        let missing_version = conn.execute(
            "INSERT INTO invocations(invocation_id, version_id, inputs_json, status,
                started_at, started_at_ns) VALUES ('w', ?1, '[]', 'running', 't', 0)",
            params!["f".repeat(64)],
        );
        assert!(missing_version.is_err());
        Ok(())
    }

    #[test]
    fn put_version_is_idempotent_and_keeps_first_observation() -> Result<()> {
        let store = memory_store()?;
        let first = fixture_version("classify", "return 1");
        let mut second = first.clone();
        second.name = "classify_alias".to_string();
        second.created_at = fixture_time() + TimeDuration::days(1);

        store.put_version(&first)?;
        store.put_version(&second)?;

        assert_eq!(store.list_all_versions()?.len(), 1);
        assert_eq!(store.get_version(&first.version_id)?, Some(first));
        Ok(())
    }

    #[test]
    fn put_version_rejects_tampered_content() -> Result<()> {
        let store = memory_store()?;
        let mut version = fixture_version("a", "return 1");
        version.source_text = "return 2".to_string();
        assert!(matches!(store.put_version(&version), Err(TraceError::Validation(_))));
        Ok(())
    }

    #[test]
    fn float_free_variables_survive_storage_exactly() -> Result<()> {
        let store = memory_store()?;
        let registry = LmpRegistry::new();
        registry.define(
            LmpDefinition::new("scale")
                .with_source("fn scale(x: f64) -> f64 { x * FACTOR }")
                .bind_serialized("FACTOR", SerializedValue::float(-1.028_326_946_535_144_3e-117)),
        );
        let mut version = DependencyHasher::new().hash_lmp(&"scale".into(), &registry);
        version.created_at = fixture_time();
        store.put_version(&version)?;

        let stored = store
            .get_version(&version.version_id)?
            .ok_or_else(|| anyhow!("stored version should be readable"))?;
        stored.validate()?;
        assert_eq!(stored, version);

        let export_dir = std::env::temp_dir().join(format!("lmp-trace-floats-{}", Ulid::new()));
        store.export_snapshot(&export_dir)?;
        let target = memory_store()?;
        assert_eq!(target.import_snapshot(&export_dir, false)?.imported_versions, 1);
        let imported = target
            .get_version(&version.version_id)?
            .ok_or_else(|| anyhow!("imported version should be readable"))?;
        imported.validate()?;
        assert_eq!(imported.free_variables, version.free_variables);

        fs::remove_dir_all(&export_dir)?;
        Ok(())
    }

    #[test]
    fn put_invocation_requires_version_and_parent_and_inserts_once() -> Result<()> {
        let store = memory_store()?;
        let version = fixture_version("a", "return 1");
        let invocation = running(&version, None, 0);

        assert!(matches!(store.put_invocation(&invocation), Err(TraceError::NotFound(_))));
        store.put_version(&version)?;
        store.put_invocation(&invocation)?;
        assert!(matches!(store.put_invocation(&invocation), Err(TraceError::Conflict(_))));

        let orphan = running(&version, Some(InvocationId::new()), 1);
        assert!(matches!(store.put_invocation(&orphan), Err(TraceError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn finalize_transitions_exactly_once() -> Result<()> {
        let store = memory_store()?;
        let version = fixture_version("a", "return 1");
        store.put_version(&version)?;
        let mut invocation = running(&version, None, 0);
        invocation.metadata.insert("env".to_string(), serde_json::json!("test"));
        store.put_invocation(&invocation)?;

        let mut late = Metadata::new();
        late.insert("tokens".to_string(), serde_json::json!(12));
        let finalization = Finalization::failed(
            invocation.started_at + TimeDuration::milliseconds(3),
            InvocationError::new("ValueError", "bad input"),
        )
        .with_metadata(late);
        store.finalize_invocation(invocation.invocation_id, &finalization)?;

        let stored = store
            .get_invocation(invocation.invocation_id)?
            .ok_or_else(|| anyhow!("finalized invocation missing"))?;
        assert_eq!(stored.status, InvocationStatus::Failed);
        assert_eq!(stored.error, Some(InvocationError::new("ValueError", "bad input")));
        assert_eq!(stored.metadata.len(), 2);
        assert!(stored.ended_at >= Some(stored.started_at));

        let again = store.finalize_invocation(
            invocation.invocation_id,
            &Finalization::completed(stored.started_at, SerializedValue::null()),
        );
        assert!(matches!(again, Err(TraceError::Conflict(_))));

        let missing = store.finalize_invocation(InvocationId::new(), &finalization);
        assert!(matches!(missing, Err(TraceError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn list_invocations_filters_half_open_range() -> Result<()> {
        let store = memory_store()?;
        let version = fixture_version("a", "return 1");
        let other = fixture_version("b", "return 2");
        store.put_version(&version)?;
        store.put_version(&other)?;
        for offset in [0, 10, 20, 30] {
            store.put_invocation(&completed(&version, None, offset))?;
        }
        store.put_invocation(&completed(&other, None, 15))?;

        let all = store.list_invocations(&version.version_id, &TimeRange::all())?;
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|pair| pair[0].started_at <= pair[1].started_at));

        let window = TimeRange::between(
            fixture_time() + TimeDuration::milliseconds(10),
            fixture_time() + TimeDuration::milliseconds(30),
        );
        let within = store.list_invocations(&version.version_id, &window)?;
        let offsets = within
            .iter()
            .map(|invocation| (invocation.started_at - fixture_time()).whole_milliseconds())
            .collect::<Vec<_>>();
        assert_eq!(offsets, vec![10, 20]);
        Ok(())
    }

    #[test]
    fn lineage_children_and_descendants_follow_the_call_tree() -> Result<()> {
        let store = memory_store()?;
        let version = fixture_version("a", "return 1");
        store.put_version(&version)?;

        let root = completed(&version, None, 0);
        let child_a = completed(&version, Some(root.invocation_id), 1);
        let child_b = completed(&version, Some(root.invocation_id), 2);
        let grandchild = completed(&version, Some(child_a.invocation_id), 3);
        for invocation in [&root, &child_a, &child_b, &grandchild] {
            store.put_invocation(invocation)?;
        }

        let lineage = store
            .get_lineage(grandchild.invocation_id)?
            .into_iter()
            .map(|invocation| invocation.invocation_id)
            .collect::<Vec<_>>();
        assert_eq!(lineage, vec![grandchild.invocation_id, child_a.invocation_id, root.invocation_id]);

        let children = store.list_children(root.invocation_id)?;
        assert_eq!(children.len(), 2);

        let descendants = store.get_descendants(root.invocation_id)?;
        assert_eq!(descendants.len(), 3);
        assert_eq!(descendants[2].invocation_id, grandchild.invocation_id);

        assert!(matches!(store.get_lineage(InvocationId::new()), Err(TraceError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn version_history_and_diff() -> Result<()> {
        let store = memory_store()?;
        let v1 = fixture_version("classify", "return 1");
        let mut v2 = fixture_version("classify", "return 2");
        v2.created_at = fixture_time() + TimeDuration::hours(1);
        let unrelated = fixture_version("other", "return 3");
        for version in [&v1, &v2, &unrelated] {
            store.put_version(version)?;
        }

        let history = store.list_versions("classify")?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version_id, v1.version_id);

        assert_eq!(store.previous_version(&v2.version_id)?, Some(v1.clone()));
        assert_eq!(store.previous_version(&v1.version_id)?, None);

        let diff = store.diff(&v1.version_id, &v2.version_id)?;
        assert!(diff.source_changed);
        assert!(matches!(
            store.diff(&v1.version_id, &VersionId::parse(&"0".repeat(64))?),
            Err(TraceError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn export_import_round_trip_preserves_parent_order() -> Result<()> {
        let source = memory_store()?;
        let version = fixture_version("a", "return 1");
        source.put_version(&version)?;
        let root = completed(&version, None, 5);
        // Child starts earlier than its parent to force out-of-order rows in the export.
        let mut child = completed(&version, Some(root.invocation_id), 0);
        child.started_at = root.started_at - TimeDuration::milliseconds(1);
        child.ended_at = Some(root.started_at);
        source.put_invocation(&root)?;
        source.put_invocation(&child)?;

        let export_dir = std::env::temp_dir().join(format!("lmp-trace-export-{}", Ulid::new()));
        let manifest = source.export_snapshot(&export_dir)?;
        assert_eq!(manifest.files.len(), 2);

        let target = memory_store()?;
        let summary = target.import_snapshot(&export_dir, false)?;
        assert_eq!(summary.imported_versions, 1);
        assert_eq!(summary.imported_invocations, 2);
        assert_eq!(target.get_invocation(child.invocation_id)?, Some(child));

        assert!(target.import_snapshot(&export_dir, false).is_err());
        let skipped = target.import_snapshot(&export_dir, true)?;
        assert_eq!(skipped.skipped_existing_versions, 1);
        assert_eq!(skipped.skipped_existing_invocations, 2);

        fs::remove_dir_all(&export_dir)?;
        Ok(())
    }

    #[test]
    fn export_during_concurrent_recording_is_self_consistent() -> Result<()> {
        let db_path = temp_db_path("export-consistency");
        SqliteStore::open_and_migrate(&db_path)?;
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let writer_path = db_path.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open_and_migrate(&writer_path)?;
                for step in 0..40 {
                    let version = fixture_version("step", &format!("return {step}"));
                    store.put_version(&version)?;
                    store.put_invocation(&completed(&version, None, step))?;
                }
                done.store(true, Ordering::SeqCst);
                Ok(())
            })
        };

        let exporter = SqliteStore::open(&db_path)?;
        let mut rounds = 0;
        loop {
            let finished = done.load(Ordering::SeqCst);
            let export_dir = std::env::temp_dir().join(format!("lmp-trace-live-export-{}", Ulid::new()));
            let manifest = exporter.export_snapshot(&export_dir)?;
            let target = memory_store()?;
            let summary = target.import_snapshot(&export_dir, false)?;
            assert_eq!(summary.imported_invocations, manifest.files[1].records);
            fs::remove_dir_all(&export_dir)?;
            rounds += 1;
            if finished {
                break;
            }
        }
        assert!(rounds >= 1);

        let Ok(writer_result) = writer.join() else {
            return Err(anyhow!("writer thread panicked"));
        };
        writer_result?;
        drop(exporter);
        cleanup_db(&db_path)
    }

    #[test]
    fn import_rejects_tampered_files() -> Result<()> {
        let source = memory_store()?;
        let version = fixture_version("a", "return 1");
        source.put_version(&version)?;

        let export_dir = std::env::temp_dir().join(format!("lmp-trace-tamper-{}", Ulid::new()));
        source.export_snapshot(&export_dir)?;
        fs::write(export_dir.join(VERSIONS_FILE), "{}\n")?;

        let target = memory_store()?;
        let err = target
            .import_snapshot(&export_dir, false)
            .err()
            .ok_or_else(|| anyhow!("tampered import should fail"))?;
        assert!(err.to_string().contains("digest mismatch"));

        fs::remove_dir_all(&export_dir)?;
        Ok(())
    }

    #[test]
    fn backup_restore_and_integrity_check() -> Result<()> {
        let db_path = temp_db_path("backup");
        let backup_path = temp_db_path("backup-copy");
        let store = SqliteStore::open_and_migrate(&db_path)?;
        let version = fixture_version("a", "return 1");
        store.put_version(&version)?;
        store.backup_database(&backup_path)?;

        let restored = SqliteStore::open(Path::new(":memory:"))?;
        restored.restore_database(&backup_path)?;
        assert_eq!(restored.get_version(&version.version_id)?, Some(version));

        let report = restored.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);

        drop(store);
        cleanup_db(&db_path)?;
        cleanup_db(&backup_path)?;
        Ok(())
    }

    #[test]
    fn busy_database_is_retried_then_reported() -> Result<()> {
        let db_path = temp_db_path("busy");
        let store = SqliteStore::open_and_migrate(&db_path)?
            .with_retry_policy(RetryPolicy { max_attempts: 3, backoff_ms: 1 });
        store.set_busy_timeout(Duration::ZERO)?;

        let blocker = Connection::open(&db_path)?;
        blocker.execute_batch("BEGIN IMMEDIATE;")?;

        let version = fixture_version("a", "return 1");
        let result = store.put_version(&version);
        assert!(matches!(result, Err(TraceError::StoreWrite { attempts: 3, .. })));

        blocker.execute_batch("ROLLBACK;")?;
        store.put_version(&version)?;
        assert!(store.get_version(&version.version_id)?.is_some());

        drop(blocker);
        drop(store);
        cleanup_db(&db_path)
    }

    #[test]
    fn shared_store_accepts_concurrent_writers() -> Result<()> {
        let store = Arc::new(memory_store()?);
        let version = fixture_version("a", "return 1");
        store.put_version(&version)?;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let version = version.clone();
            handles.push(thread::spawn(move || -> Result<Vec<InvocationId>> {
                let mut ids = Vec::new();
                for offset in 0..25 {
                    let invocation = running(&version, None, offset);
                    store.put_invocation(&invocation)?;
                    store.finalize_invocation(
                        invocation.invocation_id,
                        &Finalization::completed(invocation.started_at, SerializedValue::null()),
                    )?;
                    ids.push(invocation.invocation_id);
                }
                Ok(ids)
            }));
        }

        let mut all_ids = HashSet::new();
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("writer thread panicked"));
            };
            all_ids.extend(thread_result?);
        }
        assert_eq!(all_ids.len(), 100);

        let stored = store.list_invocations(&version.version_id, &TimeRange::all())?;
        assert_eq!(stored.len(), 100);
        assert!(stored.iter().all(|invocation| invocation.status == InvocationStatus::Completed));
        Ok(())
    }

    #[test]
    fn concurrent_connections_on_one_file_preserve_integrity() -> Result<()> {
        let db_path = temp_db_path("concurrency");
        let version = fixture_version("a", "return 1");
        {
            let init = SqliteStore::open_and_migrate(&db_path)?;
            init.put_version(&version)?;
        }

        let writer_threads = 4;
        let writes_per_thread = 20;
        let mut handles = Vec::new();

        for _ in 0..writer_threads {
            let writer_path = db_path.clone();
            let version = version.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open_and_migrate(&writer_path)?;
                for offset in 0..writes_per_thread {
                    store.put_invocation(&completed(&version, None, offset))?;
                }
                Ok(())
            }));
        }

        for _ in 0..2 {
            let reader_path = db_path.clone();
            let version_id = version.version_id.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open(&reader_path)?;
                for _ in 0..30 {
                    let _ = store.list_invocations(&version_id, &TimeRange::all())?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path)?;
        let stored = store.list_invocations(&version.version_id, &TimeRange::all())?;
        assert_eq!(stored.len(), writer_threads * usize::try_from(writes_per_thread)?);
        assert!(store.integrity_check()?.quick_check_ok);

        drop(store);
        cleanup_db(&db_path)
    }
}
