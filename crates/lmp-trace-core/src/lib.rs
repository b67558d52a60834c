use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod codec;
mod hasher;
mod normalize;
mod serialize;

pub use codec::{BlobCodec, CodecEntry, CodecRegistry};
pub use hasher::{
    DependencyHasher, FreeVariable, HashingError, Introspect, LmpDefinition, LmpKey, LmpRegistry,
};
pub use normalize::normalize_source;
pub use serialize::{
    deserialize, serialize, Capture, DecodedBlob, Field, Opaque, OpaqueValue, Primitive,
    RecordBuilder, Registered, Restore, RestoreError, RuntimeValue, SerdeValue, SerializedValue,
    Serializer,
};

/// Free-form JSON tags attached to an invocation.
pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TraceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store write failed after {attempts} attempt(s): {message}")]
    StoreWrite { attempts: u32, message: String },
    #[error("store error: {0}")]
    Backend(String),
}

/// Content hash of a Version: 64 lowercase hex characters of a SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId(String);

impl VersionId {
    #[must_use]
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(hex::encode(digest))
    }

    /// # Errors
    /// Returns [`TraceError::Validation`] unless `raw` is 64 lowercase hex characters.
    pub fn parse(raw: &str) -> Result<Self, TraceError> {
        if raw.len() == 64 && raw.bytes().all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(raw.to_string()))
        } else {
            Err(TraceError::Validation(format!(
                "version_id MUST be 64 lowercase hex characters, got `{raw}`"
            )))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl Display for VersionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VersionId {
    type Err = TraceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for VersionId {
    type Error = TraceError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<VersionId> for String {
    fn from(id: VersionId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct InvocationId(pub Ulid);

impl InvocationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for InvocationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InvocationId {
    type Err = TraceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| TraceError::Validation(format!("invalid invocation_id `{raw}`: {err}")))
    }
}

/// Immutable, content-addressed identity of an LMP definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: VersionId,
    pub name: String,
    pub source_text: String,
    pub dependencies: BTreeSet<VersionId>,
    pub free_variables: BTreeMap<String, SerializedValue>,
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub cycle_seal: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Version {
    /// Digest of one acyclic version's content. `name` and `created_at` do not participate.
    #[must_use]
    pub fn compute_id(
        source_text: &str,
        dependencies: &BTreeSet<VersionId>,
        free_variables: &BTreeMap<String, SerializedValue>,
    ) -> VersionId {
        VersionId::from_digest(digest::version(source_text, dependencies, free_variables))
    }

    /// Validate structural invariants of a Version.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] when the name is empty, when an
    /// acyclic version's id does not match its content, or when the cycle
    /// seal is malformed.
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.name.trim().is_empty() {
            return Err(TraceError::Validation("name MUST be provided".to_string()));
        }

        match &self.cycle_seal {
            Some(seal) => {
                VersionId::parse(seal).map_err(|_| {
                    TraceError::Validation("cycle_seal MUST be a 64-character hex digest".to_string())
                })?;
            }
            None => {
                if self.dependencies.contains(&self.version_id) {
                    return Err(TraceError::Validation(
                        "self-dependent version MUST carry a cycle_seal".to_string(),
                    ));
                }
                let expected =
                    Self::compute_id(&self.source_text, &self.dependencies, &self.free_variables);
                if expected != self.version_id {
                    return Err(TraceError::Validation(format!(
                        "version_id {} does not match content digest {expected}",
                        self.version_id
                    )));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    Completed,
    Failed,
}

impl InvocationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationError {
    pub kind: String,
    pub message: String,
}

impl InvocationError {
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into() }
    }
}

/// One recorded execution of an LMP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub invocation_id: InvocationId,
    pub version_id: VersionId,
    pub parent_invocation_id: Option<InvocationId>,
    pub inputs: SerializedValue,
    #[serde(default)]
    pub output: Option<SerializedValue>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub status: InvocationStatus,
    #[serde(default)]
    pub error: Option<InvocationError>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Invocation {
    /// A fresh `running` invocation.
    #[must_use]
    pub fn start(
        version_id: VersionId,
        parent_invocation_id: Option<InvocationId>,
        inputs: SerializedValue,
        metadata: Metadata,
        started_at: OffsetDateTime,
    ) -> Self {
        Self {
            invocation_id: InvocationId::new(),
            version_id,
            parent_invocation_id,
            inputs,
            output: None,
            started_at,
            ended_at: None,
            status: InvocationStatus::Running,
            error: None,
            metadata,
        }
    }

    /// Validate the status-dependent shape of an invocation.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] when the record is self-parented,
    /// when `ended_at` precedes `started_at`, or when output/error/end time
    /// disagree with `status`.
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.parent_invocation_id == Some(self.invocation_id) {
            return Err(TraceError::Validation(
                "invocation MUST NOT be its own parent".to_string(),
            ));
        }

        if let Some(ended_at) = self.ended_at {
            if ended_at < self.started_at {
                return Err(TraceError::Validation(
                    "ended_at MUST be >= started_at".to_string(),
                ));
            }
        }

        match self.status {
            InvocationStatus::Running => {
                if self.ended_at.is_some() || self.output.is_some() || self.error.is_some() {
                    return Err(TraceError::Validation(
                        "running invocation MUST NOT carry ended_at, output, or error".to_string(),
                    ));
                }
            }
            InvocationStatus::Completed => {
                if self.ended_at.is_none() || self.error.is_some() {
                    return Err(TraceError::Validation(
                        "completed invocation MUST have ended_at and no error".to_string(),
                    ));
                }
            }
            InvocationStatus::Failed => {
                if self.ended_at.is_none() || self.error.is_none() || self.output.is_some() {
                    return Err(TraceError::Validation(
                        "failed invocation MUST have ended_at and error, and no output".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Apply the single running-to-terminal transition in memory.
    ///
    /// # Errors
    /// Returns [`TraceError::Conflict`] if the invocation is already terminal,
    /// or [`TraceError::Validation`] if the result would be invalid.
    pub fn finalize(&mut self, finalization: &Finalization) -> Result<(), TraceError> {
        if self.status.is_terminal() {
            return Err(TraceError::Conflict(format!(
                "invocation {} is already {}",
                self.invocation_id,
                self.status.as_str()
            )));
        }

        let mut finalized = self.clone();
        finalized.status = finalization.status();
        finalized.ended_at = Some(finalization.ended_at);
        match &finalization.outcome {
            Outcome::Completed { output } => finalized.output = Some(output.clone()),
            Outcome::Failed { error } => finalized.error = Some(error.clone()),
        }
        finalized.metadata.extend(finalization.metadata.clone());
        finalized.validate()?;

        *self = finalized;
        Ok(())
    }

    #[must_use]
    pub fn duration(&self) -> Option<time::Duration> {
        self.ended_at.map(|ended_at| ended_at - self.started_at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { output: SerializedValue },
    Failed { error: InvocationError },
}

/// Terminal state written by `finalize_invocation`. `metadata` is merged
/// over the metadata recorded at start.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalization {
    pub ended_at: OffsetDateTime,
    pub outcome: Outcome,
    pub metadata: Metadata,
}

impl Finalization {
    #[must_use]
    pub fn completed(ended_at: OffsetDateTime, output: SerializedValue) -> Self {
        Self { ended_at, outcome: Outcome::Completed { output }, metadata: Metadata::new() }
    }

    #[must_use]
    pub fn failed(ended_at: OffsetDateTime, error: InvocationError) -> Self {
        Self { ended_at, outcome: Outcome::Failed { error }, metadata: Metadata::new() }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn status(&self) -> InvocationStatus {
        match self.outcome {
            Outcome::Completed { .. } => InvocationStatus::Completed,
            Outcome::Failed { .. } => InvocationStatus::Failed,
        }
    }
}

/// Half-open `[start, end)` window over `started_at`; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
}

impl TimeRange {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn between(start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self { start: Some(start), end: Some(end) }
    }

    #[must_use]
    pub fn since(start: OffsetDateTime) -> Self {
        Self { start: Some(start), end: None }
    }

    #[must_use]
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        let after_start = match self.start {
            Some(start) => at >= start,
            None => true,
        };
        let before_end = match self.end {
            Some(end) => at < end,
            None => true,
        };
        after_start && before_end
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VersionComponent {
    SourceText,
    Dependencies,
    FreeVariables,
}

impl VersionComponent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceText => "source_text",
            Self::Dependencies => "dependencies",
            Self::FreeVariables => "free_variables",
        }
    }
}

/// Component-wise comparison of two Versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub from: VersionId,
    pub to: VersionId,
    pub source_changed: bool,
    pub dependencies_added: Vec<VersionId>,
    pub dependencies_removed: Vec<VersionId>,
    pub free_variables_added: Vec<String>,
    pub free_variables_removed: Vec<String>,
    pub free_variables_changed: Vec<String>,
}

impl VersionDiff {
    #[must_use]
    pub fn between(from: &Version, to: &Version) -> Self {
        let free_variables_changed = from
            .free_variables
            .iter()
            .filter_map(|(name, before)| {
                let after = to.free_variables.get(name)?;
                (before.canonical_json() != after.canonical_json()).then(|| name.clone())
            })
            .collect();

        Self {
            from: from.version_id.clone(),
            to: to.version_id.clone(),
            source_changed: from.source_text != to.source_text,
            dependencies_added: to.dependencies.difference(&from.dependencies).cloned().collect(),
            dependencies_removed: from.dependencies.difference(&to.dependencies).cloned().collect(),
            free_variables_added: to
                .free_variables
                .keys()
                .filter(|name| !from.free_variables.contains_key(*name))
                .cloned()
                .collect(),
            free_variables_removed: from
                .free_variables
                .keys()
                .filter(|name| !to.free_variables.contains_key(*name))
                .cloned()
                .collect(),
            free_variables_changed,
        }
    }

    #[must_use]
    pub fn changed_components(&self) -> Vec<VersionComponent> {
        let mut changed = Vec::new();
        if self.source_changed {
            changed.push(VersionComponent::SourceText);
        }
        if !self.dependencies_added.is_empty() || !self.dependencies_removed.is_empty() {
            changed.push(VersionComponent::Dependencies);
        }
        if !self.free_variables_added.is_empty()
            || !self.free_variables_removed.is_empty()
            || !self.free_variables_changed.is_empty()
        {
            changed.push(VersionComponent::FreeVariables);
        }
        changed
    }

    #[must_use]
    pub fn is_identical(&self) -> bool {
        self.changed_components().is_empty()
    }
}

/// Append-only persistence contract for Versions and Invocations.
///
/// Implementations are shared across threads and tasks. `put_version` is
/// idempotent, `put_invocation` inserts exactly once, and
/// `finalize_invocation` is the only mutation an invocation ever sees.
pub trait TraceStore: Send + Sync {
    /// # Errors
    /// Returns [`TraceError`] when the version is invalid or cannot be written.
    fn put_version(&self, version: &Version) -> Result<(), TraceError>;

    /// # Errors
    /// Returns [`TraceError::Conflict`] if the id already exists and
    /// [`TraceError::NotFound`] if its version or parent is missing.
    fn put_invocation(&self, invocation: &Invocation) -> Result<(), TraceError>;

    /// # Errors
    /// Returns [`TraceError::Conflict`] if the invocation is already terminal.
    fn finalize_invocation(
        &self,
        invocation_id: InvocationId,
        finalization: &Finalization,
    ) -> Result<(), TraceError>;

    /// # Errors
    /// Returns [`TraceError`] on backend failure.
    fn get_version(&self, version_id: &VersionId) -> Result<Option<Version>, TraceError>;

    /// # Errors
    /// Returns [`TraceError`] on backend failure.
    fn get_invocation(&self, invocation_id: InvocationId)
        -> Result<Option<Invocation>, TraceError>;

    /// Invocations of one version whose `started_at` falls in `range`, oldest first.
    ///
    /// # Errors
    /// Returns [`TraceError`] on backend failure.
    fn list_invocations(
        &self,
        version_id: &VersionId,
        range: &TimeRange,
    ) -> Result<Vec<Invocation>, TraceError>;

    /// The invocation followed by its ancestors up to the root.
    ///
    /// # Errors
    /// Returns [`TraceError::NotFound`] when the invocation does not exist.
    fn get_lineage(&self, invocation_id: InvocationId) -> Result<Vec<Invocation>, TraceError>;

    /// # Errors
    /// Returns [`TraceError`] on backend failure.
    fn list_children(&self, invocation_id: InvocationId) -> Result<Vec<Invocation>, TraceError>;

    /// Every invocation below `invocation_id`, breadth-first.
    ///
    /// # Errors
    /// Returns [`TraceError::NotFound`] when the invocation does not exist.
    fn get_descendants(&self, invocation_id: InvocationId)
        -> Result<Vec<Invocation>, TraceError>;

    /// Versions recorded under one name, oldest first.
    ///
    /// # Errors
    /// Returns [`TraceError`] on backend failure.
    fn list_versions(&self, name: &str) -> Result<Vec<Version>, TraceError>;

    /// The version recorded under the same name immediately before `version_id`.
    ///
    /// # Errors
    /// Returns [`TraceError::NotFound`] when `version_id` does not exist.
    fn previous_version(&self, version_id: &VersionId) -> Result<Option<Version>, TraceError>;

    /// Versions that list `version_id` among their dependencies.
    ///
    /// # Errors
    /// Returns [`TraceError`] on backend failure.
    fn list_dependents(&self, version_id: &VersionId) -> Result<Vec<Version>, TraceError>;

    /// # Errors
    /// Returns [`TraceError::NotFound`] if either version is missing.
    fn diff(&self, from: &VersionId, to: &VersionId) -> Result<VersionDiff, TraceError> {
        let lookup = |id: &VersionId| {
            self.get_version(id)?
                .ok_or_else(|| TraceError::NotFound(format!("version {id}")))
        };
        Ok(VersionDiff::between(&lookup(from)?, &lookup(to)?))
    }
}

pub(crate) mod digest {
    use std::collections::{BTreeMap, BTreeSet};

    use sha2::{Digest, Sha256};

    use crate::{SerializedValue, VersionId};

    const VERSION_DOMAIN: &[u8] = b"lmp.version.v1";
    const MEMBER_DOMAIN: &[u8] = b"lmp.cycle-member.v1";
    const SEAL_DOMAIN: &[u8] = b"lmp.cycle-seal.v1";
    const SEALED_DOMAIN: &[u8] = b"lmp.sealed-member.v1";

    /// Length-prefixed fields so that adjacent values cannot be re-split.
    struct FieldHasher(Sha256);

    impl FieldHasher {
        fn new(domain: &[u8]) -> Self {
            let mut hasher = Self(Sha256::new());
            hasher.field(domain);
            hasher
        }

        fn field(&mut self, bytes: &[u8]) {
            self.0.update((bytes.len() as u64).to_le_bytes());
            self.0.update(bytes);
        }

        fn content(
            &mut self,
            source_text: &str,
            dependencies: &BTreeSet<VersionId>,
            free_variables: &BTreeMap<String, SerializedValue>,
        ) {
            self.field(source_text.as_bytes());
            self.field(&(dependencies.len() as u64).to_le_bytes());
            for dependency in dependencies {
                self.field(dependency.as_str().as_bytes());
            }
            self.field(&(free_variables.len() as u64).to_le_bytes());
            for (name, value) in free_variables {
                self.field(name.as_bytes());
                self.field(value.canonical_json().as_bytes());
            }
        }

        fn finish(self) -> [u8; 32] {
            self.0.finalize().into()
        }
    }

    pub(crate) fn version(
        source_text: &str,
        dependencies: &BTreeSet<VersionId>,
        free_variables: &BTreeMap<String, SerializedValue>,
    ) -> [u8; 32] {
        let mut hasher = FieldHasher::new(VERSION_DOMAIN);
        hasher.content(source_text, dependencies, free_variables);
        hasher.finish()
    }

    pub(crate) fn member_digest(
        source_text: &str,
        external_dependencies: &BTreeSet<VersionId>,
        free_variables: &BTreeMap<String, SerializedValue>,
    ) -> String {
        let mut hasher = FieldHasher::new(MEMBER_DOMAIN);
        hasher.content(source_text, external_dependencies, free_variables);
        hex::encode(hasher.finish())
    }

    pub(crate) fn cycle_seal(mut member_digests: Vec<String>) -> String {
        member_digests.sort();
        let mut hasher = FieldHasher::new(SEAL_DOMAIN);
        for member in &member_digests {
            hasher.field(member.as_bytes());
        }
        hex::encode(hasher.finish())
    }

    pub(crate) fn sealed_member(seal: &str, member_digest: &str) -> [u8; 32] {
        let mut hasher = FieldHasher::new(SEALED_DOMAIN);
        hasher.field(seal.as_bytes());
        hasher.field(member_digest.as_bytes());
        hasher.finish()
    }
}
