//! Records versions and invocations of language-model programs.
//!
//! A [`Recorder`] owns the definition registry, the dependency hasher and a
//! handle to a [`TraceStore`]. [`Recorder::lmp`] wraps a function into an
//! [`Lmp`] whose calls are persisted as invocations linked to the enclosing
//! recorded call on the same task.

mod context;

use std::any::type_name;
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use lmp_trace_core::{
    serialize, Capture, CodecRegistry, DependencyHasher, Finalization, Invocation,
    InvocationError, InvocationId, LmpDefinition, LmpKey, LmpRegistry, Metadata, SerializedValue,
    TraceStore, Version, VersionId,
};
use lmp_trace_store_sqlite::SqliteStore;
use parking_lot::Mutex;
use time::OffsetDateTime;

pub use context::{current_invocation, record_metadata};

use crate::context::{current_frame, CallFrame};

/// Error kind recorded when an async call is dropped before completion.
pub const CANCELLED_KIND: &str = "cancelled";
/// Error kind recorded when the wrapped function panics.
pub const PANIC_KIND: &str = "panic";

#[derive(Debug, Clone, Default)]
pub struct RecorderConfig {
    /// Tags merged into every invocation's metadata.
    pub capture_metadata: Metadata,
    /// Blob codecs layered over the built-in ones.
    pub serializer_overrides: CodecRegistry,
    /// Compute and persist versions at first call instead of at registration.
    pub lazy_versioning: bool,
    /// Log every invocation at `info` instead of `debug`.
    pub verbose: bool,
}

impl RecorderConfig {
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.capture_metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_serializer_overrides(mut self, overrides: CodecRegistry) -> Self {
        self.serializer_overrides = overrides;
        self
    }

    #[must_use]
    pub fn lazy_versioning(mut self, lazy: bool) -> Self {
        self.lazy_versioning = lazy;
        self
    }

    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

struct RecorderInner {
    store: Arc<dyn TraceStore>,
    config: RecorderConfig,
    codecs: CodecRegistry,
    registry: LmpRegistry,
    hasher: DependencyHasher,
    persisted: Mutex<HashSet<VersionId>>,
}

/// Shared handle; clones record into the same store and registry.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("config", &self.inner.config)
            .field("definitions", &self.inner.registry.keys())
            .finish_non_exhaustive()
    }
}

impl Recorder {
    #[must_use]
    pub fn new(store: Arc<dyn TraceStore>, config: RecorderConfig) -> Self {
        let mut codecs = CodecRegistry::with_builtin_codecs();
        codecs.extend_from(&config.serializer_overrides);
        Self {
            inner: Arc::new(RecorderInner {
                store,
                config,
                codecs,
                registry: LmpRegistry::new(),
                hasher: DependencyHasher::new(),
                persisted: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Open (and migrate) a `SQLite` trace database at `path` and record into it.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open_sqlite(path: &Path, config: RecorderConfig) -> anyhow::Result<Self> {
        let store = SqliteStore::open_and_migrate(path)?;
        Ok(Self::new(Arc::new(store), config))
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn config(&self) -> &RecorderConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn codecs(&self) -> &CodecRegistry {
        &self.inner.codecs
    }

    #[must_use]
    pub fn registry(&self) -> &LmpRegistry {
        &self.inner.registry
    }

    /// Register (or replace) a definition without wrapping a function, for
    /// LMPs that are only referenced as dependencies.
    pub fn define(&self, definition: LmpDefinition) -> LmpKey {
        let key = self.inner.registry.define(definition);
        if !self.inner.config.lazy_versioning {
            self.resolve_version(&key);
        }
        key
    }

    /// Register `definition` and wrap `func` so every call is recorded.
    ///
    /// Registering again under the same key replaces the definition; the
    /// next call resolves to the new version.
    pub fn lmp<F>(&self, definition: LmpDefinition, func: F) -> Lmp<F> {
        let key = self.define(definition);
        Lmp { recorder: self.clone(), key, func }
    }

    /// Current version of `key`, with its dependency closure persisted.
    #[must_use]
    pub fn version(&self, key: &LmpKey) -> Version {
        let version = self.inner.hasher.hash_lmp(key, &self.inner.registry);
        self.persist_closure(key, &version);
        version
    }

    fn resolve_version(&self, key: &LmpKey) -> VersionId {
        self.version(key).version_id
    }

    fn persist_closure(&self, key: &LmpKey, root: &Version) {
        if self.inner.persisted.lock().contains(&root.version_id) {
            return;
        }
        if root.best_effort {
            tracing::warn!(lmp = %key, version_id = %root.version_id, "recording best-effort version");
        }

        for version in self.inner.hasher.hash_closure(key, &self.inner.registry) {
            if self.inner.persisted.lock().contains(&version.version_id) {
                continue;
            }
            match self.inner.store.put_version(&version) {
                Ok(()) => {
                    self.inner.persisted.lock().insert(version.version_id.clone());
                }
                Err(err) => {
                    tracing::error!(
                        version_id = %version.version_id,
                        name = %version.name,
                        error = %err,
                        "failed to persist version; trace record lost"
                    );
                }
            }
        }
    }

    fn capture<T: Capture + ?Sized>(&self, value: &T) -> SerializedValue {
        serialize(value, &self.inner.codecs)
    }

    /// Persist a `running` invocation and build the frame its body runs in.
    fn begin(
        &self,
        key: &LmpKey,
        parent: Option<&CallFrame>,
        inputs: SerializedValue,
        call_metadata: Metadata,
    ) -> ActiveCall {
        let version_id = self.resolve_version(key);
        let parent_invocation_id = parent.and_then(|frame| frame.invocation_id);

        let mut metadata = self.inner.config.capture_metadata.clone();
        metadata.extend(call_metadata);

        let invocation = Invocation::start(
            version_id,
            parent_invocation_id,
            inputs,
            metadata,
            OffsetDateTime::now_utc(),
        );
        let invocation_id = invocation.invocation_id;
        let recorded = match self.inner.store.put_invocation(&invocation) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    lmp = %key,
                    invocation_id = %invocation_id,
                    error = %err,
                    "failed to persist invocation start; trace record lost"
                );
                false
            }
        };

        let frame = CallFrame::new(if recorded { Some(invocation_id) } else { parent_invocation_id });
        ActiveCall {
            key: key.clone(),
            invocation_id,
            started_at: invocation.started_at,
            clock: Instant::now(),
            frame,
            recorded,
        }
    }

    fn finish(&self, active: &ActiveCall, outcome: Result<SerializedValue, InvocationError>) {
        let ended_at = active.started_at + active.clock.elapsed();
        let metadata = active.frame.take_metadata();
        if !active.recorded {
            return;
        }

        let status = if outcome.is_ok() { "completed" } else { "failed" };
        let finalization = match outcome {
            Ok(output) => Finalization::completed(ended_at, output),
            Err(error) => Finalization::failed(ended_at, error),
        }
        .with_metadata(metadata);

        if let Err(err) = self.inner.store.finalize_invocation(active.invocation_id, &finalization) {
            tracing::error!(
                lmp = %active.key,
                invocation_id = %active.invocation_id,
                error = %err,
                "failed to finalize invocation; trace record lost"
            );
            return;
        }

        let elapsed_ms = u64::try_from(active.clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        if self.inner.config.verbose {
            tracing::info!(
                lmp = %active.key,
                invocation_id = %active.invocation_id,
                status,
                elapsed_ms,
                "invocation recorded"
            );
        } else {
            tracing::debug!(
                lmp = %active.key,
                invocation_id = %active.invocation_id,
                status,
                elapsed_ms,
                "invocation recorded"
            );
        }
    }
}

struct ActiveCall {
    key: LmpKey,
    invocation_id: InvocationId,
    started_at: OffsetDateTime,
    clock: Instant,
    frame: CallFrame,
    recorded: bool,
}

/// Finalizes an in-flight async call as failed if its future is dropped.
struct CancelGuard<'r> {
    recorder: &'r Recorder,
    active: Option<ActiveCall>,
}

impl CancelGuard<'_> {
    fn disarm(&mut self) -> Option<ActiveCall> {
        self.active.take()
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let error = if std::thread::panicking() {
                InvocationError::new(PANIC_KIND, "async call panicked")
            } else {
                InvocationError::new(CANCELLED_KIND, "call dropped before completion")
            };
            self.recorder.finish(&active, Err(error));
        }
    }
}

/// A recorded language-model program: the wrapped function plus its key.
#[derive(Clone)]
pub struct Lmp<F> {
    recorder: Recorder,
    key: LmpKey,
    func: F,
}

impl<F> std::fmt::Debug for Lmp<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lmp").field("key", &self.key).finish_non_exhaustive()
    }
}

impl<F> Lmp<F> {
    #[must_use]
    pub fn key(&self) -> &LmpKey {
        &self.key
    }

    #[must_use]
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// The version the next call will be recorded against.
    #[must_use]
    pub fn version(&self) -> Version {
        self.recorder.version(&self.key)
    }

    /// Call the wrapped function and record the invocation.
    ///
    /// # Errors
    /// Returns exactly the error produced by the wrapped function. Recording
    /// failures are logged and never returned.
    pub fn call<A, R, E>(&self, args: A) -> Result<R, E>
    where
        F: Fn(A) -> Result<R, E>,
        A: Capture,
        R: Capture,
        E: Display,
    {
        self.call_with_metadata(args, Metadata::new())
    }

    /// Like [`Lmp::call`], with extra tags for this invocation only.
    ///
    /// # Errors
    /// Returns exactly the error produced by the wrapped function.
    pub fn call_with_metadata<A, R, E>(&self, args: A, metadata: Metadata) -> Result<R, E>
    where
        F: Fn(A) -> Result<R, E>,
        A: Capture,
        R: Capture,
        E: Display,
    {
        let parent = current_frame();
        let inputs = self.recorder.capture(&args);
        let active = self.recorder.begin(&self.key, parent.as_ref(), inputs, metadata);

        let frame = active.frame.clone();
        let result = catch_unwind(AssertUnwindSafe(|| frame.run(|| (self.func)(args))));
        match result {
            Ok(Ok(value)) => {
                self.recorder.finish(&active, Ok(self.recorder.capture(&value)));
                Ok(value)
            }
            Ok(Err(err)) => {
                let error = InvocationError::new(type_name::<E>(), err.to_string());
                self.recorder.finish(&active, Err(error));
                Err(err)
            }
            Err(payload) => {
                let error = InvocationError::new(PANIC_KIND, panic_message(&*payload));
                self.recorder.finish(&active, Err(error));
                resume_unwind(payload)
            }
        }
    }

    /// Call an async wrapped function and record the invocation.
    ///
    /// The parent is taken from the context at the time `call_async` is
    /// called, so a future spawned onto another task still nests under the
    /// caller. Dropping the future before it resolves finalizes the
    /// invocation as failed with kind `cancelled`.
    pub fn call_async<'a, A, Fut, R, E>(&'a self, args: A) -> impl Future<Output = Result<R, E>> + 'a
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<R, E>> + 'a,
        A: Capture + 'a,
        R: Capture + 'a,
        E: Display + 'a,
    {
        self.call_async_with_metadata(args, Metadata::new())
    }

    /// Like [`Lmp::call_async`], with extra tags for this invocation only.
    pub fn call_async_with_metadata<'a, A, Fut, R, E>(
        &'a self,
        args: A,
        metadata: Metadata,
    ) -> impl Future<Output = Result<R, E>> + 'a
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<R, E>> + 'a,
        A: Capture + 'a,
        R: Capture + 'a,
        E: Display + 'a,
    {
        let parent = current_frame();
        async move {
            let inputs = self.recorder.capture(&args);
            let active = self.recorder.begin(&self.key, parent.as_ref(), inputs, metadata);
            let frame = active.frame.clone();
            let mut guard = CancelGuard { recorder: &self.recorder, active: Some(active) };

            let future = frame.clone().run(|| (self.func)(args));
            let result = frame.run_async(future).await;

            if let Some(active) = guard.disarm() {
                let outcome = match &result {
                    Ok(value) => Ok(self.recorder.capture(value)),
                    Err(err) => Err(InvocationError::new(type_name::<E>(), err.to_string())),
                };
                self.recorder.finish(&active, outcome);
            }
            result
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
