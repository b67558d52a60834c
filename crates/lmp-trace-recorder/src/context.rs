//! Per-task call context.
//!
//! The innermost recorded call is held in a tokio task-local, so nesting is
//! tracked per task (and per thread for synchronous calls) without any
//! process-wide mutable state.

use std::future::Future;
use std::sync::Arc;

use lmp_trace_core::{InvocationId, Metadata};
use parking_lot::Mutex;

tokio::task_local! {
    static CURRENT_CALL: CallFrame;
}

/// The innermost recorded call visible to the running code.
#[derive(Debug, Clone)]
pub(crate) struct CallFrame {
    /// Parent for calls made inside this frame. Inherited from the enclosing
    /// frame when this call could not be recorded.
    pub(crate) invocation_id: Option<InvocationId>,
    pub(crate) metadata: Arc<Mutex<Metadata>>,
}

impl CallFrame {
    pub(crate) fn new(invocation_id: Option<InvocationId>) -> Self {
        Self { invocation_id, metadata: Arc::new(Mutex::new(Metadata::new())) }
    }

    pub(crate) fn take_metadata(&self) -> Metadata {
        std::mem::take(&mut *self.metadata.lock())
    }

    pub(crate) fn run<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT_CALL.sync_scope(self, f)
    }

    pub(crate) async fn run_async<Fut: Future>(self, future: Fut) -> Fut::Output {
        CURRENT_CALL.scope(self, future).await
    }
}

pub(crate) fn current_frame() -> Option<CallFrame> {
    CURRENT_CALL.try_with(Clone::clone).ok()
}

/// Id of the innermost recorded invocation on this task, if any.
#[must_use]
pub fn current_invocation() -> Option<InvocationId> {
    current_frame().and_then(|frame| frame.invocation_id)
}

/// Attach a metadata entry to the innermost running invocation, e.g. token
/// counts reported by a provider. Entries are merged when the invocation is
/// finalized and override earlier values under the same key.
///
/// Returns `false` when called outside a recorded invocation.
pub fn record_metadata(key: impl Into<String>, value: impl Into<serde_json::Value>) -> bool {
    CURRENT_CALL
        .try_with(|frame| {
            frame.metadata.lock().insert(key.into(), value.into());
        })
        .is_ok()
}
