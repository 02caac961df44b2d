// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Call surface used by instrumentation hooks.
//!
//! Every method is a no-op unless the engine is active and the relevant
//! subsystem is enabled in the current configuration.

use crate::runtime::Diagnostics;
use crate::trackers::{LayoutSize, ObjectId, RedrawCause, StateChange};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Completes a tracked task when dropped, so panics and aborts are counted
/// as finished work too.
struct CompletionGuard {
    diagnostics: Diagnostics,
    task_id: String,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.diagnostics.concurrency().complete_task(&self.task_id);
    }
}

impl Diagnostics {
    pub fn record_invocation(&self, view_id: &str, cause: RedrawCause, parent_id: Option<&str>) {
        self.when_enabled(
            |c| c.enable_redraw_tracking,
            || self.redraw().record_invocation(view_id, cause, parent_id),
        );
    }

    pub fn record_pass(&self, view_id: &str, size: LayoutSize) {
        self.when_enabled(
            |c| c.enable_layout_tracking,
            || self.layout().record_pass(view_id, size),
        );
    }

    pub fn record_change(&self, change: StateChange) {
        self.when_enabled(
            |c| c.enable_state_tracking,
            || self.state().record_change(change),
        );
    }

    /// Track `object` for leaks. Returns `None` when memory tracking is off.
    pub fn register_object<T: Any + Send + Sync>(
        &self,
        object: &Arc<T>,
        expected_deadline: Option<Instant>,
    ) -> Option<ObjectId> {
        self.when_enabled(
            |c| c.enable_memory_tracking,
            || self.leaks().register(object, expected_deadline),
        )
    }

    pub fn unregister_object<T: ?Sized>(&self, object: &Arc<T>) {
        self.when_enabled(
            |c| c.enable_memory_tracking,
            || self.leaks().unregister(object),
        );
    }

    /// Notify that the object registered as `object_id` was destroyed.
    pub fn record_drop(&self, object_id: ObjectId) {
        self.when_enabled(
            |c| c.enable_memory_tracking,
            || self.leaks().record_drop(object_id),
        );
    }

    pub fn register_task(&self, task_id: &str) {
        self.when_enabled(
            |c| c.enable_concurrency_tracking,
            || self.concurrency().register_task(task_id),
        );
    }

    pub fn complete_task(&self, task_id: &str) {
        self.when_enabled(
            |c| c.enable_concurrency_tracking,
            || self.concurrency().complete_task(task_id),
        );
    }

    pub fn cancel_task(&self, task_id: &str) {
        self.when_enabled(
            |c| c.enable_concurrency_tracking,
            || self.concurrency().cancel_task(task_id),
        );
    }

    pub fn record_main_context_violation(&self, view_id: &str, message: &str) {
        self.when_enabled(
            |c| c.enable_concurrency_tracking,
            || {
                self.concurrency()
                    .record_main_context_violation(view_id, message);
            },
        );
    }

    /// Spawn `future` on the engine's runtime as tracked work.
    ///
    /// The task is registered under a fresh id before it starts and completed
    /// when it finishes, panics or is aborted. With concurrency tracking off
    /// this is a plain spawn.
    pub fn spawn_tracked<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.when_enabled(
            |c| c.enable_concurrency_tracking,
            || {
                let task_id = Uuid::new_v4().to_string();
                self.concurrency().register_task(&task_id);
                CompletionGuard {
                    diagnostics: self.clone(),
                    task_id,
                }
            },
        );
        let Some(guard) = guard else {
            return self.runtime().spawn(future);
        };

        self.runtime().spawn(async move {
            let _guard = guard;
            future.await
        })
    }
}
