// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle controller for the diagnostics engine.
//!
//! [`Diagnostics`] spawns one service task per tracker plus the metrics store
//! on a tokio runtime and moves between two states:
//!
//! ```text
//!   inactive ──start(config)──> active ──stop()──> inactive
//! ```
//!
//! `start` while active and `stop` while inactive are no-ops. The active flag,
//! the current configuration and the session number are the only state
//! shared outside the service tasks; they live behind a single mutex.
//!
//! Instrumentation calls are sent while that mutex is held, so every tracker
//! sees them strictly before or after the reset issued by `stop`. Events a
//! tracker emits for an earlier session are discarded by the store.

use crate::config::{
    Configuration, DEFAULT_LAYOUT_LOOP_THRESHOLD, DEFAULT_MAX_STORED_EVENTS,
    DEFAULT_REDRAW_THRESHOLD_PER_SECOND,
};
use crate::error::DiagnosticsError;
use crate::logger::{self, Category};
use crate::sampler::Sampler;
use crate::store_service::{StoreHandle, StoreService};
use crate::trackers::{
    BreachCallback, ConcurrencyHandle, ConcurrencyService, LayoutHandle, LayoutService,
    LeakHandle, LeakService, RedrawHandle, RedrawService, StateHandle, StateService,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Lifecycle {
    active: bool,
    config: Configuration,
    session: u64,
    sampler: Option<CancellationToken>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            active: false,
            config: Configuration::disabled(),
            session: 0,
            sampler: None,
        }
    }
}

fn lock(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    #[allow(clippy::expect_used)]
    lifecycle.lock().expect("lock poisoned")
}

#[derive(Debug)]
struct Inner {
    lifecycle: Arc<Mutex<Lifecycle>>,
    store: StoreHandle,
    redraw: RedrawHandle,
    layout: LayoutHandle,
    leaks: LeakHandle,
    state: StateHandle,
    concurrency: ConcurrencyHandle,
    runtime: Handle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut lifecycle) = self.lifecycle.lock() {
            if let Some(token) = lifecycle.sampler.take() {
                token.cancel();
            }
        }
    }
}

/// Handle to a running diagnostics engine.
///
/// Cheap to clone; every clone drives the same trackers and store. The
/// service tasks stop once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    inner: Arc<Inner>,
}

impl Diagnostics {
    /// Spawn the metrics store and all trackers on `runtime`. The engine
    /// starts inactive.
    #[must_use]
    pub fn new(runtime: &Handle) -> Self {
        let (store_service, store) = StoreService::new(DEFAULT_MAX_STORED_EVENTS);
        runtime.spawn(store_service.run());
        let lifecycle = Lifecycle::default();
        let scoped = store.scoped(lifecycle.session);

        let (redraw_service, redraw) =
            RedrawService::new(DEFAULT_REDRAW_THRESHOLD_PER_SECOND, Some(scoped.clone()));
        runtime.spawn(redraw_service.run());

        let (layout_service, layout) =
            LayoutService::new(DEFAULT_LAYOUT_LOOP_THRESHOLD, Some(scoped.clone()));
        runtime.spawn(layout_service.run());

        let (leak_service, leaks) = LeakService::new();
        runtime.spawn(leak_service.run());

        let (state_service, state) = StateService::new(Some(scoped.clone()));
        runtime.spawn(state_service.run());

        let (concurrency_service, concurrency) = ConcurrencyService::new(Some(scoped));
        runtime.spawn(concurrency_service.run());

        debug!("Diagnostics services spawned");

        Self {
            inner: Arc::new(Inner {
                lifecycle: Arc::new(Mutex::new(lifecycle)),
                store,
                redraw,
                layout,
                leaks,
                state,
                concurrency,
                runtime: runtime.clone(),
            }),
        }
    }

    /// Build an engine on the runtime of the calling context.
    pub fn current() -> Result<Self, DiagnosticsError> {
        let runtime = Handle::try_current().map_err(|e| DiagnosticsError::NoRuntime(e.to_string()))?;
        Ok(Self::new(&runtime))
    }

    /// Activate the engine with `config`.
    ///
    /// No-op when already active, or in a release build unless
    /// `config.use_in_release` is set.
    pub fn start(&self, config: Configuration) {
        if !config.allowed_in_current_build() {
            debug!("Diagnostics disabled in release builds, ignoring start");
            return;
        }

        let mut lifecycle = lock(&self.inner.lifecycle);
        if lifecycle.active {
            debug!("Diagnostics already active, ignoring start");
            return;
        }

        self.inner.store.configure(config.effective_max_stored_events());
        self.inner.store.set_log_to_console(config.log_to_console);
        self.inner
            .redraw
            .set_threshold(config.redraw_threshold_per_second);
        self.inner
            .layout
            .set_loop_threshold(config.layout_loop_threshold);

        if config.enable_performance_tracking {
            let token = CancellationToken::new();
            let shared = Arc::clone(&self.inner.lifecycle);
            let mut sampler = Sampler::new(
                self.inner.store.scoped(lifecycle.session),
                move || lock(&shared).active,
            );
            if config.enable_memory_tracking {
                sampler = sampler.with_leak_sweep(self.inner.leaks.clone(), config.leak_timeout);
            }
            if config.enable_concurrency_tracking {
                sampler = sampler.with_task_sweep(
                    self.inner.concurrency.clone(),
                    config.long_running_task_threshold,
                );
            }
            self.inner.runtime.spawn(sampler.run(token.clone()));
            lifecycle.sampler = Some(token);
        }

        info!(
            "Diagnostics started (max stored events: {}, redraw threshold: {}/s)",
            config.effective_max_stored_events(),
            config.redraw_threshold_per_second
        );
        lifecycle.config = config;
        lifecycle.active = true;
    }

    /// Start with `log_to_console` overridden, then log a start message.
    pub fn quick_start(&self, config: Configuration, log_to_console: bool) {
        self.start(Configuration {
            log_to_console,
            ..config
        });
        if self.is_active() && log_to_console {
            logger::log("Diagnostics started via quick_start()", Category::General);
        }
    }

    /// Deactivate the engine, stop the sampler and discard all session data.
    ///
    /// Trackers reset once they reach the commands queued before this call.
    /// Their events for the ended session, and those of a sampler tick still
    /// in flight, never reach the next session's store.
    pub fn stop(&self) {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if !lifecycle.active {
            return;
        }
        lifecycle.active = false;
        if let Some(token) = lifecycle.sampler.take() {
            token.cancel();
        }
        lifecycle.session += 1;
        let session = lifecycle.session;

        self.inner.redraw.begin_session(session);
        self.inner.layout.begin_session(session);
        self.inner.leaks.reset();
        self.inner.state.begin_session(session);
        self.inner.concurrency.begin_session(session);
        self.inner.store.begin_session(session);
        drop(lifecycle);
        info!("Diagnostics stopped");
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        lock(&self.inner.lifecycle).active
    }

    /// The configuration of the last `start`, or [`Configuration::disabled`]
    /// if the engine was never started. Only meaningful while active.
    #[must_use]
    pub fn current_configuration(&self) -> Configuration {
        lock(&self.inner.lifecycle).config.clone()
    }

    /// Register (or clear) the callback fired when an element's redraw rate
    /// breaches the threshold. It runs on the redraw tracker's task.
    pub fn on_redraw_threshold_breach(&self, callback: Option<BreachCallback>) {
        self.inner.redraw.set_on_threshold_breach(callback);
    }

    /// Export every stored event as pretty-printed JSON.
    ///
    /// Returns an empty payload when inactive or when nothing was recorded.
    /// Blocks the calling thread until the store answers: never call this
    /// from an async task, use [`Diagnostics::export_metrics_async`] instead.
    #[must_use]
    pub fn export_metrics(&self) -> Vec<u8> {
        if !self.is_active() {
            return Vec::new();
        }
        self.inner.store.export_json_blocking().unwrap_or_else(|e| {
            warn!("Failed to export diagnostics: {e}");
            Vec::new()
        })
    }

    /// Non-blocking variant of [`Diagnostics::export_metrics`].
    pub async fn export_metrics_async(&self) -> Vec<u8> {
        if !self.is_active() {
            return Vec::new();
        }
        self.inner.store.export_json().await.unwrap_or_else(|e| {
            warn!("Failed to export diagnostics: {e}");
            Vec::new()
        })
    }

    pub fn store(&self) -> &StoreHandle {
        &self.inner.store
    }

    pub fn redraw(&self) -> &RedrawHandle {
        &self.inner.redraw
    }

    pub fn layout(&self) -> &LayoutHandle {
        &self.inner.layout
    }

    pub fn leaks(&self) -> &LeakHandle {
        &self.inner.leaks
    }

    pub fn state(&self) -> &StateHandle {
        &self.inner.state
    }

    pub fn concurrency(&self) -> &ConcurrencyHandle {
        &self.inner.concurrency
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Run `f` if the engine is active and the subsystem picked by `enabled`
    /// is switched on. The lifecycle lock is held while `f` runs, so `f` must
    /// only queue work and must not call back into the lifecycle.
    pub(crate) fn when_enabled<R>(
        &self,
        enabled: impl FnOnce(&Configuration) -> bool,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        let lifecycle = lock(&self.inner.lifecycle);
        (lifecycle.active && enabled(&lifecycle.config)).then(f)
    }
}
