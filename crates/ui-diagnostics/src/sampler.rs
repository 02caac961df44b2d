// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic performance sampler.
//!
//! Every [`SAMPLE_INTERVAL`] the sampler records the resident memory of the
//! process. On the same tick it sweeps the leak detector and the concurrency
//! tracker when those subsystems are enabled, turning their findings into
//! events. The wait is cancellation-aware: once the token fires, or the
//! engine reports itself inactive, the loop exits without emitting.

use crate::event::{DiagnosticEvent, EventKind};
use crate::proc;
use crate::store_service::StoreHandle;
use crate::trackers::{ConcurrencyHandle, LeakHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) struct Sampler<F> {
    store: StoreHandle,
    leaks: Option<(LeakHandle, Duration)>,
    tasks: Option<(ConcurrencyHandle, Duration)>,
    interval: Duration,
    is_active: F,
}

impl<F> Sampler<F>
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    pub(crate) fn new(store: StoreHandle, is_active: F) -> Self {
        Self {
            store,
            leaks: None,
            tasks: None,
            interval: SAMPLE_INTERVAL,
            is_active,
        }
    }

    /// Also report objects alive past `leak_timeout` on every tick.
    pub(crate) fn with_leak_sweep(mut self, leaks: LeakHandle, leak_timeout: Duration) -> Self {
        self.leaks = Some((leaks, leak_timeout));
        self
    }

    /// Also report work running longer than `threshold` on every tick.
    pub(crate) fn with_task_sweep(mut self, tasks: ConcurrencyHandle, threshold: Duration) -> Self {
        self.tasks = Some((tasks, threshold));
        self
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub(crate) async fn run(self, cancel_token: CancellationToken) {
        debug!("Performance sampler started");

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
            if cancel_token.is_cancelled() || !(self.is_active)() {
                break;
            }
            self.sample().await;
        }

        debug!("Performance sampler stopped");
    }

    async fn sample(&self) {
        match proc::resident_memory_mb() {
            Ok(mb) => self.store.add(
                DiagnosticEvent::new(EventKind::PerformanceSample)
                    .with_message("Memory")
                    .with_payload("mb", format!("{mb:.1}")),
            ),
            Err(e) => debug!("Skipping memory sample: {e}"),
        }

        if let Some((leaks, leak_timeout)) = &self.leaks {
            match leaks.suspected_leaks(*leak_timeout).await {
                Ok(found) => {
                    for leak in found {
                        self.store.add(
                            DiagnosticEvent::new(EventKind::SuspectedLeak)
                                .with_view_id(leak.object_id.to_string())
                                .with_message(leak.message)
                                .with_payload(
                                    "ageSecs",
                                    format!("{:.1}", leak.registered_at.elapsed().as_secs_f64()),
                                ),
                        );
                    }
                }
                Err(e) => debug!("Skipping leak sweep: {e}"),
            }
        }

        if let Some((tasks, threshold)) = &self.tasks {
            match tasks.long_running_tasks(*threshold).await {
                Ok(found) => {
                    for task in found {
                        let seconds = task.duration.as_secs_f64();
                        self.store.add(
                            DiagnosticEvent::new(EventKind::ConcurrencyWarning)
                                .with_message(format!("Task running for {seconds:.1}s"))
                                .with_payload("type", "longRunningTask")
                                .with_payload("taskId", task.task_id)
                                .with_payload("durationSecs", format!("{seconds:.1}")),
                        );
                    }
                }
                Err(e) => debug!("Skipping long-running task sweep: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_service::StoreService;
    use crate::trackers::{ConcurrencyService, LeakService};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn spawn_store() -> StoreHandle {
        let (service, handle) = StoreService::new(1_000);
        tokio::spawn(service.run());
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_tick_emits_nothing() {
        let store = spawn_store();
        let token = CancellationToken::new();
        let sampler = Sampler::new(store.clone(), || true);
        let task = tokio::spawn(sampler.run(token.clone()));

        token.cancel();
        task.await.expect("sampler task failed");
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_engine_stops_sampler() {
        let store = spawn_store();
        let token = CancellationToken::new();
        let sampler = Sampler::new(store.clone(), || false);
        let task = tokio::spawn(sampler.run(token.clone()));

        tokio::time::advance(SAMPLE_INTERVAL + Duration::from_millis(1)).await;
        task.await.expect("sampler task failed");
        assert!(!token.is_cancelled());
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_tick_emits_memory_sample() {
        let store = spawn_store();
        let token = CancellationToken::new();
        let active = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&active);
        let sampler = Sampler::new(store.clone(), move || flag.load(Ordering::SeqCst))
            .with_interval(Duration::from_millis(10));
        let task = tokio::spawn(sampler.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        task.await.expect("sampler task failed");

        let events = store.recent_events(100).await.unwrap();
        assert!(!events.is_empty());
        let sample = &events[0];
        assert_eq!(sample.kind(), EventKind::PerformanceSample);
        assert_eq!(sample.message(), Some("Memory"));
        let mb = sample.payload_value("mb").expect("mb payload");
        assert_eq!(mb.split('.').nth(1).map(str::len), Some(1));
        assert!(mb.parse::<f64>().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_tick_sweeps_leaks_and_tasks() {
        let store = spawn_store();
        let (leak_service, leaks) = LeakService::new();
        tokio::spawn(leak_service.run());
        let (concurrency_service, tasks) = ConcurrencyService::new(None);
        tokio::spawn(concurrency_service.run());

        let retained = Arc::new(String::from("retained"));
        leaks.register(&retained, None);
        tasks.register_task("sync");

        let token = CancellationToken::new();
        let sampler = Sampler::new(store.clone(), || true)
            .with_interval(Duration::from_millis(20))
            .with_leak_sweep(leaks.clone(), Duration::from_millis(1))
            .with_task_sweep(tasks.clone(), Duration::from_millis(1));
        let task = tokio::spawn(sampler.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(70)).await;
        token.cancel();
        task.await.expect("sampler task failed");

        let events = store.recent_events(1_000).await.unwrap();
        let leak = events
            .iter()
            .find(|e| e.kind() == EventKind::SuspectedLeak)
            .expect("leak event");
        assert!(leak.view_id().is_some_and(|id| id.starts_with("0x")));
        assert!(leak.payload_value("ageSecs").is_some());

        let warning = events
            .iter()
            .find(|e| e.kind() == EventKind::ConcurrencyWarning)
            .expect("long-running task event");
        assert_eq!(warning.payload_value("type"), Some("longRunningTask"));
        assert_eq!(warning.payload_value("taskId"), Some("sync"));
    }
}
