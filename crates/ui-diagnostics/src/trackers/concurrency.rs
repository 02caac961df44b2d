// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background work lifecycle tracking.

use crate::error::DiagnosticsError;
use crate::event::{DiagnosticEvent, EventKind};
use crate::service::{request, respond, send};
use crate::store_service::StoreHandle;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const SERVICE_NAME: &str = "concurrency tracker";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongRunningTask {
    pub task_id: String,
    pub created_at: Instant,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
struct TaskEntry {
    created_at: Instant,
    cancelled: bool,
    completed_at: Option<Instant>,
}

impl TaskEntry {
    fn is_active(&self) -> bool {
        self.completed_at.is_none() && !self.cancelled
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConcurrencyTracker {
    tasks: HashMap<String, TaskEntry>,
    completed_durations: HashMap<String, Duration>,
}

impl ConcurrencyTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `task_id`. Re-registering an id restarts its clock.
    pub fn register_task(&mut self, task_id: &str) {
        self.register_task_at(task_id, Instant::now());
    }

    fn register_task_at(&mut self, task_id: &str, now: Instant) {
        self.tasks.insert(
            task_id.to_string(),
            TaskEntry {
                created_at: now,
                cancelled: false,
                completed_at: None,
            },
        );
    }

    /// Mark `task_id` cancelled. The entry is kept.
    pub fn cancel_task(&mut self, task_id: &str) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.cancelled = true;
        }
    }

    pub fn complete_task(&mut self, task_id: &str) {
        self.complete_task_at(task_id, Instant::now());
    }

    fn complete_task_at(&mut self, task_id: &str, now: Instant) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.completed_at = Some(now);
            self.completed_durations.insert(
                task_id.to_string(),
                now.saturating_duration_since(task.created_at),
            );
        }
    }

    #[must_use]
    pub fn long_running_tasks(&self, threshold: Duration) -> Vec<LongRunningTask> {
        self.long_running_tasks_at(threshold, Instant::now())
    }

    /// Unfinished, uncancelled tasks whose age is at least `threshold`,
    /// oldest first.
    fn long_running_tasks_at(&self, threshold: Duration, now: Instant) -> Vec<LongRunningTask> {
        let mut tasks: Vec<LongRunningTask> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.is_active())
            .filter_map(|(task_id, task)| {
                let duration = now.saturating_duration_since(task.created_at);
                (duration >= threshold).then(|| LongRunningTask {
                    task_id: task_id.clone(),
                    created_at: task.created_at,
                    duration,
                })
            })
            .collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        tasks
    }

    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.tasks.values().filter(|task| task.is_active()).count()
    }

    /// How long a completed task ran for.
    #[must_use]
    pub fn completed_duration(&self, task_id: &str) -> Option<Duration> {
        self.completed_durations.get(task_id).copied()
    }

    pub fn reset(&mut self) {
        self.tasks.clear();
        self.completed_durations.clear();
    }
}

#[derive(Debug)]
pub enum ConcurrencyCommand {
    RegisterTask(String),
    CancelTask(String),
    CompleteTask(String),
    LongRunningTasks {
        threshold: Duration,
        response_tx: oneshot::Sender<Vec<LongRunningTask>>,
    },
    ActiveTaskCount(oneshot::Sender<usize>),
    CompletedDuration {
        task_id: String,
        response_tx: oneshot::Sender<Option<Duration>>,
    },
    MainContextViolation {
        view_id: String,
        message: String,
    },
    Reset,
    BeginSession(u64),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct ConcurrencyHandle {
    tx: mpsc::UnboundedSender<ConcurrencyCommand>,
}

impl ConcurrencyHandle {
    pub fn register_task(&self, task_id: &str) {
        send(
            &self.tx,
            SERVICE_NAME,
            ConcurrencyCommand::RegisterTask(task_id.to_string()),
        );
    }

    pub fn cancel_task(&self, task_id: &str) {
        send(
            &self.tx,
            SERVICE_NAME,
            ConcurrencyCommand::CancelTask(task_id.to_string()),
        );
    }

    pub fn complete_task(&self, task_id: &str) {
        send(
            &self.tx,
            SERVICE_NAME,
            ConcurrencyCommand::CompleteTask(task_id.to_string()),
        );
    }

    pub async fn long_running_tasks(
        &self,
        threshold: Duration,
    ) -> Result<Vec<LongRunningTask>, DiagnosticsError> {
        request(&self.tx, SERVICE_NAME, |response_tx| {
            ConcurrencyCommand::LongRunningTasks {
                threshold,
                response_tx,
            }
        })
        .await
    }

    pub async fn active_task_count(&self) -> Result<usize, DiagnosticsError> {
        request(&self.tx, SERVICE_NAME, ConcurrencyCommand::ActiveTaskCount).await
    }

    pub async fn completed_duration(
        &self,
        task_id: &str,
    ) -> Result<Option<Duration>, DiagnosticsError> {
        let task_id = task_id.to_string();
        request(&self.tx, SERVICE_NAME, |response_tx| {
            ConcurrencyCommand::CompletedDuration {
                task_id,
                response_tx,
            }
        })
        .await
    }

    /// Report a write that should have happened on the main context.
    pub fn record_main_context_violation(&self, view_id: &str, message: &str) {
        send(
            &self.tx,
            SERVICE_NAME,
            ConcurrencyCommand::MainContextViolation {
                view_id: view_id.to_string(),
                message: message.to_string(),
            },
        );
    }

    pub fn reset(&self) {
        send(&self.tx, SERVICE_NAME, ConcurrencyCommand::Reset);
    }

    /// Reset, then scope store events to `session`.
    pub(crate) fn begin_session(&self, session: u64) {
        send(&self.tx, SERVICE_NAME, ConcurrencyCommand::BeginSession(session));
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<ConcurrencyCommand>> {
        self.tx.send(ConcurrencyCommand::Shutdown)
    }
}

pub struct ConcurrencyService {
    tracker: ConcurrencyTracker,
    store: Option<StoreHandle>,
    rx: mpsc::UnboundedReceiver<ConcurrencyCommand>,
}

impl ConcurrencyService {
    #[must_use]
    pub fn new(store: Option<StoreHandle>) -> (Self, ConcurrencyHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            tracker: ConcurrencyTracker::new(),
            store,
            rx,
        };
        (service, ConcurrencyHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Concurrency tracker service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                ConcurrencyCommand::RegisterTask(task_id) => self.tracker.register_task(&task_id),
                ConcurrencyCommand::CancelTask(task_id) => self.tracker.cancel_task(&task_id),
                ConcurrencyCommand::CompleteTask(task_id) => self.tracker.complete_task(&task_id),
                ConcurrencyCommand::LongRunningTasks {
                    threshold,
                    response_tx,
                } => respond(
                    response_tx,
                    SERVICE_NAME,
                    self.tracker.long_running_tasks(threshold),
                ),
                ConcurrencyCommand::ActiveTaskCount(response_tx) => {
                    respond(response_tx, SERVICE_NAME, self.tracker.active_task_count());
                }
                ConcurrencyCommand::CompletedDuration {
                    task_id,
                    response_tx,
                } => respond(
                    response_tx,
                    SERVICE_NAME,
                    self.tracker.completed_duration(&task_id),
                ),
                ConcurrencyCommand::MainContextViolation { view_id, message } => {
                    if let Some(store) = &self.store {
                        store.add(
                            DiagnosticEvent::new(EventKind::ConcurrencyWarning)
                                .with_view_id(view_id)
                                .with_message(message)
                                .with_payload("type", "mainContextViolation"),
                        );
                    }
                }
                ConcurrencyCommand::Reset => self.tracker.reset(),
                ConcurrencyCommand::BeginSession(session) => {
                    self.tracker.reset();
                    self.store = self.store.as_ref().map(|store| store.scoped(session));
                }
                ConcurrencyCommand::Shutdown => {
                    debug!("Concurrency tracker service shutting down");
                    break;
                }
            }
        }

        debug!("Concurrency tracker service stopped");
    }
}
