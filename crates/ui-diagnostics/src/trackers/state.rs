// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! State mutation counting, redundant-update detection and off-main-context
//! write reporting.
//!
//! Whether a write happened on the main context is reported by the caller;
//! the monitor records it as given.

use crate::bounded::BoundedBuffer;
use crate::error::DiagnosticsError;
use crate::event::{DiagnosticEvent, EventKind};
use crate::service::{request, respond, send};
use crate::store_service::StoreHandle;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub const MAX_VIOLATIONS: usize = 200;

const SERVICE_NAME: &str = "state monitor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateViolation {
    pub view_id: String,
    pub key: Option<String>,
    pub on_main_context: bool,
    pub message: String,
}

/// A single observed mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateChange {
    pub view_id: String,
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub on_main_context: bool,
}

impl StateChange {
    #[must_use]
    pub fn new(view_id: impl Into<String>, on_main_context: bool) -> Self {
        Self {
            view_id: view_id.into(),
            on_main_context,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_values(mut self, old_value: Option<String>, new_value: Option<String>) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    fn is_redundant(&self) -> bool {
        self.key.is_some() && self.old_value.is_some() && self.old_value == self.new_value
    }
}

#[derive(Debug, Clone, Default)]
struct ViewStateEntry {
    change_count: u64,
    redundant_count: u64,
    last_value_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StateMonitor {
    view_states: HashMap<String, ViewStateEntry>,
    violations: BoundedBuffer<StateViolation>,
}

impl Default for StateMonitor {
    fn default() -> Self {
        Self {
            view_states: HashMap::new(),
            violations: BoundedBuffer::new(MAX_VIOLATIONS),
        }
    }
}

impl StateMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutation; returns the violation it produced, if any.
    pub fn record_change(&mut self, change: StateChange) -> Option<StateViolation> {
        let redundant = change.is_redundant();
        let entry = self.view_states.entry(change.view_id.clone()).or_default();
        entry.change_count += 1;
        if redundant {
            entry.redundant_count += 1;
        }
        entry.last_value_key.clone_from(&change.key);

        if change.on_main_context {
            return None;
        }
        let violation = StateViolation {
            view_id: change.view_id,
            key: change.key,
            on_main_context: false,
            message: "State change off main context".to_string(),
        };
        self.violations.push(violation.clone());
        Some(violation)
    }

    #[must_use]
    pub fn change_count_for(&self, view_id: &str) -> u64 {
        self.view_states.get(view_id).map_or(0, |entry| entry.change_count)
    }

    #[must_use]
    pub fn redundant_count_for(&self, view_id: &str) -> u64 {
        self.view_states
            .get(view_id)
            .map_or(0, |entry| entry.redundant_count)
    }

    #[must_use]
    pub fn last_value_key_for(&self, view_id: &str) -> Option<&str> {
        self.view_states
            .get(view_id)
            .and_then(|entry| entry.last_value_key.as_deref())
    }

    /// Retained violations, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<StateViolation> {
        self.violations.to_vec()
    }

    pub fn reset(&mut self) {
        self.view_states.clear();
        self.violations.clear();
    }
}

#[derive(Debug)]
pub enum StateCommand {
    RecordChange(Box<StateChange>),
    ChangeCountFor {
        view_id: String,
        response_tx: oneshot::Sender<u64>,
    },
    RedundantCountFor {
        view_id: String,
        response_tx: oneshot::Sender<u64>,
    },
    Violations(oneshot::Sender<Vec<StateViolation>>),
    Reset,
    BeginSession(u64),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct StateHandle {
    tx: mpsc::UnboundedSender<StateCommand>,
}

impl StateHandle {
    pub fn record_change(&self, change: StateChange) {
        send(
            &self.tx,
            SERVICE_NAME,
            StateCommand::RecordChange(Box::new(change)),
        );
    }

    pub async fn change_count_for(&self, view_id: &str) -> Result<u64, DiagnosticsError> {
        let view_id = view_id.to_string();
        request(&self.tx, SERVICE_NAME, |response_tx| {
            StateCommand::ChangeCountFor {
                view_id,
                response_tx,
            }
        })
        .await
    }

    pub async fn redundant_count_for(&self, view_id: &str) -> Result<u64, DiagnosticsError> {
        let view_id = view_id.to_string();
        request(&self.tx, SERVICE_NAME, |response_tx| {
            StateCommand::RedundantCountFor {
                view_id,
                response_tx,
            }
        })
        .await
    }

    pub async fn violations(&self) -> Result<Vec<StateViolation>, DiagnosticsError> {
        request(&self.tx, SERVICE_NAME, StateCommand::Violations).await
    }

    pub fn reset(&self) {
        send(&self.tx, SERVICE_NAME, StateCommand::Reset);
    }

    /// Reset, then scope store events to `session`.
    pub(crate) fn begin_session(&self, session: u64) {
        send(&self.tx, SERVICE_NAME, StateCommand::BeginSession(session));
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<StateCommand>> {
        self.tx.send(StateCommand::Shutdown)
    }
}

pub struct StateService {
    monitor: StateMonitor,
    store: Option<StoreHandle>,
    rx: mpsc::UnboundedReceiver<StateCommand>,
}

impl StateService {
    #[must_use]
    pub fn new(store: Option<StoreHandle>) -> (Self, StateHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            monitor: StateMonitor::new(),
            store,
            rx,
        };
        (service, StateHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("State monitor service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                StateCommand::RecordChange(change) => {
                    if let Some(violation) = self.monitor.record_change(*change) {
                        self.emit_violation(violation);
                    }
                }
                StateCommand::ChangeCountFor {
                    view_id,
                    response_tx,
                } => respond(
                    response_tx,
                    SERVICE_NAME,
                    self.monitor.change_count_for(&view_id),
                ),
                StateCommand::RedundantCountFor {
                    view_id,
                    response_tx,
                } => respond(
                    response_tx,
                    SERVICE_NAME,
                    self.monitor.redundant_count_for(&view_id),
                ),
                StateCommand::Violations(response_tx) => {
                    respond(response_tx, SERVICE_NAME, self.monitor.violations());
                }
                StateCommand::Reset => self.monitor.reset(),
                StateCommand::BeginSession(session) => {
                    self.monitor.reset();
                    self.store = self.store.as_ref().map(|store| store.scoped(session));
                }
                StateCommand::Shutdown => {
                    debug!("State monitor service shutting down");
                    break;
                }
            }
        }

        debug!("State monitor service stopped");
    }

    fn emit_violation(&self, violation: StateViolation) {
        let Some(store) = &self.store else {
            return;
        };
        let mut event = DiagnosticEvent::new(EventKind::StateViolation)
            .with_view_id(violation.view_id)
            .with_message(violation.message);
        if let Some(key) = violation.key {
            event = event.with_payload("key", key);
        }
        store.add(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_service::StoreService;

    fn change(old: Option<&str>, new: Option<&str>) -> StateChange {
        StateChange::new("form", true)
            .with_key("email")
            .with_values(old.map(str::to_string), new.map(str::to_string))
    }

    #[test]
    fn test_redundant_requires_key_and_equal_values() {
        let mut monitor = StateMonitor::new();

        monitor.record_change(change(Some("a"), Some("a")));
        assert_eq!(monitor.redundant_count_for("form"), 1);

        monitor.record_change(change(Some("a"), Some("b")));
        assert_eq!(monitor.redundant_count_for("form"), 1);

        // equal but absent values are not redundant
        monitor.record_change(change(None, None));
        assert_eq!(monitor.redundant_count_for("form"), 1);

        // no key
        monitor.record_change(
            StateChange::new("form", true)
                .with_values(Some("a".to_string()), Some("a".to_string())),
        );
        assert_eq!(monitor.redundant_count_for("form"), 1);

        assert_eq!(monitor.change_count_for("form"), 4);
    }

    #[test]
    fn test_last_value_key_tracks_latest_write() {
        let mut monitor = StateMonitor::new();
        monitor.record_change(change(Some("a"), Some("b")));
        assert_eq!(monitor.last_value_key_for("form"), Some("email"));

        monitor.record_change(StateChange::new("form", true));
        assert_eq!(monitor.last_value_key_for("form"), None);
    }

    #[test]
    fn test_off_main_context_records_violation() {
        let mut monitor = StateMonitor::new();
        assert!(monitor.record_change(change(None, Some("x"))).is_none());

        let violation = monitor
            .record_change(StateChange::new("form", false).with_key("email"))
            .expect("off-main-context write should be reported");
        assert_eq!(violation.view_id, "form");
        assert_eq!(violation.key.as_deref(), Some("email"));
        assert!(!violation.on_main_context);
        assert_eq!(monitor.violations(), vec![violation]);
    }

    #[test]
    fn test_violations_are_bounded() {
        let mut monitor = StateMonitor::new();
        for i in 0..250 {
            monitor.record_change(StateChange::new(format!("view-{i}"), false));
        }
        let violations = monitor.violations();
        assert_eq!(violations.len(), MAX_VIOLATIONS);
        assert_eq!(violations[0].view_id, "view-50");
        assert_eq!(violations[MAX_VIOLATIONS - 1].view_id, "view-249");
    }

    #[test]
    fn test_reset_and_unknown_ids() {
        let mut monitor = StateMonitor::new();
        monitor.record_change(StateChange::new("form", false));
        monitor.reset();
        assert_eq!(monitor.change_count_for("form"), 0);
        assert_eq!(monitor.redundant_count_for("form"), 0);
        assert!(monitor.violations().is_empty());
    }

    #[tokio::test]
    async fn test_service_emits_violation_events() {
        let (store_service, store) = StoreService::new(1_000);
        tokio::spawn(store_service.run());
        let (service, handle) = StateService::new(Some(store.clone()));
        tokio::spawn(service.run());

        handle.record_change(change(Some("a"), Some("a")));
        handle.record_change(StateChange::new("form", false).with_key("email"));

        assert_eq!(handle.change_count_for("form").await.unwrap(), 2);
        assert_eq!(handle.redundant_count_for("form").await.unwrap(), 1);
        assert_eq!(handle.violations().await.unwrap().len(), 1);

        let events = store.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::StateViolation);
        assert_eq!(events[0].view_id(), Some("form"));
        assert_eq!(events[0].payload_value("key"), Some("email"));

        handle.reset();
        assert!(handle.violations().await.unwrap().is_empty());
        handle.shutdown().expect("Failed to shutdown");
    }
}
