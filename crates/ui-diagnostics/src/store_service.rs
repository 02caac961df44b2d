// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor wrapper around [`MetricsStore`].
//!
//! ```text
//!    trackers / sampler / runtime
//!           │ StoreCommand (unbounded, fire-and-forget)
//!           v
//!    ┌──────────────┐
//!    │ StoreService │ owns MetricsStore, one command at a time
//!    └──────────────┘
//! ```
//!
//! Producers owned by the engine hold a handle scoped to a session. When a
//! new session begins the store is emptied, and events still in flight from
//! an older session are discarded on arrival.

use crate::error::DiagnosticsError;
use crate::event::DiagnosticEvent;
use crate::service::{request, request_blocking, respond, send};
use crate::store::MetricsStore;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

const SERVICE_NAME: &str = "metrics store";

#[derive(Debug)]
pub enum StoreCommand {
    Add {
        event: Box<DiagnosticEvent>,
        session: Option<u64>,
    },
    Configure(usize),
    SetLogToConsole(bool),
    Clear,
    BeginSession(u64),
    ExportJson(oneshot::Sender<Vec<u8>>),
    RecentEvents {
        limit: usize,
        response_tx: oneshot::Sender<Vec<DiagnosticEvent>>,
    },
    Len(oneshot::Sender<usize>),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
    session: Option<u64>,
}

impl StoreHandle {
    /// Append `event`. Events from a scoped handle are dropped by the store
    /// once a later session has begun.
    pub fn add(&self, event: DiagnosticEvent) {
        send(
            &self.tx,
            SERVICE_NAME,
            StoreCommand::Add {
                event: Box::new(event),
                session: self.session,
            },
        );
    }

    /// A handle whose events belong to `session`.
    pub(crate) fn scoped(&self, session: u64) -> Self {
        Self {
            tx: self.tx.clone(),
            session: Some(session),
        }
    }

    /// Empty the store and reject events from sessions before `session`.
    pub(crate) fn begin_session(&self, session: u64) {
        send(&self.tx, SERVICE_NAME, StoreCommand::BeginSession(session));
    }

    /// Set the capacity; values below the floor are clamped.
    pub fn configure(&self, max_events: usize) {
        send(&self.tx, SERVICE_NAME, StoreCommand::Configure(max_events));
    }

    pub fn set_log_to_console(&self, enabled: bool) {
        send(&self.tx, SERVICE_NAME, StoreCommand::SetLogToConsole(enabled));
    }

    pub fn clear(&self) {
        send(&self.tx, SERVICE_NAME, StoreCommand::Clear);
    }

    pub async fn export_json(&self) -> Result<Vec<u8>, DiagnosticsError> {
        request(&self.tx, SERVICE_NAME, StoreCommand::ExportJson).await
    }

    /// Blocking variant of [`StoreHandle::export_json`].
    ///
    /// Blocks the calling thread until the store has serialized its events.
    /// Never call this from inside an async task.
    pub fn export_json_blocking(&self) -> Result<Vec<u8>, DiagnosticsError> {
        request_blocking(&self.tx, SERVICE_NAME, StoreCommand::ExportJson)
    }

    pub async fn recent_events(&self, limit: usize) -> Result<Vec<DiagnosticEvent>, DiagnosticsError> {
        request(&self.tx, SERVICE_NAME, |response_tx| StoreCommand::RecentEvents {
            limit,
            response_tx,
        })
        .await
    }

    pub async fn len(&self) -> Result<usize, DiagnosticsError> {
        request(&self.tx, SERVICE_NAME, StoreCommand::Len).await
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<StoreCommand>> {
        self.tx.send(StoreCommand::Shutdown)
    }
}

pub struct StoreService {
    store: MetricsStore,
    session: u64,
    rx: mpsc::UnboundedReceiver<StoreCommand>,
}

impl StoreService {
    #[must_use]
    pub fn new(max_events: usize) -> (Self, StoreHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            store: MetricsStore::new(max_events),
            session: 0,
            rx,
        };
        (service, StoreHandle { tx, session: None })
    }

    pub async fn run(mut self) {
        debug!("Metrics store service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                StoreCommand::Add { event, session } => match session {
                    Some(session) if session < self.session => {}
                    _ => self.store.add(*event),
                },
                StoreCommand::Configure(max_events) => self.store.configure(max_events),
                StoreCommand::SetLogToConsole(enabled) => self.store.set_log_to_console(enabled),
                StoreCommand::Clear => self.store.clear(),
                StoreCommand::BeginSession(session) => {
                    self.store.clear();
                    self.session = self.session.max(session);
                }
                StoreCommand::ExportJson(response_tx) => {
                    let payload = self.store.export_json().unwrap_or_else(|e| {
                        error!("Failed to serialize diagnostic events: {e}");
                        Vec::new()
                    });
                    respond(response_tx, SERVICE_NAME, payload);
                }
                StoreCommand::RecentEvents { limit, response_tx } => {
                    respond(response_tx, SERVICE_NAME, self.store.recent_events(limit));
                }
                StoreCommand::Len(response_tx) => {
                    respond(response_tx, SERVICE_NAME, self.store.len());
                }
                StoreCommand::Shutdown => {
                    debug!("Metrics store service shutting down");
                    break;
                }
            }
        }

        debug!("Metrics store service stopped");
    }
}
