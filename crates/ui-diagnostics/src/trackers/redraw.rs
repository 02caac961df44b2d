// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Render invocation counting and windowed rate detection.
//!
//! Each element keeps its last [`MAX_TIMESTAMPS`] invocation instants. The
//! rate is the number of those that fall inside the trailing
//! [`RATE_WINDOW`], recomputed on every write and every query.

use crate::bounded::BoundedBuffer;
use crate::config::DEFAULT_REDRAW_THRESHOLD_PER_SECOND;
use crate::error::DiagnosticsError;
use crate::event::{DiagnosticEvent, EventKind};
use crate::service::{request, respond, send};
use crate::store_service::StoreHandle;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub const MAX_TIMESTAMPS: usize = 120;
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

const SERVICE_NAME: &str = "redraw tracker";

/// Why an element was redrawn, as reported by the instrumentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RedrawCause {
    StateChange,
    EnvChange,
    BindingChange,
    IdentityChange,
    #[default]
    Unknown,
}

impl RedrawCause {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RedrawCause::StateChange => "stateChange",
            RedrawCause::EnvChange => "envChange",
            RedrawCause::BindingChange => "bindingChange",
            RedrawCause::IdentityChange => "identityChange",
            RedrawCause::Unknown => "unknown",
        }
    }
}

/// Callback fired with the element id whenever its redraw rate breaches the
/// threshold. Runs on the tracker's own task, so it must not block.
#[derive(Clone)]
pub struct BreachCallback(Arc<dyn Fn(&str) + Send + Sync>);

impl BreachCallback {
    pub fn new(callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    fn call(&self, view_id: &str) {
        (self.0)(view_id);
    }
}

impl fmt::Debug for BreachCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BreachCallback")
    }
}

#[derive(Debug, Clone)]
struct RedrawEntry {
    count: u64,
    timestamps: BoundedBuffer<Instant>,
    last_cause: Option<RedrawCause>,
    last_parent_id: Option<String>,
}

impl Default for RedrawEntry {
    fn default() -> Self {
        Self {
            count: 0,
            timestamps: BoundedBuffer::new(MAX_TIMESTAMPS),
            last_cause: None,
            last_parent_id: None,
        }
    }
}

/// A rate breach detected while recording an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RedrawBreach {
    pub view_id: String,
    pub rate: f64,
    pub threshold: u32,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RedrawTracker {
    entries: HashMap<String, RedrawEntry>,
    threshold: u32,
}

impl Default for RedrawTracker {
    fn default() -> Self {
        Self::new(DEFAULT_REDRAW_THRESHOLD_PER_SECOND)
    }
}

impl RedrawTracker {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            entries: HashMap::new(),
            threshold,
        }
    }

    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
    }

    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record one render of `view_id`; returns the breach if the resulting
    /// rate is at or above the threshold.
    pub fn record_invocation(
        &mut self,
        view_id: &str,
        cause: RedrawCause,
        parent_id: Option<&str>,
    ) -> Option<RedrawBreach> {
        self.record_invocation_at(view_id, cause, parent_id, Instant::now())
    }

    fn record_invocation_at(
        &mut self,
        view_id: &str,
        cause: RedrawCause,
        parent_id: Option<&str>,
        now: Instant,
    ) -> Option<RedrawBreach> {
        let entry = self.entries.entry(view_id.to_string()).or_default();
        entry.count += 1;
        entry.timestamps.push(now);
        entry.last_cause = Some(cause);
        entry.last_parent_id = parent_id.map(str::to_string);

        let rate = self.rate_for_at(view_id, now);
        if rate >= f64::from(self.threshold) {
            return Some(RedrawBreach {
                view_id: view_id.to_string(),
                rate,
                threshold: self.threshold,
                parent_id: parent_id.map(str::to_string),
            });
        }
        None
    }

    #[must_use]
    pub fn count_for(&self, view_id: &str) -> u64 {
        self.entries.get(view_id).map_or(0, |entry| entry.count)
    }

    /// Invocations per second over the trailing window ending now.
    #[must_use]
    pub fn rate_for(&self, view_id: &str) -> f64 {
        self.rate_for_at(view_id, Instant::now())
    }

    fn rate_for_at(&self, view_id: &str, now: Instant) -> f64 {
        let Some(entry) = self.entries.get(view_id) else {
            return 0.0;
        };
        let recent = match now.checked_sub(RATE_WINDOW) {
            // timestamps are non-decreasing, so scan from the newest end
            Some(cutoff) => entry
                .timestamps
                .iter()
                .rev()
                .take_while(|ts| **ts >= cutoff)
                .count(),
            None => entry.timestamps.len(),
        };
        recent as f64 / RATE_WINDOW.as_secs_f64()
    }

    #[must_use]
    pub fn last_cause_for(&self, view_id: &str) -> Option<RedrawCause> {
        self.entries.get(view_id).and_then(|entry| entry.last_cause)
    }

    #[must_use]
    pub fn last_parent_for(&self, view_id: &str) -> Option<&str> {
        self.entries
            .get(view_id)
            .and_then(|entry| entry.last_parent_id.as_deref())
    }

    /// Every tracked id, sorted.
    #[must_use]
    pub fn all_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug)]
pub enum RedrawCommand {
    RecordInvocation {
        view_id: String,
        cause: RedrawCause,
        parent_id: Option<String>,
    },
    SetThreshold(u32),
    SetOnThresholdBreach(Option<BreachCallback>),
    CountFor {
        view_id: String,
        response_tx: oneshot::Sender<u64>,
    },
    RateFor {
        view_id: String,
        response_tx: oneshot::Sender<f64>,
    },
    LastCauseFor {
        view_id: String,
        response_tx: oneshot::Sender<Option<RedrawCause>>,
    },
    AllIds(oneshot::Sender<Vec<String>>),
    Reset,
    BeginSession(u64),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct RedrawHandle {
    tx: mpsc::UnboundedSender<RedrawCommand>,
}

impl RedrawHandle {
    pub fn record_invocation(&self, view_id: &str, cause: RedrawCause, parent_id: Option<&str>) {
        send(
            &self.tx,
            SERVICE_NAME,
            RedrawCommand::RecordInvocation {
                view_id: view_id.to_string(),
                cause,
                parent_id: parent_id.map(str::to_string),
            },
        );
    }

    pub fn set_threshold(&self, threshold: u32) {
        send(&self.tx, SERVICE_NAME, RedrawCommand::SetThreshold(threshold));
    }

    pub fn set_on_threshold_breach(&self, callback: Option<BreachCallback>) {
        send(
            &self.tx,
            SERVICE_NAME,
            RedrawCommand::SetOnThresholdBreach(callback),
        );
    }

    pub async fn count_for(&self, view_id: &str) -> Result<u64, DiagnosticsError> {
        let view_id = view_id.to_string();
        request(&self.tx, SERVICE_NAME, |response_tx| RedrawCommand::CountFor {
            view_id,
            response_tx,
        })
        .await
    }

    pub async fn rate_for(&self, view_id: &str) -> Result<f64, DiagnosticsError> {
        let view_id = view_id.to_string();
        request(&self.tx, SERVICE_NAME, |response_tx| RedrawCommand::RateFor {
            view_id,
            response_tx,
        })
        .await
    }

    pub async fn last_cause_for(
        &self,
        view_id: &str,
    ) -> Result<Option<RedrawCause>, DiagnosticsError> {
        let view_id = view_id.to_string();
        request(&self.tx, SERVICE_NAME, |response_tx| {
            RedrawCommand::LastCauseFor {
                view_id,
                response_tx,
            }
        })
        .await
    }

    pub async fn all_ids(&self) -> Result<Vec<String>, DiagnosticsError> {
        request(&self.tx, SERVICE_NAME, RedrawCommand::AllIds).await
    }

    pub fn reset(&self) {
        send(&self.tx, SERVICE_NAME, RedrawCommand::Reset);
    }

    /// Reset, then scope store events to `session`.
    pub(crate) fn begin_session(&self, session: u64) {
        send(&self.tx, SERVICE_NAME, RedrawCommand::BeginSession(session));
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<RedrawCommand>> {
        self.tx.send(RedrawCommand::Shutdown)
    }
}

pub struct RedrawService {
    tracker: RedrawTracker,
    on_breach: Option<BreachCallback>,
    store: Option<StoreHandle>,
    rx: mpsc::UnboundedReceiver<RedrawCommand>,
}

impl RedrawService {
    /// Breaches are forwarded to `store` when one is given.
    #[must_use]
    pub fn new(threshold: u32, store: Option<StoreHandle>) -> (Self, RedrawHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            tracker: RedrawTracker::new(threshold),
            on_breach: None,
            store,
            rx,
        };
        (service, RedrawHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Redraw tracker service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                RedrawCommand::RecordInvocation {
                    view_id,
                    cause,
                    parent_id,
                } => {
                    if let Some(breach) =
                        self.tracker
                            .record_invocation(&view_id, cause, parent_id.as_deref())
                    {
                        self.report_breach(&breach);
                    }
                }
                RedrawCommand::SetThreshold(threshold) => self.tracker.set_threshold(threshold),
                RedrawCommand::SetOnThresholdBreach(callback) => self.on_breach = callback,
                RedrawCommand::CountFor {
                    view_id,
                    response_tx,
                } => respond(response_tx, SERVICE_NAME, self.tracker.count_for(&view_id)),
                RedrawCommand::RateFor {
                    view_id,
                    response_tx,
                } => respond(response_tx, SERVICE_NAME, self.tracker.rate_for(&view_id)),
                RedrawCommand::LastCauseFor {
                    view_id,
                    response_tx,
                } => respond(
                    response_tx,
                    SERVICE_NAME,
                    self.tracker.last_cause_for(&view_id),
                ),
                RedrawCommand::AllIds(response_tx) => {
                    respond(response_tx, SERVICE_NAME, self.tracker.all_ids());
                }
                RedrawCommand::Reset => self.tracker.reset(),
                RedrawCommand::BeginSession(session) => {
                    self.tracker.reset();
                    self.store = self.store.as_ref().map(|store| store.scoped(session));
                }
                RedrawCommand::Shutdown => {
                    debug!("Redraw tracker service shutting down");
                    break;
                }
            }
        }

        debug!("Redraw tracker service stopped");
    }

    fn report_breach(&self, breach: &RedrawBreach) {
        if let Some(callback) = &self.on_breach {
            callback.call(&breach.view_id);
        }
        if let Some(store) = &self.store {
            let mut event = DiagnosticEvent::new(EventKind::RedrawBreach)
                .with_view_id(breach.view_id.clone())
                .with_message(format!(
                    "Redraws/sec: {} >= {}",
                    breach.rate, breach.threshold
                ))
                .with_payload("rps", breach.rate.to_string());
            if let Some(parent_id) = &breach.parent_id {
                event = event.with_payload("parentId", parent_id.clone());
            }
            store.add(event);
        }
    }
}
