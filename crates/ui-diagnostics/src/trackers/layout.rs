// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Layout pass counting and size oscillation detection.

use crate::bounded::BoundedBuffer;
use crate::config::DEFAULT_LAYOUT_LOOP_THRESHOLD;
use crate::error::DiagnosticsError;
use crate::event::{DiagnosticEvent, EventKind};
use crate::service::{request, respond, send};
use crate::store_service::StoreHandle;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub const MAX_SIZES: usize = 10;

/// Maximum per-dimension difference for two sizes to count as a repeat.
pub const OSCILLATION_TOLERANCE: f64 = 0.1;

const SERVICE_NAME: &str = "layout analyzer";

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LayoutSize {
    pub width: f64,
    pub height: f64,
}

impl LayoutSize {
    #[must_use]
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    fn repeats(&self, other: &LayoutSize) -> bool {
        (self.width - other.width).abs() < OSCILLATION_TOLERANCE
            && (self.height - other.height).abs() < OSCILLATION_TOLERANCE
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutWarning {
    pub view_id: String,
    pub pass_count: u64,
    pub is_oscillating: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
struct LayoutEntry {
    pass_count: u64,
    sizes: BoundedBuffer<LayoutSize>,
    last_pass_time: Option<Instant>,
}

impl Default for LayoutEntry {
    fn default() -> Self {
        Self {
            pass_count: 0,
            sizes: BoundedBuffer::new(MAX_SIZES),
            last_pass_time: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayoutAnalyzer {
    entries: HashMap<String, LayoutEntry>,
    loop_threshold: u32,
}

impl Default for LayoutAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_LAYOUT_LOOP_THRESHOLD)
    }
}

impl LayoutAnalyzer {
    #[must_use]
    pub fn new(loop_threshold: u32) -> Self {
        Self {
            entries: HashMap::new(),
            loop_threshold,
        }
    }

    pub fn set_loop_threshold(&mut self, loop_threshold: u32) {
        self.loop_threshold = loop_threshold;
    }

    pub fn record_pass(&mut self, view_id: &str, size: LayoutSize) {
        let entry = self.entries.entry(view_id.to_string()).or_default();
        entry.pass_count += 1;
        entry.last_pass_time = Some(Instant::now());
        entry.sizes.push(size);
    }

    #[must_use]
    pub fn pass_count(&self, view_id: &str) -> u64 {
        self.entries.get(view_id).map_or(0, |entry| entry.pass_count)
    }

    #[must_use]
    pub fn last_pass_time(&self, view_id: &str) -> Option<Instant> {
        self.entries.get(view_id).and_then(|entry| entry.last_pass_time)
    }

    /// True when the last four sizes alternate A, B, A, B within
    /// [`OSCILLATION_TOLERANCE`]. A and B may be equal.
    #[must_use]
    pub fn detect_oscillation(&self, view_id: &str) -> bool {
        let Some(entry) = self.entries.get(view_id) else {
            return false;
        };
        let last: Vec<&LayoutSize> = entry.sizes.last_n(4).collect();
        match last.as_slice() {
            [a, b, a2, b2] => a.repeats(a2) && b.repeats(b2),
            _ => false,
        }
    }

    #[must_use]
    pub fn warnings_for(&self, view_id: &str) -> Vec<LayoutWarning> {
        let Some(entry) = self.entries.get(view_id) else {
            return Vec::new();
        };
        let mut warnings = Vec::new();
        if entry.pass_count >= u64::from(self.loop_threshold) {
            warnings.push(LayoutWarning {
                view_id: view_id.to_string(),
                pass_count: entry.pass_count,
                is_oscillating: false,
                message: format!("High layout pass count: {}", entry.pass_count),
            });
        }
        if self.detect_oscillation(view_id) {
            warnings.push(LayoutWarning {
                view_id: view_id.to_string(),
                pass_count: entry.pass_count,
                is_oscillating: true,
                message: "Oscillating layout".to_string(),
            });
        }
        warnings
    }

    /// Warnings for every tracked element, ordered by element id.
    #[must_use]
    pub fn all_warnings(&self) -> Vec<LayoutWarning> {
        let mut ids: Vec<&String> = self.entries.keys().collect();
        ids.sort_unstable();
        ids.into_iter()
            .flat_map(|id| self.warnings_for(id))
            .collect()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug)]
pub enum LayoutCommand {
    RecordPass { view_id: String, size: LayoutSize },
    SetLoopThreshold(u32),
    PassCount {
        view_id: String,
        response_tx: oneshot::Sender<u64>,
    },
    DetectOscillation {
        view_id: String,
        response_tx: oneshot::Sender<bool>,
    },
    WarningsFor {
        view_id: String,
        response_tx: oneshot::Sender<Vec<LayoutWarning>>,
    },
    AllWarnings(oneshot::Sender<Vec<LayoutWarning>>),
    Reset,
    BeginSession(u64),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct LayoutHandle {
    tx: mpsc::UnboundedSender<LayoutCommand>,
}

impl LayoutHandle {
    pub fn record_pass(&self, view_id: &str, size: LayoutSize) {
        send(
            &self.tx,
            SERVICE_NAME,
            LayoutCommand::RecordPass {
                view_id: view_id.to_string(),
                size,
            },
        );
    }

    pub fn set_loop_threshold(&self, loop_threshold: u32) {
        send(
            &self.tx,
            SERVICE_NAME,
            LayoutCommand::SetLoopThreshold(loop_threshold),
        );
    }

    pub async fn pass_count(&self, view_id: &str) -> Result<u64, DiagnosticsError> {
        let view_id = view_id.to_string();
        request(&self.tx, SERVICE_NAME, |response_tx| LayoutCommand::PassCount {
            view_id,
            response_tx,
        })
        .await
    }

    pub async fn detect_oscillation(&self, view_id: &str) -> Result<bool, DiagnosticsError> {
        let view_id = view_id.to_string();
        request(&self.tx, SERVICE_NAME, |response_tx| {
            LayoutCommand::DetectOscillation {
                view_id,
                response_tx,
            }
        })
        .await
    }

    pub async fn warnings_for(&self, view_id: &str) -> Result<Vec<LayoutWarning>, DiagnosticsError> {
        let view_id = view_id.to_string();
        request(&self.tx, SERVICE_NAME, |response_tx| {
            LayoutCommand::WarningsFor {
                view_id,
                response_tx,
            }
        })
        .await
    }

    pub async fn all_warnings(&self) -> Result<Vec<LayoutWarning>, DiagnosticsError> {
        request(&self.tx, SERVICE_NAME, LayoutCommand::AllWarnings).await
    }

    pub fn reset(&self) {
        send(&self.tx, SERVICE_NAME, LayoutCommand::Reset);
    }

    /// Reset, then scope store events to `session`.
    pub(crate) fn begin_session(&self, session: u64) {
        send(&self.tx, SERVICE_NAME, LayoutCommand::BeginSession(session));
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<LayoutCommand>> {
        self.tx.send(LayoutCommand::Shutdown)
    }
}

pub struct LayoutService {
    analyzer: LayoutAnalyzer,
    store: Option<StoreHandle>,
    rx: mpsc::UnboundedReceiver<LayoutCommand>,
}

impl LayoutService {
    #[must_use]
    pub fn new(loop_threshold: u32, store: Option<StoreHandle>) -> (Self, LayoutHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            analyzer: LayoutAnalyzer::new(loop_threshold),
            store,
            rx,
        };
        (service, LayoutHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Layout analyzer service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                LayoutCommand::RecordPass { view_id, size } => {
                    let before = self.analyzer.warnings_for(&view_id);
                    self.analyzer.record_pass(&view_id, size);
                    self.emit_new_warnings(&view_id, &before);
                }
                LayoutCommand::SetLoopThreshold(loop_threshold) => {
                    self.analyzer.set_loop_threshold(loop_threshold);
                }
                LayoutCommand::PassCount {
                    view_id,
                    response_tx,
                } => respond(response_tx, SERVICE_NAME, self.analyzer.pass_count(&view_id)),
                LayoutCommand::DetectOscillation {
                    view_id,
                    response_tx,
                } => respond(
                    response_tx,
                    SERVICE_NAME,
                    self.analyzer.detect_oscillation(&view_id),
                ),
                LayoutCommand::WarningsFor {
                    view_id,
                    response_tx,
                } => respond(
                    response_tx,
                    SERVICE_NAME,
                    self.analyzer.warnings_for(&view_id),
                ),
                LayoutCommand::AllWarnings(response_tx) => {
                    respond(response_tx, SERVICE_NAME, self.analyzer.all_warnings());
                }
                LayoutCommand::Reset => self.analyzer.reset(),
                LayoutCommand::BeginSession(session) => {
                    self.analyzer.reset();
                    self.store = self.store.as_ref().map(|store| store.scoped(session));
                }
                LayoutCommand::Shutdown => {
                    debug!("Layout analyzer service shutting down");
                    break;
                }
            }
        }

        debug!("Layout analyzer service stopped");
    }

    /// Emit the warnings that apply after this pass but did not before it.
    fn emit_new_warnings(&self, view_id: &str, before: &[LayoutWarning]) {
        let Some(store) = &self.store else {
            return;
        };
        let new_warnings = self
            .analyzer
            .warnings_for(view_id)
            .into_iter()
            .filter(|warning| {
                !before
                    .iter()
                    .any(|previous| previous.is_oscillating == warning.is_oscillating)
            });
        for warning in new_warnings {
            store.add(
                DiagnosticEvent::new(EventKind::LayoutWarning)
                    .with_view_id(warning.view_id)
                    .with_message(warning.message),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_service::StoreService;

    const A: LayoutSize = LayoutSize {
        width: 100.0,
        height: 40.0,
    };
    const B: LayoutSize = LayoutSize {
        width: 120.0,
        height: 44.0,
    };

    #[test]
    fn test_pass_count_and_time() {
        let mut analyzer = LayoutAnalyzer::default();
        assert_eq!(analyzer.pass_count("card"), 0);
        assert!(analyzer.last_pass_time("card").is_none());

        analyzer.record_pass("card", A);
        analyzer.record_pass("card", B);
        assert_eq!(analyzer.pass_count("card"), 2);
        assert!(analyzer.last_pass_time("card").is_some());
    }

    #[test]
    fn test_sizes_are_bounded() {
        let mut analyzer = LayoutAnalyzer::default();
        for i in 0..25 {
            analyzer.record_pass("card", LayoutSize::new(f64::from(i), 1.0));
        }
        let sizes = &analyzer.entries["card"].sizes;
        assert_eq!(sizes.len(), MAX_SIZES);
        assert_eq!(sizes.iter().next(), Some(&LayoutSize::new(15.0, 1.0)));
    }

    #[test]
    fn test_oscillation_detected_for_abab() {
        let mut analyzer = LayoutAnalyzer::default();
        for size in [A, B, A, B] {
            analyzer.record_pass("card", size);
        }
        assert!(analyzer.detect_oscillation("card"));
    }

    #[test]
    fn test_oscillation_within_tolerance() {
        let mut analyzer = LayoutAnalyzer::default();
        analyzer.record_pass("card", A);
        analyzer.record_pass("card", B);
        analyzer.record_pass("card", LayoutSize::new(100.05, 40.05));
        analyzer.record_pass("card", LayoutSize::new(119.95, 43.95));
        assert!(analyzer.detect_oscillation("card"));

        analyzer.record_pass("card", LayoutSize::new(100.5, 40.0));
        analyzer.record_pass("card", B);
        // last four: (100.05, 40.05), B', (100.5, 40), B
        assert!(!analyzer.detect_oscillation("card"));
    }

    #[test]
    fn test_stable_size_counts_as_oscillation() {
        let mut analyzer = LayoutAnalyzer::default();
        for _ in 0..4 {
            analyzer.record_pass("card", A);
        }
        assert!(analyzer.detect_oscillation("card"));
    }

    #[test]
    fn test_no_oscillation_with_fewer_than_four_sizes() {
        let mut analyzer = LayoutAnalyzer::default();
        for size in [A, B, A] {
            analyzer.record_pass("card", size);
        }
        assert!(!analyzer.detect_oscillation("card"));
        assert!(!analyzer.detect_oscillation("unknown"));
    }

    #[test]
    fn test_high_pass_warning_independent_of_oscillation() {
        let mut analyzer = LayoutAnalyzer::default();
        for i in 0..19 {
            analyzer.record_pass("list", LayoutSize::new(f64::from(i), f64::from(i)));
        }
        assert!(analyzer.warnings_for("list").is_empty());

        analyzer.record_pass("list", LayoutSize::new(50.0, 50.0));
        let warnings = analyzer.warnings_for("list");
        assert_eq!(warnings.len(), 1);
        assert!(!warnings[0].is_oscillating);
        assert_eq!(warnings[0].pass_count, 20);
        assert_eq!(warnings[0].message, "High layout pass count: 20");
    }

    #[test]
    fn test_both_warnings_can_appear() {
        let mut analyzer = LayoutAnalyzer::new(4);
        for size in [A, B, A, B] {
            analyzer.record_pass("card", size);
        }
        let warnings = analyzer.warnings_for("card");
        assert_eq!(warnings.len(), 2);
        assert!(!warnings[0].is_oscillating);
        assert!(warnings[1].is_oscillating);
        assert_eq!(warnings[1].message, "Oscillating layout");
    }

    #[test]
    fn test_all_warnings_sorted_and_reset() {
        let mut analyzer = LayoutAnalyzer::new(1);
        analyzer.record_pass("b", A);
        analyzer.record_pass("a", A);
        let ids: Vec<String> = analyzer
            .all_warnings()
            .into_iter()
            .map(|w| w.view_id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        analyzer.reset();
        assert!(analyzer.all_warnings().is_empty());
        assert_eq!(analyzer.pass_count("a"), 0);
    }

    #[tokio::test]
    async fn test_service_emits_warning_events() {
        let (store_service, store) = StoreService::new(1_000);
        tokio::spawn(store_service.run());
        let (service, handle) = LayoutService::new(3, Some(store.clone()));
        tokio::spawn(service.run());

        for size in [A, B, A] {
            handle.record_pass("card", size);
        }
        assert_eq!(handle.pass_count("card").await.unwrap(), 3);
        assert!(!handle.detect_oscillation("card").await.unwrap());
        assert_eq!(handle.warnings_for("card").await.unwrap().len(), 1);

        handle.record_pass("card", B);
        assert!(handle.detect_oscillation("card").await.unwrap());
        assert_eq!(handle.all_warnings().await.unwrap().len(), 2);

        // third pass: high count; fourth pass: oscillation starts
        let events = store.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.kind() == EventKind::LayoutWarning && e.view_id() == Some("card")));
        assert_eq!(events[0].message(), Some("High layout pass count: 3"));
        assert_eq!(events[1].message(), Some("Oscillating layout"));

        // a layout stuck in the loop does not add more events
        for size in [A, B, A, B, A, B] {
            handle.record_pass("card", size);
        }
        assert_eq!(handle.pass_count("card").await.unwrap(), 10);
        assert_eq!(handle.all_warnings().await.unwrap().len(), 2);
        assert_eq!(store.len().await.unwrap(), 2);

        handle.reset();
        assert_eq!(handle.pass_count("card").await.unwrap(), 0);
        handle.shutdown().expect("Failed to shutdown");
    }

    #[tokio::test]
    async fn test_service_loop_threshold_update() {
        let (service, handle) = LayoutService::new(20, None);
        tokio::spawn(service.run());

        handle.record_pass("card", A);
        assert!(handle.warnings_for("card").await.unwrap().is_empty());

        handle.set_loop_threshold(1);
        assert_eq!(handle.warnings_for("card").await.unwrap().len(), 1);
    }
}
