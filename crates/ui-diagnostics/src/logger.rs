// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log forwarding for diagnostic events.
//!
//! Every event accepted by the metrics store is mirrored to `tracing` at
//! `DEBUG` level with a `[UIDiagnostics][Category]` prefix so it can be
//! filtered out of application logs:
//!
//! ```text
//! [UIDiagnostics][Layout] Oscillating layout view=sidebar
//! [UIDiagnostics][Performance] Memory
//! ```
//!
//! Forwarding is best-effort; nothing here can fail the caller.

use crate::event::{DiagnosticEvent, EventKind};
use std::fmt;
use tracing::debug;

pub const LOG_PREFIX: &str = "[UIDiagnostics]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Redraw,
    Layout,
    Memory,
    State,
    Concurrency,
    Performance,
    General,
}

impl Category {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Redraw => "Redraw",
            Category::Layout => "Layout",
            Category::Memory => "Memory",
            Category::State => "State",
            Category::Concurrency => "Concurrency",
            Category::Performance => "Performance",
            Category::General => "General",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EventKind> for Category {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::RedrawBreach => Category::Redraw,
            EventKind::LayoutWarning => Category::Layout,
            EventKind::SuspectedLeak => Category::Memory,
            EventKind::StateViolation => Category::State,
            EventKind::ConcurrencyWarning => Category::Concurrency,
            EventKind::PerformanceSample => Category::Performance,
        }
    }
}

pub fn log(message: &str, category: Category) {
    debug!(category = category.as_str(), "{LOG_PREFIX}[{category}] {message}");
}

/// Render the one-line summary used for an event.
#[must_use]
pub fn format_event(event: &DiagnosticEvent) -> String {
    let message = event.message().unwrap_or(event.kind().as_str());
    match event.view_id() {
        Some(view_id) => format!("{message} view={view_id}"),
        None => message.to_string(),
    }
}

pub fn log_event(event: &DiagnosticEvent) {
    log(&format_event(event), Category::from(event.kind()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_format_event_uses_message_and_view() {
        let event = DiagnosticEvent::new(EventKind::LayoutWarning)
            .with_view_id("sidebar")
            .with_message("Oscillating layout");
        assert_eq!(format_event(&event), "Oscillating layout view=sidebar");
    }

    #[test]
    fn test_format_event_falls_back_to_kind() {
        let event = DiagnosticEvent::new(EventKind::SuspectedLeak);
        assert_eq!(format_event(&event), "suspectedLeak");
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(Category::from(EventKind::RedrawBreach), Category::Redraw);
        assert_eq!(Category::from(EventKind::SuspectedLeak), Category::Memory);
        assert_eq!(
            Category::from(EventKind::PerformanceSample),
            Category::Performance
        );
    }

    #[test]
    #[traced_test]
    fn test_log_event_writes_prefixed_line() {
        let event = DiagnosticEvent::new(EventKind::StateViolation)
            .with_view_id("counter")
            .with_message("State change off main context");
        log_event(&event);
        assert!(logs_contain(
            "[UIDiagnostics][State] State change off main context view=counter"
        ));
    }
}
