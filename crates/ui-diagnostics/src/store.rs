// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, append-only event store.
//!
//! # Memory Management
//!
//! The store keeps at most `max_events` events (never fewer than
//! [`MIN_STORED_EVENTS`]). When an insert or a capacity change pushes it over
//! the limit, the oldest excess is removed in a single drain.
//!
//! # Output Format
//!
//! [`MetricsStore::export_json`] produces a pretty-printed JSON array with
//! sorted keys and second-precision UTC timestamps:
//!
//! ```json
//! [
//!   {
//!     "kind": "redrawBreach",
//!     "message": "Redraws/sec: 61 >= 60",
//!     "payload": { "rps": "61" },
//!     "timestamp": "2024-03-09T14:05:07Z",
//!     "viewId": "list-row"
//!   }
//! ]
//! ```

use crate::bounded::BoundedBuffer;
use crate::config::{DEFAULT_MAX_STORED_EVENTS, MIN_STORED_EVENTS};
use crate::error::DiagnosticsError;
use crate::event::DiagnosticEvent;
use crate::logger;

#[derive(Debug, Clone)]
pub struct MetricsStore {
    events: BoundedBuffer<DiagnosticEvent>,
    log_to_console: bool,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STORED_EVENTS)
    }
}

impl MetricsStore {
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: BoundedBuffer::new(max_events.max(MIN_STORED_EVENTS)),
            log_to_console: false,
        }
    }

    /// Set the capacity, clamped to [`MIN_STORED_EVENTS`].
    pub fn configure(&mut self, max_events: usize) {
        self.events.set_capacity(max_events.max(MIN_STORED_EVENTS));
    }

    pub fn set_log_to_console(&mut self, enabled: bool) {
        self.log_to_console = enabled;
    }

    #[must_use]
    pub fn max_events(&self) -> usize {
        self.events.capacity()
    }

    pub fn add(&mut self, event: DiagnosticEvent) {
        if self.log_to_console {
            logger::log_event(&event);
        }
        self.events.push(event);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Serialize every retained event. An empty store yields an empty payload.
    pub fn export_json(&self) -> Result<Vec<u8>, DiagnosticsError> {
        if self.events.is_empty() {
            return Ok(Vec::new());
        }
        let events: Vec<&DiagnosticEvent> = self.events.iter().collect();
        Ok(serde_json::to_vec_pretty(&events)?)
    }

    /// The most recent `limit` events in chronological order.
    #[must_use]
    pub fn recent_events(&self, limit: usize) -> Vec<DiagnosticEvent> {
        self.events.last_n(limit).cloned().collect()
    }
}
