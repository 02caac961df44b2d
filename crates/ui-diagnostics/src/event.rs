// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The diagnostic event emitted by trackers and retained by the metrics store.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Fixed textual format used for every exported timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    RedrawBreach,
    LayoutWarning,
    SuspectedLeak,
    StateViolation,
    ConcurrencyWarning,
    PerformanceSample,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RedrawBreach => "redrawBreach",
            EventKind::LayoutWarning => "layoutWarning",
            EventKind::SuspectedLeak => "suspectedLeak",
            EventKind::StateViolation => "stateViolation",
            EventKind::ConcurrencyWarning => "concurrencyWarning",
            EventKind::PerformanceSample => "performanceSample",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single diagnostic observation.
///
/// The timestamp is taken at construction. Builder methods consume the event,
/// so once it has been handed to the store it can no longer change.
///
/// Fields are declared in lexical order so the serialized object has sorted
/// keys; the payload is a `BTreeMap` for the same reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticEvent {
    kind: EventKind,
    message: Option<String>,
    payload: Option<BTreeMap<String, String>>,
    #[serde(serialize_with = "serialize_timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "viewId")]
    view_id: Option<String>,
}

impl DiagnosticEvent {
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            message: None,
            payload: None,
            timestamp: Utc::now(),
            view_id: None,
        }
    }

    #[must_use]
    pub fn with_view_id(mut self, view_id: impl Into<String>) -> Self {
        self.view_id = Some(view_id.into());
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    #[must_use]
    pub fn view_id(&self) -> Option<&str> {
        self.view_id.as_deref()
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub fn payload(&self) -> Option<&BTreeMap<String, String>> {
        self.payload.as_ref()
    }

    #[must_use]
    pub fn payload_value(&self, key: &str) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get(key))
            .map(String::as_str)
    }
}

fn serialize_timestamp<S: Serializer>(
    timestamp: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&timestamp.format(TIMESTAMP_FORMAT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_builder_sets_fields() {
        let event = DiagnosticEvent::new(EventKind::RedrawBreach)
            .with_view_id("list-row")
            .with_message("Redraws/sec: 61 >= 60")
            .with_payload("rps", "61");

        assert_eq!(event.kind(), EventKind::RedrawBreach);
        assert_eq!(event.view_id(), Some("list-row"));
        assert_eq!(event.message(), Some("Redraws/sec: 61 >= 60"));
        assert_eq!(event.payload_value("rps"), Some("61"));
        assert_eq!(event.payload_value("missing"), None);
    }

    #[test]
    fn test_serializes_sorted_keys_and_nulls() {
        let mut event = DiagnosticEvent::new(EventKind::PerformanceSample)
            .with_payload("zeta", "1")
            .with_payload("alpha", "2");
        event.timestamp = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"performanceSample","message":null,"payload":{"alpha":"2","zeta":"1"},"timestamp":"2024-03-09T14:05:07Z","viewId":null}"#
        );
    }

    #[test]
    fn test_kind_names_match_serialized_form() {
        for kind in [
            EventKind::RedrawBreach,
            EventKind::LayoutWarning,
            EventKind::SuspectedLeak,
            EventKind::StateViolation,
            EventKind::ConcurrencyWarning,
            EventKind::PerformanceSample,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
