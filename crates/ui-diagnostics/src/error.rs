// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by service handles and configuration parsing.
///
/// The public instrumentation surface never returns these; it logs and falls
/// back to empty or zero results instead.
#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} service is not running")]
    ServiceUnavailable(&'static str),

    #[error("{0} service dropped the response")]
    ResponseDropped(&'static str),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = DiagnosticsError::InvalidConfig("threshold must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: threshold must be positive"
        );

        let error = DiagnosticsError::ServiceUnavailable("metrics store");
        assert_eq!(error.to_string(), "metrics store service is not running");
    }

    #[test]
    fn test_serde_error_converts() {
        let parse_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = DiagnosticsError::from(parse_error);
        assert!(matches!(error, DiagnosticsError::Serialization(_)));
    }
}
