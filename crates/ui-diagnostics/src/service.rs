// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for the actor services.
//!
//! Every tracker and the metrics store run as a single task that owns its
//! state and drains an unbounded command channel. Writes are fire-and-forget;
//! queries carry a oneshot responder.

use crate::error::DiagnosticsError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Send a command without waiting for it to be processed.
pub(crate) fn send<C>(tx: &mpsc::UnboundedSender<C>, service: &'static str, command: C) {
    if tx.send(command).is_err() {
        debug!("{service} service is not running, dropping command");
    }
}

/// Send a query and wait for the service to answer it.
pub(crate) async fn request<C, T>(
    tx: &mpsc::UnboundedSender<C>,
    service: &'static str,
    build: impl FnOnce(oneshot::Sender<T>) -> C,
) -> Result<T, DiagnosticsError> {
    let (response_tx, response_rx) = oneshot::channel();
    tx.send(build(response_tx))
        .map_err(|_| DiagnosticsError::ServiceUnavailable(service))?;

    response_rx
        .await
        .map_err(|_| DiagnosticsError::ResponseDropped(service))
}

/// Send a query and block the calling thread until the service answers.
///
/// Must not be called from inside an async task: the answer may be queued
/// behind work scheduled on the very thread that is blocked. tokio panics if
/// this is attempted from within a runtime context.
pub(crate) fn request_blocking<C, T>(
    tx: &mpsc::UnboundedSender<C>,
    service: &'static str,
    build: impl FnOnce(oneshot::Sender<T>) -> C,
) -> Result<T, DiagnosticsError> {
    let (response_tx, response_rx) = oneshot::channel();
    tx.send(build(response_tx))
        .map_err(|_| DiagnosticsError::ServiceUnavailable(service))?;

    response_rx
        .blocking_recv()
        .map_err(|_| DiagnosticsError::ResponseDropped(service))
}

/// Answer a query, logging if the requester went away.
pub(crate) fn respond<T>(response_tx: oneshot::Sender<T>, service: &'static str, value: T) {
    if response_tx.send(value).is_err() {
        error!("Failed to send {service} response - receiver dropped");
    }
}
