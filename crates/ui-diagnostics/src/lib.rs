// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # UI Diagnostics
//!
//! A concurrent diagnostics aggregation engine for UI runtimes. Instrumentation
//! hooks report renders, layout passes, state writes, object lifetimes and
//! background work; the engine aggregates them and exports a JSON report.
//!
//! ## Architecture
//!
//! - [`runtime`]: the [`Diagnostics`] lifecycle controller
//! - [`trackers`]: one isolated service task per subsystem
//! - [`store`] / [`store_service`]: the bounded event store and its service
//! - [`sampler`]: periodic memory sampling and leak/task sweeps
//! - [`config`]: [`Configuration`] defaults, presets and environment overrides
//!
//! ```no_run
//! use ui_diagnostics::{Configuration, Diagnostics, RedrawCause};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = tokio::runtime::Runtime::new()?;
//! let diagnostics = Diagnostics::new(runtime.handle());
//! diagnostics.start(Configuration::default());
//! diagnostics.record_invocation("list-row", RedrawCause::StateChange, None);
//! let report = diagnostics.export_metrics();
//! # let _ = report;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]

mod bounded;
pub mod config;
pub mod error;
pub mod event;
mod instrument;
pub mod logger;
pub mod proc;
pub mod runtime;
pub mod sampler;
mod service;
pub mod store;
pub mod store_service;
pub mod trackers;

pub use config::Configuration;
pub use error::DiagnosticsError;
pub use event::{DiagnosticEvent, EventKind};
pub use runtime::Diagnostics;
pub use store::MetricsStore;
pub use store_service::{StoreHandle, StoreService};
pub use trackers::{
    BreachCallback, LayoutSize, LayoutWarning, LongRunningTask, ObjectId, RedrawCause,
    StateChange, StateViolation, SuspectedLeak,
};
