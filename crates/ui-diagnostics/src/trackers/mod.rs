// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The five trackers. Each owns its state inside a single service task and is
//! driven through a cloneable handle.

pub mod concurrency;
pub mod layout;
pub mod leak;
pub mod redraw;
pub mod state;

pub use concurrency::{ConcurrencyHandle, ConcurrencyService, ConcurrencyTracker, LongRunningTask};
pub use layout::{LayoutAnalyzer, LayoutHandle, LayoutService, LayoutSize, LayoutWarning};
pub use leak::{LeakHandle, LeakService, MemoryLeakDetector, ObjectId, SuspectedLeak};
pub use redraw::{BreachCallback, RedrawCause, RedrawHandle, RedrawService, RedrawTracker};
pub use state::{StateChange, StateHandle, StateMonitor, StateService, StateViolation};
