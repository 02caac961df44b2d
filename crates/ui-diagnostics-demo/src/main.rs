// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{env, io};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use ui_diagnostics::{
    BreachCallback, Configuration, Diagnostics, LayoutSize, RedrawCause, StateChange,
};

const DEFAULT_RUN_SECS: u64 = 11;

struct Screen {
    _rows: Vec<String>,
}

pub fn main() {
    let log_level = env::var("UI_DIAGNOSTICS_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Configuration::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    let run_for = env::var("UI_DIAGNOSTICS_DEMO_SECS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .map_or(Duration::from_secs(DEFAULT_RUN_SECS), Duration::from_secs);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Unable to start runtime: {e}");
            return;
        }
    };

    let diagnostics = Diagnostics::new(runtime.handle());
    diagnostics.on_redraw_threshold_breach(Some(BreachCallback::new(|view_id| {
        warn!("Redraw threshold breached by {view_id}");
    })));
    diagnostics.start(config);
    if !diagnostics.is_active() {
        warn!("Diagnostics not active in this build, set UI_DIAGNOSTICS_USE_IN_RELEASE=true");
        return;
    }

    simulate_workload(&diagnostics, &runtime, run_for);

    // plain thread: the blocking export must not run inside the runtime
    let report = diagnostics.export_metrics();
    info!("Exported {} bytes of diagnostics", report.len());
    let mut stdout = io::stdout().lock();
    if let Err(e) = stdout.write_all(&report).and_then(|()| stdout.write_all(b"\n")) {
        error!("Failed to write report: {e}");
    }

    diagnostics.stop();
}

fn simulate_workload(diagnostics: &Diagnostics, runtime: &tokio::runtime::Runtime, run_for: Duration) {
    info!("Simulating UI workload for {}s", run_for.as_secs());

    // a row re-rendered on every keystroke
    for _ in 0..80 {
        diagnostics.record_invocation("search-row", RedrawCause::StateChange, Some("results"));
    }
    diagnostics.record_invocation("header", RedrawCause::EnvChange, None);

    // a sidebar flipping between two widths
    let narrow = LayoutSize::new(240.0, 800.0);
    let wide = LayoutSize::new(320.0, 800.0);
    for pass in 0..24 {
        let size = if pass % 2 == 0 { narrow } else { wide };
        diagnostics.record_pass("sidebar", size);
    }

    // form writes, one redundant and one from a background context
    diagnostics.record_change(
        StateChange::new("profile-form", true)
            .with_key("email")
            .with_values(Some("a@example.com".to_string()), Some("b@example.com".to_string())),
    );
    diagnostics.record_change(
        StateChange::new("profile-form", true)
            .with_key("email")
            .with_values(Some("b@example.com".to_string()), Some("b@example.com".to_string())),
    );
    diagnostics.record_change(StateChange::new("profile-form", false).with_key("avatar"));
    diagnostics.record_main_context_violation("profile-form", "Avatar published off main context");

    // one screen kept alive past its deadline, one released
    let retained = Arc::new(Screen {
        _rows: vec!["settings".to_string()],
    });
    let released = Arc::new(Screen { _rows: Vec::new() });
    diagnostics.register_object(&retained, Some(Instant::now()));
    diagnostics.register_object(&released, Some(Instant::now()));
    drop(released);

    // background work: one finishes, one never does
    diagnostics.register_task("thumbnail-decode");
    let fetch = diagnostics.spawn_tracked(async {
        tokio::time::sleep(Duration::from_millis(50)).await;
    });

    runtime.block_on(async {
        if let Err(e) = fetch.await {
            warn!("Tracked fetch failed: {e}");
        }
        tokio::time::sleep(run_for).await;
    });

    drop(retained);
}
