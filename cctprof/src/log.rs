// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log setup for the parts of the profiler that run outside signal
//! handlers. Nothing on the sampling path logs through `tracing`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Variable holding an `EnvFilter` directive, e.g. `cctprof=debug`.
pub const LOG_ENV: &str = "CCTPROF_LOG";

/// The filter from [LOG_ENV], or `fallback` when it is unset or invalid.
pub fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs a global `fmt` subscriber writing to stderr.
pub fn init_logging(fallback_level: &str) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::registry().with(env_filter(fallback_level)).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_thread_ids(true)
            .with_target(true),
    );
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("failed to set global default subscriber: {e}"))
}
