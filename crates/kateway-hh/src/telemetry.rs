use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the process-wide tracing subscriber.
///
/// - Level directives come from `RUST_LOG` (e.g. "info", "warn,kateway_hh::storage::disk=debug"),
///   falling back to `default_directive` when unset or invalid.
/// - `log` records from the queue and pump are forwarded to `tracing` via `LogTracer`.
/// - Pump threads are named per destination, so thread names are printed.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_with_default(default_directive: &str) {
    let _ = LogTracer::init();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

pub fn init() {
    init_with_default("info");
}

/// Subscriber that discards everything, so benchmarks measure I/O rather than formatting.
pub fn init_for_benchmarks() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("off"))
        .try_init();
}
