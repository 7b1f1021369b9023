use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "inspequte_idioms=info,warn";
const DEBUG_STACK_ENV: &str = "INSPEQUTE_IDIOMS_DEBUG_STACK";

/// Initialize logging facade with stderr output.
pub(crate) fn init_logging() {
    let init_result = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    let _ = init_result;
}

/// Returns whether per-instruction stack tracing is enabled.
pub(crate) fn debug_stack_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| flag_enabled(std::env::var(DEBUG_STACK_ENV).ok().as_deref()))
}

fn flag_enabled(value: Option<&str>) -> bool {
    value
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Run a closure inside a named `tracing` span.
pub(crate) fn with_span<T, F>(name: &'static str, target: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let span = tracing::info_span!("analysis", phase = name, target = target);
    span.in_scope(f)
}
