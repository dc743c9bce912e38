use tracing_subscriber::EnvFilter;

/// Filter directives for the watcher, e.g. `SIMWATCH_LOG=simwatch_runtime=debug`.
pub const LOG_ENV: &str = "SIMWATCH_LOG";

// HTTP client internals log every connection at info.
const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn";

/// Installs the global fmt subscriber. Calling it again is a no-op.
///
/// Run-scoped events carry `shot` and `run` through the run span, and
/// fetch/upload events add `timestep`. Every state change sets `event`.
pub fn init_tracing() {
    let filter = filter_from(configured_directives().as_deref());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// `SIMWATCH_LOG`, falling back to `RUST_LOG`. Blank values count as unset.
fn configured_directives() -> Option<String> {
    [LOG_ENV, EnvFilter::DEFAULT_ENV]
        .into_iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.trim().is_empty())
}

/// Builds a filter from user directives. Directives that do not parse are
/// reported on stderr and replaced by the defaults.
pub fn filter_from(directives: Option<&str>) -> EnvFilter {
    let Some(directives) = directives else {
        return EnvFilter::new(DEFAULT_DIRECTIVES);
    };
    match EnvFilter::try_new(directives) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("ignoring invalid {LOG_ENV} directives {directives:?}: {err}");
            EnvFilter::new(DEFAULT_DIRECTIVES)
        }
    }
}
