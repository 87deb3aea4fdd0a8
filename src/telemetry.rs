//! Tracing subscriber setup for embedding applications and tests.

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins when set. Otherwise keyforge crates log at `debug`
/// (`trace` when `verbose`). Returns `false` if a subscriber was already
/// installed.
pub fn init_tracing(verbose: bool) -> bool {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(verbose));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter.as_str())
        .try_init()
        .is_ok()
}

fn default_filter(verbose: bool) -> String {
    if verbose {
        "keyforge=trace,kf_pipeline=trace,kf_monitor=trace,kf_av=debug,kf_core=debug".to_string()
    } else {
        "keyforge=debug,kf_pipeline=debug,kf_monitor=info,kf_av=info,kf_core=info".to_string()
    }
}
