use tracing::Level;


/// Setting this to `1`, `true`, `yes` or `on` turns off the per-operation diagnostic logging
pub const QUIET_ENV_VAR: &str = "MSGRELAY_QUIET";

pub fn is_quiet_value(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

pub fn is_quiet() -> bool {
    std::env::var(QUIET_ENV_VAR)
        .map(|v| is_quiet_value(&v))
        .unwrap_or(false)
}

/// An explicit request for trace output wins over the quiet toggle
pub fn log_level(quiet: bool, very_verbose: bool) -> Level {
    match (quiet, very_verbose) {
        (_, true) => Level::TRACE,
        (true, false) => Level::INFO,
        (false, false) => Level::DEBUG,
    }
}

pub fn init_logging(level: Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();
}
