use tracing::warn;
use tracing_subscriber::filter::LevelFilter;

/// Installs the global fmt subscriber. Unknown level names fall back to info.
pub fn init(level: &str) {
    let parsed = level.parse::<LevelFilter>().ok();
    let max = parsed.unwrap_or(LevelFilter::INFO);
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(max)
        .with_thread_names(true)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Logging is already initialized");
        return;
    }
    if parsed.is_none() {
        warn!("Unknown log level '{level}', using info");
    }
}
