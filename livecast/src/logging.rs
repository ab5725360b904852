use livecast_sfu::ConnectionId;
use tracing::{Level, Span};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Targets logged at the configured level; everything else only at warn
const RELAY_TARGETS: [&str; 3] = ["livecast", "livecast_sfu", "tower_http"];

/// Initialize structured logging based on configuration
///
/// `json` for production, anything else is the pretty development format.
/// `RUST_LOG` overrides the configured filter.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(level)))?;
    let (writer, ansi) = open_writer(config)?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_writer(writer),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_line_number(true)
                    .with_file(false)
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .init();
    }

    Ok(())
}

/// Filter directives for the relay crates at `level`
#[must_use]
pub fn default_filter(level: Level) -> String {
    let level = level.as_str().to_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(RELAY_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

/// Span for everything logged on behalf of one signaling connection
#[must_use]
pub fn connection_span(connection_id: &ConnectionId) -> Span {
    tracing::info_span!("signaling", connection_id = %connection_id)
}

/// Log file if configured, stdout otherwise. Color only on stdout.
fn open_writer(config: &LoggingConfig) -> anyhow::Result<(BoxMakeWriter, bool)> {
    match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("Failed to open log file {path}: {e}"))?;
            Ok((BoxMakeWriter::new(std::sync::Arc::new(file)), false))
        }
        None => Ok((BoxMakeWriter::new(std::io::stdout), true)),
    }
}

/// Parse log level string to tracing Level
pub fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("TRACE").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("warning").unwrap(), Level::WARN);
        assert!(parse_log_level("info").is_ok());
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_default_filter_scopes_relay_targets() {
        let filter = default_filter(Level::DEBUG);
        assert_eq!(
            filter,
            "warn,livecast=debug,livecast_sfu=debug,tower_http=debug"
        );
        assert!(EnvFilter::try_new(&filter).is_ok());
    }

    #[test]
    fn test_log_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.log");
        let config = LoggingConfig {
            level: "info".to_string(),
            format: "json".to_string(),
            file_path: Some(path.to_string_lossy().into_owned()),
        };

        let (_, ansi) = open_writer(&config).unwrap();
        assert!(!ansi);
        assert!(path.exists());
    }
}
