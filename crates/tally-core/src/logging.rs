//! Global `tracing` subscriber setup.
//!
//! Output goes to stderr. `RUST_LOG`, when set, takes precedence over the
//! configured level.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human-readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse from string (case-insensitive). Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "compact" | "text" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Call once at startup. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // try_init fails if a global subscriber is already set
    let _ = match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_subscriber_does_not_panic() {
        init_subscriber("warn", LogFormat::Compact);
        init_subscriber("debug", LogFormat::Json);
    }

    #[test]
    fn parse_format() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("compact"), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("text"), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("yaml"), None);
    }

    #[test]
    fn format_serde() {
        assert_eq!(serde_json::to_string(&LogFormat::Json).unwrap(), "\"json\"");
        let back: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(back, LogFormat::Compact);
    }

    #[test]
    fn default_is_compact() {
        assert_eq!(LogFormat::default(), LogFormat::Compact);
    }
}
