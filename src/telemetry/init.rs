// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber setup for the library and the `foreman` binary.

use std::io;
use tracing::Level;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// How log lines are laid out on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One line per event, fields inline.
    #[default]
    Compact,
    /// Multi-field layout with span context, for local debugging.
    Full,
}

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Level applied to every target without a more specific directive.
    pub level: Level,

    pub format: LogFormat,

    /// Emit span close events, which carry `time.busy` / `time.idle`.
    /// Useful for seeing how long provisioning and teardown spans take.
    pub span_timings: bool,

    /// Include file and line of the call site.
    pub source_locations: bool,

    pub ansi: bool,

    /// Extra per-target directives such as `foreman::monitor=debug`.
    /// Applied on top of `level` (or `RUST_LOG`).
    pub directives: Vec<String>,

    /// Ignore `RUST_LOG` even when it is set.
    pub ignore_env: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            span_timings: false,
            source_locations: false,
            ansi: true,
            directives: Vec::new(),
            ignore_env: false,
        }
    }
}

impl TelemetryConfig {
    /// Verbose output for local debugging.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            format: LogFormat::Full,
            span_timings: true,
            source_locations: true,
            ..Self::default()
        }
    }

    /// Long-running coordinator or monitor: warnings and escalations only,
    /// no colour codes in collected logs.
    pub fn production() -> Self {
        Self {
            level: Level::WARN,
            ansi: false,
            ..Self::default()
        }
    }

    /// Trace everything in this crate, deterministic output.
    pub fn testing() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Full,
            span_timings: true,
            source_locations: true,
            ansi: false,
            directives: vec!["foreman=trace".to_string()],
            ignore_env: true,
        }
    }

    /// Pick a preset from CLI verbosity flags.
    pub fn from_flags(verbose: bool, debug: bool) -> Self {
        if debug {
            Self::development()
        } else if verbose {
            Self::default()
        } else {
            Self::default().with_level(Level::WARN)
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Build the env filter: `RUST_LOG` (unless ignored) or the base level,
    /// then every extra directive. Malformed directives are skipped.
    pub fn build_filter(&self) -> EnvFilter {
        let base = if self.ignore_env {
            None
        } else {
            EnvFilter::try_from_default_env().ok()
        };
        let mut filter = base.unwrap_or_else(|| EnvFilter::new(self.level.to_string()));
        for raw in &self.directives {
            match raw.parse::<Directive>() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("ignoring log directive {:?}: {}", raw, e),
            }
        }
        filter
    }
}

/// Guard that keeps telemetry alive; hold it for the life of the program.
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global subscriber.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
/// Fails if a global subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let span_events = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi)
        .with_target(true)
        .with_file(config.source_locations)
        .with_line_number(config.source_locations)
        .with_span_events(span_events);

    let registry = tracing_subscriber::registry().with(config.build_filter());
    let result = match config.format {
        LogFormat::Compact => registry.with(fmt_layer.compact()).try_init(),
        LogFormat::Full => registry.with(fmt_layer).try_init(),
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(TelemetryGuard { _private: () })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flags() {
        assert_eq!(TelemetryConfig::from_flags(false, false).level, Level::WARN);
        assert_eq!(TelemetryConfig::from_flags(true, false).level, Level::INFO);

        let debug = TelemetryConfig::from_flags(false, true);
        assert_eq!(debug.level, Level::DEBUG);
        assert_eq!(debug.format, LogFormat::Full);
        assert!(debug.span_timings);
    }

    #[test]
    fn test_testing_preset_ignores_env() {
        let config = TelemetryConfig::testing();
        assert!(config.ignore_env);
        let rendered = config.build_filter().to_string().to_lowercase();
        assert!(rendered.contains("foreman=trace"), "{}", rendered);
        assert!(rendered.contains("warn"), "{}", rendered);
    }

    #[test]
    fn test_directives_layer_on_base_level() {
        let config = TelemetryConfig {
            ignore_env: true,
            ..TelemetryConfig::production()
        }
        .with_directive("foreman::monitor=debug")
        .with_directive("foreman::graph=loud")
        .with_ansi(true);

        assert!(config.ansi);
        let rendered = config.build_filter().to_string().to_lowercase();
        assert!(rendered.contains("foreman::monitor=debug"), "{}", rendered);
        assert!(rendered.contains("warn"), "{}", rendered);
        assert!(!rendered.contains("foreman::graph"), "{}", rendered);
    }
}
