use clap::builder::TypedValueParser;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::time::Duration;

use crate::selector::SelectionMode;

pub const DEFAULT_METRICS_PORT: u16 = 8080;
pub const DEFAULT_SCHEDULE: &str = "@every 30m";
pub const DEFAULT_THREAD_COUNT: usize = 64;
pub const DEFAULT_LOG_LEVEL: &str = "INFO";
pub const DEFAULT_SAMPLE_SECS: u64 = 10;
pub const DEFAULT_PING_COUNT: usize = 5;
pub const DEFAULT_CYCLE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "speedtest-exporter")]
#[command(version, about = "Prometheus exporter for periodic internet speed tests")]
pub struct Settings {
    /// Port serving GET /metrics
    #[arg(long, env = "METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Run schedule: `@every <duration>`, a descriptor such as `@hourly`, or a cron expression
    #[arg(long, env = "SPEEDTEST_CRON_SCHEDULE", default_value = DEFAULT_SCHEDULE)]
    pub schedule: String,

    /// Concurrent connections per download/upload phase
    #[arg(
        long,
        env = "SPEEDTEST_THREAD_COUNT",
        default_value_t = DEFAULT_THREAD_COUNT,
        value_parser = clap::value_parser!(u16).range(1..).map(usize::from)
    )]
    pub threads: usize,

    /// Minimum log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long, env = "LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Which discovered servers are measured each cycle
    #[arg(
        long,
        env = "SPEEDTEST_SERVER_MODE",
        value_enum,
        default_value_t = SelectionMode::SingleBest
    )]
    pub server_mode: SelectionMode,

    /// Spread workers over every reachable server instead of only the target
    #[arg(
        long,
        env = "SPEEDTEST_MULTI_SERVER",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub multi_server: bool,

    /// Length of each download/upload sample window in seconds
    #[arg(long, env = "SPEEDTEST_SAMPLE_SECONDS", default_value_t = DEFAULT_SAMPLE_SECS)]
    pub sample_secs: u64,

    /// Round trips averaged for the latency figure
    #[arg(long, env = "SPEEDTEST_PING_COUNT", default_value_t = DEFAULT_PING_COUNT)]
    pub ping_count: usize,

    /// Abort a cycle running longer than this many seconds (0 disables)
    #[arg(
        long,
        env = "SPEEDTEST_CYCLE_TIMEOUT_SECONDS",
        default_value_t = DEFAULT_CYCLE_TIMEOUT_SECS
    )]
    pub cycle_timeout_secs: u64,

    /// Run a cycle at startup instead of waiting for the first fire
    #[arg(long, env = "SPEEDTEST_RUN_ON_START", default_value_t = false)]
    pub run_on_start: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            schedule: DEFAULT_SCHEDULE.to_string(),
            threads: DEFAULT_THREAD_COUNT,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_format: LogFormat::Json,
            server_mode: SelectionMode::SingleBest,
            multi_server: true,
            sample_secs: DEFAULT_SAMPLE_SECS,
            ping_count: DEFAULT_PING_COUNT,
            cycle_timeout_secs: DEFAULT_CYCLE_TIMEOUT_SECS,
            run_on_start: false,
        }
    }
}

impl Settings {
    pub fn sample_window(&self) -> Duration {
        Duration::from_secs(self.sample_secs.max(1))
    }

    pub fn cycle_timeout(&self) -> Option<Duration> {
        match self.cycle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_defaults_match_default_impl() {
        // flags only, env vars are not set for these names in the test environment
        let parsed = Settings::try_parse_from(["speedtest-exporter"]).unwrap();
        let defaults = Settings::default();

        assert_eq!(parsed.metrics_port, defaults.metrics_port);
        assert_eq!(parsed.schedule, defaults.schedule);
        assert_eq!(parsed.threads, defaults.threads);
        assert_eq!(parsed.log_level, defaults.log_level);
        assert_eq!(parsed.server_mode, defaults.server_mode);
        assert_eq!(parsed.multi_server, defaults.multi_server);
        assert_eq!(parsed.cycle_timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn parses_flags() {
        let parsed = Settings::try_parse_from([
            "speedtest-exporter",
            "--metrics-port",
            "9798",
            "--schedule",
            "@every 1m",
            "--threads",
            "8",
            "--server-mode",
            "all-available",
            "--multi-server",
            "false",
            "--cycle-timeout-secs",
            "0",
            "--log-format",
            "text",
        ])
        .unwrap();

        assert_eq!(parsed.metrics_port, 9798);
        assert_eq!(parsed.schedule, "@every 1m");
        assert_eq!(parsed.threads, 8);
        assert_eq!(parsed.server_mode, SelectionMode::AllAvailable);
        assert!(!parsed.multi_server);
        assert_eq!(parsed.cycle_timeout(), None);
        assert_eq!(parsed.log_format, LogFormat::Text);
    }

    #[test]
    fn rejects_zero_threads() {
        assert!(Settings::try_parse_from(["speedtest-exporter", "--threads", "0"]).is_err());
    }

    #[test]
    fn serializes_for_startup_log() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(json["server_mode"], "single-best");
        assert_eq!(json["threads"], 64);
    }
}
