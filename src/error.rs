//! Error types for the exporter.
//!
//! Errors raised inside a measurement cycle are recovered by the service and
//! only ever logged. Schedule, registration and logging errors happen at
//! startup and abort the process.

use std::time::Duration;
use thiserror::Error;

use crate::speedtest::TestPhase;

pub type Result<T> = std::result::Result<T, ExporterError>;

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Server discovery failed: {reason}")]
    Discovery { reason: String },

    #[error("No reachable speedtest servers available")]
    NoServersAvailable,

    #[error("Measurement failed during {phase} phase on server {server}: {reason}")]
    Measurement {
        phase: TestPhase,
        server: String,
        reason: String,
    },

    #[error("Measurement cycle exceeded {timeout:?}")]
    CycleTimeout { timeout: Duration },

    #[error("Invalid schedule expression {expression:?}: {reason}")]
    ScheduleConfig { expression: String, reason: String },

    #[error("Failed to register metrics: {0}")]
    MetricsRegistration(#[from] prometheus::Error),

    #[error("Failed to initialize logging: {reason}")]
    Logging { reason: String },
}

impl ExporterError {
    pub fn discovery(err: anyhow::Error) -> Self {
        ExporterError::Discovery {
            reason: format!("{err:#}"),
        }
    }

    pub fn measurement(phase: TestPhase, server: impl Into<String>, err: anyhow::Error) -> Self {
        ExporterError::Measurement {
            phase,
            server: server.into(),
            reason: format!("{err:#}"),
        }
    }

    /// Cycle step the error belongs to, if any.
    pub fn phase(&self) -> Option<TestPhase> {
        match self {
            ExporterError::Discovery { .. } | ExporterError::NoServersAvailable => {
                Some(TestPhase::Discovery)
            }
            ExporterError::Measurement { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Short label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ExporterError::Discovery { .. } => "discovery",
            ExporterError::NoServersAvailable => "no_servers_available",
            ExporterError::Measurement { .. } => "measurement",
            ExporterError::CycleTimeout { .. } => "cycle_timeout",
            ExporterError::ScheduleConfig { .. } => "schedule_config",
            ExporterError::MetricsRegistration(_) => "metrics_registration",
            ExporterError::Logging { .. } => "logging",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measurement_error_keeps_context_chain() {
        let err = anyhow::anyhow!("connection reset").context("worker 3 failed");
        let err = ExporterError::measurement(TestPhase::Upload, "1234", err);

        let message = err.to_string();
        assert!(message.contains("upload phase"));
        assert!(message.contains("1234"));
        assert!(message.contains("worker 3 failed: connection reset"));
        assert_eq!(err.kind(), "measurement");
        assert_eq!(err.phase(), Some(TestPhase::Upload));
    }

    #[test]
    fn startup_errors_have_no_phase() {
        let err = ExporterError::ScheduleConfig {
            expression: "@every".to_string(),
            reason: "missing duration".to_string(),
        };
        assert_eq!(err.phase(), None);
        assert_eq!(ExporterError::NoServersAvailable.phase(), Some(TestPhase::Discovery));
    }

    #[test]
    fn discovery_error_message() {
        let err = ExporterError::discovery(anyhow::anyhow!("dns lookup failed"));
        assert_eq!(err.to_string(), "Server discovery failed: dns lookup failed");
    }
}
