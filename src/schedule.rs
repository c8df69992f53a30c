//! Periodic execution of the measurement cycle.
//!
//! Accepted expressions:
//! - `@every <duration>` with Go style durations such as `30m`, `1h30m`, `90s`
//! - `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight`, `@hourly`
//! - cron with 6 or 7 fields (seconds first) or 5 fields (seconds fixed to 0),
//!   evaluated in UTC. Numeric day-of-week values count 0-6 from Sunday.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::{ExporterError, Result};

#[derive(Debug, Clone)]
pub enum Schedule {
    Every(Duration),
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let invalid = |reason: String| ExporterError::ScheduleConfig {
            expression: expression.to_string(),
            reason,
        };

        if let Some(rest) = expression.strip_prefix("@every") {
            let interval = parse_go_duration(rest.trim()).map_err(invalid)?;
            return Ok(Schedule::Every(interval));
        }

        let normalized = match expression {
            "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
            "@monthly" => "0 0 0 1 * *".to_string(),
            "@weekly" => "0 0 0 * * Sun".to_string(),
            "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
            "@hourly" => "0 0 * * * *".to_string(),
            _ => {
                let mut fields: Vec<String> =
                    expression.split_whitespace().map(str::to_string).collect();
                if fields.len() == 5 {
                    fields.insert(0, "0".to_string());
                }
                if let Some(weekdays) = fields.get_mut(5) {
                    *weekdays = shift_weekdays(weekdays).map_err(invalid)?;
                }
                fields.join(" ")
            }
        };
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Schedule::Cron {
            expression: normalized,
            schedule: Box::new(schedule),
        })
    }

    /// Time to wait from `now` until the next fire, `None` when the schedule
    /// has no future occurrence.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Schedule::Every(interval) => Some(*interval),
            Schedule::Cron { schedule, .. } => schedule
                .after(&now)
                .next()
                .map(|next| (next - now).to_std().unwrap_or_default()),
        }
    }
}

/// Rewrites numeric day-of-week values from 0-6 (Sunday first) to the
/// 1-7 numbering of the `cron` crate. Names, `*`, `?` and step sizes are
/// left alone.
fn shift_weekdays(field: &str) -> std::result::Result<String, String> {
    let shift = |token: &str| -> std::result::Result<String, String> {
        match token.parse::<u8>() {
            Ok(day @ 0..=6) => Ok((day + 1).to_string()),
            Ok(day) => Err(format!("day of week {day} out of range 0-6")),
            Err(_) => Ok(token.to_string()),
        }
    };

    let items = field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = range
                .split('-')
                .map(shift)
                .collect::<std::result::Result<Vec<_>, _>>()?
                .join("-");
            Ok(match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            })
        })
        .collect::<std::result::Result<Vec<String>, String>>()?;
    Ok(items.join(","))
}

/// Parses the `<number><unit>` sequences of a Go duration string.
fn parse_go_duration(input: &str) -> std::result::Result<Duration, String> {
    if input.is_empty() {
        return Err("missing duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {input:?}"))?;
        if number_len == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid number in duration {input:?}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        rest = &rest[unit_len..];

        let part = Duration::try_from_secs_f64(value * seconds)
            .map_err(|_| format!("duration {input:?} out of range"))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("duration {input:?} out of range"))?;
    }

    if total < Duration::from_secs(1) {
        return Err(format!("interval {input:?} is shorter than one second"));
    }
    Ok(total)
}

/// Work executed on every fire.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn run(&self) -> Result<()>;
}

/// Fires a [`Job`] on a [`Schedule`], never running two invocations at once.
/// A fire that finds the previous invocation still running is skipped.
pub struct Scheduler {
    schedule: Schedule,
    run_lock: Arc<Mutex<()>>,
}

impl Scheduler {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Spawns the timer loop. With `run_immediately` the first invocation
    /// happens right away instead of at the first fire time.
    pub fn start<J: Job>(self, job: Arc<J>, run_immediately: bool) -> JoinHandle<()> {
        tokio::spawn(async move {
            if run_immediately {
                self.fire(&job);
            }

            loop {
                let Some(delay) = self.schedule.next_delay(Utc::now()) else {
                    warn!("Schedule has no further occurrences, stopping scheduler");
                    break;
                };
                tokio::time::sleep(delay).await;
                self.fire(&job);
            }
        })
    }

    fn fire<J: Job>(&self, job: &Arc<J>) {
        let Ok(guard) = self.run_lock.clone().try_lock_owned() else {
            warn!("Previous speedtest cycle still running, skipping this run");
            return;
        };

        let job = job.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = job.run().await {
                let phase = e.phase().map_or("none", |p| p.as_str());
                error!(error = %e, kind = e.kind(), phase, "Scheduled job failed");
            }
        });

        // Panics stay inside the job task; the lock guard is released on unwind.
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Scheduled job panicked");
                }
            }
        });
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Every(interval) => write!(f, "every {interval:?}"),
            Schedule::Cron { expression, .. } => write!(f, "cron {expression}"),
        }
    }
}
