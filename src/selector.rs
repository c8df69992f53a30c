use clap::ValueEnum;
use serde::Serialize;
use std::fmt;

use crate::error::{ExporterError, Result};
use crate::speedtest::{Candidate, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    /// Measure only the closest reachable server.
    SingleBest,
    /// Measure every reachable server in discovery order.
    AllAvailable,
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionMode::SingleBest => f.write_str("single-best"),
            SelectionMode::AllAvailable => f.write_str("all-available"),
        }
    }
}

#[derive(Debug)]
pub enum Selection {
    Single(Target),
    All(Vec<Target>),
}

impl Selection {
    pub fn into_targets(self) -> Vec<Target> {
        match self {
            Selection::Single(target) => vec![target],
            Selection::All(targets) => targets,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerSelector {
    mode: SelectionMode,
}

impl ServerSelector {
    pub fn new(mode: SelectionMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Picks the target(s) for this cycle from the discovery ordering.
    pub fn select(&self, candidates: &[Candidate]) -> Result<Selection> {
        let mut reachable = reachable(candidates).into_iter();

        match self.mode {
            SelectionMode::SingleBest => reachable
                .next()
                .map(|c| Selection::Single(Target::new(c)))
                .ok_or(ExporterError::NoServersAvailable),
            SelectionMode::AllAvailable => {
                let targets: Vec<Target> = reachable.map(Target::new).collect();
                if targets.is_empty() {
                    return Err(ExporterError::NoServersAvailable);
                }
                Ok(Selection::All(targets))
            }
        }
    }
}

/// Reachable candidates, order preserved.
pub fn reachable(candidates: &[Candidate]) -> Vec<Candidate> {
    candidates
        .iter()
        .filter(|c| c.is_reachable())
        .cloned()
        .collect()
}
