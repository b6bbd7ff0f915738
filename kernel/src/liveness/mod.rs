// Partition Liveness Guard
//
// Checks run against a partition directory right before it is retired.
// A partition that any check reports busy is left in place for the next
// sweep, and a check that cannot decide blocks retirement.

use std::io;
use std::path::Path;

use crate::config::LivenessConfig;

mod open_files;

pub use open_files::OpenFileCheck;

/// Result of a single liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Idle,
    Busy(String),
}

/// Trait implemented by all liveness checks.
///
/// Checks must not modify the partition directory.
pub trait LivenessCheck: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, partition_dir: &Path) -> io::Result<Liveness>;
}

/// Why a partition must not be retired right now.
#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("partition in use according to `{check}`: {reason}")]
    Busy { check: &'static str, reason: String },

    #[error("liveness check `{check}` failed: {source}")]
    CheckFailed {
        check: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Evaluates a set of liveness checks.
#[derive(Default)]
pub struct LivenessGuard {
    checks: Vec<Box<dyn LivenessCheck>>,
}

impl LivenessGuard {
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    /// Guard with the checks enabled in `config`.
    pub fn from_config(config: &LivenessConfig) -> Self {
        let mut guard = Self::new();
        if config.enabled {
            guard.register(OpenFileCheck::new(config.process_prefix.clone()));
        }
        guard
    }

    pub fn register<C: LivenessCheck + 'static>(&mut self, check: C) {
        self.checks.push(Box::new(check));
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Evaluate all checks.
    ///
    /// Stops at the first busy report or check failure.
    pub fn evaluate(&self, partition_dir: &Path) -> Result<(), LivenessError> {
        for check in &self.checks {
            match check.check(partition_dir) {
                Ok(Liveness::Idle) => continue,
                Ok(Liveness::Busy(reason)) => {
                    return Err(LivenessError::Busy {
                        check: check.name(),
                        reason,
                    })
                }
                Err(source) => {
                    return Err(LivenessError::CheckFailed {
                        check: check.name(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LivenessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.checks.iter().map(|c| c.name()).collect();
        f.debug_struct("LivenessGuard").field("checks", &names).finish()
    }
}
