//! Health checking
//!
//! A bounded-retry policy polling the deployed service's health probe.
//! The probe is a collaborator: any non-success result or connection
//! failure counts as unhealthy. Polling bounds itself by both a maximum
//! attempt count and a wall-clock timeout, whichever triggers first.

use std::collections::VecDeque;
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Result of one probe attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Service is ready to serve
    Healthy,
    /// Anything else: bad status, bad output, connection failure
    Unhealthy(String),
}

/// The deployed service's health probe
pub trait HealthProbe {
    /// Perform one readiness check
    fn check(&self) -> HealthStatus;
}

/// Probe that runs a command; exit 0 means ready
pub struct CommandProbe {
    command: Vec<String>,
}

impl CommandProbe {
    /// Create a probe from a command and its arguments
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl HealthProbe for CommandProbe {
    fn check(&self) -> HealthStatus {
        let Some((program, args)) = self.command.split_first() else {
            return HealthStatus::Unhealthy("no health command configured".to_string());
        };

        match Command::new(program).args(args).output() {
            Ok(output) if output.status.success() => HealthStatus::Healthy,
            Ok(output) => HealthStatus::Unhealthy(format!(
                "{program} exited with {}",
                output.status
            )),
            Err(e) => HealthStatus::Unhealthy(format!("failed to run {program}: {e}")),
        }
    }
}

/// Probe returning a fixed status; used by tests and dry runs
pub struct StaticProbe(pub HealthStatus);

impl HealthProbe for StaticProbe {
    fn check(&self) -> HealthStatus {
        self.0.clone()
    }
}

/// Probe replaying a scripted sequence of results, then repeating the last
pub struct ScriptedProbe {
    script: Mutex<VecDeque<HealthStatus>>,
    last: Mutex<HealthStatus>,
}

impl ScriptedProbe {
    /// Create a probe that yields `script` results in order
    pub fn new(script: Vec<HealthStatus>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(HealthStatus::Unhealthy("script exhausted".to_string())),
        }
    }
}

impl HealthProbe for ScriptedProbe {
    fn check(&self) -> HealthStatus {
        let mut script = self.script.lock().expect("probe script lock");
        match script.pop_front() {
            Some(status) => {
                *self.last.lock().expect("probe last lock") = status.clone();
                status
            }
            None => self.last.lock().expect("probe last lock").clone(),
        }
    }
}

/// Errors from retry policy validation
#[derive(Debug, Error)]
pub enum RetryPolicyError {
    #[error("max_attempts must be in (0, 1000], got {0}")]
    AttemptsOutOfBounds(u32),

    #[error("timeout_secs must be in (0, 3600], got {0}")]
    TimeoutOutOfBounds(u64),
}

/// Bounded-retry policy for health polling
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum probe attempts (default: 10)
    pub max_attempts: u32,

    /// Delay between attempts in milliseconds (default: 2000)
    pub delay_ms: u64,

    /// Overall wall-clock budget in seconds (default: 60)
    pub timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_ms: 2000,
            timeout_secs: 60,
        }
    }
}

impl RetryPolicy {
    /// Validate policy bounds
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 || self.max_attempts > 1000 {
            return Err(RetryPolicyError::AttemptsOutOfBounds(self.max_attempts));
        }
        if self.timeout_secs == 0 || self.timeout_secs > 3600 {
            return Err(RetryPolicyError::TimeoutOutOfBounds(self.timeout_secs));
        }
        Ok(())
    }

    /// Poll the probe until healthy, attempts are exhausted, or the
    /// wall-clock budget is spent — whichever comes first.
    pub fn await_healthy(&self, probe: &dyn HealthProbe) -> HealthVerdict {
        let start = Instant::now();
        let timeout = Duration::from_secs(self.timeout_secs);
        let delay = Duration::from_millis(self.delay_ms);
        let mut attempts = 0;
        let mut last_reason = String::new();

        loop {
            attempts += 1;
            match probe.check() {
                HealthStatus::Healthy => {
                    debug!(attempts, "health probe succeeded");
                    return HealthVerdict::Healthy { attempts };
                }
                HealthStatus::Unhealthy(reason) => {
                    debug!(attempts, %reason, "health probe failed");
                    last_reason = reason;
                }
            }

            let elapsed = start.elapsed();
            if attempts >= self.max_attempts {
                return HealthVerdict::Unhealthy {
                    attempts,
                    last_reason,
                    timed_out: false,
                };
            }
            if elapsed + delay > timeout {
                return HealthVerdict::Unhealthy {
                    attempts,
                    last_reason,
                    timed_out: true,
                };
            }

            std::thread::sleep(delay);
        }
    }
}

/// Outcome of a bounded health-polling round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Probe reported ready within bounds
    Healthy { attempts: u32 },
    /// Attempts or wall clock exhausted without a ready response
    Unhealthy {
        attempts: u32,
        last_reason: String,
        timed_out: bool,
    },
}

impl HealthVerdict {
    /// True when the service came up
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthVerdict::Healthy { .. })
    }
}
