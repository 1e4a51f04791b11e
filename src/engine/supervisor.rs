//! Process supervisor interface
//!
//! The supervisor that starts/stops/restarts the deployed service is an
//! external collaborator; the engine only needs its three primitives.

use std::process::Command;
use std::sync::Mutex;

use thiserror::Error;
use tracing::info;

/// Errors from supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor command {command} failed: {detail}")]
    CommandFailed { command: String, detail: String },
}

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Start/stop/restart primitives of the process supervisor
pub trait Supervisor {
    /// Start the service
    fn start(&self) -> SupervisorResult<()>;

    /// Stop the service
    fn stop(&self) -> SupervisorResult<()>;

    /// Restart the service against the currently active release
    fn restart(&self) -> SupervisorResult<()>;
}

/// Supervisor driven by configured commands (e.g. systemctl)
pub struct CommandSupervisor {
    start_command: Vec<String>,
    stop_command: Vec<String>,
    restart_command: Option<Vec<String>>,
}

impl CommandSupervisor {
    /// Create from start/stop commands and an optional restart command;
    /// without one, restart is stop-then-start.
    pub fn new(
        start_command: Vec<String>,
        stop_command: Vec<String>,
        restart_command: Option<Vec<String>>,
    ) -> Self {
        Self {
            start_command,
            stop_command,
            restart_command,
        }
    }

    fn run(command: &[String]) -> SupervisorResult<()> {
        let Some((program, args)) = command.split_first() else {
            // An unconfigured primitive is a no-op; development setups run
            // the service by hand.
            return Ok(());
        };

        info!(command = %command.join(" "), "supervisor");
        let output = Command::new(program).args(args).output().map_err(|e| {
            SupervisorError::CommandFailed {
                command: program.clone(),
                detail: e.to_string(),
            }
        })?;

        if !output.status.success() {
            return Err(SupervisorError::CommandFailed {
                command: program.clone(),
                detail: format!(
                    "exited with {} ({})",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

impl Supervisor for CommandSupervisor {
    fn start(&self) -> SupervisorResult<()> {
        Self::run(&self.start_command)
    }

    fn stop(&self) -> SupervisorResult<()> {
        Self::run(&self.stop_command)
    }

    fn restart(&self) -> SupervisorResult<()> {
        match &self.restart_command {
            Some(command) => Self::run(command),
            None => {
                self.stop()?;
                self.start()
            }
        }
    }
}

/// Supervisor recording invocations instead of acting; used by tests
#[derive(Default)]
pub struct RecordingSupervisor {
    calls: Mutex<Vec<String>>,
}

impl RecordingSupervisor {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Invocations so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("supervisor calls lock").clone()
    }

    fn record(&self, call: &str) {
        self.calls
            .lock()
            .expect("supervisor calls lock")
            .push(call.to_string());
    }
}

impl Supervisor for RecordingSupervisor {
    fn start(&self) -> SupervisorResult<()> {
        self.record("start");
        Ok(())
    }

    fn stop(&self) -> SupervisorResult<()> {
        self.record("stop");
        Ok(())
    }

    fn restart(&self) -> SupervisorResult<()> {
        self.record("restart");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_supervisor_success() {
        let sup = CommandSupervisor::new(
            vec!["true".to_string()],
            vec!["true".to_string()],
            None,
        );
        assert!(sup.start().is_ok());
        assert!(sup.restart().is_ok());
    }

    #[test]
    fn test_command_supervisor_failure() {
        let sup = CommandSupervisor::new(vec!["false".to_string()], vec![], None);
        assert!(matches!(
            sup.start(),
            Err(SupervisorError::CommandFailed { .. })
        ));
    }

    #[test]
    fn test_unconfigured_commands_are_noops() {
        let sup = CommandSupervisor::new(vec![], vec![], None);
        assert!(sup.start().is_ok());
        assert!(sup.stop().is_ok());
        assert!(sup.restart().is_ok());
    }

    #[test]
    fn test_recording_supervisor() {
        let sup = RecordingSupervisor::new();
        sup.restart().unwrap();
        sup.stop().unwrap();
        assert_eq!(sup.calls(), vec!["restart".to_string(), "stop".to_string()]);
    }
}
