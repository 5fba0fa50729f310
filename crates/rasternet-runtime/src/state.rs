//! Engine lifecycle.
//!
//! ```text
//! Uninitialized --compile--> Compiled --prepare--> Ready --begin--> Running
//!                                                    ^                 |
//!                                                    +----finish-------+
//! any --fail--> Failed --compile--> Compiled
//! ```

use crate::error::{Result, RuntimeError};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Compiled,
    Ready,
    Running,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    Compile,
    Prepare,
    BeginRun,
    FinishRun,
    Fail,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Compiled => "compiled",
            EngineState::Ready => "ready",
            EngineState::Running => "running",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl EngineState {
    /// The state after `event`.
    ///
    /// # Errors
    /// Returns `Precondition` when the event is not allowed in this state.
    pub fn transition(self, event: EngineEvent) -> Result<EngineState> {
        use EngineEvent::*;
        use EngineState::*;

        match (self, event) {
            (_, Fail) => Ok(Failed),
            (Running, Compile) => Err(RuntimeError::precondition(
                "cannot recompile while a run is in progress",
            )),
            (_, Compile) => Ok(Compiled),
            (Compiled | Ready, Prepare) => Ok(Ready),
            (Ready, BeginRun) => Ok(Running),
            (Running, FinishRun) => Ok(Ready),
            (Failed, _) => Err(RuntimeError::precondition(format!(
                "engine failed; compile again before {}",
                event.action()
            ))),
            (Uninitialized, _) => Err(RuntimeError::precondition(format!(
                "no graph compiled; call compile before {}",
                event.action()
            ))),
            (state, event) => Err(RuntimeError::precondition(format!(
                "cannot {} while {state}",
                event.action()
            ))),
        }
    }

    /// The state after an operation returned an error.
    ///
    /// Device failures fail the engine; any other error ends a run in
    /// progress and leaves other states alone.
    pub fn after_error(self, device_failure: bool) -> EngineState {
        if device_failure {
            self.transition(EngineEvent::Fail)
                .unwrap_or(EngineState::Failed)
        } else if self == EngineState::Running {
            self.transition(EngineEvent::FinishRun)
                .unwrap_or(EngineState::Ready)
        } else {
            self
        }
    }

    /// Whether a compiled graph is available to prepare or run.
    pub fn is_compiled(self) -> bool {
        matches!(
            self,
            EngineState::Compiled | EngineState::Ready | EngineState::Running
        )
    }
}

impl EngineEvent {
    fn action(self) -> &'static str {
        match self {
            EngineEvent::Compile => "compile",
            EngineEvent::Prepare => "prepare",
            EngineEvent::BeginRun => "run",
            EngineEvent::FinishRun => "finish a run",
            EngineEvent::Fail => "fail",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasternet_core::Error;

    fn is_precondition(result: Result<EngineState>) -> bool {
        matches!(result, Err(RuntimeError::Engine(Error::Precondition(_))))
    }

    #[test]
    fn test_happy_path() {
        let state = EngineState::Uninitialized
            .transition(EngineEvent::Compile)
            .and_then(|s| s.transition(EngineEvent::Prepare))
            .and_then(|s| s.transition(EngineEvent::BeginRun))
            .and_then(|s| s.transition(EngineEvent::FinishRun))
            .unwrap();
        assert_eq!(state, EngineState::Ready);
        assert_eq!(
            state.transition(EngineEvent::Prepare).unwrap(),
            EngineState::Ready
        );
    }

    #[test]
    fn test_run_before_compile() {
        assert!(is_precondition(
            EngineState::Uninitialized.transition(EngineEvent::BeginRun)
        ));
        assert!(is_precondition(
            EngineState::Uninitialized.transition(EngineEvent::Prepare)
        ));
    }

    #[test]
    fn test_run_requires_prepare() {
        assert!(is_precondition(
            EngineState::Compiled.transition(EngineEvent::BeginRun)
        ));
    }

    #[test]
    fn test_failed_requires_recompile() {
        let failed = EngineState::Running.transition(EngineEvent::Fail).unwrap();
        assert_eq!(failed, EngineState::Failed);
        assert!(is_precondition(failed.transition(EngineEvent::Prepare)));
        assert!(is_precondition(failed.transition(EngineEvent::BeginRun)));
        assert_eq!(
            failed.transition(EngineEvent::Compile).unwrap(),
            EngineState::Compiled
        );
    }

    #[test]
    fn test_no_recompile_while_running() {
        assert!(is_precondition(
            EngineState::Running.transition(EngineEvent::Compile)
        ));
        assert!(is_precondition(
            EngineState::Ready.transition(EngineEvent::FinishRun)
        ));
    }

    #[test]
    fn test_device_failure_fails_from_every_state() {
        for state in [
            EngineState::Uninitialized,
            EngineState::Compiled,
            EngineState::Ready,
            EngineState::Running,
            EngineState::Failed,
        ] {
            assert_eq!(state.after_error(true), EngineState::Failed, "from {state}");
        }
    }

    #[test]
    fn test_other_errors_end_the_run() {
        assert_eq!(EngineState::Running.after_error(false), EngineState::Ready);
        assert_eq!(EngineState::Ready.after_error(false), EngineState::Ready);
        assert_eq!(EngineState::Compiled.after_error(false), EngineState::Compiled);
        assert_eq!(EngineState::Failed.after_error(false), EngineState::Failed);
    }

    #[test]
    fn test_is_compiled() {
        assert!(!EngineState::Uninitialized.is_compiled());
        assert!(EngineState::Ready.is_compiled());
        assert!(!EngineState::Failed.is_compiled());
    }
}
