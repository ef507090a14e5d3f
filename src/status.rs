//! Macro and executor state reporting types.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a macro instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacroState {
    /// Instance created, not yet driven.
    Created,
    /// Being driven by the worker.
    Running,
    /// Parked at a pause point.
    Paused,
    /// Completed normally.
    Finished,
    /// Interrupted gracefully.
    Stopped,
    /// Interrupted immediately.
    Aborted,
    /// Failed with a runtime error.
    Exception,
}

impl MacroState {
    /// True once the instance can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MacroState::Finished | MacroState::Stopped | MacroState::Aborted | MacroState::Exception
        )
    }
}

impl std::fmt::Display for MacroState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MacroState::Created => "created",
            MacroState::Running => "running",
            MacroState::Paused => "paused",
            MacroState::Finished => "finished",
            MacroState::Stopped => "stopped",
            MacroState::Aborted => "aborted",
            MacroState::Exception => "exception",
        };
        write!(f, "{name}")
    }
}

/// Event tag carried by one emitted status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEvent {
    /// Macro entered its driving loop.
    Start,
    /// One step completed.
    Step,
    /// Macro parked at a pause point.
    Pause,
    /// Macro left a pause point.
    Resume,
    /// Terminal: graceful interruption.
    Stop,
    /// Terminal: immediate interruption.
    Abort,
    /// Terminal: runtime failure.
    Exception,
    /// Terminal: normal completion.
    Finish,
}

impl std::fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusEvent::Start => "start",
            StatusEvent::Step => "step",
            StatusEvent::Pause => "pause",
            StatusEvent::Resume => "resume",
            StatusEvent::Stop => "stop",
            StatusEvent::Abort => "abort",
            StatusEvent::Exception => "exception",
            StatusEvent::Finish => "finish",
        };
        write!(f, "{name}")
    }
}

impl StatusEvent {
    /// True for the four terminal events. Exactly one of these is emitted
    /// per started macro instance.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StatusEvent::Stop | StatusEvent::Abort | StatusEvent::Exception | StatusEvent::Finish
        )
    }
}

/// One status record emitted for a macro instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroStatus {
    /// Instance id (negative for internally assigned ids).
    pub id: i64,
    /// Event tag.
    pub event: StatusEvent,
    /// Progress range, `(low, high)`.
    pub range: (f64, f64),
    /// Progress value within `range`.
    pub step: f64,
    /// Failure classification, present only on exception records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_type: Option<String>,
    /// Failure message, present only on exception records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_value: Option<String>,
    /// Extra failure context lines.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exc_stack: Vec<String>,
}

impl MacroStatus {
    /// Fresh status for a new instance, default progress range 0..100.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            event: StatusEvent::Start,
            range: (0.0, 100.0),
            step: 0.0,
            exc_type: None,
            exc_value: None,
            exc_stack: Vec::new(),
        }
    }
}

/// Session-level executor state, reported through the door.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    /// No job running.
    Idle,
    /// A submitted tree is being executed.
    Running,
    /// The running macro is parked at a pause point.
    Paused,
    /// Terminal for the last job: completed normally.
    Finished,
    /// Terminal for the last job: interrupted or failed.
    Abort,
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutorState::Idle => "idle",
            ExecutorState::Running => "running",
            ExecutorState::Paused => "paused",
            ExecutorState::Finished => "finished",
            ExecutorState::Abort => "abort",
        };
        write!(f, "{name}")
    }
}
