//! A macro execution engine for scientific instrument control servers.
//!
//! The engine executes user-defined procedures ("macros") against controlled
//! hardware elements on behalf of connected clients. One [`executor::MacroExecutor`]
//! serves one session: submissions are validated synchronously (macro name,
//! parameter decoding), then run strictly sequentially by a dedicated worker
//! that drives each macro step by step, reacting to hook points, sub-macro
//! requests and pause points, while `abort`/`stop`/`pause`/`resume` arrive
//! on control paths and are honored cooperatively.
//!
//! Clients observe everything through the session [`door::Door`]: executor
//! state changes, textual output, per-macro status records, results and
//! record data.

pub mod config;
pub mod door;
pub mod element;
pub mod env;
pub mod error;
pub mod executor;
pub mod params;
pub mod registry;
pub mod sequence;
pub mod status;
pub mod stdlib;
pub mod task;
pub mod types;

pub use error::{ErrorRecord, MacroError, MacroResult};
pub use executor::{MacroExecutor, RunHandle, SessionContext};
pub use sequence::{HookNode, Sequence, SequenceNode};
pub use status::{ExecutorState, MacroState, MacroStatus, StatusEvent};
pub use task::{MacroContext, MacroTask, Progress, StepOutcome};
