//! The macro unit: task trait, execution context and control primitives.
//!
//! A macro implementation is a [`MacroTask`]: a state machine the executor
//! drives by calling [`MacroTask::step`] until it returns
//! [`StepOutcome::Done`]. Each step returns what happened (progress, a hook
//! place to run, a sub-macro to execute, a pause point) and the executor
//! reacts before driving the next step. Cancellation is cooperative: the
//! executor checks the instance [`ControlFlags`] immediately before and
//! after every step, and every context method checks them on entry, so an
//! abort surfaces as `Err(MacroError::Aborted)` at the next interaction
//! with the engine.
//!
//! # Pause
//!
//! Pausing is only honored at explicit pause points. A task yields
//! [`StepOutcome::Pause`]; the executor parks on the instance [`PauseGate`]
//! until `resume()` opens it (or the optional timeout elapses). The
//! pause/resume completion callbacks fire exactly once per transition,
//! inside the worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::door::Door;
use crate::env::EnvironmentStore;
use crate::error::{MacroError, MacroResult};
use crate::types::ParamValue;

/// Progress report for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Current progress value.
    pub step: f64,
    /// Optional new progress range `(low, high)`.
    pub range: Option<(f64, f64)>,
}

impl Progress {
    /// Progress value within the current range.
    pub fn at(step: f64) -> Self {
        Self { step, range: None }
    }

    /// Progress value with a new range.
    pub fn with_range(step: f64, low: f64, high: f64) -> Self {
        Self {
            step,
            range: Some((low, high)),
        }
    }
}

/// What one driven step of a macro produced.
#[derive(Debug)]
pub enum StepOutcome {
    /// Progress update; the executor emits a step status record.
    Progress(Progress),
    /// A scheduling tick with nothing to report; a step status record is
    /// still emitted with unchanged progress.
    Tick,
    /// Run the hooks attached to the given place, then continue.
    RunHooks {
        /// Hook place name; empty runs hooks attached without a place.
        place: String,
    },
    /// Run a sub-macro from flat tokens (name first), then continue. The
    /// sub-macro result is available through
    /// [`MacroContext::take_sub_result`].
    RunMacro {
        /// Flat command tokens.
        tokens: Vec<String>,
    },
    /// Explicit pause point; the executor parks here if a pause was
    /// requested.
    Pause {
        /// Give up waiting after this long and continue running.
        timeout: Option<Duration>,
    },
    /// The macro is finished, optionally with stringified result values.
    Done(Option<Vec<String>>),
}

/// Why an instance is being interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Immediate interruption.
    Abort,
    /// Graceful interruption.
    Stop,
}

/// Shared cancellation flags of one macro instance.
///
/// Set from control paths (never the worker), observed cooperatively by the
/// worker and by every context method. Abort takes precedence over stop.
#[derive(Default)]
pub struct ControlFlags {
    aborted: AtomicBool,
    stopped: AtomicBool,
    // Set while the executor runs on_abort/on_stop so those handlers can
    // still use the context without re-raising.
    handling_interrupt: AtomicBool,
}

impl ControlFlags {
    /// Fresh flags, nothing requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request immediate interruption.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Request graceful interruption.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// True once abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// True once stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_interrupt_handling(&self) {
        self.handling_interrupt.store(true, Ordering::SeqCst);
    }

    pub(crate) fn end_interrupt_handling(&self) {
        self.handling_interrupt.store(false, Ordering::SeqCst);
    }

    /// The mAPI guard: fail with the pending interruption, unless the
    /// executor is currently running the interrupt handler.
    pub fn guard(&self, what: &str) -> MacroResult<()> {
        if self.handling_interrupt.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.is_aborted() {
            return Err(MacroError::Aborted(what.to_string()));
        }
        if self.is_stopped() {
            return Err(MacroError::Stopped(what.to_string()));
        }
        Ok(())
    }

    /// The pending interruption, if any.
    pub fn pending(&self) -> Option<Interrupt> {
        if self.is_aborted() {
            Some(Interrupt::Abort)
        } else if self.is_stopped() {
            Some(Interrupt::Stop)
        } else {
            None
        }
    }
}

type TransitionCallback = Box<dyn FnOnce() + Send>;

/// Pause gate of one macro instance.
///
/// `pause()`/`resume()` are called from control paths and return
/// immediately; the worker parks in [`PauseGate::wait`] at the next pause
/// point. Transition callbacks fire exactly once, inside the worker, when
/// the transition completes.
pub struct PauseGate {
    paused: watch::Sender<bool>,
    on_paused: Mutex<Option<TransitionCallback>>,
    on_resumed: Mutex<Option<TransitionCallback>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// Open gate, nothing pending.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused,
            on_paused: Mutex::new(None),
            on_resumed: Mutex::new(None),
        }
    }

    /// True while a pause is requested or in effect.
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Request a pause. `callback` fires when the worker actually parks.
    pub fn pause(&self, callback: Option<TransitionCallback>) {
        if self.is_paused() {
            return;
        }
        if let Ok(mut slot) = self.on_paused.lock() {
            *slot = callback;
        }
        self.paused.send_replace(true);
    }

    /// Release a pause. `callback` fires when the worker actually resumes.
    pub fn resume(&self, callback: Option<TransitionCallback>) {
        if !self.is_paused() {
            return;
        }
        if let Ok(mut slot) = self.on_resumed.lock() {
            *slot = callback;
        }
        self.paused.send_replace(false);
    }

    /// Release a pause without a resume callback. Used by abort paths; the
    /// interruption itself is reported instead of a resume event.
    pub fn release_for_interrupt(&self) {
        if self.is_paused() {
            self.paused.send_replace(false);
        }
    }

    /// Park until the gate opens. Returns immediately when not paused.
    /// With a timeout, gives up after it elapses and the macro keeps
    /// running; the resume callback then fires on the eventual `resume()`
    /// at a later pause point.
    pub async fn wait(&self, timeout: Option<Duration>) {
        if !self.is_paused() {
            return;
        }
        if let Some(cb) = self.on_paused.lock().ok().and_then(|mut s| s.take()) {
            cb();
        }

        let mut rx = self.paused.subscribe();
        let until_open = async {
            while *rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };

        let opened = match timeout {
            Some(t) => tokio::time::timeout(t, until_open).await.is_ok(),
            None => {
                until_open.await;
                true
            }
        };

        if opened {
            if let Some(cb) = self.on_resumed.lock().ok().and_then(|mut s| s.take()) {
                cb();
            }
        } else {
            debug!("Pause point timed out, continuing");
        }
    }
}

/// The execution context handed to a macro task.
///
/// Every fallible method starts with the mAPI guard, so a pending abort or
/// stop surfaces at the macro's next engine interaction.
pub struct MacroContext {
    id: i64,
    name: String,
    macro_line: String,
    parent_id: Option<i64>,
    params: Vec<ParamValue>,
    flags: Arc<ControlFlags>,
    env: Arc<EnvironmentStore>,
    door: Arc<dyn Door>,
    output_buf: String,
    sub_result: Option<Vec<String>>,
}

impl MacroContext {
    /// Assemble a context for one instance.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: i64,
        name: String,
        macro_line: String,
        parent_id: Option<i64>,
        params: Vec<ParamValue>,
        flags: Arc<ControlFlags>,
        env: Arc<EnvironmentStore>,
        door: Arc<dyn Door>,
    ) -> Self {
        Self {
            id,
            name,
            macro_line,
            parent_id,
            params,
            flags,
            env,
            door,
            output_buf: String::new(),
            sub_result: None,
        }
    }

    /// Instance id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Macro name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable invocation line.
    pub fn macro_line(&self) -> &str {
        &self.macro_line
    }

    /// Parent instance id, when running as a hook or sub-macro.
    pub fn parent_id(&self) -> Option<i64> {
        self.parent_id
    }

    /// Explicit cancellation checkpoint for long computations.
    pub fn check_point(&self) -> MacroResult<()> {
        self.flags.guard(&self.name)
    }

    /// Decoded parameters, in schema order.
    pub fn params(&self) -> MacroResult<&[ParamValue]> {
        self.flags.guard(&self.name)?;
        Ok(&self.params)
    }

    /// One decoded parameter by position.
    pub fn param(&self, index: usize) -> MacroResult<&ParamValue> {
        self.flags.guard(&self.name)?;
        self.params.get(index).ok_or_else(|| {
            MacroError::MissingParam(format!(
                "{} has no parameter at position {index}",
                self.name
            ))
        })
    }

    /// Send one complete output line to the session clients.
    pub fn output(&mut self, line: impl AsRef<str>) -> MacroResult<()> {
        self.flags.guard(&self.name)?;
        self.flush()?;
        self.door.send_output(line.as_ref());
        Ok(())
    }

    /// Buffered write; complete lines are forwarded as they form.
    pub fn write(&mut self, text: &str) -> MacroResult<()> {
        self.flags.guard(&self.name)?;
        self.output_buf.push_str(text);
        while let Some(pos) = self.output_buf.find('\n') {
            let rest = self.output_buf.split_off(pos + 1);
            let line = std::mem::replace(&mut self.output_buf, rest);
            self.door.send_output(line.trim_end_matches('\n'));
        }
        Ok(())
    }

    /// Flush any buffered partial line.
    pub fn flush(&mut self) -> MacroResult<()> {
        if !self.output_buf.is_empty() {
            let line = std::mem::take(&mut self.output_buf);
            self.door.send_output(&line);
        }
        Ok(())
    }

    /// Read an environment key, failing with `MissingEnv` when absent.
    pub fn get_env(&self, key: &str) -> MacroResult<serde_json::Value> {
        self.flags.guard(&self.name)?;
        self.env.require(key)
    }

    /// Set an environment key.
    pub fn set_env(&self, key: impl Into<String>, value: serde_json::Value) -> MacroResult<()> {
        self.flags.guard(&self.name)?;
        self.env.set(key, value);
        Ok(())
    }

    /// Remove an environment key.
    pub fn unset_env(&self, key: &str) -> MacroResult<Option<serde_json::Value>> {
        self.flags.guard(&self.name)?;
        Ok(self.env.unset(key))
    }

    /// Sorted environment keys.
    pub fn env_keys(&self) -> MacroResult<Vec<String>> {
        self.flags.guard(&self.name)?;
        Ok(self.env.keys())
    }

    /// Forward opaque record data to the session clients.
    pub fn send_record_data(
        &self,
        payload: serde_json::Value,
        codec: Option<&str>,
    ) -> MacroResult<()> {
        self.flags.guard(&self.name)?;
        self.door.send_record_data(payload, codec);
        Ok(())
    }

    /// Result of the last sub-macro run through [`StepOutcome::RunMacro`].
    pub fn take_sub_result(&mut self) -> Option<Vec<String>> {
        self.sub_result.take()
    }

    pub(crate) fn set_sub_result(&mut self, result: Option<Vec<String>>) {
        self.sub_result = result;
    }
}

/// A macro implementation.
///
/// Fresh instances come from the registry factory; the executor calls
/// `prepare` once and then drives `step` until `Done`. The interruption
/// handlers run after an abort/stop was observed; errors they raise are
/// logged and swallowed.
#[async_trait]
pub trait MacroTask: Send {
    /// One-time setup before the first step. Failing here counts as the
    /// macro never having started.
    async fn prepare(&mut self, _ctx: &mut MacroContext) -> MacroResult<()> {
        Ok(())
    }

    /// Drive the macro one step forward.
    async fn step(&mut self, ctx: &mut MacroContext) -> MacroResult<StepOutcome>;

    /// Cleanup after an abort was observed.
    async fn on_abort(&mut self, _ctx: &mut MacroContext) -> MacroResult<()> {
        Ok(())
    }

    /// Cleanup after a stop was observed. Defaults to the abort cleanup.
    async fn on_stop(&mut self, ctx: &mut MacroContext) -> MacroResult<()> {
        self.on_abort(ctx).await
    }

    /// Called once when the macro parks at a pause point.
    async fn on_pause(&mut self, _ctx: &mut MacroContext) -> MacroResult<()> {
        Ok(())
    }
}

/// Helper for tasks written as a fixed list of outcomes, useful in tests.
pub struct ScriptedTask {
    outcomes: VecDeque<StepOutcome>,
}

impl ScriptedTask {
    /// Build a task that yields the given outcomes in order, then `Done`.
    pub fn new(outcomes: Vec<StepOutcome>) -> Self {
        Self {
            outcomes: outcomes.into(),
        }
    }
}

#[async_trait]
impl MacroTask for ScriptedTask {
    async fn step(&mut self, _ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        Ok(self
            .outcomes
            .pop_front()
            .unwrap_or(StepOutcome::Done(None)))
    }
}
