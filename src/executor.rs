//! The macro executor: session context, scheduling, and the driving worker.
//!
//! One [`MacroExecutor`] serves one session. `run()` validates macro names
//! and decodes all parameters synchronously, so definition and parameter
//! errors fail the submission with no side effects; accepted trees are
//! queued on a job channel consumed by a single dedicated worker task, which
//! keeps jobs strictly sequential.
//!
//! `abort()` and `stop()` spawn short background tasks that flip the shared
//! flags, interrupt the running macro's control primitives and call
//! best-effort `abort`/`stop` on every reserved element; the worker observes
//! the flags cooperatively. `pause()`/`resume()` request a gate transition
//! and return; the completion callbacks fire inside the worker, at the
//! macro's next pause point.
//!
//! # Status contract
//!
//! Every started instance emits a `start` record, zero or more `step`
//! (and paired `pause`/`resume`) records, and exactly one terminal record
//! (`finish`, `stop`, `abort` or `exception`). The terminal session state of
//! a job is exactly one of `Finished` or `Abort`, reported through the door.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::door::Door;
use crate::element::{Element, ElementRegistry};
use crate::env::EnvironmentStore;
use crate::error::{MacroError, MacroResult};
use crate::params::decode;
use crate::registry::{MacroRecord, MacroRegistry};
use crate::sequence::{Sequence, SequenceNode};
use crate::status::{ExecutorState, MacroState, MacroStatus, StatusEvent};
use crate::task::{ControlFlags, Interrupt, MacroContext, PauseGate, StepOutcome};
use crate::types::{ParamValue, TypeRegistry};

/// Everything a session shares: registries, environment and the door.
/// Constructed explicitly, passed by `Arc`-cloning; one per session.
#[derive(Clone)]
pub struct SessionContext {
    /// Macro registry.
    pub registry: Arc<MacroRegistry>,
    /// Parameter type registry.
    pub types: Arc<TypeRegistry>,
    /// Element registry.
    pub elements: Arc<ElementRegistry>,
    /// Environment store.
    pub environment: Arc<EnvironmentStore>,
    /// Client event sink.
    pub door: Arc<dyn Door>,
}

/// A fully validated macro invocation, ready to run.
struct PlannedMacro {
    id: i64,
    record: MacroRecord,
    params: Vec<ParamValue>,
    macro_line: String,
    hooks: Vec<PlannedHook>,
}

struct PlannedHook {
    places: Vec<String>,
    node: PlannedMacro,
}

/// Elements reserved by running macros, keyed by instance id.
///
/// Mutated only by the worker; control paths take snapshots. Stop-first
/// elements sort ahead within each macro's reservation list. The
/// element-centric view (which elements are held, across all macros) is
/// derived on demand by `snapshot`/`element_names`; no reverse map is kept.
#[derive(Default)]
struct ReservationTable {
    by_macro: HashMap<i64, Vec<Arc<dyn Element>>>,
}

impl ReservationTable {
    /// Record a reservation. Returns false when this macro already holds
    /// the element.
    fn reserve(&mut self, macro_id: i64, element: Arc<dyn Element>) -> bool {
        let entry = self.by_macro.entry(macro_id).or_default();
        if entry.iter().any(|e| e.name() == element.name()) {
            return false;
        }
        if element.stop_first() {
            entry.insert(0, element);
        } else {
            entry.push(element);
        }
        true
    }

    fn release(&mut self, macro_id: i64) -> Vec<Arc<dyn Element>> {
        self.by_macro.remove(&macro_id).unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Element>> {
        let mut all: Vec<Arc<dyn Element>> = Vec::new();
        for elements in self.by_macro.values() {
            for element in elements {
                if !all.iter().any(|e| e.name() == element.name()) {
                    all.push(element.clone());
                }
            }
        }
        all.sort_by_key(|e| !e.stop_first());
        all
    }

    fn is_empty(&self) -> bool {
        self.by_macro.is_empty()
    }

    fn element_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_macro
            .values()
            .flatten()
            .map(|e| e.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Live handle to the deepest currently running instance.
#[derive(Clone)]
struct RunningHandle {
    id: i64,
    name: String,
    flags: Arc<ControlFlags>,
    gate: Arc<PauseGate>,
    status: Arc<Mutex<MacroStatus>>,
    state: Arc<Mutex<MacroState>>,
}

struct ExecutorShared {
    door: Arc<dyn Door>,
    state: watch::Sender<ExecutorState>,
    aborted: AtomicBool,
    stopped: AtomicBool,
    paused: AtomicBool,
    running: Mutex<Option<RunningHandle>>,
    reservations: Mutex<ReservationTable>,
    next_id: AtomicI64,
}

impl ExecutorShared {
    fn set_state(&self, state: ExecutorState) {
        self.state.send_replace(state);
        self.door.send_state(state);
    }

    fn running_handle(&self) -> Option<RunningHandle> {
        self.running.lock().ok().and_then(|g| g.clone())
    }

    fn emit_status(&self, status: &Arc<Mutex<MacroStatus>>, event: StatusEvent) {
        if let Ok(mut guard) = status.lock() {
            guard.event = event;
            self.door.send_macro_status(&guard);
        }
    }

    fn pending_interrupt(&self, err: &MacroError) -> Option<Interrupt> {
        if self.aborted.load(Ordering::SeqCst) {
            Some(Interrupt::Abort)
        } else if self.stopped.load(Ordering::SeqCst) {
            Some(Interrupt::Stop)
        } else {
            match err {
                MacroError::Aborted(_) => Some(Interrupt::Abort),
                MacroError::Stopped(_) => Some(Interrupt::Stop),
                _ => None,
            }
        }
    }
}

struct Job {
    run_id: Uuid,
    planned: Vec<PlannedMacro>,
    done: oneshot::Sender<ExecutorState>,
}

/// Completion handle of one accepted submission.
pub struct RunHandle {
    /// Identifier of this run.
    pub run_id: Uuid,
    done: oneshot::Receiver<ExecutorState>,
}

impl RunHandle {
    /// Wait for the job's terminal state.
    pub async fn wait(self) -> MacroResult<ExecutorState> {
        self.done.await.map_err(|_| MacroError::SessionClosed)
    }
}

/// The per-session macro executor.
pub struct MacroExecutor {
    session: SessionContext,
    shared: Arc<ExecutorShared>,
    jobs: mpsc::Sender<Job>,
}

impl MacroExecutor {
    /// Create an executor and spawn its worker. Must be called inside a
    /// tokio runtime.
    pub fn new(session: SessionContext, settings: &EngineSettings) -> Self {
        let (state, _) = watch::channel(ExecutorState::Idle);
        let shared = Arc::new(ExecutorShared {
            door: session.door.clone(),
            state,
            aborted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            running: Mutex::new(None),
            reservations: Mutex::new(ReservationTable::default()),
            next_id: AtomicI64::new(-1),
        });

        let (jobs, job_rx) = mpsc::channel(settings.job_queue_capacity);
        let worker = Worker {
            session: session.clone(),
            shared: shared.clone(),
        };
        tokio::spawn(worker.run_loop(job_rx));

        Self {
            session,
            shared,
            jobs,
        }
    }

    /// Current session-level executor state.
    pub fn state(&self) -> ExecutorState {
        *self.shared.state.borrow()
    }

    /// Id, name and state of the deepest running macro, if any.
    pub fn running_macro(&self) -> Option<(i64, String, MacroState)> {
        let handle = self.shared.running_handle()?;
        let state = handle.state.lock().ok().map(|s| *s)?;
        Some((handle.id, handle.name, state))
    }

    /// Names of all currently reserved elements. Empty whenever no macro is
    /// running.
    pub fn reserved_element_names(&self) -> Vec<String> {
        self.shared
            .reservations
            .lock()
            .map(|t| t.element_names())
            .unwrap_or_default()
    }

    /// True when no element reservation is outstanding.
    pub fn reservations_empty(&self) -> bool {
        self.shared
            .reservations
            .lock()
            .map(|t| t.is_empty())
            .unwrap_or(true)
    }

    /// Submit a macro tree. Macro names are validated and all parameters
    /// decoded here, synchronously; errors fail the submission with no side
    /// effects. Accepted jobs run strictly after previously accepted ones.
    #[instrument(skip(self, sequence), err)]
    pub fn run(&self, sequence: Sequence) -> MacroResult<RunHandle> {
        if sequence.macros.is_empty() {
            return Err(MacroError::WrongParam("empty sequence".to_string()));
        }
        let mut planned = Vec::with_capacity(sequence.macros.len());
        for node in &sequence.macros {
            planned.push(plan_node(&self.session, &self.shared.next_id, node)?);
        }

        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, macros = planned.len(), "Submitting macro job");

        let (done, rx) = oneshot::channel();
        self.jobs
            .try_send(Job {
                run_id,
                planned,
                done,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    MacroError::InvalidState("job queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => MacroError::SessionClosed,
            })?;

        Ok(RunHandle { run_id, done: rx })
    }

    /// Submit a single macro from flat tokens (name first).
    pub fn run_tokens<S: AsRef<str>>(&self, tokens: &[S]) -> MacroResult<RunHandle> {
        self.run(Sequence::from_tokens(tokens)?)
    }

    /// Request immediate interruption of the running job. Returns at once;
    /// the interruption proceeds in the background.
    pub fn abort(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            info!("Abort requested");
            shared.aborted.store(true, Ordering::SeqCst);
            if let Some(handle) = shared.running_handle() {
                handle.flags.abort();
                handle.gate.release_for_interrupt();
            }
            let elements = shared
                .reservations
                .lock()
                .map(|t| t.snapshot())
                .unwrap_or_default();
            for element in elements {
                if let Err(e) = element.abort().await {
                    warn!(element = element.name(), error = %e, "Element abort failed");
                }
            }
        });
    }

    /// Request graceful interruption of the running job. A paused macro is
    /// first resumed so it can observe the stop.
    pub fn stop(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            info!("Stop requested");
            shared.stopped.store(true, Ordering::SeqCst);
            if let Some(handle) = shared.running_handle() {
                handle.flags.stop();
                if handle.gate.is_paused() {
                    let cb_shared = shared.clone();
                    let cb_status = handle.status.clone();
                    handle.gate.resume(Some(Box::new(move || {
                        cb_shared.emit_status(&cb_status, StatusEvent::Resume);
                        cb_shared.set_state(ExecutorState::Running);
                    })));
                    shared.paused.store(false, Ordering::SeqCst);
                }
            }
            let elements = shared
                .reservations
                .lock()
                .map(|t| t.snapshot())
                .unwrap_or_default();
            for element in elements {
                if let Err(e) = element.stop().await {
                    warn!(element = element.name(), error = %e, "Element stop failed");
                }
            }
        });
    }

    /// Request a pause. Honored at the running macro's next pause point;
    /// the paired status record and the `Paused` state are emitted when the
    /// worker actually parks.
    pub fn pause(&self) {
        if self.state() != ExecutorState::Running {
            warn!(state = %self.state(), "Ignoring pause request");
            return;
        }
        self.shared.paused.store(true, Ordering::SeqCst);
        if let Some(handle) = self.shared.running_handle() {
            let cb_shared = self.shared.clone();
            let cb_status = handle.status.clone();
            let cb_state = handle.state.clone();
            handle.gate.pause(Some(Box::new(move || {
                if let Ok(mut state) = cb_state.lock() {
                    *state = MacroState::Paused;
                }
                cb_shared.emit_status(&cb_status, StatusEvent::Pause);
                cb_shared.set_state(ExecutorState::Paused);
            })));
        }
    }

    /// Release a pause. The paired status record and the `Running` state
    /// are emitted when the worker actually resumes.
    pub fn resume(&self) {
        if !self.shared.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.shared.running_handle() {
            let cb_shared = self.shared.clone();
            let cb_status = handle.status.clone();
            let cb_state = handle.state.clone();
            handle.gate.resume(Some(Box::new(move || {
                if let Ok(mut state) = cb_state.lock() {
                    *state = MacroState::Running;
                }
                cb_shared.emit_status(&cb_status, StatusEvent::Resume);
                cb_shared.set_state(ExecutorState::Running);
            })));
        }
    }

    /// The session context this executor drives.
    pub fn session(&self) -> &SessionContext {
        &self.session
    }
}

/// Validate one node and its hooks, assigning internal ids where needed.
fn plan_node(
    session: &SessionContext,
    next_id: &AtomicI64,
    node: &SequenceNode,
) -> MacroResult<PlannedMacro> {
    let record = session.registry.get_macro(&node.name)?;
    let params = decode(&record.definition.params, &node.params, &session.types)?;
    let id = node
        .id
        .unwrap_or_else(|| next_id.fetch_sub(1, Ordering::SeqCst));

    let mut hooks = Vec::with_capacity(node.hooks.len());
    for hook in &node.hooks {
        // Unknown places are tolerated but flagged; the hook simply
        // never runs.
        let allowed = record.definition.allowed_hook_places();
        if !allowed.is_empty() {
            for place in &hook.places {
                if !allowed.contains(place) {
                    warn!(
                        hook = %hook.node.name,
                        place = %place,
                        parent = %record.definition.name,
                        "Hook place not advertised by parent"
                    );
                }
            }
        }
        hooks.push(PlannedHook {
            places: hook.places.clone(),
            node: plan_node(session, next_id, &hook.node)?,
        });
    }

    Ok(PlannedMacro {
        id,
        record,
        params,
        macro_line: node.macro_line(),
        hooks,
    })
}

fn reserve_params(table: &mut ReservationTable, macro_id: i64, params: &[ParamValue]) {
    for value in params {
        match value {
            ParamValue::Element(element) => {
                if table.reserve(macro_id, element.clone()) {
                    element.reserve();
                }
            }
            ParamValue::Seq(inner) => reserve_params(table, macro_id, inner),
            _ => {}
        }
    }
}

/// The dedicated worker driving jobs one at a time.
struct Worker {
    session: SessionContext,
    shared: Arc<ExecutorShared>,
}

impl Worker {
    async fn run_loop(self, mut jobs: mpsc::Receiver<Job>) {
        while let Some(job) = jobs.recv().await {
            let state = self.run_job(&job.planned, job.run_id).await;
            let _ = job.done.send(state);
        }
        debug!("Worker loop finished, session closed");
    }

    #[instrument(skip(self, planned), fields(run_id = %run_id))]
    async fn run_job(&self, planned: &[PlannedMacro], run_id: Uuid) -> ExecutorState {
        self.shared.aborted.store(false, Ordering::SeqCst);
        self.shared.stopped.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.set_state(ExecutorState::Running);

        let mut result = Ok(());
        for macro_node in planned {
            if let Err(e) = self.run_node(macro_node, None).await {
                result = Err(e);
                break;
            }
        }

        let state = match result {
            Ok(()) => {
                info!(run_id = %run_id, "Job finished");
                ExecutorState::Finished
            }
            Err(e) => {
                info!(run_id = %run_id, error = %e, "Job aborted");
                ExecutorState::Abort
            }
        };
        self.shared.set_state(state);
        state
    }

    /// Run one planned macro, depth-first through hooks and sub-macros.
    /// Returns the stringified result values, if any.
    fn run_node<'a>(
        &'a self,
        planned: &'a PlannedMacro,
        parent: Option<i64>,
    ) -> BoxFuture<'a, MacroResult<Option<Vec<String>>>> {
        async move {
            // Between-macros check: nothing new starts once the job is
            // being interrupted.
            if self.shared.aborted.load(Ordering::SeqCst) {
                return Err(MacroError::Aborted(format!(
                    "aborted before {}",
                    planned.macro_line
                )));
            }
            if self.shared.stopped.load(Ordering::SeqCst) {
                return Err(MacroError::Stopped(format!(
                    "stopped before {}",
                    planned.macro_line
                )));
            }

            let definition = &planned.record.definition;
            self.session
                .environment
                .check_required(&definition.required_env)?;

            let mut task = planned.record.instantiate();
            let flags = Arc::new(ControlFlags::new());
            let gate = Arc::new(PauseGate::new());
            let status = Arc::new(Mutex::new(MacroStatus::new(planned.id)));
            let state = Arc::new(Mutex::new(MacroState::Created));

            debug!(id = planned.id, line = %planned.macro_line, "Starting macro");

            if let Ok(mut table) = self.shared.reservations.lock() {
                reserve_params(&mut table, planned.id, &planned.params);
            }

            let handle = RunningHandle {
                id: planned.id,
                name: definition.name.clone(),
                flags: flags.clone(),
                gate: gate.clone(),
                status: status.clone(),
                state: state.clone(),
            };
            let previous = self
                .shared
                .running
                .lock()
                .ok()
                .map(|mut g| g.replace(handle));

            // A session-wide pause requested earlier also parks macros
            // that start afterwards, with the same paired status records
            // a direct pause() request produces.
            if self.shared.paused.load(Ordering::SeqCst) {
                let cb_shared = self.shared.clone();
                let cb_status = status.clone();
                let cb_state = state.clone();
                gate.pause(Some(Box::new(move || {
                    if let Ok(mut s) = cb_state.lock() {
                        *s = MacroState::Paused;
                    }
                    cb_shared.emit_status(&cb_status, StatusEvent::Pause);
                    cb_shared.set_state(ExecutorState::Paused);
                })));
            }

            let mut ctx = MacroContext::new(
                planned.id,
                definition.name.clone(),
                planned.macro_line.clone(),
                parent,
                planned.params.clone(),
                flags.clone(),
                self.session.environment.clone(),
                self.session.door.clone(),
            );

            let prepared = task.prepare(&mut ctx).await;
            let outcome = match prepared {
                Err(e) => {
                    // Never started: no status records for this instance.
                    self.cleanup_node(planned.id, previous);
                    return Err(e);
                }
                Ok(()) => {
                    if let Ok(mut s) = state.lock() {
                        *s = MacroState::Running;
                    }
                    self.shared.emit_status(&status, StatusEvent::Start);
                    self.drive(planned, &mut task, &mut ctx, &flags, &gate, &status)
                        .await
                }
            };

            let result = match outcome {
                DriveOutcome::Finished(result) => {
                    let _ = ctx.flush();
                    if let Ok(mut guard) = status.lock() {
                        guard.step = guard.range.1;
                    }
                    if let Ok(mut s) = state.lock() {
                        *s = MacroState::Finished;
                    }
                    self.shared.emit_status(&status, StatusEvent::Finish);
                    if parent.is_none() && definition.has_result() {
                        let values = result.clone().unwrap_or_default();
                        self.shared.door.send_result(&values);
                    }
                    Ok(result)
                }
                DriveOutcome::Failed { error, from_child } => {
                    let _ = ctx.flush();
                    match self.shared.pending_interrupt(&error) {
                        Some(Interrupt::Abort) => {
                            if !from_child {
                                self.run_interrupt_handler(
                                    &mut task, &mut ctx, &flags, Interrupt::Abort,
                                )
                                .await;
                            }
                            if let Ok(mut s) = state.lock() {
                                *s = MacroState::Aborted;
                            }
                            self.shared.emit_status(&status, StatusEvent::Abort);
                        }
                        Some(Interrupt::Stop) => {
                            if !from_child {
                                self.run_interrupt_handler(
                                    &mut task, &mut ctx, &flags, Interrupt::Stop,
                                )
                                .await;
                            }
                            if let Ok(mut s) = state.lock() {
                                *s = MacroState::Stopped;
                            }
                            self.shared.emit_status(&status, StatusEvent::Stop);
                        }
                        None => {
                            error!(
                                id = planned.id,
                                line = %planned.macro_line,
                                error = %error,
                                "Macro failed"
                            );
                            let record = error.to_record();
                            if let Ok(mut guard) = status.lock() {
                                guard.exc_type = Some(record.exc_type);
                                guard.exc_value = Some(record.message);
                                guard.exc_stack = record.traceback;
                            }
                            if let Ok(mut s) = state.lock() {
                                *s = MacroState::Exception;
                            }
                            self.shared.emit_status(&status, StatusEvent::Exception);
                        }
                    }
                    Err(error)
                }
            };

            self.cleanup_node(planned.id, previous);
            result
        }
        .boxed()
    }

    /// Release reservations and restore the running pointer. Runs on every
    /// exit path of `run_node`.
    fn cleanup_node(&self, macro_id: i64, previous: Option<Option<RunningHandle>>) {
        let released = self
            .shared
            .reservations
            .lock()
            .map(|mut t| t.release(macro_id))
            .unwrap_or_default();
        for element in &released {
            element.unreserve();
        }
        if !released.is_empty() {
            debug!(id = macro_id, count = released.len(), "Released reservations");
        }
        if let (Ok(mut guard), Some(previous)) = (self.shared.running.lock(), previous) {
            *guard = previous;
        }
    }

    async fn drive(
        &self,
        planned: &PlannedMacro,
        task: &mut Box<dyn crate::task::MacroTask>,
        ctx: &mut MacroContext,
        flags: &Arc<ControlFlags>,
        gate: &Arc<PauseGate>,
        status: &Arc<Mutex<MacroStatus>>,
    ) -> DriveOutcome {
        let name = &planned.record.definition.name;
        let mut from_child = false;

        let result: MacroResult<Option<Vec<String>>> = 'drive: loop {
            if let Err(e) = flags.guard(name) {
                break Err(e);
            }
            let outcome = match task.step(ctx).await {
                Ok(outcome) => outcome,
                Err(e) => break Err(e),
            };
            if let Err(e) = flags.guard(name) {
                break Err(e);
            }

            match outcome {
                StepOutcome::Progress(progress) => {
                    if let Ok(mut guard) = status.lock() {
                        if let Some(range) = progress.range {
                            guard.range = range;
                        }
                        guard.step = progress.step;
                    }
                    self.shared.emit_status(status, StatusEvent::Step);
                }
                StepOutcome::Tick => {
                    self.shared.emit_status(status, StatusEvent::Step);
                }
                StepOutcome::RunHooks { place } => {
                    let _ = ctx.flush();
                    for hook in &planned.hooks {
                        let matches = if place.is_empty() {
                            hook.places.is_empty()
                        } else {
                            hook.places.iter().any(|p| p == &place)
                        };
                        if !matches {
                            continue;
                        }
                        if let Err(e) = self.run_node(&hook.node, Some(planned.id)).await {
                            from_child = true;
                            break 'drive Err(e);
                        }
                    }
                }
                StepOutcome::RunMacro { tokens } => {
                    let _ = ctx.flush();
                    let child = match Sequence::from_tokens(&tokens).and_then(|seq| {
                        plan_node(&self.session, &self.shared.next_id, &seq.macros[0])
                    }) {
                        Ok(child) => child,
                        Err(e) => break Err(e),
                    };
                    match self.run_node(&child, Some(planned.id)).await {
                        Ok(result) => ctx.set_sub_result(result),
                        Err(e) => {
                            from_child = true;
                            break Err(e);
                        }
                    }
                }
                StepOutcome::Pause { timeout } => {
                    if gate.is_paused() {
                        if let Err(e) = task.on_pause(ctx).await {
                            warn!(id = planned.id, error = %e, "on_pause failed");
                        }
                    }
                    gate.wait(timeout).await;
                }
                StepOutcome::Done(result) => break Ok(result),
            }
        };

        match result {
            Ok(result) => DriveOutcome::Finished(result),
            Err(error) => DriveOutcome::Failed { error, from_child },
        }
    }

    /// Run on_abort/on_stop with the mAPI guard suspended. Handler errors
    /// are logged and swallowed.
    async fn run_interrupt_handler(
        &self,
        task: &mut Box<dyn crate::task::MacroTask>,
        ctx: &mut MacroContext,
        flags: &Arc<ControlFlags>,
        interrupt: Interrupt,
    ) {
        flags.begin_interrupt_handling();
        let handled = match interrupt {
            Interrupt::Abort => task.on_abort(ctx).await,
            Interrupt::Stop => task.on_stop(ctx).await,
        };
        flags.end_interrupt_handling();
        if let Err(e) = handled {
            warn!(error = %e, "Interrupt handler failed");
        }
    }
}

enum DriveOutcome {
    Finished(Option<Vec<String>>),
    Failed {
        error: MacroError,
        from_child: bool,
    },
}
