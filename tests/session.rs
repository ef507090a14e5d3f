//! End-to-end session tests: a full executor driven through the broadcast
//! door, exercising status ordering, interruption, pause/resume, hooks and
//! sub-macros.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use rust_macroserver::config::EngineSettings;
use rust_macroserver::door::{BroadcastDoor, DoorEvent};
use rust_macroserver::element::mock::MockElement;
use rust_macroserver::element::ElementRegistry;
use rust_macroserver::env::EnvironmentStore;
use rust_macroserver::executor::{MacroExecutor, SessionContext};
use rust_macroserver::params::ParamSpec;
use rust_macroserver::registry::{
    MacroDefinition, MacroLibrarySource, MacroRecord, MacroRegistry,
};
use rust_macroserver::status::{ExecutorState, MacroStatus, StatusEvent};
use rust_macroserver::stdlib::StandardLibrary;
use rust_macroserver::task::{MacroContext, MacroTask, Progress, StepOutcome};
use rust_macroserver::types::TypeRegistry;
use rust_macroserver::MacroResult;

/// Interrupt-handler counters shared between the test and its macros.
#[derive(Default)]
struct Hits {
    aborts: AtomicUsize,
    stops: AtomicUsize,
}

/// `looper <steps> [<motor>]`: progress steps with interruptible sleeps.
struct LooperTask {
    hits: Arc<Hits>,
    total: i64,
    done: i64,
}

#[async_trait]
impl MacroTask for LooperTask {
    async fn prepare(&mut self, ctx: &mut MacroContext) -> MacroResult<()> {
        self.total = ctx.param(0)?.as_integer()?;
        Ok(())
    }

    async fn step(&mut self, ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        if self.done >= self.total {
            return Ok(StepOutcome::Done(None));
        }
        ctx.check_point()?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.done += 1;
        Ok(StepOutcome::Progress(Progress::with_range(
            self.done as f64,
            0.0,
            self.total as f64,
        )))
    }

    async fn on_abort(&mut self, _ctx: &mut MacroContext) -> MacroResult<()> {
        self.hits.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &mut MacroContext) -> MacroResult<()> {
        self.hits.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// `pauser <steps>`: a pause point before every progress step.
struct PauserTask {
    total: i64,
    done: i64,
    at_pause_point: bool,
}

#[async_trait]
impl MacroTask for PauserTask {
    async fn prepare(&mut self, ctx: &mut MacroContext) -> MacroResult<()> {
        self.total = ctx.param(0)?.as_integer()?;
        Ok(())
    }

    async fn step(&mut self, ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        if self.done >= self.total {
            return Ok(StepOutcome::Done(None));
        }
        if !self.at_pause_point {
            self.at_pause_point = true;
            return Ok(StepOutcome::Pause { timeout: None });
        }
        self.at_pause_point = false;
        ctx.check_point()?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.done += 1;
        Ok(StepOutcome::Progress(Progress::with_range(
            self.done as f64,
            0.0,
            self.total as f64,
        )))
    }
}

/// `stepscan <points>`: runs `post-step` hooks after each point.
struct StepScanTask {
    points: i64,
    done: i64,
    hook_pending: bool,
}

#[async_trait]
impl MacroTask for StepScanTask {
    async fn prepare(&mut self, ctx: &mut MacroContext) -> MacroResult<()> {
        self.points = ctx.param(0)?.as_integer()?;
        Ok(())
    }

    async fn step(&mut self, ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        if self.hook_pending {
            self.hook_pending = false;
            return Ok(StepOutcome::RunHooks {
                place: "post-step".to_string(),
            });
        }
        if self.done >= self.points {
            return Ok(StepOutcome::Done(None));
        }
        ctx.check_point()?;
        self.done += 1;
        self.hook_pending = true;
        Ok(StepOutcome::Progress(Progress::with_range(
            self.done as f64,
            0.0,
            self.points as f64,
        )))
    }
}

/// `producer`: finishes immediately with a result.
struct ProducerTask;

#[async_trait]
impl MacroTask for ProducerTask {
    async fn step(&mut self, _ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        Ok(StepOutcome::Done(Some(vec!["7".to_string()])))
    }
}

/// `caller`: runs `producer` as a sub-macro and forwards its result.
struct CallerTask {
    called: bool,
}

#[async_trait]
impl MacroTask for CallerTask {
    async fn step(&mut self, ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        if !self.called {
            self.called = true;
            return Ok(StepOutcome::RunMacro {
                tokens: vec!["producer".to_string()],
            });
        }
        Ok(StepOutcome::Done(ctx.take_sub_result()))
    }
}

struct TestLibrary {
    hits: Arc<Hits>,
}

impl MacroLibrarySource for TestLibrary {
    fn name(&self) -> &str {
        "testlib"
    }

    fn load(&self) -> anyhow::Result<Vec<MacroRecord>> {
        let hits = self.hits.clone();
        Ok(vec![
            MacroRecord::new(
                MacroDefinition::new("looper")
                    .with_param(ParamSpec::scalar("steps", "Integer"))
                    .with_param(
                        ParamSpec::repeat("motors", vec![ParamSpec::scalar("motor", "Motor")])
                            .with_bounds(0, None),
                    ),
                Arc::new(move || {
                    Box::new(LooperTask {
                        hits: hits.clone(),
                        total: 0,
                        done: 0,
                    })
                }),
            ),
            MacroRecord::new(
                MacroDefinition::new("pauser")
                    .with_param(ParamSpec::scalar("steps", "Integer")),
                Arc::new(|| {
                    Box::new(PauserTask {
                        total: 0,
                        done: 0,
                        at_pause_point: false,
                    })
                }),
            ),
            MacroRecord::new(
                MacroDefinition::new("stepscan")
                    .with_param(ParamSpec::scalar("points", "Integer"))
                    .with_hint("allowsHooks", vec!["post-step".to_string()]),
                Arc::new(|| {
                    Box::new(StepScanTask {
                        points: 0,
                        done: 0,
                        hook_pending: false,
                    })
                }),
            ),
            MacroRecord::new(
                MacroDefinition::new("producer")
                    .with_result(ParamSpec::scalar("value", "Integer")),
                Arc::new(|| Box::new(ProducerTask)),
            ),
            MacroRecord::new(
                MacroDefinition::new("caller")
                    .with_result(ParamSpec::scalar("value", "Integer")),
                Arc::new(|| Box::new(CallerTask { called: false })),
            ),
        ])
    }
}

struct Session {
    executor: MacroExecutor,
    events: broadcast::Receiver<DoorEvent>,
    hits: Arc<Hits>,
    motor: Arc<MockElement>,
}

fn session() -> Session {
    let hits = Arc::new(Hits::default());
    let motor = Arc::new(MockElement::new("mot01", "Motor"));

    let elements = Arc::new(ElementRegistry::new());
    elements.register(motor.clone());
    let types = Arc::new(TypeRegistry::with_builtins());
    types.register_element_kinds(&["Motor"], &elements);
    let registry = Arc::new(MacroRegistry::new());
    registry.set_sources(vec![
        Arc::new(StandardLibrary),
        Arc::new(TestLibrary { hits: hits.clone() }),
    ]);

    let door = Arc::new(BroadcastDoor::new(1024));
    let events = door.subscribe();
    let context = SessionContext {
        registry,
        types,
        elements,
        environment: Arc::new(EnvironmentStore::new()),
        door,
    };
    Session {
        executor: MacroExecutor::new(context, &EngineSettings::default()),
        events,
        hits,
        motor,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<DoorEvent>) -> DoorEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a door event")
        .expect("door channel closed")
}

async fn wait_for_state(rx: &mut broadcast::Receiver<DoorEvent>, wanted: ExecutorState) {
    loop {
        if let DoorEvent::State { state } = next_event(rx).await {
            if state == wanted {
                return;
            }
        }
    }
}

async fn wait_for_status(
    rx: &mut broadcast::Receiver<DoorEvent>,
    wanted: StatusEvent,
) -> MacroStatus {
    loop {
        if let DoorEvent::MacroStatus { status } = next_event(rx).await {
            if status.event == wanted {
                return status;
            }
        }
    }
}

/// Drain remaining events after the job's terminal state, returning all
/// collected status records.
async fn collect_statuses(
    rx: &mut broadcast::Receiver<DoorEvent>,
) -> (Vec<MacroStatus>, ExecutorState) {
    let mut statuses = Vec::new();
    loop {
        match next_event(rx).await {
            DoorEvent::MacroStatus { status } => statuses.push(status),
            DoorEvent::State { state }
                if matches!(state, ExecutorState::Finished | ExecutorState::Abort) =>
            {
                return (statuses, state)
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn status_ordering_start_steps_single_terminal() {
    let mut s = session();
    let handle = s.executor.run_tokens(&["looper", "3"]).unwrap();

    let (statuses, state) = collect_statuses(&mut s.events).await;
    assert_eq!(state, ExecutorState::Finished);
    assert_eq!(handle.wait().await.unwrap(), ExecutorState::Finished);

    assert_eq!(statuses.first().map(|st| st.event), Some(StatusEvent::Start));
    let steps: Vec<f64> = statuses
        .iter()
        .filter(|st| st.event == StatusEvent::Step)
        .map(|st| st.step)
        .collect();
    assert_eq!(steps, vec![1.0, 2.0, 3.0]);
    let terminals: Vec<StatusEvent> = statuses
        .iter()
        .map(|st| st.event)
        .filter(|e| e.is_terminal())
        .collect();
    assert_eq!(terminals, vec![StatusEvent::Finish]);
    assert_eq!(statuses.last().map(|st| st.event), Some(StatusEvent::Finish));
}

#[tokio::test]
async fn submission_and_prepare_failures_have_no_side_effects() {
    let mut s = session();
    // "abc" fails Integer decoding synchronously, nothing is enqueued.
    assert!(s.executor.run_tokens(&["looper", "abc"]).is_err());

    // ct requires ActiveMntGrp; absent, it fails before starting.
    let handle = s.executor.run_tokens(&["ct", "0.1"]).unwrap();
    let (statuses, state) = collect_statuses(&mut s.events).await;
    assert_eq!(state, ExecutorState::Abort);
    assert_eq!(handle.wait().await.unwrap(), ExecutorState::Abort);

    // The missing env key failed the macro before it started: no status
    // records at all, and nothing left reserved.
    assert!(statuses.is_empty());
    assert!(s.executor.reservations_empty());
}

#[tokio::test]
async fn exception_status_carries_error_envelope() {
    let mut s = session();
    // senv with a bad schema cannot fail at runtime; use a sub-macro
    // calling an unknown macro, which surfaces as the caller's failure.
    struct BadCaller;

    #[async_trait]
    impl MacroTask for BadCaller {
        async fn step(&mut self, _ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
            Ok(StepOutcome::RunMacro {
                tokens: vec!["no_such_macro".to_string()],
            })
        }
    }

    struct BadLib;
    impl MacroLibrarySource for BadLib {
        fn name(&self) -> &str {
            "badlib"
        }
        fn load(&self) -> anyhow::Result<Vec<MacroRecord>> {
            Ok(vec![MacroRecord::new(
                MacroDefinition::new("badcaller"),
                Arc::new(|| Box::new(BadCaller)),
            )])
        }
    }

    s.executor.session().registry.set_sources(vec![
        Arc::new(TestLibrary {
            hits: s.hits.clone(),
        }),
        Arc::new(BadLib),
    ]);

    let handle = s.executor.run_tokens(&["badcaller"]).unwrap();
    let (statuses, state) = collect_statuses(&mut s.events).await;
    assert_eq!(state, ExecutorState::Abort);
    handle.wait().await.unwrap();

    let exception = statuses
        .iter()
        .find(|st| st.event == StatusEvent::Exception)
        .expect("exception status");
    assert_eq!(exception.exc_type.as_deref(), Some("UnknownMacro"));
    assert!(exception
        .exc_value
        .as_deref()
        .unwrap_or_default()
        .contains("no_such_macro"));
}

#[tokio::test]
async fn pause_resume_callbacks_pair_exactly_once() {
    let mut s = session();
    let handle = s.executor.run_tokens(&["pauser", "5"]).unwrap();
    wait_for_state(&mut s.events, ExecutorState::Running).await;
    wait_for_status(&mut s.events, StatusEvent::Step).await;

    s.executor.pause();
    let paused = wait_for_status(&mut s.events, StatusEvent::Pause).await;
    wait_for_state(&mut s.events, ExecutorState::Paused).await;

    s.executor.resume();
    wait_for_status(&mut s.events, StatusEvent::Resume).await;
    wait_for_state(&mut s.events, ExecutorState::Running).await;

    let (statuses, state) = collect_statuses(&mut s.events).await;
    assert_eq!(state, ExecutorState::Finished);
    assert_eq!(handle.wait().await.unwrap(), ExecutorState::Finished);

    // No duplicate pause/resume records after the pair above.
    assert!(statuses
        .iter()
        .all(|st| st.event != StatusEvent::Pause && st.event != StatusEvent::Resume));
    assert_eq!(paused.id, statuses.last().map(|st| st.id).unwrap_or(0));
}

#[tokio::test]
async fn pause_requested_during_sibling_pairs_on_next_macro() {
    let mut s = session();
    let seq = rust_macroserver::Sequence {
        macros: vec![
            rust_macroserver::SequenceNode::new("looper").with_param("3").with_id(40),
            rust_macroserver::SequenceNode::new("pauser").with_param("2").with_id(41),
        ],
    };
    let handle = s.executor.run(seq).unwrap();

    // The pause lands while looper (no pause points) is running; it
    // carries over to pauser, which parks at its first pause point and
    // must emit the pause record and the Paused state there.
    let first = wait_for_status(&mut s.events, StatusEvent::Step).await;
    assert_eq!(first.id, 40);
    s.executor.pause();

    let paused = wait_for_status(&mut s.events, StatusEvent::Pause).await;
    assert_eq!(paused.id, 41);
    wait_for_state(&mut s.events, ExecutorState::Paused).await;

    s.executor.resume();
    let resumed = wait_for_status(&mut s.events, StatusEvent::Resume).await;
    assert_eq!(resumed.id, 41);

    let (statuses, state) = collect_statuses(&mut s.events).await;
    assert_eq!(state, ExecutorState::Finished);
    assert_eq!(handle.wait().await.unwrap(), ExecutorState::Finished);

    // Exactly the one pause/resume pair above, nothing unpaired after.
    assert!(statuses
        .iter()
        .all(|st| st.event != StatusEvent::Pause && st.event != StatusEvent::Resume));
}

#[tokio::test]
async fn abort_interrupts_step_and_skips_siblings() {
    let mut s = session();
    let seq = rust_macroserver::Sequence {
        macros: vec![
            rust_macroserver::SequenceNode::new("looper")
                .with_params(["100", "mot01"])
                .with_id(10),
            rust_macroserver::SequenceNode::new("looper").with_param("1").with_id(11),
        ],
    };
    let handle = s.executor.run(seq).unwrap();
    wait_for_status(&mut s.events, StatusEvent::Step).await;

    s.executor.abort();
    let (statuses, state) = collect_statuses(&mut s.events).await;
    assert_eq!(state, ExecutorState::Abort);
    assert_eq!(handle.wait().await.unwrap(), ExecutorState::Abort);

    // The first macro got its abort terminal; the sibling never started.
    let terminal = statuses
        .iter()
        .filter(|st| st.event.is_terminal())
        .collect::<Vec<_>>();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].event, StatusEvent::Abort);
    assert_eq!(terminal[0].id, 10);
    assert!(statuses.iter().all(|st| st.id != 11));

    // on_abort ran exactly once, reservations are gone, the reserved
    // element was interrupted.
    assert_eq!(s.hits.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(s.hits.stops.load(Ordering::SeqCst), 0);
    assert!(s.executor.reservations_empty());
    assert!(s.motor.abort_count() >= 1);
}

#[tokio::test]
async fn stop_is_graceful_and_resumes_paused_macro() {
    let mut s = session();
    let handle = s.executor.run_tokens(&["pauser", "50"]).unwrap();
    wait_for_state(&mut s.events, ExecutorState::Running).await;
    wait_for_status(&mut s.events, StatusEvent::Step).await;

    s.executor.pause();
    wait_for_status(&mut s.events, StatusEvent::Pause).await;

    // Stop on a paused macro: the gate reopens (resume record), then the
    // stop lands at the next guard.
    s.executor.stop();
    wait_for_status(&mut s.events, StatusEvent::Resume).await;
    let (statuses, state) = collect_statuses(&mut s.events).await;
    assert_eq!(state, ExecutorState::Abort);
    assert_eq!(handle.wait().await.unwrap(), ExecutorState::Abort);

    let terminal: Vec<StatusEvent> = statuses
        .iter()
        .map(|st| st.event)
        .filter(|e| e.is_terminal())
        .collect();
    assert_eq!(terminal, vec![StatusEvent::Stop]);
}

#[tokio::test]
async fn stop_prefers_element_stop_over_abort() {
    let mut s = session();
    let handle = s.executor.run_tokens(&["looper", "100", "mot01"]).unwrap();
    wait_for_status(&mut s.events, StatusEvent::Step).await;

    s.executor.stop();
    let (_statuses, state) = collect_statuses(&mut s.events).await;
    assert_eq!(state, ExecutorState::Abort);
    handle.wait().await.unwrap();

    assert!(s.motor.stop_count() >= 1);
    assert_eq!(s.motor.abort_count(), 0);
    assert_eq!(s.hits.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hooks_run_at_their_place_between_parent_steps() {
    let mut s = session();
    let seq = rust_macroserver::Sequence::single(
        rust_macroserver::SequenceNode::new("stepscan")
            .with_param("2")
            .with_id(20)
            .with_hook(
                rust_macroserver::SequenceNode::new("sleep")
                    .with_param("0.01")
                    .with_id(21),
                ["post-step"],
            ),
    );
    let handle = s.executor.run(seq).unwrap();
    let (statuses, state) = collect_statuses(&mut s.events).await;
    assert_eq!(state, ExecutorState::Finished);
    assert_eq!(handle.wait().await.unwrap(), ExecutorState::Finished);

    // Two hook executions, each a full start..finish cycle for id 21,
    // interleaved after the parent's step records.
    let hook_finishes = statuses
        .iter()
        .filter(|st| st.id == 21 && st.event == StatusEvent::Finish)
        .count();
    assert_eq!(hook_finishes, 2);

    let sequence_of_21: Vec<StatusEvent> = statuses
        .iter()
        .filter(|st| st.id == 21)
        .map(|st| st.event)
        .collect();
    assert_eq!(sequence_of_21.first(), Some(&StatusEvent::Start));

    // The parent finishes after the last hook finishes.
    let parent_finish = statuses
        .iter()
        .position(|st| st.id == 20 && st.event == StatusEvent::Finish)
        .expect("parent finish");
    let last_hook = statuses
        .iter()
        .rposition(|st| st.id == 21)
        .expect("hook status");
    assert!(parent_finish > last_hook);
}

#[tokio::test]
async fn submacro_result_flows_back_to_caller() {
    let mut s = session();
    let handle = s.executor.run_tokens(&["caller"]).unwrap();

    let mut result = None;
    let mut state = None;
    loop {
        match next_event(&mut s.events).await {
            DoorEvent::Result { values } => result = Some(values),
            DoorEvent::State { state: st }
                if matches!(st, ExecutorState::Finished | ExecutorState::Abort) =>
            {
                state = Some(st);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(state, Some(ExecutorState::Finished));
    assert_eq!(handle.wait().await.unwrap(), ExecutorState::Finished);
    // Only the top-level caller forwards a Result event.
    assert_eq!(result, Some(vec!["7".to_string()]));
}

#[tokio::test]
async fn sibling_macros_share_one_job() {
    let mut s = session();
    let seq = rust_macroserver::Sequence {
        macros: vec![
            rust_macroserver::SequenceNode::new("looper").with_param("1").with_id(30),
            rust_macroserver::SequenceNode::new("looper").with_param("1").with_id(31),
        ],
    };
    let handle = s.executor.run(seq).unwrap();
    let (statuses, state) = collect_statuses(&mut s.events).await;
    assert_eq!(state, ExecutorState::Finished);
    assert_eq!(handle.wait().await.unwrap(), ExecutorState::Finished);

    for id in [30, 31] {
        let events: Vec<StatusEvent> = statuses
            .iter()
            .filter(|st| st.id == id)
            .map(|st| st.event)
            .collect();
        assert_eq!(
            events,
            vec![StatusEvent::Start, StatusEvent::Step, StatusEvent::Finish]
        );
    }
}
