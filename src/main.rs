//! `macroserver` CLI: run a macro against a demo session and print the
//! event stream.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use rust_macroserver::config::EngineSettings;
use rust_macroserver::door::{BroadcastDoor, DoorEvent};
use rust_macroserver::element::mock::MockElement;
use rust_macroserver::element::ElementRegistry;
use rust_macroserver::env::EnvironmentStore;
use rust_macroserver::executor::{MacroExecutor, SessionContext};
use rust_macroserver::registry::MacroRegistry;
use rust_macroserver::status::ExecutorState;
use rust_macroserver::stdlib::StandardLibrary;
use rust_macroserver::types::TypeRegistry;

#[derive(Parser, Debug)]
#[command(name = "macroserver", about = "Run a macro against a demo session")]
struct Cli {
    /// Macro command: name followed by its parameter tokens.
    #[arg(required_unless_present = "list")]
    command: Vec<String>,

    /// List the available macros and exit.
    #[arg(long)]
    list: bool,

    /// Environment presets, `KEY=VALUE` (VALUE parsed as JSON when possible).
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = EngineSettings::load()?;

    let door = Arc::new(BroadcastDoor::new(settings.door_channel_capacity));
    let session = demo_session(door.clone());
    for preset in &cli.env {
        let (key, raw) = preset
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid --env '{preset}', expected KEY=VALUE"))?;
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        session.environment.set(key, value);
    }

    if cli.list {
        for name in session.registry.macro_names() {
            let record = session.registry.get_macro(&name)?;
            println!("{name:<12} {}", record.definition.description);
        }
        return Ok(());
    }

    let mut events = door.subscribe();

    let executor = MacroExecutor::new(session, &settings);
    info!(command = ?cli.command, "Submitting");
    let handle = executor.run_tokens(&cli.command)?;

    loop {
        match events.recv().await? {
            DoorEvent::Output { line } => println!("{line}"),
            DoorEvent::MacroStatus { status } => {
                println!(
                    "  [{} {}] step {:.1} of {:.1}..{:.1}",
                    status.id, status.event, status.step, status.range.0, status.range.1
                );
            }
            DoorEvent::Result { values } => println!("result: {}", values.join(", ")),
            DoorEvent::RecordData { payload, .. } => println!("record: {payload}"),
            DoorEvent::State { state } => {
                println!("state: {state}");
                if matches!(state, ExecutorState::Finished | ExecutorState::Abort) {
                    break;
                }
            }
        }
    }

    let state = handle.wait().await?;
    std::process::exit(match state {
        ExecutorState::Finished => 0,
        _ => 1,
    });
}

fn demo_session(door: Arc<BroadcastDoor>) -> SessionContext {
    let elements = Arc::new(ElementRegistry::new());
    for name in ["mot01", "mot02", "mot03", "mot04"] {
        elements.register(Arc::new(MockElement::new(name, "Motor")));
    }
    for name in ["ct01", "ct02"] {
        elements.register(Arc::new(MockElement::new(name, "Counter")));
    }

    let types = Arc::new(TypeRegistry::with_builtins());
    types.register_element_kinds(&["Motor", "Counter"], &elements);

    let registry = Arc::new(MacroRegistry::new());
    registry.set_sources(vec![Arc::new(StandardLibrary)]);

    SessionContext {
        registry,
        types,
        elements,
        environment: Arc::new(EnvironmentStore::new()),
        door,
    }
}
