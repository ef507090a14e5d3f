//! Built-in macro library.
//!
//! A small set of general-purpose macros every session gets: motion (`mv`),
//! acquisition (`ct`, `sleep`) and environment management (`lsenv`, `senv`,
//! `usenv`). They double as realistic exercise material for the engine:
//! between them they cover element parameters, repeat groups, defaults,
//! required environment keys, hooks, pause points and results.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::MacroResult;
use crate::params::ParamSpec;
use crate::registry::{MacroDefinition, MacroLibrarySource, MacroRecord};
use crate::task::{MacroContext, MacroTask, Progress, StepOutcome};
use crate::types::ParamValue;

const SLEEP_CHUNK: Duration = Duration::from_millis(100);

/// The built-in library source.
pub struct StandardLibrary;

impl MacroLibrarySource for StandardLibrary {
    fn name(&self) -> &str {
        "standard"
    }

    fn load(&self) -> anyhow::Result<Vec<MacroRecord>> {
        Ok(vec![
            MacroRecord::new(
                MacroDefinition::new("sleep")
                    .with_description("Sleep for the given number of seconds")
                    .with_param(ParamSpec::scalar("seconds", "Float")),
                Arc::new(|| Box::new(SleepMacro::default())),
            ),
            MacroRecord::new(
                MacroDefinition::new("mv")
                    .with_description("Move motors to absolute positions")
                    .with_param(ParamSpec::repeat(
                        "moveables",
                        vec![
                            ParamSpec::scalar("motor", "Motor"),
                            ParamSpec::scalar("position", "Float"),
                        ],
                    )),
                Arc::new(|| Box::new(MvMacro::default())),
            ),
            MacroRecord::new(
                MacroDefinition::new("ct")
                    .with_description("Count on the active measurement group")
                    .with_param(
                        ParamSpec::scalar("integ_time", "Float").with_default("1.0"),
                    )
                    .with_result(ParamSpec::scalar("counts", "Float"))
                    .with_hint(
                        "allowsHooks",
                        vec!["pre-acq".to_string(), "post-acq".to_string()],
                    )
                    .with_required_env("ActiveMntGrp"),
                Arc::new(|| Box::new(CtMacro::default())),
            ),
            MacroRecord::new(
                MacroDefinition::new("lsenv")
                    .with_description("List the session environment"),
                Arc::new(|| Box::new(LsEnvMacro)),
            ),
            MacroRecord::new(
                MacroDefinition::new("senv")
                    .with_description("Set one environment key")
                    .with_param(ParamSpec::scalar("name", "String"))
                    .with_param(ParamSpec::scalar("value", "String")),
                Arc::new(|| Box::new(SenvMacro)),
            ),
            MacroRecord::new(
                MacroDefinition::new("usenv")
                    .with_description("Remove environment keys")
                    .with_param(ParamSpec::repeat(
                        "keys",
                        vec![ParamSpec::scalar("name", "String")],
                    )),
                Arc::new(|| Box::new(UsenvMacro)),
            ),
        ])
    }
}

/// `sleep <seconds>`: chunked interruptible wait with progress reporting.
#[derive(Default)]
struct SleepMacro {
    total: f64,
    elapsed: f64,
}

#[async_trait]
impl MacroTask for SleepMacro {
    async fn prepare(&mut self, ctx: &mut MacroContext) -> MacroResult<()> {
        self.total = ctx.param(0)?.as_float()?;
        Ok(())
    }

    async fn step(&mut self, ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        if self.elapsed >= self.total {
            return Ok(StepOutcome::Done(None));
        }
        if self.elapsed == 0.0 {
            debug!(seconds = self.total, "Sleeping");
        }
        ctx.check_point()?;
        let remaining = Duration::from_secs_f64(self.total - self.elapsed);
        let chunk = SLEEP_CHUNK.min(remaining);
        tokio::time::sleep(chunk).await;
        self.elapsed += chunk.as_secs_f64();
        Ok(StepOutcome::Progress(Progress::with_range(
            self.elapsed,
            0.0,
            self.total,
        )))
    }
}

/// `mv [<motor> <position>]+`: simulated absolute motion, one repetition at
/// a time, with a pause point before each motor.
#[derive(Default)]
struct MvMacro {
    moves: Vec<(String, f64)>,
    index: usize,
    at_pause_point: bool,
}

#[async_trait]
impl MacroTask for MvMacro {
    async fn prepare(&mut self, ctx: &mut MacroContext) -> MacroResult<()> {
        let params = ctx.params()?.to_vec();
        for repetition in &params {
            let pair = repetition.as_seq()?;
            let motor = pair
                .first()
                .ok_or_else(|| crate::error::MacroError::MissingParam("motor".to_string()))?
                .as_element()?;
            let position = pair
                .get(1)
                .ok_or_else(|| crate::error::MacroError::MissingParam("position".to_string()))?
                .as_float()?;
            self.moves.push((motor.name().to_string(), position));
        }
        Ok(())
    }

    async fn step(&mut self, ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        if self.index >= self.moves.len() {
            return Ok(StepOutcome::Done(None));
        }
        if !self.at_pause_point {
            self.at_pause_point = true;
            return Ok(StepOutcome::Pause { timeout: None });
        }
        self.at_pause_point = false;

        let (motor, position) = self.moves[self.index].clone();
        ctx.output(format!("Moving {motor} to {position}"))?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.index += 1;
        Ok(StepOutcome::Progress(Progress::with_range(
            self.index as f64,
            0.0,
            self.moves.len() as f64,
        )))
    }
}

/// `ct [<integ_time>]`: acquisition with pre/post hooks and a result.
#[derive(Default)]
struct CtMacro {
    integ_time: f64,
    elapsed: f64,
    phase: CtPhase,
}

#[derive(Default, PartialEq)]
enum CtPhase {
    #[default]
    PreAcq,
    Acquire,
    PostAcq,
    Report,
}

#[async_trait]
impl MacroTask for CtMacro {
    async fn prepare(&mut self, ctx: &mut MacroContext) -> MacroResult<()> {
        self.integ_time = ctx.param(0)?.as_float()?;
        Ok(())
    }

    async fn step(&mut self, ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        match self.phase {
            CtPhase::PreAcq => {
                self.phase = CtPhase::Acquire;
                Ok(StepOutcome::RunHooks {
                    place: "pre-acq".to_string(),
                })
            }
            CtPhase::Acquire => {
                if self.elapsed >= self.integ_time {
                    self.phase = CtPhase::PostAcq;
                    return Ok(StepOutcome::Tick);
                }
                ctx.check_point()?;
                let remaining = Duration::from_secs_f64(self.integ_time - self.elapsed);
                let chunk = SLEEP_CHUNK.min(remaining);
                tokio::time::sleep(chunk).await;
                self.elapsed += chunk.as_secs_f64();
                Ok(StepOutcome::Progress(Progress::with_range(
                    self.elapsed,
                    0.0,
                    self.integ_time,
                )))
            }
            CtPhase::PostAcq => {
                self.phase = CtPhase::Report;
                Ok(StepOutcome::RunHooks {
                    place: "post-acq".to_string(),
                })
            }
            CtPhase::Report => {
                let group = ctx.get_env("ActiveMntGrp")?;
                let counts = self.integ_time * 100.0;
                ctx.output(format!("{group}: {counts} counts"))?;
                Ok(StepOutcome::Done(Some(vec![counts.to_string()])))
            }
        }
    }
}

/// `lsenv`: print the whole environment.
struct LsEnvMacro;

#[async_trait]
impl MacroTask for LsEnvMacro {
    async fn step(&mut self, ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        let keys = ctx.env_keys()?;
        if keys.is_empty() {
            ctx.output("Environment is empty")?;
        }
        for key in keys {
            let value = ctx.get_env(&key)?;
            ctx.output(format!("{key} = {value}"))?;
        }
        Ok(StepOutcome::Done(None))
    }
}

/// `senv <name> <value>`: set one key. The value token is parsed as JSON
/// when possible, otherwise stored as a plain string.
struct SenvMacro;

#[async_trait]
impl MacroTask for SenvMacro {
    async fn step(&mut self, ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        let name = ctx.param(0)?.as_str()?.to_string();
        let raw = ctx.param(1)?.as_str()?.to_string();
        let value = serde_json::from_str(&raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
        ctx.set_env(name.clone(), value.clone())?;
        ctx.output(format!("{name} = {value}"))?;
        Ok(StepOutcome::Done(None))
    }
}

/// `usenv <name>+`: remove keys.
struct UsenvMacro;

#[async_trait]
impl MacroTask for UsenvMacro {
    async fn step(&mut self, ctx: &mut MacroContext) -> MacroResult<StepOutcome> {
        let params = ctx.params()?.to_vec();
        for repetition in &params {
            let name = match repetition {
                ParamValue::Seq(inner) => inner
                    .first()
                    .ok_or_else(|| crate::error::MacroError::MissingParam("name".to_string()))?
                    .as_str()?,
                other => other.as_str()?,
            };
            match ctx.unset_env(name)? {
                Some(_) => ctx.output(format!("Removed {name}"))?,
                None => ctx.output(format!("{name} was not set"))?,
            }
        }
        Ok(StepOutcome::Done(None))
    }
}
