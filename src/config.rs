//! Engine settings, loaded through Figment.
//!
//! Defaults are overridable from a `macroserver.toml` file and from
//! `MACROSERVER_`-prefixed environment variables, in that order.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{MacroError, MacroResult};

/// Tunable engine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Capacity of the door broadcast channel.
    pub door_channel_capacity: usize,
    /// Maximum number of accepted-but-not-started jobs.
    pub job_queue_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            door_channel_capacity: 1024,
            job_queue_capacity: 32,
        }
    }
}

impl EngineSettings {
    /// Load settings: defaults, then `macroserver.toml`, then
    /// `MACROSERVER_*` environment overrides.
    pub fn load() -> MacroResult<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(EngineSettings::default()))
                .merge(Toml::file("macroserver.toml"))
                .merge(Env::prefixed("MACROSERVER_")),
        )
    }

    fn from_figment(figment: Figment) -> MacroResult<Self> {
        let settings: EngineSettings = figment
            .extract()
            .map_err(|e| MacroError::Config(e.to_string()))?;
        if settings.door_channel_capacity == 0 {
            return Err(MacroError::Config(
                "door_channel_capacity must be positive".to_string(),
            ));
        }
        if settings.job_queue_capacity == 0 {
            return Err(MacroError::Config(
                "job_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.door_channel_capacity, 1024);
        assert_eq!(settings.job_queue_capacity, 32);
    }

    #[test]
    fn test_toml_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("macroserver.toml", "job_queue_capacity = 4")?;
            let settings = EngineSettings::from_figment(
                Figment::from(Serialized::defaults(EngineSettings::default()))
                    .merge(Toml::file("macroserver.toml")),
            )
            .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(settings.job_queue_capacity, 4);
            assert_eq!(settings.door_channel_capacity, 1024);
            Ok(())
        });
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let figment = Figment::from(Serialized::defaults(EngineSettings {
            door_channel_capacity: 0,
            ..EngineSettings::default()
        }));
        assert!(matches!(
            EngineSettings::from_figment(figment),
            Err(MacroError::Config(_))
        ));
    }
}
