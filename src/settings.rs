//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables with the
//! `FL_CLIENT` prefix and `__` as section separator. An example configuration file can be found
//! in the `configs/` directory located in the repository root.

use std::{convert::TryFrom, fmt, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    mask::MaskConfig,
    participant::ParticipantSettings,
    weight::{ScalingError, Weight},
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub client: ClientSettings,
    #[serde(default)]
    pub mask: MaskConfig,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fl_client").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
/// The participant settings.
pub struct ClientSettings {
    /// The name of the participant. It must be unique within the federation.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [client]
    /// username = "hospital-a"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_CLIENT_CLIENT__USERNAME=hospital-a
    /// ```
    #[validate(length(min = 1))]
    pub username: String,

    /// The number of rounds to take part in. Must be at least `1`.
    #[validate(range(min = 1))]
    pub iterations: u32,

    /// The round of the first global model to fetch.
    #[serde(default)]
    pub start_round: u32,

    /// The aggregation weight, usually proportional to the size of the local dataset. Must be
    /// positive and finite.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [client]
    /// weight = 0.3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_CLIENT_CLIENT__WEIGHT=0.3
    /// ```
    #[validate(custom = "validate_weight")]
    pub weight: f64,

    /// The number of local epochs per round.
    #[serde(default = "default_local_epochs")]
    #[validate(range(min = 1))]
    pub local_epochs: u32,

    /// The directory the outbound payloads are written to.
    pub models_dir: PathBuf,
}

fn default_local_epochs() -> u32 {
    1
}

fn validate_weight(weight: f64) -> Result<(), ValidationError> {
    if weight.is_finite() && weight > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::new("invalid weight"))
    }
}

impl TryFrom<&ClientSettings> for ParticipantSettings {
    type Error = ScalingError;

    fn try_from(settings: &ClientSettings) -> Result<Self, Self::Error> {
        Ok(ParticipantSettings {
            iterations: settings.iterations,
            start_round: settings.start_round,
            weight: Weight::new(settings.weight)?,
            local_epochs: settings.local_epochs,
            models_dir: settings.models_dir.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
/// The logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_CLIENT_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::mask::{BoundType, GroupType, ModelType};

    impl Default for ClientSettings {
        fn default() -> Self {
            Self {
                username: "hospital-a".into(),
                iterations: 3,
                start_round: 0,
                weight: 0.3,
                local_epochs: 1,
                models_dir: PathBuf::from("models"),
            }
        }
    }

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_settings_new() {
        assert!(Settings::new(concat!(env!("CARGO_MANIFEST_DIR"), "/configs/config.toml")).is_ok());
        assert!(Settings::new("").is_err());
    }

    #[test]
    fn test_settings_from_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [client]
            username = "hospital-b"
            iterations = 10
            start_round = 4
            weight = 0.7
            models_dir = "/tmp/models"

            [mask]
            group_type = "Power2"
            bound_type = "B4"
            model_type = "M6"

            [log]
            filter = "silo_client=debug"
            "#,
        );
        let settings = Settings::new(path).unwrap();
        assert_eq!(settings.client.username, "hospital-b");
        assert_eq!(settings.client.iterations, 10);
        assert_eq!(settings.client.start_round, 4);
        assert_eq!(settings.client.local_epochs, 1);
        assert_eq!(settings.client.models_dir, PathBuf::from("/tmp/models"));
        assert_eq!(
            settings.mask,
            MaskConfig {
                group_type: GroupType::Power2,
                bound_type: BoundType::B4,
                model_type: ModelType::M6,
            },
        );

        let participant = ParticipantSettings::try_from(&settings.client).unwrap();
        assert_eq!(participant.weight.get(), 0.7);
        assert_eq!(participant.start_round, 4);
    }

    #[test]
    fn test_settings_default_mask() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [client]
            username = "hospital-a"
            iterations = 1
            weight = 1.0
            models_dir = "models"

            [log]
            filter = "info"
            "#,
        );
        assert_eq!(Settings::new(path).unwrap().mask, MaskConfig::default());
    }

    #[test]
    fn test_settings_invalid_filter() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [client]
            username = "hospital-a"
            iterations = 1
            weight = 1.0
            models_dir = "models"

            [log]
            filter = "silo_client=loudest"
            "#,
        );
        assert!(matches!(
            Settings::new(path),
            Err(SettingsError::Loading(_)),
        ));
    }

    #[test]
    fn test_validate_client() {
        assert!(ClientSettings::default().validate().is_ok());

        let mut client = ClientSettings::default();
        client.username = String::new();
        assert!(client.validate().is_err());

        let mut client = ClientSettings::default();
        client.iterations = 0;
        assert!(client.validate().is_err());

        let mut client = ClientSettings::default();
        client.local_epochs = 0;
        assert!(client.validate().is_err());

        for weight in &[0.0, -0.5, f64::NAN, f64::INFINITY] {
            let mut client = ClientSettings::default();
            client.weight = *weight;
            assert!(client.validate().is_err());
        }
    }

    #[test]
    fn test_settings_validation_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [client]
            username = ""
            iterations = 1
            weight = 1.0
            models_dir = "models"

            [log]
            filter = "info"
            "#,
        );
        assert!(matches!(
            Settings::new(path),
            Err(SettingsError::Validation(_)),
        ));
    }
}
