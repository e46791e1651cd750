use std::collections::HashSet;

use conduit::execution::MappingDefinition;
use conduit_config::shared::{
    ExecutionConfig, PgConnectionConfig, PoolConfig, StreamConfig, ValidationConfig,
    ValidationError,
};
use conduit_config::{Config, LoadConfigError, StrictConfigError, load_config, parse_strict};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RunnerResult;

/// Top level keys of a runner configuration.
const SECTIONS: &[&str] = &[
    "systems",
    "pool",
    "stream",
    "validation",
    "execution",
    "mapping",
    "store",
];

/// A PostgreSQL system mappings can refer to by id.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    pub id: String,
    pub connection: PgConnectionConfig,
}

/// Everything the runner needs to execute one mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    pub systems: Vec<SystemConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    pub mapping: MappingDefinition,
    /// Database where finished runs are recorded. Runs are not persisted when absent.
    #[serde(default)]
    pub store: Option<PgConnectionConfig>,
}

fn invalid(field: &str, constraint: impl Into<String>) -> ValidationError {
    ValidationError::InvalidFieldValue {
        field: field.to_string(),
        constraint: constraint.into(),
    }
}

impl Config for RunnerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];

    fn validate(&self) -> Result<(), ValidationError> {
        if self.systems.is_empty() {
            return Err(invalid("systems", "at least one system is required"));
        }

        let mut ids = HashSet::new();
        for system in &self.systems {
            if !ids.insert(system.id.as_str()) {
                return Err(invalid("systems", format!("duplicate system id `{}`", system.id)));
            }
            system.connection.validate()?;
        }

        for (field, system_id) in [
            ("mapping.source.systemId", &self.mapping.source.system_id),
            ("mapping.target.systemId", &self.mapping.target.system_id),
        ] {
            if !ids.contains(system_id.as_str()) {
                return Err(invalid(field, format!("unknown system `{system_id}`")));
            }
        }

        if let Some(store) = &self.store {
            store.validate()?;
        }

        self.pool.validate()?;
        self.stream.validate()?;
        self.validation.validate()?;
        self.execution.validate()
    }
}

impl RunnerConfig {
    /// Builds the configuration from its loosely typed form.
    ///
    /// With `execution.strictMode` set, unknown top level keys and unknown keys of the component
    /// sections are rejected, all of them reported at once with their full path.
    pub fn from_value(value: Value) -> Result<Self, StrictConfigError> {
        let empty = Value::Object(Map::new());
        let section = |name: &str| value.get(name).unwrap_or(&empty);

        let execution: ExecutionConfig = parse_strict(section("execution"), false)?;
        if execution.strict_mode {
            let mut unknown: Vec<String> = value
                .as_object()
                .map(|sections| {
                    sections
                        .keys()
                        .filter(|key| !SECTIONS.contains(&key.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            unknown.extend(unknown_keys::<PoolConfig>("pool", section("pool"))?);
            unknown.extend(unknown_keys::<StreamConfig>("stream", section("stream"))?);
            unknown.extend(unknown_keys::<ValidationConfig>(
                "validation",
                section("validation"),
            )?);
            unknown.extend(unknown_keys::<ExecutionConfig>(
                "execution",
                section("execution"),
            )?);

            if !unknown.is_empty() {
                return Err(StrictConfigError::UnknownKeys(unknown));
            }
        }

        Ok(serde_json::from_value(value)?)
    }
}

/// Unknown keys of one component section, prefixed with the section name.
fn unknown_keys<T>(name: &str, section: &Value) -> Result<Vec<String>, StrictConfigError>
where
    T: DeserializeOwned + Serialize + Default,
{
    match parse_strict::<T>(section, true) {
        Ok(_) => Ok(Vec::new()),
        Err(StrictConfigError::UnknownKeys(keys)) => {
            Ok(keys.into_iter().map(|key| format!("{name}.{key}")).collect())
        }
        Err(err) => Err(err),
    }
}

/// The layered configuration before it is checked and typed.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct RawRunnerConfig(Value);

impl Config for RawRunnerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

/// Loads the runner configuration from the `configuration` directory and the environment.
pub fn load_runner_config() -> RunnerResult<RunnerConfig> {
    let raw = load_config::<RawRunnerConfig>()?;
    let config = RunnerConfig::from_value(raw.0)?;
    config.validate().map_err(LoadConfigError::from)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn raw_config(target_system: &str) -> Value {
        let connection = json!({
            "host": "localhost",
            "port": 5432,
            "name": "app",
            "username": "conduit"
        });

        json!({
            "systems": [
                {"id": "app", "connection": connection},
            ],
            "execution": {"errorPolicy": "stop"},
            "mapping": {
                "id": "copy-users",
                "source": {"systemId": "app", "namespace": "public", "name": "users"},
                "target": {"systemId": target_system, "namespace": "archive", "name": "users"},
                "mode": "upsert",
                "conflictColumns": ["id"]
            }
        })
    }

    fn config(target_system: &str) -> RunnerConfig {
        RunnerConfig::from_value(raw_config(target_system)).unwrap()
    }

    fn with_typos(strict_mode: bool) -> Value {
        let mut raw = raw_config("app");
        raw["execution"]["strictMode"] = json!(strict_mode);
        raw["execution"]["retryAttemps"] = json!(5);
        raw["pool"] = json!({"maxConnections": 4, "maxIdle": 2});
        raw["verbose"] = json!(true);
        raw
    }

    #[test]
    fn accepts_mappings_between_known_systems() {
        let config = config("app");

        assert!(config.validate().is_ok());
        assert_eq!(config.pool, PoolConfig::default());
        assert!(config.store.is_none());
    }

    #[test]
    fn unknown_keys_are_ignored_outside_strict_mode() {
        let config = RunnerConfig::from_value(with_typos(false)).unwrap();

        assert_eq!(config.pool.max_connections, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn strict_mode_rejects_unknown_keys() {
        let err = RunnerConfig::from_value(with_typos(true)).unwrap_err();

        match err {
            StrictConfigError::UnknownKeys(keys) => assert_eq!(
                keys,
                vec![
                    "verbose".to_string(),
                    "pool.maxIdle".to_string(),
                    "execution.retryAttemps".to_string(),
                ]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn strict_mode_accepts_known_keys() {
        let mut raw = raw_config("app");
        raw["execution"]["strictMode"] = json!(true);
        raw["pool"] = json!({"maxConnections": 4});

        let config = RunnerConfig::from_value(raw).unwrap();
        assert!(config.execution.strict_mode);
    }

    #[test]
    fn rejects_mappings_to_unknown_systems() {
        let err = config("warehouse").validate().unwrap_err();

        assert_eq!(
            err,
            invalid("mapping.target.systemId", "unknown system `warehouse`")
        );
    }
}
