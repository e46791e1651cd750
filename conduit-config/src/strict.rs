use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised by [`parse_strict`].
#[derive(Debug, Error)]
pub enum StrictConfigError {
    /// Keys that do not correspond to any option, reported with their full path.
    #[error("unknown configuration keys: {}", .0.join(", "))]
    UnknownKeys(Vec<String>),

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[from] serde_json::Error),
}

/// Deserializes a component configuration from a loosely typed value.
///
/// Unknown keys are ignored unless `strict` is set, in which case every key that is not an
/// option of `T` (including keys of nested sections) is reported in a single error.
pub fn parse_strict<T>(value: &Value, strict: bool) -> Result<T, StrictConfigError>
where
    T: DeserializeOwned + Serialize + Default,
{
    if strict {
        let known = serde_json::to_value(T::default())?;
        let mut unknown = Vec::new();
        collect_unknown_keys(&known, value, "", &mut unknown);

        if !unknown.is_empty() {
            return Err(StrictConfigError::UnknownKeys(unknown));
        }
    }

    Ok(serde_json::from_value(value.clone())?)
}

fn collect_unknown_keys(known: &Value, given: &Value, prefix: &str, unknown: &mut Vec<String>) {
    let (Value::Object(known), Value::Object(given)) = (known, given) else {
        return;
    };

    for (key, value) in given {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        match known.get(key) {
            Some(known_value) => collect_unknown_keys(known_value, value, &path, unknown),
            None => unknown.push(path),
        }
    }
}

/// Convenience used by callers holding a map rather than a value.
pub fn parse_strict_map<T>(map: Map<String, Value>, strict: bool) -> Result<T, StrictConfigError>
where
    T: DeserializeOwned + Serialize + Default,
{
    parse_strict(&Value::Object(map), strict)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::shared::{ExecutionConfig, PoolConfig};

    #[test]
    fn unknown_keys_are_ignored_outside_strict_mode() {
        let config: ExecutionConfig =
            parse_strict(&json!({"timeout": 10, "verbose": true}), false).unwrap();
        assert_eq!(config.timeout_ms, 10);
    }

    #[test]
    fn unknown_keys_are_rejected_in_strict_mode() {
        let err = parse_strict::<PoolConfig>(
            &json!({"maxConnections": 4, "maxIdle": 2, "minConection": 1}),
            true,
        )
        .unwrap_err();

        match err {
            StrictConfigError::UnknownKeys(keys) => {
                assert_eq!(keys, vec!["maxIdle".to_string(), "minConection".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn known_keys_pass_strict_mode() {
        let config: PoolConfig =
            parse_strict(&json!({"maxConnections": 4, "acquireTimeout": 50}), true).unwrap();
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.acquire_timeout_ms, 50);
    }
}
