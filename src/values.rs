//! Landscape input values: value files, `--set` overrides and deep merging.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::LsiError;

/// Merge `source` into `target`. Objects merge key by key, every other value in
/// `source` replaces the one in `target`. A null `source` leaves `target` as is.
pub fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (_, Value::Null) => {}
        (Value::Object(target), Value::Object(source)) => merge_maps(target, source),
        (target, source) => *target = source,
    }
}

/// Key-wise [`deep_merge`] of two maps.
pub fn merge_maps(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match target.get_mut(&key) {
            Some(existing) if existing.is_object() && value.is_object() => {
                deep_merge(existing, value);
            }
            _ => {
                target.insert(key, value);
            }
        }
    }
}

/// Read YAML value files in order; later files override earlier ones.
pub async fn read_value_files<P: AsRef<Path>>(paths: &[P]) -> Result<Value> {
    let mut merged = Value::Object(Map::new());
    for path in paths {
        let path = path.as_ref();
        info!("Read values from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read values file {}", path.display()))?;
        let values: Value = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse values file {}", path.display()))?;
        match values {
            Value::Null => {}
            Value::Object(_) => deep_merge(&mut merged, values),
            _ => {
                return Err(LsiError::InvalidValues(format!(
                    "{} must contain a mapping at the top level",
                    path.display()
                ))
                .into());
            }
        }
    }
    Ok(merged)
}

/// Parse a `path.to.key=value` override into a nested value.
///
/// The right-hand side is read as a YAML scalar, so `true` and `3` keep their
/// types; anything unparseable is taken as a plain string.
pub fn parse_set(expr: &str) -> Result<Value> {
    let (path, raw) = expr
        .split_once('=')
        .ok_or_else(|| LsiError::InvalidValues(format!("expected key=value, got '{expr}'")))?;

    let keys: Vec<&str> = path.split('.').collect();
    if keys.iter().any(|k| k.trim().is_empty()) {
        return Err(LsiError::InvalidValues(format!("invalid key path '{path}'")).into());
    }

    let leaf = match serde_yaml::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => v,
        _ => Value::String(raw.to_string()),
    };

    Ok(keys.iter().rev().fold(leaf, |acc, key| {
        let mut map = Map::new();
        map.insert((*key).trim().to_string(), acc);
        Value::Object(map)
    }))
}

/// Apply `--set` overrides on top of `values`, in order.
pub fn apply_overrides(values: &mut Value, overrides: &[String]) -> Result<()> {
    for expr in overrides {
        deep_merge(values, parse_set(expr)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_deep_merge_nested_objects() {
        let mut target = json!({"etcd": {"tls": {"ca": "a"}, "replicas": 1}, "version": "v1.0.0"});
        deep_merge(
            &mut target,
            json!({"etcd": {"replicas": 3}, "gardener": {"enabled": true}}),
        );
        assert_eq!(
            target,
            json!({
                "etcd": {"tls": {"ca": "a"}, "replicas": 3},
                "gardener": {"enabled": true},
                "version": "v1.0.0"
            })
        );
    }

    #[test]
    fn test_deep_merge_replaces_arrays_and_scalars() {
        let mut target = json!({"list": [1, 2], "obj": {"a": 1}});
        deep_merge(&mut target, json!({"list": [3], "obj": "flat"}));
        assert_eq!(target, json!({"list": [3], "obj": "flat"}));
    }

    #[test]
    fn test_deep_merge_null_source_is_noop() {
        let mut target = json!({"a": 1});
        deep_merge(&mut target, Value::Null);
        assert_eq!(target, json!({"a": 1}));
    }

    #[test]
    fn test_parse_set() {
        assert_eq!(
            parse_set("gardener.featureGates.HVPA=true").unwrap(),
            json!({"gardener": {"featureGates": {"HVPA": true}}})
        );
        assert_eq!(parse_set("replicas=3").unwrap(), json!({"replicas": 3}));
        assert_eq!(parse_set("version=v1.62.0").unwrap(), json!({"version": "v1.62.0"}));
        assert_eq!(parse_set("list=[a").unwrap(), json!({"list": "[a"}));
    }

    #[test]
    fn test_parse_set_rejects_malformed() {
        assert!(parse_set("no-equals").is_err());
        assert!(parse_set("a..b=1").is_err());
        assert!(parse_set("=1").is_err());
    }

    #[tokio::test]
    async fn test_read_value_files_later_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("default.yaml");
        let second = dir.path().join("override.yaml");
        let empty = dir.path().join("empty.yaml");
        std::fs::File::create(&first)
            .unwrap()
            .write_all(b"version: v1.61.0\netcd:\n  replicas: 1\n  storage: 10Gi\n")
            .unwrap();
        std::fs::File::create(&second)
            .unwrap()
            .write_all(b"version: v1.62.0\netcd:\n  replicas: 3\n")
            .unwrap();
        std::fs::File::create(&empty).unwrap();

        let values = read_value_files(&[first, second, empty]).await.unwrap();
        assert_eq!(
            values,
            json!({"version": "v1.62.0", "etcd": {"replicas": 3, "storage": "10Gi"}})
        );
    }

    #[tokio::test]
    async fn test_read_value_files_rejects_non_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.yaml");
        std::fs::write(&path, "- a\n- b\n").unwrap();

        let err = read_value_files(&[path]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LsiError>(),
            Some(LsiError::InvalidValues(_))
        ));
    }

    #[test]
    fn test_apply_overrides_in_order() {
        let mut values = json!({"etcd": {"replicas": 1}});
        apply_overrides(
            &mut values,
            &["etcd.replicas=2".to_string(), "etcd.replicas=5".to_string()],
        )
        .unwrap();
        assert_eq!(values, json!({"etcd": {"replicas": 5}}));
    }
}
