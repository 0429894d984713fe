//! Job options handed over by the external configuration loader.
//!
//! Options arrive as a loose [`ConfigMap`] and are coerced once into a typed
//! [`JobConfig`]. The manager keeps its own copy; nothing here aliases the
//! caller's maps.

use crate::error::{PiperError, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

pub type ConfigMap = BTreeMap<String, Value>;
pub type EnvMap = BTreeMap<String, String>;

pub const STRING_OPTIONS: &[&str] = &[
    "workdir",
    "inpath",
    "outpath",
    "errpath",
    "jobname",
    "native_spec",
    "scriptdir",
];
pub const BOOL_OPTIONS: &[&str] = &["keepscripts", "joinfiles"];
pub const ENV_OPTION: &str = "env";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobConfig {
    pub workdir: Option<String>,
    pub inpath: Option<String>,
    pub outpath: Option<String>,
    pub errpath: Option<String>,
    pub jobname: Option<String>,
    pub native_spec: Option<String>,
    pub scriptdir: Option<String>,
    pub env: Option<EnvMap>,
    pub keepscripts: bool,
    pub joinfiles: bool,
}

impl JobConfig {
    pub fn from_options(options: &ConfigMap) -> Result<Self> {
        let mut config = JobConfig::default();
        for (key, value) in options {
            match key.as_str() {
                "workdir" => config.workdir = coerce_text(value),
                "inpath" => config.inpath = coerce_text(value),
                "outpath" => config.outpath = coerce_text(value),
                "errpath" => config.errpath = coerce_text(value),
                "jobname" => config.jobname = coerce_text(value),
                "native_spec" => config.native_spec = coerce_text(value),
                "scriptdir" => config.scriptdir = coerce_text(value),
                "keepscripts" => config.keepscripts = coerce_bool(key, value)?,
                "joinfiles" => config.joinfiles = coerce_bool(key, value)?,
                ENV_OPTION => config.env = Some(coerce_env(value)?),
                other => debug!(option = other, "ignoring unsupported job option"),
            }
        }
        Ok(config)
    }

    /// Upper-cases every environment variable name.
    pub fn normalize_env(&mut self) {
        if let Some(env) = self.env.take() {
            self.env = Some(
                env.into_iter()
                    .map(|(name, value)| (name.to_uppercase(), value))
                    .collect(),
            );
        }
    }
}

/// Reads a YAML or JSON option file, chosen by extension.
pub fn load_options(path: &Path) -> Result<ConfigMap> {
    let raw = fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let value: Value = if ext == "yaml" || ext == "yml" {
        serde_yaml::from_str(&raw).map_err(|e| {
            PiperError::Configuration(format!("failed to parse {}: {}", path.display(), e))
        })?
    } else {
        serde_json::from_str(&raw).map_err(|e| {
            PiperError::Configuration(format!("failed to parse {}: {}", path.display(), e))
        })?
    };
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        Value::Null => Ok(ConfigMap::new()),
        other => Err(PiperError::Configuration(format!(
            "job options in {} must be a mapping, found {}",
            path.display(),
            value_type_name(&other)
        ))),
    }
}

fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn coerce_bool(key: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(PiperError::Configuration(format!(
                "option {} expects a boolean, got {:?}",
                key, s
            ))),
        },
        other => Err(PiperError::Configuration(format!(
            "option {} expects a boolean, got {}",
            key,
            value_type_name(other)
        ))),
    }
}

fn coerce_env(value: &Value) -> Result<EnvMap> {
    let mut env = EnvMap::new();
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (name, val) in map {
                env.insert(name.clone(), coerce_text(val).unwrap_or_default());
            }
        }
        Value::Array(pairs) => {
            for pair in pairs {
                let (name, val) = pair
                    .as_array()
                    .filter(|p| p.len() == 2)
                    .and_then(|p| p[0].as_str().map(|n| (n, &p[1])))
                    .ok_or_else(|| {
                        PiperError::Configuration(format!(
                            "env entries must be [name, value] pairs, got {}",
                            pair
                        ))
                    })?;
                env.insert(name.to_string(), coerce_text(val).unwrap_or_default());
            }
        }
        other => {
            return Err(PiperError::Configuration(format!(
                "env must be a mapping, got {}",
                value_type_name(other)
            )))
        }
    }
    Ok(env)
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(value: Value) -> ConfigMap {
        value
            .as_object()
            .expect("object")
            .clone()
            .into_iter()
            .collect()
    }

    #[test]
    fn string_options_are_coerced_to_text() {
        let config = JobConfig::from_options(&options(json!({
            "workdir": "/scratch/run",
            "jobname": 42,
            "native_spec": "-l h_vmem=4G"
        })))
        .expect("config");
        assert_eq!(config.workdir.as_deref(), Some("/scratch/run"));
        assert_eq!(config.jobname.as_deref(), Some("42"));
        assert_eq!(config.native_spec.as_deref(), Some("-l h_vmem=4G"));
        assert!(config.outpath.is_none(), "missing options stay absent");
    }

    #[test]
    fn every_declared_option_is_recognized() {
        let mut map = ConfigMap::new();
        for key in STRING_OPTIONS {
            map.insert(key.to_string(), json!(format!("/{}", key)));
        }
        for key in BOOL_OPTIONS {
            map.insert(key.to_string(), json!("yes"));
        }
        map.insert(ENV_OPTION.to_string(), json!({}));
        let config = JobConfig::from_options(&map).expect("config");
        assert_eq!(config.workdir.as_deref(), Some("/workdir"));
        assert_eq!(config.inpath.as_deref(), Some("/inpath"));
        assert_eq!(config.scriptdir.as_deref(), Some("/scriptdir"));
        assert!(config.keepscripts && config.joinfiles);
        assert_eq!(config.env, Some(EnvMap::new()));
    }

    #[test]
    fn bool_options_accept_ints_and_strings() {
        let config = JobConfig::from_options(&options(json!({
            "keepscripts": "1",
            "joinfiles": 0
        })))
        .expect("config");
        assert!(config.keepscripts);
        assert!(!config.joinfiles);

        let err = JobConfig::from_options(&options(json!({ "joinfiles": "maybe" })))
            .expect_err("bad bool");
        assert!(err.to_string().contains("joinfiles"), "{}", err);
    }

    #[test]
    fn env_accepts_pair_lists_and_normalizes_names() {
        let mut config = JobConfig::from_options(&options(json!({
            "env": [["path", "/usr/bin"], ["Threads", 4]]
        })))
        .expect("config");
        config.normalize_env();
        let env = config.env.expect("env");
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("THREADS").map(String::as_str), Some("4"));
        assert!(!env.contains_key("path"));
    }

    #[test]
    fn load_options_reads_yaml_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("job.yaml");
        fs::write(&path, "workdir: /tmp\njoinfiles: true\nenv:\n  lang: C\n").expect("write");
        let map = load_options(&path).expect("load");
        let config = JobConfig::from_options(&map).expect("config");
        assert_eq!(config.workdir.as_deref(), Some("/tmp"));
        assert!(config.joinfiles);
        assert_eq!(
            config.env.expect("env").get("lang").map(String::as_str),
            Some("C")
        );
    }

    #[test]
    fn load_options_rejects_non_mappings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("job.json");
        fs::write(&path, "[1, 2]").expect("write");
        let err = load_options(&path).expect_err("list is not a mapping");
        assert!(matches!(err, PiperError::Configuration(_)));
    }
}
