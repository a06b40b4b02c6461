//! Layered configuration: built-in defaults, then `config.json`, then the
//! environment.
//!
//! Environment values are typed by the field they replace, so a numeric
//! looking API key or session key stays a string while `SERVER__PORT` must
//! parse as a number.

use super::schema::Config;
use super::validate::validate_config;
use crate::Error;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

/// Prefix of `KAI_RELAY__<SECTION>__<FIELD>` overrides
pub const ENV_PATH_PREFIX: &str = "KAI_RELAY__";

/// Shorthand variables and the field each sets. Path overrides win over these.
const ENV_ALIASES: &[(&str, &str)] = &[
    ("OPENAI_API_KEY", "upstream.api_key"),
    ("OPENAI_API_BASE", "upstream.api_base"),
    ("KAI_RELAY_API_KEY", "upstream.api_key"),
    ("KAI_RELAY_API_BASE", "upstream.api_base"),
    ("KAI_RELAY_MODEL", "upstream.model"),
];

/// Reads and writes `<config_dir>/config.json`
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Loader rooted at `~/.kai-relay`
    pub fn new() -> Self {
        let dir = dirs::home_dir()
            .map(|home| home.join(".kai-relay"))
            .unwrap_or_else(|| PathBuf::from(".kai-relay"));
        Self::with_dir(dir)
    }

    pub fn with_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            config_dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Load using the process environment
    pub fn load(&self) -> crate::Result<Config> {
        self.load_with_env(std::env::vars())
    }

    /// Load using `vars` as the environment
    pub fn load_with_env<I>(&self, vars: I) -> crate::Result<Config>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut document = serde_json::to_value(Config::default())?;
        if let Some(file) = self.read_file()? {
            overlay(&mut document, file);
        }
        for env_override in env_overrides(vars) {
            env_override.apply(&mut document)?;
        }

        let config: Config = serde_json::from_value(document)
            .map_err(|e| Error::Config(format!("{}: {}", self.config_path().display(), e)))?;
        validate_config(&config)?;
        Ok(config)
    }

    pub fn save(&self, config: &Config) -> crate::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::write(self.config_path(), serde_json::to_string_pretty(config)?)?;
        Ok(())
    }

    fn read_file(&self) -> crate::Result<Option<Value>> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Overlay `file` onto `base`: sections merge field by field, anything else
/// replaces the base value.
fn overlay(base: &mut Value, file: Value) {
    match (base, file) {
        (Value::Object(sections), Value::Object(fields)) => {
            for (key, value) in fields {
                match sections.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        sections.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// One environment variable aimed at a config field
#[derive(Debug, Clone, PartialEq)]
struct EnvOverride {
    var: String,
    path: Vec<String>,
    raw: String,
}

impl EnvOverride {
    fn apply(&self, document: &mut Value) -> crate::Result<()> {
        let Some((field, sections)) = self.path.split_last() else {
            return Ok(());
        };

        let mut node = document;
        for section in sections {
            let Value::Object(map) = node else {
                return Err(self.mismatch("a section"));
            };
            node = map
                .entry(section.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let Value::Object(map) = node else {
            return Err(self.mismatch("a section"));
        };

        let value = coerce(&self.raw, map.get(field)).map_err(|expected| self.mismatch(expected))?;
        map.insert(field.clone(), value);
        Ok(())
    }

    fn mismatch(&self, expected: &str) -> Error {
        Error::Config(format!(
            "{} ({}): expected {}, got '{}'",
            self.var,
            self.path.join("."),
            expected,
            self.raw
        ))
    }
}

/// Alias overrides first, then path overrides in name order
fn env_overrides<I>(vars: I) -> Vec<EnvOverride>
where
    I: IntoIterator<Item = (String, String)>,
{
    let vars: BTreeMap<String, String> = vars.into_iter().collect();

    let aliases = ENV_ALIASES.iter().filter_map(|(var, target)| {
        vars.get(*var).map(|raw| EnvOverride {
            var: var.to_string(),
            path: target.split('.').map(str::to_string).collect(),
            raw: raw.clone(),
        })
    });

    let paths = vars.iter().filter_map(|(var, raw)| {
        let suffix = var.strip_prefix(ENV_PATH_PREFIX)?;
        let path: Vec<String> = suffix
            .split("__")
            .filter(|segment| !segment.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        (!path.is_empty()).then(|| EnvOverride {
            var: var.clone(),
            path,
            raw: raw.clone(),
        })
    });

    aliases.chain(paths).collect()
}

/// Parse `raw` as the JSON type of the value it replaces. Fields the schema
/// does not know, such as new map entries, are taken as strings.
fn coerce(raw: &str, current: Option<&Value>) -> Result<Value, &'static str> {
    let trimmed = raw.trim();
    match current {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(Value::String(raw.to_string())),
        Some(Value::Bool(_)) => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
            _ => Err("a boolean"),
        },
        Some(Value::Number(_)) => trimmed
            .parse::<u64>()
            .map(Value::from)
            .ok()
            .or_else(|| {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
            })
            .ok_or("a number"),
        Some(Value::Array(_)) => match serde_json::from_str(trimmed) {
            Ok(value @ Value::Array(_)) => Ok(value),
            _ => Err("a JSON array"),
        },
        Some(Value::Object(_)) => match serde_json::from_str(trimmed) {
            Ok(value @ Value::Object(_)) => Ok(value),
            _ => Err("a JSON object"),
        },
    }
}
