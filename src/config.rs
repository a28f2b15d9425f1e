//! Typed configuration store: a mapping from fully-qualified key
//! (`section/name`) to a validated value, with per-key metadata describing
//! its default, multiplicity, processors, validators, and optional closed
//! option set.

pub mod validators;

use crate::error::Error;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// A processor is a pure function applied to every individual value of a
/// key (after splitting on the multi-value separator, if any) before
/// validation.
pub type Processor = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// A validator accepts or rejects a single already-processed value.
pub type Validator = Arc<dyn Fn(&str, &str) -> Result<(), Error> + Send + Sync>;

/// The value of a configuration key: either a single string or an ordered,
/// deduplicated list of strings, per [`ParamSpec::is_multi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Single(String),
    Multi(Vec<String>),
}

impl Value {
    pub fn as_single(&self) -> Option<&str> {
        match self {
            Value::Single(s) => Some(s),
            Value::Multi(_) => None,
        }
    }

    pub fn as_multi(&self) -> Option<&[String]> {
        match self {
            Value::Multi(v) => Some(v),
            Value::Single(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Single(s) => write!(f, "{s}"),
            Value::Multi(items) => write!(f, "{}", items.join(",")),
        }
    }
}

/// Per-key metadata: default, multiplicity, ordered processors and
/// validators, an optional closed option set, and free-form usage text.
#[derive(Clone)]
pub struct ParamSpec {
    pub name: String,
    pub default: Value,
    pub is_multi: bool,
    pub processors: Vec<Processor>,
    pub validators: Vec<Validator>,
    pub options: Option<HashSet<String>>,
    pub usage: String,
    /// CLI-facing parameter name, derived the way a plugin loader would
    /// derive a flag name; this crate does no argument parsing itself.
    pub cli_name: String,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, default: impl Into<String>) -> Self {
        let name = name.into();
        let cli_name = name.replace('_', "-").replace('/', "-");
        ParamSpec {
            name,
            default: Value::Single(default.into()),
            is_multi: false,
            processors: Vec::new(),
            validators: Vec::new(),
            options: None,
            usage: String::new(),
            cli_name,
        }
    }

    pub fn multi(mut self, default: Vec<String>) -> Self {
        self.is_multi = true;
        self.default = Value::Multi(default);
        self
    }

    pub fn with_validator(mut self, v: Validator) -> Self {
        self.validators.push(v);
        self
    }

    pub fn with_processor(mut self, p: Processor) -> Self {
        self.processors.push(p);
        self
    }

    pub fn with_options(mut self, options: HashSet<String>) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }
}

/// Validated key/value configuration store.
///
/// Constructed once at startup; mutated only through [`Config::set`], which
/// re-runs every processor and validator for the affected key. Never
/// mutated concurrently during deployment (enforced by convention, not the
/// type system, matching the single-writer discipline of the orchestrator's
/// planning phase).
pub struct Config {
    meta: IndexMap<String, ParamSpec>,
    values: IndexMap<String, Value>,
    multi_separator: String,
}

impl Config {
    /// Builds a `Config` populated entirely from defaults.
    pub fn new(meta: IndexMap<String, ParamSpec>) -> Config {
        let values = meta
            .iter()
            .map(|(k, spec)| {
                tracing::debug!(key = %k, "configuration key resolved to default");
                (k.clone(), spec.default.clone())
            })
            .collect();
        Config {
            meta,
            values,
            multi_separator: ",".to_string(),
        }
    }

    pub fn with_multi_separator(mut self, sep: impl Into<String>) -> Self {
        self.multi_separator = sep.into();
        self
    }

    /// Parses the INI-like grammar of the config file format: `[section]`
    /// headers, `key=value` lines, `#`-prefixed comments. Keys absent from
    /// the file keep their declared default.
    pub fn load(path: &Path, meta: IndexMap<String, ParamSpec>) -> Result<Config, Error> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::config(path.display().to_string(), e))?;
        let mut config = Config::new(meta);
        let mut section = String::new();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(stripped) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                section = stripped.trim().to_string();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::config(
                    format!("{}:{}", path.display(), lineno + 1),
                    "expected `key=value`",
                ));
            };
            let key = key.trim();
            let full_key = if section.is_empty() {
                key.to_string()
            } else {
                format!("{section}/{key}")
            };
            config.set(&full_key, value.trim())?;
        }
        Ok(config)
    }

    /// Re-serializes the resolved configuration to the INI grammar, with
    /// usage text as a comment above each key and declared options appended
    /// to it.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let mut sections: IndexMap<String, Vec<&str>> = IndexMap::new();
        for key in self.meta.keys() {
            let (section, _) = split_key(key);
            sections.entry(section.to_string()).or_default().push(key);
        }
        let mut out = String::new();
        for (section, keys) in sections {
            out.push_str(&format!("[{section}]\n"));
            for key in keys {
                let spec = &self.meta[key];
                if !spec.usage.is_empty() {
                    out.push_str(&format!("# {}\n", spec.usage));
                }
                if let Some(options) = &spec.options {
                    let mut opts: Vec<&str> = options.iter().map(String::as_str).collect();
                    opts.sort_unstable();
                    out.push_str(&format!("# options: {}\n", opts.join(", ")));
                }
                let (_, name) = split_key(key);
                out.push_str(&format!("{name}={}\n", self.values[key]));
            }
            out.push('\n');
        }
        fs::write(path, out).map_err(|e| Error::config(path.display().to_string(), e))
    }

    /// The single typed setter. Splits multi-value input on the configured
    /// separator, deduplicates while preserving first-seen order, runs every
    /// processor over each item, then validates each processed item against
    /// the option set (if declared) and every validator.
    pub fn set(&mut self, key: &str, raw_value: &str) -> Result<(), Error> {
        let spec = self
            .meta
            .get(key)
            .ok_or_else(|| Error::config(key, "unknown configuration key"))?
            .clone();

        let items: Vec<String> = if spec.is_multi {
            let mut seen = IndexMap::new();
            for item in raw_value.split(&self.multi_separator) {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                seen.insert(item.to_string(), ());
            }
            seen.into_keys().collect()
        } else {
            vec![raw_value.to_string()]
        };

        let mut processed = Vec::with_capacity(items.len());
        for item in items {
            let mut value = item;
            for processor in &spec.processors {
                value = processor(&value);
            }
            if let Some(options) = &spec.options {
                if !options.contains(&value) {
                    return Err(Error::config(
                        key,
                        format!("`{value}` is not in the allowed option set"),
                    ));
                }
            }
            for validator in &spec.validators {
                if let Err(e) = validator(key, &value) {
                    tracing::debug!(key, %value, error = %e, "validation rejected");
                    return Err(e);
                }
                tracing::debug!(key, %value, "configuration value passed validation");
            }
            processed.push(value);
        }

        let value = if spec.is_multi {
            Value::Multi(processed)
        } else {
            Value::Single(processed.into_iter().next().unwrap_or_default())
        };
        tracing::debug!(key, %value, "configuration key resolved");
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn meta(&self, key: &str) -> Option<&ParamSpec> {
        self.meta.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.meta.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.meta.keys().map(String::as_str)
    }

    /// All distinct host identities: the deduplicated union of values under
    /// every key whose name part ends in `host` (single) or `hosts` (multi).
    pub fn hosts(&self) -> HashSet<String> {
        self.iter_hosts().collect()
    }

    pub fn iter_hosts(&self) -> impl Iterator<Item = String> + '_ {
        self.values.iter().flat_map(|(key, value)| {
            let (_, name) = split_key(key);
            let matches_single = name.ends_with("host") && !name.ends_with("hosts");
            let matches_multi = name.ends_with("hosts");
            let hosts: Vec<String> = if matches_multi {
                value.as_multi().map(|v| v.to_vec()).unwrap_or_default()
            } else if matches_single {
                value
                    .as_single()
                    .filter(|s| !s.is_empty())
                    .map(|s| vec![s.to_string()])
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            hosts.into_iter()
        })
    }
}

fn split_key(key: &str) -> (&str, &str) {
    match key.split_once('/') {
        Some((section, name)) => (section, name),
        None => ("", key),
    }
}

/// Reads the project-module-path environment override. Unset is acceptable;
/// the caller falls back to its own default path in that case.
pub fn env_project_path() -> Option<String> {
    std::env::var("KANZO_PROJECT").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sql_meta() -> IndexMap<String, ParamSpec> {
        let mut meta = IndexMap::new();
        meta.insert(
            "sql/host".to_string(),
            ParamSpec::new("sql/host", "localhost"),
        );
        meta.insert(
            "sql/backend".to_string(),
            ParamSpec::new("sql/backend", "mysql").with_options(
                ["postgresql".to_string(), "mysql".to_string()]
                    .into_iter()
                    .collect::<HashSet<_>>(),
            ),
        );
        meta.insert(
            "sql/admin_user".to_string(),
            ParamSpec::new("sql/admin_user", "admin"),
        );
        meta.insert(
            "sql/admin_password".to_string(),
            ParamSpec::new("sql/admin_password", "").with_validator(Arc::new(
                validators::min_length(8),
            )),
        );
        meta
    }

    mod metadata_completeness {
        use super::*;

        #[test]
        fn every_key_is_populated_after_construction() {
            let config = Config::new(sql_meta());
            for key in config.keys() {
                assert!(config.get(key).is_some());
            }
        }
    }

    mod scenario_s1 {
        use super::*;

        #[test]
        fn loads_successfully_from_assignments() {
            let mut config = Config::new(sql_meta());
            config.set("sql/host", "127.0.0.1").unwrap();
            config.set("sql/backend", "mysql").unwrap();
            config.set("sql/admin_user", "test").unwrap();
            config.set("sql/admin_password", "testtest").unwrap();

            assert_eq!(
                config.get("sql/host").unwrap().as_single(),
                Some("127.0.0.1")
            );
        }

        #[test]
        fn rejects_backend_outside_options() {
            let mut config = Config::new(sql_meta());
            assert!(config.set("sql/backend", "oracle").is_err());
        }

        #[test]
        fn rejects_password_below_min_length() {
            let mut config = Config::new(sql_meta());
            assert!(config.set("sql/admin_password", "short").is_err());
        }
    }

    mod host_dedup {
        use super::*;

        #[test]
        fn collects_single_and_multi_host_keys() {
            let mut meta = IndexMap::new();
            meta.insert("web/host".to_string(), ParamSpec::new("web/host", ""));
            meta.insert(
                "db/hosts".to_string(),
                ParamSpec::new("db/hosts", "").multi(vec![]),
            );
            let mut config = Config::new(meta);
            config.set("web/host", "h1").unwrap();
            config.set("db/hosts", "h2,h3,h2").unwrap();

            let hosts = config.hosts();
            assert_eq!(hosts.len(), 3);
            assert!(hosts.contains("h1"));
            assert!(hosts.contains("h2"));
            assert!(hosts.contains("h3"));
        }
    }

    mod load_save_roundtrip {
        use super::*;
        use std::io::Write;

        #[test]
        fn load_parses_sections_and_comments() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(
                file,
                "# a comment\n[sql]\nhost=127.0.0.1\nbackend=mysql\nadmin_user=test\nadmin_password=testtest\n"
            )
            .unwrap();

            let config = Config::load(file.path(), sql_meta()).unwrap();
            assert_eq!(
                config.get("sql/host").unwrap().as_single(),
                Some("127.0.0.1")
            );
        }
    }
}
