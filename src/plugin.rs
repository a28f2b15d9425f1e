//! The plugin contract: a fixed shape of parameters, modules, resources,
//! and four ordered phase-keyed callable lists. Plugins are loaded in
//! declaration order; their parameters are merged into configuration
//! metadata with duplicate detection.

use crate::config::{Config, ParamSpec};
use crate::error::Error;
use crate::rsh::RemoteShell;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A step run during `init`, `prep`, or `clean`: given a drone's shell, the
/// shared configuration, discovered facts, and the run's shared message
/// list, it performs side effects against the host and appends any
/// messages it wants surfaced to the caller directly onto that list.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(
        &self,
        shell: Arc<dyn RemoteShell>,
        config: Arc<Config>,
        facts: IndexMap<String, String>,
        messages: Arc<Mutex<Vec<String>>>,
    ) -> Result<(), Error>;
}

pub type PhaseStep = Arc<dyn Step>;

/// A record produced by a `plan` step: `(host, manifest name, marker,
/// prerequisite markers)`.
#[derive(Debug, Clone)]
pub struct PlanRecord {
    pub host: String,
    pub manifest: String,
    pub marker: String,
    pub prerequisites: Vec<String>,
}

/// A plan step runs sequentially (it may consult state left by earlier plan
/// steps) and yields zero or more [`PlanRecord`]s.
#[async_trait]
pub trait PlanStepTrait: Send + Sync {
    async fn run(
        &self,
        config: Arc<Config>,
        info: Arc<IndexMap<String, IndexMap<String, String>>>,
    ) -> Vec<PlanRecord>;
}

pub type PlanStep = Arc<dyn PlanStepTrait>;

/// A fixed-shape plugin: named parameters, module/resource paths, and four
/// ordered callable lists keyed by phase. Missing lists are simply empty;
/// there is no dynamic attribute lookup.
#[derive(Default, Clone)]
pub struct Plugin {
    pub name: String,
    pub parameters: Vec<ParamSpec>,
    pub modules: Vec<PathBuf>,
    pub resources: Vec<PathBuf>,
    pub init_steps: Vec<PhaseStep>,
    pub prep_steps: Vec<PhaseStep>,
    pub plan_steps: Vec<PlanStep>,
    pub clean_steps: Vec<PhaseStep>,
}

impl Plugin {
    pub fn new(name: impl Into<String>) -> Self {
        Plugin {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Merges every plugin's parameters into a single ordered metadata map,
/// rejecting (fatally) a parameter name declared by more than one plugin.
pub fn merge_parameters(plugins: &[Plugin]) -> Result<IndexMap<String, ParamSpec>, Error> {
    let mut meta = IndexMap::new();
    for plugin in plugins {
        for param in &plugin.parameters {
            if meta.contains_key(&param.name) {
                return Err(Error::config(
                    param.name.clone(),
                    format!("duplicated parameter found (plugin `{}`)", plugin.name),
                ));
            }
            meta.insert(param.name.clone(), param.clone());
        }
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    mod merge_parameters {
        use super::*;

        #[test]
        fn merges_in_declaration_order() {
            let mut a = Plugin::new("a");
            a.parameters.push(ParamSpec::new("a/key", "1"));
            let mut b = Plugin::new("b");
            b.parameters.push(ParamSpec::new("b/key", "2"));

            let meta = merge_parameters(&[a, b]).unwrap();
            let keys: Vec<&str> = meta.keys().map(String::as_str).collect();
            assert_eq!(keys, vec!["a/key", "b/key"]);
        }

        #[test]
        fn rejects_duplicate_parameter_key() {
            let mut a = Plugin::new("a");
            a.parameters.push(ParamSpec::new("shared/key", "1"));
            let mut b = Plugin::new("b");
            b.parameters.push(ParamSpec::new("shared/key", "2"));

            assert!(merge_parameters(&[a, b]).is_err());
        }
    }
}
