//! Manifest Library (ML): a process-wide registry that accumulates named
//! manifests as ordered fragment lists and renders them to disk, plus a
//! parallel registry for structured hierarchical data files.

use crate::config::Config;
use crate::error::Error;
use indexmap::IndexMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One fragment contributing to a named manifest: a template file, a
/// per-fragment variable context, and optional data-file contributions
/// merged into the matching data-file entry at render time.
#[derive(Clone)]
pub struct Fragment {
    pub template_path: PathBuf,
    pub context: IndexMap<String, String>,
    pub data_contrib: Option<IndexMap<String, String>>,
}

/// Accumulates fragments per manifest name, preserving registration order,
/// and renders a concatenated, variable-substituted manifest to disk.
#[derive(Default)]
pub struct ManifestLibrary {
    manifests: IndexMap<String, Vec<Fragment>>,
    scratch_counter: u64,
}

impl ManifestLibrary {
    pub fn new() -> Self {
        ManifestLibrary::default()
    }

    /// Appends a fragment to `name`'s ordered list. The template path must
    /// exist.
    pub fn add_fragment(
        &mut self,
        name: &str,
        template_path: impl Into<PathBuf>,
        context: IndexMap<String, String>,
        data_contrib: Option<IndexMap<String, String>>,
    ) -> Result<(), Error> {
        let template_path = template_path.into();
        if !template_path.exists() {
            return Err(Error::config(
                name,
                format!("unknown template path: {}", template_path.display()),
            ));
        }
        self.manifests
            .entry(name.to_string())
            .or_default()
            .push(Fragment {
                template_path,
                context,
                data_contrib,
            });
        Ok(())
    }

    /// Writes `text` to a scratch file, then forwards to [`Self::add_fragment`].
    pub fn add_fragment_inline(
        &mut self,
        name: &str,
        text: &str,
        scratch_dir: &Path,
        context: IndexMap<String, String>,
        data_contrib: Option<IndexMap<String, String>>,
    ) -> Result<(), Error> {
        fs::create_dir_all(scratch_dir).map_err(|e| Error::structure(scratch_dir.display().to_string(), e))?;
        self.scratch_counter += 1;
        let path = scratch_dir.join(format!("{name}-{}.fragment", self.scratch_counter));
        fs::write(&path, text).map_err(|e| Error::structure(path.display().to_string(), e))?;
        self.add_fragment(name, path, context, data_contrib)
    }

    /// Concatenates `name`'s fragment templates in registration order,
    /// substituting `{variable}` placeholders from the union of
    /// fragment-context and `config` (fragment context wins on collision),
    /// writes `tmpdir/<name>.pp`, and merges any data contributions into
    /// `data_files`.
    pub fn render(
        &self,
        name: &str,
        tmpdir: &Path,
        config: &Config,
        data_files: &mut DataFileLibrary,
    ) -> Result<PathBuf, Error> {
        let fragments = self
            .manifests
            .get(name)
            .ok_or_else(|| Error::config(name, "no such manifest registered"))?;

        let mut rendered = String::new();
        for fragment in fragments {
            let template = fs::read_to_string(&fragment.template_path)
                .map_err(|e| Error::structure(fragment.template_path.display().to_string(), e))?;
            rendered.push_str(&substitute(&template, &fragment.context, config));
            rendered.push('\n');

            if let Some(contrib) = &fragment.data_contrib {
                data_files.set_many(name, contrib.clone());
            }
        }

        fs::create_dir_all(tmpdir).map_err(|e| Error::structure(tmpdir.display().to_string(), e))?;
        let path = tmpdir.join(format!("{name}.pp"));
        fs::write(&path, rendered).map_err(|e| Error::structure(path.display().to_string(), e))?;
        Ok(path)
    }
}

/// Substitutes `{key}` placeholders in `template` from `context`, falling
/// back to `config`'s single-valued keys; `context` wins on collision.
fn substitute(template: &str, context: &IndexMap<String, String>, config: &Config) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let key = &template[i + 1..i + end];
                let value = context.get(key).cloned().or_else(|| {
                    config
                        .get(key)
                        .and_then(|v| v.as_single().map(str::to_string))
                });
                if let Some(value) = value {
                    out.push_str(&value);
                    i += end + 1;
                    continue;
                }
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    let _ = chars.peek();
    out
}

/// Structured hierarchical data-file registry: name → mapping, serialized
/// as YAML with explicit document start and no inline flow style.
#[derive(Default, Clone)]
pub struct DataFileLibrary {
    data: IndexMap<String, IndexMap<String, String>>,
}

impl DataFileLibrary {
    pub fn new() -> Self {
        DataFileLibrary::default()
    }

    pub fn set(&mut self, name: &str, key: &str, value: &str) {
        self.data
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Merges `mapping` into `name`'s entry, last-writer-wins per key.
    pub fn set_many(&mut self, name: &str, mapping: IndexMap<String, String>) {
        let entry = self.data.entry(name.to_string()).or_default();
        for (k, v) in mapping {
            entry.insert(k, v);
        }
    }

    pub fn dump(&self, name: &str) -> Result<String, Error> {
        let entry = self.data.get(name).cloned().unwrap_or_default();
        serde_yaml::to_string(&entry).map_err(|e| Error::config(name, e))
    }

    /// Renders `name`'s entry into `dir/<name>.yaml`.
    pub fn render(&self, name: &str, dir: &Path) -> Result<PathBuf, Error> {
        let text = self.dump(name)?;
        fs::create_dir_all(dir).map_err(|e| Error::structure(dir.display().to_string(), e))?;
        let path = dir.join(format!("{name}.yaml"));
        fs::write(&path, text).map_err(|e| Error::structure(path.display().to_string(), e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap as Map;

    mod manifest_library {
        use super::*;

        #[test]
        fn render_is_idempotent() {
            let dir = tempfile::tempdir().unwrap();
            let template_path = dir.path().join("frag.pp.tmpl");
            fs::write(&template_path, "class foo { $x = \"{x}\" }").unwrap();

            let mut lib = ManifestLibrary::new();
            let mut ctx = Map::new();
            ctx.insert("x".to_string(), "bar".to_string());
            lib.add_fragment("site", &template_path, ctx, None).unwrap();

            let config = Config::new(Map::new());
            let mut data = DataFileLibrary::new();
            let rendered_dir = dir.path().join("out");
            let first = lib.render("site", &rendered_dir, &config, &mut data).unwrap();
            let first_text = fs::read_to_string(&first).unwrap();
            let second = lib.render("site", &rendered_dir, &config, &mut data).unwrap();
            let second_text = fs::read_to_string(&second).unwrap();

            assert_eq!(first_text, second_text);
        }

        #[test]
        fn preserves_fragment_registration_order() {
            let dir = tempfile::tempdir().unwrap();
            let a = dir.path().join("a.pp.tmpl");
            let b = dir.path().join("b.pp.tmpl");
            fs::write(&a, "# a\n").unwrap();
            fs::write(&b, "# b\n").unwrap();

            let mut lib = ManifestLibrary::new();
            lib.add_fragment("site", &a, Map::new(), None).unwrap();
            lib.add_fragment("site", &b, Map::new(), None).unwrap();

            let config = Config::new(Map::new());
            let mut data = DataFileLibrary::new();
            let rendered = lib
                .render("site", &dir.path().join("out"), &config, &mut data)
                .unwrap();
            let text = fs::read_to_string(rendered).unwrap();
            assert!(text.find("# a").unwrap() < text.find("# b").unwrap());
        }

        #[test]
        fn unknown_template_path_is_config_error() {
            let mut lib = ManifestLibrary::new();
            let result = lib.add_fragment("site", "/no/such/file.pp.tmpl", Map::new(), None);
            assert!(result.is_err());
        }
    }

    mod data_file_library {
        use super::*;

        #[test]
        fn set_many_is_last_writer_wins_per_key() {
            let mut data = DataFileLibrary::new();
            let mut first = Map::new();
            first.insert("a".to_string(), "1".to_string());
            let mut second = Map::new();
            second.insert("a".to_string(), "2".to_string());
            second.insert("b".to_string(), "3".to_string());

            data.set_many("hiera", first);
            data.set_many("hiera", second);

            let dumped = data.dump("hiera").unwrap();
            assert!(dumped.contains("a: '2'") || dumped.contains("a: 2"));
            assert!(dumped.contains('b'));
        }
    }
}
