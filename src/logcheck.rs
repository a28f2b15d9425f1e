//! Log Checker (LC): classifies a manifest-application log against
//! configurable error, ignore, and surrogate (rewrite) rules.

use crate::error::Error;
use crate::strings::strip_color;
use regex::Regex;

/// A surrogate pair: a regex and a `{1}`/`{2}`-style template substituted
/// with the regex's captured groups, positional and contiguous from 1.
pub struct Surrogate {
    pub pattern: Regex,
    pub template: String,
}

/// Ordered classification rules. An empty `ignore` list means "never
/// ignore"; an empty `surrogates` list means "report the raw line".
pub struct LogChecker {
    pub errors: Vec<Regex>,
    pub ignore: Vec<Regex>,
    pub surrogates: Vec<Surrogate>,
}

impl LogChecker {
    pub fn new(errors: Vec<Regex>, ignore: Vec<Regex>, surrogates: Vec<Surrogate>) -> Self {
        LogChecker {
            errors,
            ignore,
            surrogates,
        }
    }

    /// The stock Puppet-flavoured error list, matching the original
    /// project's configured defaults.
    pub fn default_errors() -> Vec<Regex> {
        const PATTERNS: &[&str] = &[
            r"err:",
            r"Syntax error at",
            r"^Duplicate definition:",
            r"^Invalid tag",
            r"^No matching value for selector param",
            r"^Parameter name failed:",
            r"Error:",
            r"^Invalid parameter",
            r"^Duplicate declaration:",
            r"^Could not find resource",
            r"^Could not parse for",
            r"^Could not autoload",
            r"^/usr/bin/puppet:\d+: .+",
            r".+\(LoadError\)",
            r"^/usr/bin/env: jruby: No such file or directory",
        ];
        PATTERNS.iter().map(|p| Regex::new(p).unwrap()).collect()
    }

    /// Checks `text` line by line: strips colour escapes, skips lines
    /// matching no error regex, skips lines matching any ignore regex,
    /// else raises [`Error::Log`] with the first unignored matching line
    /// (or its surrogate substitution). Returns `Ok(())` if every line is
    /// skipped.
    pub fn check(&self, host: &str, manifest: &str, text: &str) -> Result<(), Error> {
        for raw_line in text.lines() {
            let line = strip_color(raw_line);
            if !self.errors.iter().any(|re| re.is_match(&line)) {
                continue;
            }
            if self.ignore.iter().any(|re| re.is_match(&line)) {
                continue;
            }
            let reported = self.surrogate_message(&line).unwrap_or(line.clone());
            return Err(Error::Log {
                host: host.to_string(),
                manifest: manifest.to_string(),
                line: reported,
            });
        }
        Ok(())
    }

    fn surrogate_message(&self, line: &str) -> Option<String> {
        for surrogate in &self.surrogates {
            if let Some(caps) = surrogate.pattern.captures(line) {
                return Some(substitute_groups(&surrogate.template, &caps));
            }
        }
        None
    }
}

/// Substitutes `{1}`, `{2}`, ... in `template` with `caps`'s numbered
/// groups, positional and contiguous from 1; a missing group is elided
/// and substitution continues with the rest of the template.
fn substitute_groups(template: &str, caps: &regex::Captures) -> String {
    let mut out = String::new();
    let mut n = 1;
    let mut rest = template;
    loop {
        let marker = format!("{{{n}}}");
        match rest.find(&marker) {
            Some(pos) => {
                out.push_str(&rest[..pos]);
                if let Some(group) = caps.get(n) {
                    out.push_str(group.as_str());
                }
                rest = &rest[pos + marker.len()..];
                n += 1;
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker_with(ignore: Vec<&str>, surrogates: Vec<(&str, &str)>) -> LogChecker {
        LogChecker::new(
            LogChecker::default_errors(),
            ignore.into_iter().map(|p| Regex::new(p).unwrap()).collect(),
            surrogates
                .into_iter()
                .map(|(p, t)| Surrogate {
                    pattern: Regex::new(p).unwrap(),
                    template: t.to_string(),
                })
                .collect(),
        )
    }

    mod scenario_s4 {
        use super::*;

        #[test]
        fn unignored_error_raises_log_error() {
            let checker = checker_with(vec![], vec![]);
            let result = checker.check("h1", "m1", "err: Could not find resource");
            assert!(matches!(result, Err(Error::Log { .. })));
        }

        #[test]
        fn ignore_regex_suppresses_matching_error() {
            let checker = checker_with(vec!["benign"], vec![]);
            assert!(checker.check("h1", "m1", "err: benign").is_ok());
        }

        #[test]
        fn surrogate_substitutes_positional_groups() {
            let checker = checker_with(
                vec![],
                vec![(
                    r"Sysctl::Value\[.*\]/Sysctl\[(.*)\].*Field 'val' is required",
                    "Cannot change {1}",
                )],
            );
            let result = checker.check(
                "h1",
                "m1",
                "Sysctl::Value[x]/Sysctl[foo]blah Field 'val' is required",
            );
            match result {
                Err(Error::Log { line, .. }) => assert_eq!(line, "Cannot change foo"),
                other => panic!("expected Log error, got {other:?}"),
            }
        }

        #[test]
        fn no_error_match_is_ok() {
            let checker = checker_with(vec![], vec![]);
            assert!(checker.check("h1", "m1", "notice: applied").is_ok());
        }
    }

    mod strip_color_integration {
        use super::*;

        #[test]
        fn colour_escapes_are_stripped_before_matching() {
            let checker = checker_with(vec![], vec![]);
            let line = "\x1b[0;31merr: Could not find resource\x1b[0m";
            assert!(checker.check("h1", "m1", line).is_err());
        }
    }
}
