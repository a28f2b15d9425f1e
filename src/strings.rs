//! Log-masking and colour-stripping utilities, used in exactly one place:
//! the Remote Shell's log emitter and the free [`mask`] function itself.

use regex::Regex;
use std::sync::OnceLock;

/// Strips terminal colour escapes (`ESC[...m`-style sequences) from `text`.
///
/// Applied before Log Checker classification and before masked text is
/// logged, so neither sees raw escape bytes.
pub fn strip_color(text: &str) -> String {
    static COLOR: OnceLock<Regex> = OnceLock::new();
    let re = COLOR.get_or_init(|| Regex::new(r"\x1b.*?\d\dm").unwrap());
    re.replace_all(text, "").into_owned()
}

/// Replaces every occurrence of every string in `mask_list` with a fixed
/// token, leaving non-masked spans untouched.
///
/// This is the single substitution point mentioned in the masking design
/// note: both the Remote Shell's log emitter and a plain `execute` helper
/// call through here rather than writing unmasked text to a log.
pub fn mask(text: &str, mask_list: &[String]) -> String {
    const TOKEN: &str = "***MASKED***";
    let mut masked = text.to_string();
    for word in mask_list {
        if word.is_empty() {
            continue;
        }
        masked = masked.replace(word.as_str(), TOKEN);
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;

    mod strip_color {
        use super::*;

        #[test]
        fn removes_escape_sequences() {
            let input = "\x1b[0;32mnotice\x1b[0m: applied";
            assert_eq!(strip_color(input), "notice: applied");
        }

        #[test]
        fn leaves_plain_text_alone() {
            assert_eq!(strip_color("err: plain"), "err: plain");
        }
    }

    mod mask {
        use super::*;

        #[test]
        fn substitutes_every_masked_word() {
            let masked = mask(
                "password=hunter2 user=admin",
                &["hunter2".to_string()],
            );
            assert!(!masked.contains("hunter2"));
            assert!(masked.contains("user=admin"));
        }

        #[test]
        fn preserves_non_masked_spans_verbatim() {
            let masked = mask("alpha beta gamma", &["beta".to_string()]);
            assert!(masked.starts_with("alpha "));
            assert!(masked.ends_with(" gamma"));
        }

        #[test]
        fn empty_mask_list_is_a_no_op() {
            assert_eq!(mask("unchanged", &[]), "unchanged");
        }
    }
}
