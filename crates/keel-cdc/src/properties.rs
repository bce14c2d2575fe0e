//! Debezium properties templates
//!
//! Templates are plain `key=value` files with `%NAME%` placeholders.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use keel_common::{Error, Result};

fn is_placeholder(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn substitute(
    template: &str,
    vars: &BTreeMap<String, String>,
    missing: &mut BTreeSet<String>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if is_placeholder(&after[..end]) => {
                let name = &after[..end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        missing.insert(name.to_string());
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Replace every `%NAME%` with its value. Unknown placeholders are left as is.
///
/// Substitution is a single pass: values are never re-scanned.
pub fn render_properties(template: &str, vars: &BTreeMap<String, String>) -> String {
    substitute(template, vars, &mut BTreeSet::new())
}

/// Like [`render_properties`], but an unknown placeholder is a configuration error
pub fn render_properties_strict(template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut missing = BTreeSet::new();
    let rendered = substitute(template, vars, &mut missing);
    if missing.is_empty() {
        Ok(rendered)
    } else {
        let names: Vec<String> = missing.into_iter().collect();
        Err(Error::config(
            "debezium",
            format!("unresolved properties placeholders: {}", names.join(", ")),
        ))
    }
}

/// Read a properties template from disk
pub fn load_template(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::io(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case::single("a=%HOST%", "a=db.local")]
    #[case::repeated("%HOST%:%HOST%", "db.local:db.local")]
    #[case::unknown_kept("a=%OTHER%", "a=%OTHER%")]
    #[case::lone_percent("ratio=50%", "ratio=50%")]
    #[case::double_percent("x=%%HOST%", "x=%db.local")]
    #[case::not_a_name("x=%a b%HOST%", "x=%a bdb.local")]
    fn substitutes_placeholders(#[case] template: &str, #[case] expected: &str) {
        assert_eq!(render_properties(template, &vars(&[("HOST", "db.local")])), expected);
    }

    #[test]
    fn values_are_not_rescanned() {
        let v = vars(&[("A", "%B%"), ("B", "nope")]);
        assert_eq!(render_properties("%A%", &v), "%B%");
    }

    #[test]
    fn strict_reports_every_missing_name() {
        let err = render_properties_strict("%A%\n%B%\n%C%", &vars(&[("B", "1")])).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("A, C"));
    }

    #[test]
    fn missing_template_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_template(&dir.path().join("absent.properties")).unwrap_err();
        assert!(!err.is_config());
        assert!(err.to_string().contains("absent.properties"));
    }
}
