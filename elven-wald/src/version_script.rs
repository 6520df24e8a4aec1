//! A minimal parser for the flat subset of GNU `ld`'s version-script
//! grammar spec.md §6.1 names (`version_script`, `dynamic_list`) but
//! doesn't spell out: `{ global: pat; ...; local: pat; ...; };`, with an
//! optional leading version tag (`VERS_1.0 { ... };`) that is parsed and
//! discarded, since this core has no symbol-versioning output format to
//! attach it to. Full scripting-language semantics (nested version nodes,
//! inheritance via `VERS_2.0 { ... } VERS_1.0;`) are out of scope per §1;
//! this covers exactly the shape real build systems emit for
//! export-list control.

use bstr::BString;

use crate::error::ParseError;

/// The two pattern lists a version script assigns visibility from:
/// `global` patterns keep (or force) default visibility, `local`
/// patterns force hidden visibility on everything they match that
/// wasn't already claimed by a `global` pattern.
#[derive(Debug, Clone, Default)]
pub struct VersionScript {
    pub global: Vec<String>,
    pub local: Vec<String>,
}

/// Parses the `{ global: ...; local: ...; };` body, ignoring any leading
/// version tag identifier. Only `global:`/`local:` sections are
/// recognized; anything else inside the braces (nested version nodes,
/// `extern "C++" { ... }` blocks) is rejected rather than silently
/// mis-parsed.
pub fn parse(text: &str) -> Result<VersionScript, ParseError> {
    let body = brace_body(text)?;

    let mut script = VersionScript::default();
    let mut section: Option<&mut Vec<String>> = None;

    for raw_entry in body.split(';') {
        let entry = strip_comments(raw_entry).trim();
        if entry.is_empty() {
            continue;
        }

        if let Some(rest) = entry.strip_prefix("global:") {
            script.global.extend(patterns_in(rest));
            section = Some(&mut script.global);
            continue;
        }
        if let Some(rest) = entry.strip_prefix("local:") {
            script.local.extend(patterns_in(rest));
            section = Some(&mut script.local);
            continue;
        }
        if entry == "global" || entry == "local" {
            // A bare `global:`/`local:` split across two `;`-delimited
            // chunks never happens in practice (the colon isn't a
            // separator), but guard against an empty section header.
            continue;
        }

        match &mut section {
            Some(list) => list.extend(patterns_in(entry)),
            None => {
                return Err(ParseError::VersionScriptSyntax(format!(
                    "entry `{entry}` outside of a global:/local: section"
                )))
            }
        }
    }

    Ok(script)
}

/// GNU `ld`'s `--dynamic-list=file` format: the same brace-delimited
/// body but as a flat list of symbols to force into `.dynsym`, with no
/// `global:`/`local:` sections.
pub fn parse_dynamic_list(text: &str) -> Result<Vec<String>, ParseError> {
    let body = brace_body(text)?;
    let mut patterns = Vec::new();
    for raw_entry in body.split(';') {
        let entry = strip_comments(raw_entry).trim();
        if entry.is_empty() {
            continue;
        }
        patterns.extend(patterns_in(entry));
    }
    Ok(patterns)
}

/// Returns the text between the first matching `{`/`}` pair, after a
/// dropped leading version tag if present (`VERS_1.0 {` or bare `{`).
fn brace_body(text: &str) -> Result<String, ParseError> {
    let start = text
        .find('{')
        .ok_or_else(|| ParseError::VersionScriptSyntax("missing opening `{`".to_owned()))?;
    let mut depth = 0usize;
    let mut end = None;
    for (i, c) in text[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + i);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end.ok_or_else(|| ParseError::VersionScriptSyntax("unterminated `{`".to_owned()))?;
    Ok(text[start + 1..end].to_owned())
}

fn strip_comments(s: &str) -> &str {
    match s.find('#') {
        Some(i) => &s[..i],
        None => s,
    }
}

fn patterns_in(s: &str) -> Vec<String> {
    s.split_whitespace().map(|p| p.trim_matches('"').to_owned()).collect()
}

/// Glob-matches `name` against `pattern`, where `*` matches any run of
/// bytes (including none) and `?` matches exactly one byte. No character
/// classes or escaping, matching the subset real export-list generators
/// actually emit (`foo*`, `_Z*`, `*`).
pub fn glob_match(pattern: &str, name: &[u8]) -> bool {
    glob_match_bytes(pattern.as_bytes(), name)
}

fn glob_match_bytes(pattern: &[u8], name: &[u8]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((b'*', rest)) => {
            if rest.is_empty() {
                return true;
            }
            (0..=name.len()).any(|i| glob_match_bytes(rest, &name[i..]))
        }
        Some((b'?', rest)) => !name.is_empty() && glob_match_bytes(rest, &name[1..]),
        Some((c, rest)) => name.first() == Some(c) && glob_match_bytes(rest, &name[1..]),
    }
}

pub fn matches_any(patterns: &[String], name: &BString) -> bool {
    patterns.iter().any(|p| glob_match(p, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_any_run() {
        assert!(glob_match("foo*", b"foobar"));
        assert!(glob_match("*", b"anything"));
        assert!(!glob_match("foo*", b"bar"));
    }

    #[test]
    fn glob_question_matches_one_byte() {
        assert!(glob_match("fo?", b"foo"));
        assert!(!glob_match("fo?", b"fo"));
        assert!(!glob_match("fo?", b"fooo"));
    }

    #[test]
    fn parses_global_and_local_sections() {
        let script = parse("VERS_1.0 {\n  global:\n    foo;\n    bar*;\n  local:\n    *;\n};").unwrap();
        assert_eq!(script.global, vec!["foo".to_owned(), "bar*".to_owned()]);
        assert_eq!(script.local, vec!["*".to_owned()]);
    }

    #[test]
    fn parses_unnamed_version_node() {
        let script = parse("{ global: exported_fn; local: *; };").unwrap();
        assert_eq!(script.global, vec!["exported_fn".to_owned()]);
        assert_eq!(script.local, vec!["*".to_owned()]);
    }

    #[test]
    fn entry_outside_a_section_is_an_error() {
        assert!(parse("{ foo; };").is_err());
    }

    #[test]
    fn dynamic_list_is_a_flat_pattern_list() {
        let patterns = parse_dynamic_list("{\n  sym1;\n  sym2;\n};").unwrap();
        assert_eq!(patterns, vec!["sym1".to_owned(), "sym2".to_owned()]);
    }
}
