//! Named parameter rewriting and statement classification.
//!
//! Callers write `$name` placeholders; each backend wants positional ones
//! (`$1` for PostgreSQL, `?1` for SQLite and D1). Rewriting happens before a
//! statement reaches the driver so mismatches surface as [`DbError::Binding`].

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{DbError, Result};
use crate::value::{Params, Value};

static RETURNING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\breturning\b").expect("static pattern is valid")
});

const ROW_KEYWORDS: &[&str] = &["select", "with", "pragma", "explain", "values", "show"];

/// Positional placeholder syntax of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ... (PostgreSQL).
    Dollar,
    /// `?1`, `?2`, ... (SQLite, D1).
    Question,
}

impl PlaceholderStyle {
    /// Renders the placeholder for a 1-based parameter index.
    #[must_use]
    pub fn render(self, index: usize) -> String {
        match self {
            Self::Dollar => format!("${index}"),
            Self::Question => format!("?{index}"),
        }
    }
}

/// Expected shape of a statement's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// The statement produces rows.
    Rows,
    /// The statement produces an affected-row count.
    Count,
}

/// Rewrites `$name` placeholders into positional ones.
///
/// Returns the rewritten SQL and the values in placeholder order. A name used
/// more than once maps to a single position. A name bound to [`Value::Null`]
/// is written as a `NULL` literal so the server infers its type from context.
/// String literals, quoted
/// identifiers, comments and PostgreSQL dollar-quoted bodies are copied
/// verbatim; `$1`-style placeholders already in the text are left alone.
pub fn bind_named(
    sql: &str,
    params: &Params,
    style: PlaceholderStyle,
) -> Result<(String, Vec<Value>)> {
    let mut out = String::with_capacity(sql.len());
    let mut order: Vec<String> = Vec::new();
    let mut nulls: BTreeSet<String> = BTreeSet::new();
    let mut missing: BTreeSet<String> = BTreeSet::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let end = skip_quoted(&chars, i, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .map_or(chars.len(), |p| i + p);
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = find_seq(&chars, i + 2, &['*', '/']).map_or(chars.len(), |p| p + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            '$' if chars
                .get(i + 1)
                .is_some_and(|ch| ch.is_ascii_alphabetic() || *ch == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();

                // `$tag$ ... $tag$` is a PostgreSQL dollar-quoted string.
                if chars.get(end) == Some(&'$') {
                    let tag: Vec<char> = chars[i..=end].to_vec();
                    let close = find_seq(&chars, end + 1, &tag).map_or(chars.len(), |p| p + tag.len());
                    out.extend(&chars[i..close]);
                    i = close;
                    continue;
                }

                match params.get(&name) {
                    None => {
                        missing.insert(name.clone());
                    }
                    Some(Value::Null) => {
                        out.push_str("NULL");
                        nulls.insert(name);
                        i = end;
                        continue;
                    }
                    Some(_) => {}
                }
                let position = match order.iter().position(|n| *n == name) {
                    Some(p) => p + 1,
                    None => {
                        order.push(name);
                        order.len()
                    }
                };
                out.push_str(&style.render(position));
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    let used: BTreeSet<&str> = order
        .iter()
        .chain(&nulls)
        .map(String::as_str)
        .collect();
    let unused: Vec<&str> = params
        .keys()
        .map(String::as_str)
        .filter(|k| !used.contains(k))
        .collect();

    if !missing.is_empty() || !unused.is_empty() {
        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!(
                "missing values for {}",
                missing.iter().map(|n| format!("${n}")).collect::<Vec<_>>().join(", ")
            ));
        }
        if !unused.is_empty() {
            problems.push(format!(
                "unused values for {}",
                unused.iter().map(|n| format!("${n}")).collect::<Vec<_>>().join(", ")
            ));
        }
        return Err(DbError::Binding {
            sql: sql.to_string(),
            message: problems.join("; "),
        });
    }

    let values = order
        .iter()
        .filter_map(|name| params.get(name).cloned())
        .collect();
    Ok((out, values))
}

/// Classifies a statement as row-returning or count-returning by looking at
/// its leading keyword and for a `RETURNING` clause.
#[must_use]
pub fn classify(sql: &str) -> Shape {
    let code = strip_literals(sql);
    let first = code
        .split(|c: char| !c.is_ascii_alphabetic())
        .find(|word| !word.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if ROW_KEYWORDS.contains(&first.as_str()) || RETURNING.is_match(&code) {
        Shape::Rows
    } else {
        Shape::Count
    }
}

/// Replaces string literals, quoted identifiers and comments with spaces so
/// keyword checks cannot match inside them.
fn strip_literals(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let end = match c {
            '\'' | '"' => skip_quoted(&chars, i, c),
            '-' if chars.get(i + 1) == Some(&'-') => chars[i..]
                .iter()
                .position(|&ch| ch == '\n')
                .map_or(chars.len(), |p| i + p),
            '/' if chars.get(i + 1) == Some(&'*') => {
                find_seq(&chars, i + 2, &['*', '/']).map_or(chars.len(), |p| p + 2)
            }
            _ => {
                out.push(c);
                i += 1;
                continue;
            }
        };
        out.push(' ');
        i = end;
    }
    out
}

/// Returns the index just past the closing quote, honoring doubled quotes.
fn skip_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn find_seq(chars: &[char], from: usize, needle: &[char]) -> Option<usize> {
    if needle.is_empty() || from > chars.len() {
        return None;
    }
    chars[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}
