//! Field references extracted from formula expressions.
//!
//! The dependency engine never interprets formula semantics. It only needs
//! the list of fields an expression refers to, which an [`ExpressionParser`]
//! supplies. [`FieldCallParser`] is the default parser and understands the
//! two reference forms of the formula language:
//!
//! - `field('name')`: a field in the same table
//! - `lookup('link', 'target')`: field `target` in the table linked by the
//!   link-row field `link`
//!
//! Names may be single or double quoted; a backslash escapes the quote
//! character or another backslash.

use crate::error::{Error, Result};
use regex::{Captures, Regex};
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::LazyLock;

/// Quoted string argument: group 1 for single quotes, group 2 for double quotes.
const STRING_ARG: &str = r#"(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")"#;

static FIELD_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\bfield\s*\(\s*{STRING_ARG}\s*\)")).expect("valid field() regex")
});

static LOOKUP_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\blookup\s*\(\s*{STRING_ARG}\s*,\s*{STRING_ARG}\s*\)"
    ))
    .expect("valid lookup() regex")
});

static FUNCTION_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("valid call regex"));

/// A reference to another field, as produced by an expression parser.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldReference {
    /// A field in the same table, by name
    Field {
        /// Referenced field name
        name: String,
    },

    /// A field in a linked table, reached through a link-row field
    Lookup {
        /// Name of the link-row field in the same table
        through: String,
        /// Name of the field in the linked table
        target: String,
    },
}

impl FieldReference {
    /// Same-table reference
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field { name: name.into() }
    }

    /// Cross-table reference
    pub fn lookup(through: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Lookup {
            through: through.into(),
            target: target.into(),
        }
    }
}

/// Which name in an expression a rename applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameTarget {
    /// `field('...')` arguments
    Field,
    /// First argument of `lookup(...)`
    LookupThrough,
    /// Second argument of `lookup(...)`, only in lookups through `through`
    LookupTarget {
        /// Link-row field name the lookup must go through
        through: String,
    },
}

/// Converts expression text into the references it contains.
pub trait ExpressionParser: Send + Sync {
    /// Referenced fields in order of appearance.
    ///
    /// # Errors
    ///
    /// Returns `Error::MaximumFormulaSize` if the expression is nested
    /// deeper than the parser accepts.
    fn references(&self, expression: &str) -> Result<Vec<FieldReference>>;

    /// Lowercased names of every function called in the expression.
    fn function_names(&self, expression: &str) -> Result<BTreeSet<String>>;

    /// Rewrite references naming `old` so that they name `new`.
    fn rename_reference(
        &self,
        expression: &str,
        target: RenameTarget,
        old: &str,
        new: &str,
    ) -> String;
}

/// Default [`ExpressionParser`] for `field()` / `lookup()` references.
#[derive(Debug, Clone)]
pub struct FieldCallParser {
    max_nesting_depth: usize,
}

impl FieldCallParser {
    /// Create a parser rejecting expressions nested deeper than `max_nesting_depth`
    pub fn new(max_nesting_depth: usize) -> Self {
        Self { max_nesting_depth }
    }

    fn check_nesting(&self, expression: &str) -> Result<()> {
        let mut depth = 0usize;
        let mut deepest = 0usize;
        for c in strip_string_literals(expression).chars() {
            match c {
                '(' => {
                    depth += 1;
                    deepest = deepest.max(depth);
                }
                ')' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        if deepest > self.max_nesting_depth {
            return Err(Error::MaximumFormulaSize {
                depth: deepest,
                limit: self.max_nesting_depth,
            });
        }
        Ok(())
    }
}

impl Default for FieldCallParser {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_FORMULA_NESTING_DEPTH)
    }
}

impl ExpressionParser for FieldCallParser {
    fn references(&self, expression: &str) -> Result<Vec<FieldReference>> {
        self.check_nesting(expression)?;

        let mut found: Vec<(usize, FieldReference)> = calls(&FIELD_CALL, expression)
            .into_iter()
            .map(|caps| (position(&caps), FieldReference::field(string_arg(&caps, 1))))
            .collect();

        found.extend(calls(&LOOKUP_CALL, expression).into_iter().map(|caps| {
            (
                position(&caps),
                FieldReference::lookup(string_arg(&caps, 1), string_arg(&caps, 3)),
            )
        }));

        found.sort_by_key(|(start, _)| *start);
        Ok(found.into_iter().map(|(_, reference)| reference).collect())
    }

    fn function_names(&self, expression: &str) -> Result<BTreeSet<String>> {
        self.check_nesting(expression)?;
        let stripped = strip_string_literals(expression);
        Ok(FUNCTION_CALL
            .captures_iter(&stripped)
            .map(|caps| caps[1].to_ascii_lowercase())
            .collect())
    }

    fn rename_reference(
        &self,
        expression: &str,
        target: RenameTarget,
        old: &str,
        new: &str,
    ) -> String {
        match target {
            RenameTarget::Field => replace_calls(&FIELD_CALL, expression, |caps| {
                if string_arg(caps, 1) == old {
                    format!("field({})", quote(new))
                } else {
                    caps[0].to_string()
                }
            }),
            RenameTarget::LookupThrough | RenameTarget::LookupTarget { .. } => {
                replace_calls(&LOOKUP_CALL, expression, |caps| {
                    let mut through = string_arg(caps, 1);
                    let mut lookup_target = string_arg(caps, 3);
                    let slot = match &target {
                        RenameTarget::LookupTarget { through: required }
                            if *required != through =>
                        {
                            return caps[0].to_string();
                        }
                        RenameTarget::LookupTarget { .. } => &mut lookup_target,
                        _ => &mut through,
                    };
                    if slot != old {
                        return caps[0].to_string();
                    }
                    *slot = new.to_string();
                    format!("lookup({}, {})", quote(&through), quote(&lookup_target))
                })
            }
        }
    }
}

/// Matches of `regex` that do not start inside a string literal
fn calls<'h>(regex: &Regex, expression: &'h str) -> Vec<Captures<'h>> {
    let literals = string_literal_spans(expression);
    let mut found = Vec::new();
    let mut at = 0;

    while let Some(caps) = regex.captures_at(expression, at) {
        let Some(whole) = caps.get(0) else {
            break;
        };
        match literals.iter().find(|span| span.contains(&whole.start())) {
            Some(span) => at = span.end,
            None => {
                at = whole.end();
                found.push(caps);
            }
        }
    }
    found
}

/// Rewrite every call matched by [`calls`], leaving literal text untouched
fn replace_calls(
    regex: &Regex,
    expression: &str,
    rewrite: impl Fn(&Captures<'_>) -> String,
) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut copied = 0;
    for caps in calls(regex, expression) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&expression[copied..whole.start()]);
        out.push_str(&rewrite(&caps));
        copied = whole.end();
    }
    out.push_str(&expression[copied..]);
    out
}

/// Byte ranges of string literals, quotes included. An unterminated
/// literal runs to the end of the expression.
fn string_literal_spans(expression: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut open: Option<(usize, char)> = None;
    let mut escaped = false;

    for (i, c) in expression.char_indices() {
        match open {
            Some((start, q)) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    spans.push(start..i + c.len_utf8());
                    open = None;
                }
            }
            None if c == '\'' || c == '"' => open = Some((i, c)),
            None => {}
        }
    }
    if let Some((start, _)) = open {
        spans.push(start..expression.len());
    }
    spans
}

fn position(caps: &Captures<'_>) -> usize {
    caps.get(0).map_or(0, |m| m.start())
}

/// Unescaped value of the string argument starting at capture group `group`
/// (single quoted) or `group + 1` (double quoted).
fn string_arg(caps: &Captures<'_>, group: usize) -> String {
    let raw = caps
        .get(group)
        .or_else(|| caps.get(group + 1))
        .map_or("", |m| m.as_str());
    unescape(raw)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn quote(name: &str) -> String {
    format!("'{}'", name.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Blank out the contents of string literals so that parentheses and
/// identifiers inside them are not mistaken for syntax.
fn strip_string_literals(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut quote_char: Option<char> = None;
    let mut escaped = false;

    for c in expression.chars() {
        match quote_char {
            Some(q) => {
                if escaped {
                    escaped = false;
                    out.push(' ');
                } else if c == '\\' {
                    escaped = true;
                    out.push(' ');
                } else if c == q {
                    quote_char = None;
                    out.push(c);
                } else {
                    out.push(' ');
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote_char = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}
