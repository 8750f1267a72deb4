//! A narrow JSON-path evaluator.
//!
//! Supports the subset the engine needs for field selectors, template tags and
//! output extraction: `{.a.b}` wrapping, dotted fields, quoted fields
//! (`['a.b']`), indexes (`[0]`, `[-1]`), wildcards (`[*]`, `.*`) and equality
//! filters (`[?(@.type=="Ready")]`).

use std::fmt;

use serde_json::Value;

use crate::error::Error;
use crate::result::Result;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(i64),
    Wildcard,
    Filter {
        path: Vec<String>,
        negate: bool,
        value: Value,
    },
}

impl Segment {
    fn apply<'a>(&self, value: &'a Value) -> Vec<&'a Value> {
        match self {
            Self::Field(name) => value.get(name.as_str()).into_iter().collect(),
            Self::Index(index) => value
                .as_array()
                .and_then(|items| {
                    let len = i64::try_from(items.len()).ok()?;
                    let resolved = if *index < 0 { len.checked_add(*index)? } else { *index };
                    usize::try_from(resolved).ok().and_then(|i| items.get(i))
                })
                .into_iter()
                .collect(),
            Self::Wildcard => match value {
                Value::Array(items) => items.iter().collect(),
                Value::Object(map) => map.values().collect(),
                _ => Vec::new(),
            },
            Self::Filter {
                path,
                negate,
                value: expected,
            } => value
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter(|item| {
                            path.iter()
                                .try_fold(*item, |current, field| current.get(field.as_str()))
                                .is_some_and(|actual| (actual == expected) != *negate)
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// A parsed JSON-path expression.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parse an expression. `spec.a`, `.spec.a`, `$.spec.a` and `{.spec.a}`
    /// are equivalent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` for empty or malformed expressions.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let body = match trimmed.strip_prefix('{') {
            Some(inner) => inner
                .strip_suffix('}')
                .ok_or_else(|| Error::invalid_path(expr, "unterminated '{'"))?,
            None => trimmed,
        };
        let body = body.strip_prefix('$').unwrap_or(body);
        if body.is_empty() {
            return Err(Error::invalid_path(expr, "empty path"));
        }

        let normalized = if body.starts_with('.') || body.starts_with('[') {
            body.to_string()
        } else {
            format!(".{body}")
        };

        let mut segments = Vec::new();
        let mut rest = normalized.as_str();
        while !rest.is_empty() {
            if rest.starts_with("..") {
                return Err(Error::invalid_path(expr, "recursive descent is not supported"));
            }
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(['.', '[']).unwrap_or(after.len());
                let (name, remainder) = after.split_at(end);
                match name {
                    "" => return Err(Error::invalid_path(expr, "empty field name")),
                    "*" => segments.push(Segment::Wildcard),
                    _ => segments.push(Segment::Field(name.to_string())),
                }
                rest = remainder;
            } else if let Some(after) = rest.strip_prefix('[') {
                let close = closing_bracket(after)
                    .ok_or_else(|| Error::invalid_path(expr, "unterminated '['"))?;
                let (inner, remainder) = after.split_at(close);
                segments.push(parse_bracket(expr, inner.trim())?);
                rest = remainder.get(1..).unwrap_or_default();
            } else {
                return Err(Error::invalid_path(expr, format!("unexpected '{rest}'")));
            }
        }

        Ok(Self {
            raw: expr.to_string(),
            segments,
        })
    }

    /// The expression as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// All values the path selects.
    #[must_use]
    pub fn query<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        self.segments.iter().fold(vec![root], |current, segment| {
            current
                .into_iter()
                .flat_map(|value| segment.apply(value))
                .collect()
        })
    }

    /// The single value the path selects.
    ///
    /// # Errors
    ///
    /// Returns `PathNotFound` when nothing matches and `AmbiguousPath` when
    /// more than one value matches.
    pub fn evaluate_single<'a>(&self, root: &'a Value) -> Result<&'a Value> {
        let results = self.query(root);
        match results.as_slice() {
            [] => Err(Error::path_not_found(self.raw.clone())),
            [single] => Ok(*single),
            many => Err(Error::AmbiguousPath {
                path: self.raw.clone(),
                count: many.len(),
            }),
        }
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Parse `expr` and return the single value it selects in `root`.
///
/// # Errors
///
/// Returns an error if the expression is malformed or does not select exactly
/// one value.
pub fn evaluate(expr: &str, root: &Value) -> Result<Value> {
    JsonPath::parse(expr)?.evaluate_single(root).cloned()
}

fn closing_bracket(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, ']') => return Some(i),
            (None, _) => {}
        }
    }
    None
}

fn unquote(s: &str) -> Option<&str> {
    s.strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')))
}

fn parse_bracket(expr: &str, inner: &str) -> Result<Segment> {
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    if let Some(filter) = inner.strip_prefix('?') {
        return parse_filter(expr, filter.trim());
    }
    if let Some(name) = unquote(inner) {
        return Ok(Segment::Field(name.to_string()));
    }
    inner
        .parse::<i64>()
        .map(Segment::Index)
        .map_err(|_| Error::invalid_path(expr, format!("invalid index '{inner}'")))
}

fn parse_filter(expr: &str, filter: &str) -> Result<Segment> {
    let body = filter
        .strip_prefix('(')
        .and_then(|f| f.strip_suffix(')'))
        .ok_or_else(|| Error::invalid_path(expr, "filter must be wrapped in '(...)'"))?;

    let (left, right, negate) = if let Some((l, r)) = body.split_once("==") {
        (l, r, false)
    } else if let Some((l, r)) = body.split_once("!=") {
        (l, r, true)
    } else {
        return Err(Error::invalid_path(expr, "filter needs '==' or '!='"));
    };

    let path = left
        .trim()
        .strip_prefix("@.")
        .ok_or_else(|| Error::invalid_path(expr, "filter must start with '@.'"))?;
    if path.split('.').any(str::is_empty) {
        return Err(Error::invalid_path(expr, "empty field in filter"));
    }

    let right = right.trim();
    let value = match unquote(right) {
        Some(s) => Value::String(s.to_string()),
        None => serde_json::from_str(right)
            .map_err(|_| Error::invalid_path(expr, format!("invalid filter literal '{right}'")))?,
    };

    Ok(Segment::Filter {
        path: path.split('.').map(ToString::to_string).collect(),
        negate,
        value,
    })
}
