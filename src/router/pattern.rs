//! Route template compiler.
//!
//! Templates are made of literal segments and named parameters:
//!
//! | segment  | matches                                                       |
//! |----------|---------------------------------------------------------------|
//! | `things` | the literal `things`                                          |
//! | `:id`    | exactly one segment (no `/`)                                  |
//! | `:id?`   | zero or one segment; the leading `/` is optional with it      |
//! | `:name*` | one or more characters, `/` included; must be the last element |
//!
//! The compiled regex is anchored at both ends and always tolerates one
//! trailing `/`. Template errors surface here, at registration time, never
//! while serving a request.

use super::core::ParamVec;
use regex::Regex;
use std::borrow::Cow;
use std::sync::Arc;
use thiserror::Error;

/// Registration-time route errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route template '{template}' is malformed: {reason}")]
    Malformed { template: String, reason: String },

    #[error("route template '{template}' declares parameter '{name}' more than once")]
    DuplicateParameter { template: String, name: String },

    #[error("route template '{template}': greedy parameter '{name}' must be the last element")]
    NonFinalGreedy { template: String, name: String },

    #[error("route '{template}' already has a handler for {method}")]
    Conflict { template: String, method: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Required,
    Optional,
    Greedy,
    OptionalGreedy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Param { name: &'a str, kind: ParamKind },
}

/// A route template compiled into an anchored matcher.
///
/// Read-only once built. Two templates that compile to the same regex are
/// the same pattern as far as the route table is concerned. Templates that
/// differ only in parameter names share a [`shape`](Self::shape).
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    template: String,
    regex: Regex,
    shape: String,
    param_names: Vec<Arc<str>>,
    literal_len: usize,
}

impl CompiledPattern {
    /// Compile a template such as `/api/archive/:instance/parameters/:name*`.
    pub fn compile(template: &str) -> Result<Self, RouteError> {
        let segments = parse_segments(template)?;

        let mut pattern = String::with_capacity(template.len() * 2 + 8);
        pattern.push('^');
        let mut shape = String::with_capacity(template.len());
        let mut param_names: Vec<Arc<str>> = Vec::new();
        let mut literal_len = 0;

        for segment in &segments {
            match *segment {
                Segment::Literal(text) => {
                    pattern.push('/');
                    pattern.push_str(&regex::escape(text));
                    shape.push('/');
                    shape.push_str(text);
                    literal_len += text.len() + 1;
                }
                Segment::Param { name, kind } => {
                    if param_names.iter().any(|n| n.as_ref() == name) {
                        return Err(RouteError::DuplicateParameter {
                            template: template.to_string(),
                            name: name.to_string(),
                        });
                    }
                    let body = match kind {
                        ParamKind::Required | ParamKind::Optional => "[^/]+",
                        ParamKind::Greedy | ParamKind::OptionalGreedy => ".+?",
                    };
                    let group = format!("/(?P<{name}>{body})");
                    match kind {
                        ParamKind::Required | ParamKind::Greedy => pattern.push_str(&group),
                        ParamKind::Optional | ParamKind::OptionalGreedy => {
                            pattern.push_str("(?:");
                            pattern.push_str(&group);
                            pattern.push_str(")?");
                        }
                    }
                    shape.push_str(match kind {
                        ParamKind::Required => "/:",
                        ParamKind::Optional => "/:?",
                        ParamKind::Greedy => "/:*",
                        ParamKind::OptionalGreedy => "/:*?",
                    });
                    param_names.push(Arc::from(name));
                }
            }
        }
        pattern.push_str("/?$");

        let regex = Regex::new(&pattern).map_err(|e| RouteError::Malformed {
            template: template.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            template: template.to_string(),
            regex,
            shape,
            param_names,
            literal_len,
        })
    }

    /// Match a concrete path (no query string). Returns the captured
    /// parameters in template order; absent optional parameters are omitted.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<ParamVec> {
        let caps = self.regex.captures(path)?;
        let mut params = ParamVec::new();
        for name in &self.param_names {
            if let Some(m) = caps.name(name) {
                params.push((Arc::clone(name), decode(m.as_str()).into_owned()));
            }
        }
        Some(params)
    }

    #[inline]
    #[must_use]
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// The template this pattern was compiled from.
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The anchored regex source. Used as the identity of the pattern.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// The template with parameter names erased, e.g. `/things/:`. Patterns
    /// with equal shapes accept exactly the same paths.
    #[must_use]
    pub fn shape(&self) -> &str {
        &self.shape
    }

    #[must_use]
    pub fn param_names(&self) -> &[Arc<str>] {
        &self.param_names
    }

    /// Number of literal characters (separators included); higher means
    /// more specific.
    #[must_use]
    pub fn literal_len(&self) -> usize {
        self.literal_len
    }
}

/// Compile a route template. Shorthand for [`CompiledPattern::compile`].
pub fn compile_template(template: &str) -> Result<CompiledPattern, RouteError> {
    CompiledPattern::compile(template)
}

fn decode(raw: &str) -> Cow<'_, str> {
    if !raw.contains('%') {
        return Cow::Borrowed(raw);
    }
    urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
}

fn parse_segments(template: &str) -> Result<Vec<Segment<'_>>, RouteError> {
    let malformed = |reason: &str| RouteError::Malformed {
        template: template.to_string(),
        reason: reason.to_string(),
    };

    let rest = template
        .strip_prefix('/')
        .ok_or_else(|| malformed("must start with '/'"))?;
    // a single trailing separator is always tolerated at match time
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<&str> = rest.split('/').collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (idx, part) in raw.iter().enumerate() {
        if part.is_empty() {
            return Err(malformed("empty path segment"));
        }
        let Some(param) = part.strip_prefix(':') else {
            segments.push(Segment::Literal(part));
            continue;
        };

        let (name, kind) = if let Some(n) = param.strip_suffix("*?") {
            (n, ParamKind::OptionalGreedy)
        } else if let Some(n) = param.strip_suffix('*') {
            (n, ParamKind::Greedy)
        } else if let Some(n) = param.strip_suffix('?') {
            (n, ParamKind::Optional)
        } else {
            (param, ParamKind::Required)
        };

        if !is_valid_name(name) {
            return Err(malformed(&format!("invalid parameter name '{name}'")));
        }
        let greedy = matches!(kind, ParamKind::Greedy | ParamKind::OptionalGreedy);
        if greedy && idx + 1 != raw.len() {
            return Err(RouteError::NonFinalGreedy {
                template: template.to_string(),
                name: name.to_string(),
            });
        }
        segments.push(Segment::Param { name, kind });
    }
    Ok(segments)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
