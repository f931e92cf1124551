//! Router core module - hot path for request routing.
//!
//! Lookups never take a lock: the two route lists live behind an
//! [`ArcSwap`] and registration publishes a fresh copy (copy-on-write).
//! Registrations themselves are serialized by a mutex.

#![deny(clippy::inefficient_to_string)]
#![deny(clippy::format_push_string)]
#![deny(clippy::unnecessary_to_owned)]

use super::pattern::{CompiledPattern, RouteError};
use super::rule::RouteRule;
use crate::error::ApiError;
use arc_swap::ArcSwap;
use http::Method;
use serde::Serialize;
use smallvec::SmallVec;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Placeholder substituted into dynamic (per-instance) templates.
pub const INSTANCE_PLACEHOLDER: &str = ":instance";

/// Maximum number of path/query parameters before heap allocation.
pub const MAX_INLINE_PARAMS: usize = 8;

/// Stack-allocated parameter storage for the hot path.
///
/// Param names are `Arc<str>` shared with the compiled pattern; values are
/// per-request data from the URL.
pub type ParamVec = SmallVec<[(Arc<str>, String); MAX_INLINE_PARAMS]>;

const SLOW_MATCH: Duration = Duration::from_millis(1);

/// Result of a successful lookup: the rule plus captured parameters.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// The resolved rule (shared, never mutated)
    pub rule: Arc<RouteRule>,
    /// Path parameters captured by the template
    pub path_params: ParamVec,
    /// Query string parameters (filled in by the service)
    pub query_params: ParamVec,
}

impl RouteMatch {
    /// Get a path parameter by name. Absent optional parameters yield `None`.
    #[inline]
    #[must_use]
    pub fn get_path_param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .rfind(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v.as_str())
    }

    /// Get a query parameter by name ("last write wins" on repeats).
    #[inline]
    #[must_use]
    pub fn get_query_param(&self, name: &str) -> Option<&str> {
        self.query_params
            .iter()
            .rfind(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v.as_str())
    }

    /// Convert path_params to a HashMap. Allocates; prefer `get_path_param`.
    #[must_use]
    pub fn path_params_map(&self) -> HashMap<String, String> {
        self.path_params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}

/// Outcome of [`RouteTable::resolve`].
#[derive(Debug, Clone)]
pub enum Resolution {
    Matched(RouteMatch),
    /// The path matched one or more patterns, none of them for this method.
    MethodMismatch { allowed: Vec<Method> },
    NoMatch,
}

impl Resolution {
    /// Convert into the client-facing error taxonomy.
    pub fn into_result(self, method: &Method, path: &str) -> Result<RouteMatch, ApiError> {
        match self {
            Resolution::Matched(m) => Ok(m),
            Resolution::MethodMismatch { allowed } => Err(ApiError::MethodNotAllowed {
                method: method.clone(),
                path: path.to_string(),
                allowed,
            }),
            Resolution::NoMatch => Err(ApiError::NotFound {
                path: path.to_string(),
            }),
        }
    }
}

/// One entry of the API overview: a template and the methods it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub url: String,
    pub methods: Vec<String>,
}

/// Ordering key: priority first, then more literal characters, then the
/// template text as a deterministic tiebreak.
type SortKey = (Reverse<bool>, Reverse<usize>, String);

#[derive(Clone)]
struct RouteElement {
    pattern: CompiledPattern,
    key: SortKey,
    by_method: SmallVec<[(Method, Arc<RouteRule>); 4]>,
}

impl RouteElement {
    fn new(pattern: CompiledPattern, priority: bool) -> Self {
        let key = (
            Reverse(priority),
            Reverse(pattern.literal_len()),
            pattern.template().to_string(),
        );
        Self {
            pattern,
            key,
            by_method: SmallVec::new(),
        }
    }

    fn rule_for(&self, method: &Method) -> Option<&Arc<RouteRule>> {
        self.by_method
            .iter()
            .find(|(m, _)| m == method)
            .map(|(_, r)| r)
    }
}

#[derive(Clone, Default)]
struct Tables {
    static_routes: Vec<RouteElement>,
    dynamic_routes: Vec<RouteElement>,
}

/// The route table: a static list fixed at startup and a dynamic list for
/// per-instance routes, both kept in precedence order.
pub struct RouteTable {
    tables: ArcSwap<Tables>,
    write_lock: Mutex<()>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: ArcSwap::from_pointee(Tables::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Register a static rule.
    pub fn register(&self, rule: RouteRule) -> Result<(), RouteError> {
        self.register_batch(None, vec![rule])
    }

    /// Register a rule for one instance: `:instance` in the template is
    /// replaced by `instance` before compilation and the rule joins the
    /// dynamic list. Matches still report `instance` as a path parameter.
    pub fn register_dynamic(&self, instance: &str, rule: RouteRule) -> Result<(), RouteError> {
        self.register_batch(Some(instance), vec![rule])
    }

    /// Register several rules and publish them in one swap. Either all of
    /// them are added or none.
    pub fn register_batch(
        &self,
        instance: Option<&str>,
        rules: Vec<RouteRule>,
    ) -> Result<(), RouteError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut next = Tables::clone(&self.tables.load());
        let target = match instance {
            None => &mut next.static_routes,
            Some(_) => &mut next.dynamic_routes,
        };

        for rule in rules {
            let rule = match instance {
                Some(instance) => expand_instance(instance, rule),
                None => rule,
            };
            insert_rule(target, rule)?;
        }

        let static_count = next.static_routes.len();
        let dynamic_count = next.dynamic_routes.len();
        self.tables.store(Arc::new(next));

        debug!(
            instance = instance.unwrap_or("-"),
            static_patterns = static_count,
            dynamic_patterns = dynamic_count,
            "Route table updated"
        );
        Ok(())
    }

    /// Resolve a (method, path) pair.
    ///
    /// Static patterns are tried in order, then dynamic ones. The first
    /// pattern that matches the path and has a rule for `method` wins.
    /// Patterns matching the path for other methods contribute to the
    /// allowed set of a [`Resolution::MethodMismatch`].
    #[must_use]
    pub fn resolve(&self, method: &Method, path: &str) -> Resolution {
        let start = Instant::now();
        let tables = self.tables.load();
        let mut allowed: Option<Vec<Method>> = None;

        let lists = [&tables.static_routes, &tables.dynamic_routes];
        for element in lists.into_iter().flatten() {
            let Some(mut path_params) = element.pattern.matches(path) else {
                continue;
            };
            if let Some(rule) = element.rule_for(method) {
                if let Some((name, value)) = rule.instance_param() {
                    if !path_params.iter().any(|(k, _)| k == name) {
                        path_params.push((Arc::clone(name), value.to_string()));
                    }
                }
                let elapsed = start.elapsed();
                if elapsed > SLOW_MATCH {
                    warn!(
                        method = %method,
                        path = %path,
                        route_template = %rule.template(),
                        duration_us = elapsed.as_micros(),
                        "Slow route matching detected"
                    );
                } else {
                    debug!(
                        method = %method,
                        path = %path,
                        route_template = %rule.template(),
                        path_params = ?path_params,
                        duration_us = elapsed.as_micros(),
                        "Route matched"
                    );
                }
                return Resolution::Matched(RouteMatch {
                    rule: Arc::clone(rule),
                    path_params,
                    query_params: ParamVec::new(),
                });
            }
            let seen = allowed.get_or_insert_with(Vec::new);
            for (m, _) in &element.by_method {
                if !seen.contains(m) {
                    seen.push(m.clone());
                }
            }
        }

        match allowed {
            Some(mut allowed) => {
                allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                info!(method = %method, path = %path, allowed = ?allowed, "Method not allowed");
                Resolution::MethodMismatch { allowed }
            }
            None => {
                info!(method = %method, path = %path, "No route matched");
                Resolution::NoMatch
            }
        }
    }

    /// Static routes aggregated per unique template, in table order.
    #[must_use]
    pub fn overview(&self) -> Vec<RouteInfo> {
        let tables = self.tables.load();
        let mut out: Vec<RouteInfo> = Vec::new();
        for element in &tables.static_routes {
            for (method, rule) in &element.by_method {
                let url = rule.template();
                let idx = match out.iter().position(|r| r.url == url) {
                    Some(idx) => idx,
                    None => {
                        out.push(RouteInfo {
                            url: url.to_string(),
                            methods: Vec::new(),
                        });
                        out.len() - 1
                    }
                };
                if !out[idx].methods.iter().any(|m| m == method.as_str()) {
                    out[idx].methods.push(method.as_str().to_string());
                }
            }
        }
        out
    }

    /// Templates of each list in resolution order. Handy for diagnostics.
    #[must_use]
    pub fn templates(&self) -> (Vec<String>, Vec<String>) {
        let tables = self.tables.load();
        let collect = |list: &[RouteElement]| {
            list.iter()
                .map(|e| e.pattern.template().to_string())
                .collect::<Vec<_>>()
        };
        (
            collect(&tables.static_routes),
            collect(&tables.dynamic_routes),
        )
    }

    /// Number of distinct patterns (static, dynamic).
    #[must_use]
    pub fn len(&self) -> (usize, usize) {
        let tables = self.tables.load();
        (tables.static_routes.len(), tables.dynamic_routes.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == (0, 0)
    }

    /// Print all registered routes to stdout.
    pub fn dump_routes(&self) {
        let tables = self.tables.load();
        for (kind, list) in [
            ("static", &tables.static_routes),
            ("dynamic", &tables.dynamic_routes),
        ] {
            for element in list {
                for (method, rule) in &element.by_method {
                    println!(
                        "[route:{kind}] {method:<7} {} -> {}{}",
                        element.pattern.template(),
                        rule.name(),
                        if rule.is_off_thread() { " (off-thread)" } else { "" }
                    );
                }
            }
        }
    }
}

fn expand_instance(instance: &str, rule: RouteRule) -> RouteRule {
    let param = &INSTANCE_PLACEHOLDER[1..];
    if !contains_placeholder(rule.template()) {
        warn!(
            instance = %instance,
            route_template = %rule.template(),
            "Instance-specific route does not contain ':instance'; routing will be ambiguous"
        );
        return rule.bind_instance(param, instance);
    }
    let expanded = replace_placeholder(rule.template(), instance);
    rule.with_template(expanded).bind_instance(param, instance)
}

/// Byte offsets of `:instance` occurrences that are whole parameters, so
/// `:instanceId` is left alone.
fn placeholder_positions(template: &str) -> impl Iterator<Item = usize> + '_ {
    template
        .match_indices(INSTANCE_PLACEHOLDER)
        .map(|(idx, _)| idx)
        .filter(move |&idx| {
            template[idx + INSTANCE_PLACEHOLDER.len()..]
                .chars()
                .next()
                .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'))
        })
}

fn contains_placeholder(template: &str) -> bool {
    placeholder_positions(template).next().is_some()
}

fn replace_placeholder(template: &str, instance: &str) -> String {
    let mut out = String::with_capacity(template.len() + instance.len());
    let mut last = 0;
    for idx in placeholder_positions(template) {
        out.push_str(&template[last..idx]);
        out.push_str(instance);
        last = idx + INSTANCE_PLACEHOLDER.len();
    }
    out.push_str(&template[last..]);
    out
}

fn insert_rule(list: &mut Vec<RouteElement>, rule: RouteRule) -> Result<(), RouteError> {
    let pattern = CompiledPattern::compile(rule.template())?;
    // `/things/:id` and `/things/:name` accept the same paths
    for method in rule.methods() {
        if list
            .iter()
            .any(|e| e.pattern.shape() == pattern.shape() && e.rule_for(method).is_some())
        {
            return Err(RouteError::Conflict {
                template: rule.template().to_string(),
                method: method.to_string(),
            });
        }
    }
    let rule = Arc::new(rule);

    let idx = match list
        .iter()
        .position(|e| e.pattern.as_str() == pattern.as_str())
    {
        Some(idx) => idx,
        None => {
            list.push(RouteElement::new(pattern, rule.is_priority()));
            list.len() - 1
        }
    };

    let element = &mut list[idx];
    for method in rule.methods() {
        element.by_method.push((method.clone(), Arc::clone(&rule)));
    }
    if rule.is_priority() {
        element.key.0 = Reverse(true);
    }

    // stable: equal keys keep insertion order
    list.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(())
}
