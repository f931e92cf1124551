//! # Router Module
//!
//! Maps an incoming `(method, path)` pair to a registered [`RouteRule`] and
//! the parameters captured from the path.
//!
//! ## Architecture
//!
//! The router works in two phases:
//!
//! 1. **Compilation**: at registration, each template (e.g.
//!    `/api/archive/:instance/parameters/:name*`) is compiled into an
//!    anchored regex with named groups ([`CompiledPattern`]). Malformed
//!    templates fail here, never while serving.
//!
//! 2. **Resolution**: [`RouteTable::resolve`] scans the static list, then
//!    the dynamic list, in precedence order. The first pattern that accepts
//!    the path *and* has a rule for the method wins. Patterns accepting the
//!    path for other methods are remembered so a miss can be reported as
//!    `MethodMismatch` with the union of allowed methods.
//!
//! ## Precedence
//!
//! Within each list patterns are ordered by priority flag, then by number
//! of literal characters (longer first), then lexically. A priority rule
//! beats a longer non-priority rule, which is how `/things/special` is kept
//! ahead of `/things/:id`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mcs_gateway::router::{RouteRule, RouteTable, Resolution};
//! use http::Method;
//!
//! let table = RouteTable::new();
//! table.register(RouteRule::get("/api/clients/:id", get_client))?;
//! table.register(RouteRule::patch("/api/clients/:id", edit_client))?;
//!
//! match table.resolve(&Method::GET, "/api/clients/42") {
//!     Resolution::Matched(m) => assert_eq!(m.get_path_param("id"), Some("42")),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

mod core;
mod pattern;
mod rule;
#[cfg(test)]
mod tests;

pub use core::{
    ParamVec, Resolution, RouteInfo, RouteMatch, RouteTable, INSTANCE_PLACEHOLDER,
    MAX_INLINE_PARAMS,
};
pub use pattern::{compile_template, CompiledPattern, RouteError};
pub use rule::{HandlerFn, MethodVec, RouteProvider, RouteRule, DEFAULT_MAX_BODY_SIZE};
