use super::request::RequestHead;
use crate::config::ServerConfig;
use crate::dispatcher::{ApiResponse, BodySource, Completion, Dispatcher, IncomingRequest, Responder};
use crate::error::ApiError;
use crate::ids::RequestId;
use crate::router::{RouteError, RouteProvider, RouteRule, RouteTable};
use crate::streaming::Connection;
use http::StatusCode;
use serde_json::json;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Front door of the API: owns the route table and the dispatcher, and
/// turns raw requests into dispatched ones.
///
/// Two routes are always present: `GET /api/health` (priority) and
/// `GET /api`, the overview of every static route.
#[derive(Clone)]
pub struct ApiService {
    table: Arc<RouteTable>,
    dispatcher: Arc<Dispatcher>,
    context_path: Arc<str>,
}

impl ApiService {
    /// Build the service and its worker pool from the server configuration.
    pub fn new(config: &ServerConfig) -> std::io::Result<Self> {
        let dispatcher = Dispatcher::new(
            config.dispatch.clone(),
            config.workers.clone(),
            &config.streaming,
            config.http.default_max_body,
        )?;
        Ok(Self::with_dispatcher(
            Arc::new(dispatcher),
            &config.http.context_path,
        ))
    }

    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>, context_path: &str) -> Self {
        let service = Self {
            table: Arc::new(RouteTable::new()),
            dispatcher,
            context_path: Arc::from(normalize_context_path(context_path)),
        };
        service.register_builtin_routes();
        service
    }

    fn register_builtin_routes(&self) {
        let health = RouteRule::get("/api/health", |req| {
            req.respond_json(StatusCode::OK, &json!({ "status": "ok" }))
        })
        .priority()
        .named("health");

        let table: Weak<RouteTable> = Arc::downgrade(&self.table);
        let prefix = Arc::clone(&self.context_path);
        let overview = RouteRule::get("/api", move |req| {
            let table = table
                .upgrade()
                .ok_or_else(|| ApiError::ServiceUnavailable("shutting down".to_string()))?;
            let routes: Vec<_> = table
                .overview()
                .into_iter()
                .map(|mut info| {
                    info.url = format!("{prefix}{}", info.url);
                    info
                })
                .collect();
            req.respond_json(StatusCode::OK, &json!({ "routes": routes }))
        })
        .named("api_overview");

        for rule in [health, overview] {
            if let Err(e) = self.table.register(rule) {
                // both templates are fixed and distinct
                debug!(error = %e, "Built-in route not registered");
            }
        }
    }

    /// Register the static routes of a handler group.
    pub fn register_handlers(&self, provider: &dyn RouteProvider) -> Result<(), RouteError> {
        let rules = provider.routes();
        let count = rules.len();
        self.table.register_batch(None, rules)?;
        info!(routes = count, "Handlers registered");
        Ok(())
    }

    /// Register a handler group for one instance; `:instance` in each
    /// template is replaced by `instance`.
    pub fn register_instance(
        &self,
        instance: &str,
        provider: &dyn RouteProvider,
    ) -> Result<(), RouteError> {
        let rules = provider.routes();
        let count = rules.len();
        self.table.register_batch(Some(instance), rules)?;
        info!(instance, routes = count, "Instance handlers registered");
        Ok(())
    }

    #[must_use]
    pub fn route_table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    /// Path relative to the context path, or `None` outside of it.
    fn strip_context<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.context_path.is_empty() {
            return Some(path);
        }
        match path.strip_prefix(self.context_path.as_ref())? {
            "" => Some("/"),
            rest if rest.starts_with('/') => Some(rest),
            _ => None,
        }
    }

    /// Resolve and dispatch one request. Resolution failures are answered
    /// here; everything else is up to the dispatcher.
    pub fn handle(
        &self,
        head: RequestHead,
        body: BodySource,
        conn: Box<dyn Connection>,
    ) -> Completion {
        let request_id = RequestId::from_header_or_new(head.get_header("x-request-id"));
        let query_params = head.query_params();
        let RequestHead {
            method,
            path,
            headers,
            ..
        } = head;

        let Some(relative) = self.strip_context(&path).map(str::to_string) else {
            return reject(request_id, &ApiError::NotFound { path }, conn);
        };
        match self.table.resolve(&method, &relative).into_result(&method, &path) {
            Ok(mut route_match) => {
                route_match.query_params = query_params;
                self.dispatcher.dispatch(
                    route_match,
                    IncomingRequest {
                        request_id,
                        method,
                        path: relative,
                        headers,
                        body,
                        conn,
                    },
                )
            }
            Err(err) => {
                debug!(
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    kind = err.kind(),
                    "Request not routed"
                );
                reject(request_id, &err, conn)
            }
        }
    }
}

fn reject(request_id: RequestId, err: &ApiError, conn: Box<dyn Connection>) -> Completion {
    let completion = Completion::new(request_id);
    Responder::new(conn, completion.clone()).send(ApiResponse::from_error(err));
    completion
}

/// `""`, `"/"` → no prefix; otherwise a leading slash and no trailing one.
fn normalize_context_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_path_normalization() {
        assert_eq!(normalize_context_path(""), "");
        assert_eq!(normalize_context_path("/"), "");
        assert_eq!(normalize_context_path("yamcs/"), "/yamcs");
        assert_eq!(normalize_context_path("/yamcs"), "/yamcs");
    }

    #[test]
    fn strips_only_whole_segments() {
        let service = ApiService::with_dispatcher(
            Arc::new(Dispatcher::with_defaults().unwrap()),
            "/yamcs",
        );
        assert_eq!(service.strip_context("/yamcs/api/health"), Some("/api/health"));
        assert_eq!(service.strip_context("/yamcs"), Some("/"));
        assert_eq!(service.strip_context("/yamcsx/api"), None);
        assert_eq!(service.strip_context("/api/health"), None);
    }

    #[test]
    fn builtin_routes_are_registered() {
        let service = ApiService::with_dispatcher(
            Arc::new(Dispatcher::with_defaults().unwrap()),
            "",
        );
        let (statics, dynamics) = service.route_table().templates();
        assert_eq!(statics, vec!["/api/health".to_string(), "/api".to_string()]);
        assert!(dynamics.is_empty());
    }
}
