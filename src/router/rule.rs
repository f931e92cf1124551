use crate::dispatcher::ApiRequest;
use crate::error::ApiError;
use http::Method;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Default request body limit for aggregated (non data-load) routes.
pub const DEFAULT_MAX_BODY_SIZE: usize = 65536;

/// Handler invoked for a matched route.
///
/// A handler either responds through the request (full response or chunked
/// session) before returning, or takes the responder out of the request and
/// finishes asynchronously. Returning `Err` before anything was sent turns
/// into a structured error response.
pub type HandlerFn = Arc<dyn Fn(&mut ApiRequest) -> Result<(), ApiError> + Send + Sync>;

/// Methods a rule answers to. Most rules have one or two.
pub type MethodVec = SmallVec<[Method; 2]>;

/// One route descriptor: template, methods, execution flags and handler.
///
/// Built with the fluent constructors below and immutable after
/// registration (the table keeps it behind an `Arc`).
///
/// ```rust,ignore
/// let rule = RouteRule::get("/api/archive/:instance/packets", list_packets)
///     .off_thread()
///     .named("list_packets");
/// ```
#[derive(Clone)]
pub struct RouteRule {
    template: String,
    methods: MethodVec,
    priority: bool,
    max_body_size: Option<usize>,
    data_load: bool,
    off_thread: bool,
    name: Arc<str>,
    /// Instance this rule was registered for, as (parameter name, value)
    instance: Option<(Arc<str>, Arc<str>)>,
    handler: HandlerFn,
}

impl RouteRule {
    pub fn new<F>(methods: &[Method], template: &str, handler: F) -> Self
    where
        F: Fn(&mut ApiRequest) -> Result<(), ApiError> + Send + Sync + 'static,
    {
        Self {
            template: template.to_string(),
            methods: methods.iter().cloned().collect(),
            priority: false,
            max_body_size: None,
            data_load: false,
            off_thread: false,
            name: Arc::from(template),
            instance: None,
            handler: Arc::new(handler),
        }
    }

    pub fn get<F>(template: &str, handler: F) -> Self
    where
        F: Fn(&mut ApiRequest) -> Result<(), ApiError> + Send + Sync + 'static,
    {
        Self::new(&[Method::GET], template, handler)
    }

    pub fn post<F>(template: &str, handler: F) -> Self
    where
        F: Fn(&mut ApiRequest) -> Result<(), ApiError> + Send + Sync + 'static,
    {
        Self::new(&[Method::POST], template, handler)
    }

    pub fn put<F>(template: &str, handler: F) -> Self
    where
        F: Fn(&mut ApiRequest) -> Result<(), ApiError> + Send + Sync + 'static,
    {
        Self::new(&[Method::PUT], template, handler)
    }

    pub fn patch<F>(template: &str, handler: F) -> Self
    where
        F: Fn(&mut ApiRequest) -> Result<(), ApiError> + Send + Sync + 'static,
    {
        Self::new(&[Method::PATCH], template, handler)
    }

    pub fn delete<F>(template: &str, handler: F) -> Self
    where
        F: Fn(&mut ApiRequest) -> Result<(), ApiError> + Send + Sync + 'static,
    {
        Self::new(&[Method::DELETE], template, handler)
    }

    /// Try this rule before every non-priority rule, whatever the template length.
    #[must_use]
    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }

    #[must_use]
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = Some(bytes);
        self
    }

    /// Hand the request body to the handler as a stream instead of aggregating it.
    #[must_use]
    pub fn data_load(mut self) -> Self {
        self.data_load = true;
        self
    }

    /// Run the handler on the worker pool instead of the connection coroutine.
    #[must_use]
    pub fn off_thread(mut self) -> Self {
        self.off_thread = true;
        self
    }

    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = Arc::from(name);
        self
    }

    pub(crate) fn with_template(&self, template: String) -> Self {
        let mut rule = self.clone();
        rule.template = template;
        rule
    }

    pub(crate) fn bind_instance(mut self, param: &str, instance: &str) -> Self {
        self.instance = Some((Arc::from(param), Arc::from(instance)));
        self
    }

    /// Instance the rule was registered for, `None` for static rules.
    #[must_use]
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_ref().map(|(_, value)| value.as_ref())
    }

    pub(crate) fn instance_param(&self) -> Option<&(Arc<str>, Arc<str>)> {
        self.instance.as_ref()
    }

    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    #[must_use]
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    #[must_use]
    pub fn is_priority(&self) -> bool {
        self.priority
    }

    /// Explicit body limit, if the rule set one.
    #[must_use]
    pub fn body_limit(&self) -> Option<usize> {
        self.max_body_size
    }

    #[must_use]
    pub fn is_data_load(&self) -> bool {
        self.data_load
    }

    #[must_use]
    pub fn is_off_thread(&self) -> bool {
        self.off_thread
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn handler(&self) -> &HandlerFn {
        &self.handler
    }
}

impl fmt::Debug for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRule")
            .field("template", &self.template)
            .field("methods", &self.methods)
            .field("priority", &self.priority)
            .field("max_body_size", &self.max_body_size)
            .field("data_load", &self.data_load)
            .field("off_thread", &self.off_thread)
            .field("name", &self.name)
            .field("instance", &self.instance())
            .finish_non_exhaustive()
    }
}

/// A group of handlers that describes its own routes.
///
/// Implemented by the thin per-resource handler objects; the service walks a
/// fixed list of providers at startup and registers whatever they return.
pub trait RouteProvider {
    fn routes(&self) -> Vec<RouteRule>;
}

impl<F> RouteProvider for F
where
    F: Fn() -> Vec<RouteRule>,
{
    fn routes(&self) -> Vec<RouteRule> {
        self()
    }
}
