//! Per-request response pipeline.
//!
//! `Matching -> (NotFound | OutcomeSelection) -> Rendering -> Delaying -> Responding`
//!
//! Every failure, including a panic anywhere in the state machine, is turned
//! into a structured JSON response here; nothing escapes to the transport.

use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::EndpointDefinition;
use crate::context::RequestContext;
use crate::events::{timestamp, EventBus, MockEvent};
use crate::outcome::{self, MissingBranch};
use crate::registry::EndpointRegistry;
use crate::template::{RenderError, TemplateEngine};

/// Transport-independent view of an incoming request.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: Option<String>,
    pub body: Value,
}

impl MockRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: None,
            body: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = Some(query.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// Response produced by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    pub status: u16,
    pub body: Value,
}

/// Request-level failures, each mapped to an HTTP response.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("No endpoint defined for {method} {path}")]
    NotFound { method: String, path: String },

    #[error(transparent)]
    MissingBranch(#[from] MissingBranch),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("{0}")]
    Fault(String),
}

impl PipelineError {
    /// HTTP status for this failure.
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::NotFound { .. } => 404,
            _ => 500,
        }
    }

    /// Structured response body for this failure.
    pub fn body(&self, path: &str) -> Value {
        let message = self.to_string();
        match self {
            PipelineError::NotFound { .. } => json!({
                "error": "Not Found",
                "message": message,
                "timestamp": timestamp(),
            }),
            PipelineError::MissingBranch(_) => json!({
                "error": "Server Error",
                "message": message,
                "timestamp": timestamp(),
            }),
            PipelineError::Render(e) => {
                let mut body = json!({
                    "error": "Internal server error in template processing",
                    "message": message,
                    "timestamp": timestamp(),
                });
                if let Some(rendered) = e.rendered() {
                    body["rendered"] = Value::String(rendered.to_string());
                }
                body
            }
            PipelineError::Fault(_) => json!({
                "error": "Internal Server Error",
                "message": message,
                "path": path,
                "timestamp": timestamp(),
            }),
        }
    }
}

/// Request counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    requests_total: AtomicU64,
    requests_matched: AtomicU64,
    requests_unmatched: AtomicU64,
    requests_failed: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub requests_matched: u64,
    pub requests_unmatched: u64,
    pub requests_failed: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_matched: self.requests_matched.load(Ordering::Relaxed),
            requests_unmatched: self.requests_unmatched.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one run of the state machine.
struct Served {
    /// Route pattern of the matched endpoint
    endpoint: Option<String>,
    response: MockResponse,
}

/// Response pipeline tying matcher, outcome selector and renderer together.
pub struct ResponsePipeline {
    registry: Arc<EndpointRegistry>,
    templates: TemplateEngine,
    events: EventBus,
    stats: PipelineStats,
}

impl ResponsePipeline {
    pub fn new(registry: Arc<EndpointRegistry>, events: EventBus) -> Self {
        install_panic_hook();
        Self {
            registry,
            templates: TemplateEngine::new(events.clone()),
            events,
            stats: PipelineStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Serve one request.
    pub async fn handle(&self, request: MockRequest) -> MockResponse {
        let started = Instant::now();
        self.stats.requests_total.fetch_add(1, Ordering::Relaxed);

        let served = match AssertUnwindSafe(self.process(&request)).catch_unwind().await {
            Ok(served) => served,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.events.error(format!(
                    "Unexpected error handling request {} {}: {}",
                    request.method, request.path, message
                ));
                if let Some(trace) = take_panic_trace() {
                    error!(path = %request.path, "Fault backtrace:\n{}", trace);
                }
                Served {
                    endpoint: None,
                    response: self.reject(PipelineError::Fault(message), &request),
                }
            }
        };

        self.events.emit(MockEvent::Request {
            method: request.method.to_uppercase(),
            path: request.path.clone(),
            status: served.response.status,
            endpoint: served.endpoint,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });

        served.response
    }

    async fn process(&self, request: &MockRequest) -> Served {
        // One snapshot for the whole request
        let generation = self.registry.current();

        let Some(found) = generation.find(&request.method, &request.path) else {
            self.stats.requests_unmatched.fetch_add(1, Ordering::Relaxed);
            let not_found = PipelineError::NotFound {
                method: request.method.to_uppercase(),
                path: request.path.clone(),
            };
            return Served {
                endpoint: None,
                response: self.reject(not_found, request),
            };
        };

        self.stats.requests_matched.fetch_add(1, Ordering::Relaxed);
        debug!(
            method = %found.route.method,
            pattern = %found.route.path,
            path = %request.path,
            version = generation.version(),
            "Request matched endpoint"
        );

        let pattern = found.route.path.clone();
        let response = match self.respond(&found.route.endpoint, &found.params, request).await {
            Ok(response) => response,
            Err(e) => self.reject(e, request),
        };

        Served {
            endpoint: Some(pattern),
            response,
        }
    }

    async fn respond(
        &self,
        endpoint: &EndpointDefinition,
        params: &[(String, String)],
        request: &MockRequest,
    ) -> Result<MockResponse, PipelineError> {
        let method = request.method.to_uppercase();

        let (response, status, delay_ms) = match outcome::select(endpoint)? {
            Some(outcome) => {
                self.events.info(format!(
                    "Processing {} response for {} {} with probability {}% (Delay: {}ms, Status: {})",
                    outcome.kind,
                    method,
                    request.path,
                    endpoint.probability.unwrap_or_default(),
                    outcome.delay_ms(),
                    outcome.status()
                ));
                (outcome.response(), outcome.status(), outcome.delay_ms())
            }
            None => {
                self.events.info(format!(
                    "Processing standard response for {} {} (Delay: {}ms, Status: {})",
                    method,
                    request.path,
                    endpoint.delay_ms(),
                    endpoint.status()
                ));
                (endpoint.response.as_ref(), endpoint.status(), endpoint.delay_ms())
            }
        };

        let ctx = RequestContext::new(params, request.query.as_deref(), request.body.clone());
        let body = self.templates.render(response, &ctx)?;

        if delay_ms > 0 {
            debug!(path = %request.path, delay_ms, "Applying delay");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        Ok(MockResponse { status, body })
    }

    /// Log a failure and build its response.
    fn reject(&self, error: PipelineError, request: &MockRequest) -> MockResponse {
        match &error {
            PipelineError::NotFound { method, path } => {
                self.events.warn(format!("404 Not Found: {} {}", method, path));
            }
            PipelineError::MissingBranch(missing) => {
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                self.events.error(format!("{} for endpoint {}", missing, request.path));
            }
            PipelineError::Render(e) => {
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                self.events.error(format!(
                    "Error processing response template for {} {}: {}",
                    request.method.to_uppercase(),
                    request.path,
                    e
                ));
                if let Some(rendered) = e.rendered() {
                    self.events.error(format!("Rendered template: {}", rendered));
                }
            }
            PipelineError::Fault(_) => {
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        MockResponse {
            status: error.status(),
            body: error.body(&request.path),
        }
    }
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Record the backtrace of every panic in a thread-local slot.
///
/// The unwind reaches `catch_unwind` in the same poll, on the same thread,
/// so the fault boundary can pick the trace up right after catching.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            let _ = PANIC_TRACE.try_with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BranchConfig;

    fn pipeline(endpoints: Vec<EndpointDefinition>) -> Arc<ResponsePipeline> {
        let events = EventBus::new();
        let registry = Arc::new(EndpointRegistry::new(events.clone()));
        registry.replace(endpoints);
        Arc::new(ResponsePipeline::new(registry, events))
    }

    #[tokio::test]
    async fn test_direct_response_default_status() {
        let pipeline = pipeline(vec![EndpointDefinition::new(
            "GET",
            "/hello",
            json!({ "message": "hi" }),
        )]);

        let response = pipeline.handle(MockRequest::new("GET", "/hello")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({ "message": "hi" }));
    }

    #[tokio::test]
    async fn test_configured_status_and_params() {
        let pipeline = pipeline(vec![EndpointDefinition::new(
            "post",
            "/users/:id",
            json!({ "id": "{{params.id}}", "q": "{{query.v}}", "name": "{{body.name}}" }),
        )
        .with_status(201)]);

        let request = MockRequest::new("POST", "/users/42")
            .with_query("v=x")
            .with_body(json!({ "name": "Ann" }));
        let response = pipeline.handle(request).await;

        assert_eq!(response.status, 201);
        assert_eq!(response.body, json!({ "id": "42", "q": "x", "name": "Ann" }));
    }

    #[tokio::test]
    async fn test_not_found() {
        let pipeline = pipeline(vec![EndpointDefinition::new("GET", "/a", json!({}))]);

        let response = pipeline.handle(MockRequest::new("delete", "/a")).await;
        assert_eq!(response.status, 404);
        assert_eq!(response.body["error"], "Not Found");
        assert_eq!(response.body["message"], "No endpoint defined for DELETE /a");
        assert!(response.body["timestamp"].is_string());

        let stats = pipeline.stats();
        assert_eq!(stats.requests_total, 1);
        assert_eq!(stats.requests_unmatched, 1);
        assert_eq!(stats.requests_failed, 0);
    }

    #[tokio::test]
    async fn test_missing_response_is_empty_object() {
        let mut endpoint = EndpointDefinition::new("GET", "/empty", json!({}));
        endpoint.response = None;
        let pipeline = pipeline(vec![endpoint]);

        let response = pipeline.handle(MockRequest::new("GET", "/empty")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({}));
    }

    #[tokio::test]
    async fn test_probability_branch_status() {
        let endpoint = EndpointDefinition::new("GET", "/flaky", json!({ "direct": true }))
            .with_status(299)
            .with_split(
                100.0,
                Some(BranchConfig::new(json!({ "branch": "{{params.x}}ok" }), 202)),
                None,
            );
        let pipeline = pipeline(vec![endpoint]);

        let response = pipeline.handle(MockRequest::new("GET", "/flaky")).await;
        assert_eq!(response.status, 202);
        assert_eq!(response.body, json!({ "branch": "ok" }));
    }

    #[tokio::test]
    async fn test_missing_failure_branch_is_500() {
        let endpoint = EndpointDefinition::new("GET", "/broken", json!({})).with_split(
            -1.0,
            Some(BranchConfig::new(json!({}), 200)),
            None,
        );
        let pipeline = pipeline(vec![endpoint]);

        let response = pipeline.handle(MockRequest::new("GET", "/broken")).await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body["error"], "Server Error");
        assert_eq!(response.body["message"], "Missing failure response configuration");
        assert_eq!(pipeline.stats().requests_failed, 1);
    }

    #[tokio::test]
    async fn test_render_failure_is_500_with_diagnostic() {
        let pipeline = pipeline(vec![EndpointDefinition::new(
            "POST",
            "/echo",
            json!({ "raw": "{{{body.text}}}" }),
        )]);

        let request = MockRequest::new("POST", "/echo").with_body(json!({ "text": "\"" }));
        let response = pipeline.handle(request).await;

        assert_eq!(response.status, 500);
        assert_eq!(
            response.body["error"],
            "Internal server error in template processing"
        );
        assert_eq!(response.body["rendered"], r#"{"raw":"""}"#);
    }

    #[tokio::test]
    async fn test_template_error_is_500() {
        let pipeline = pipeline(vec![EndpointDefinition::new(
            "GET",
            "/bad",
            json!({ "x": "{{#each}}" }),
        )]);

        let response = pipeline.handle(MockRequest::new("GET", "/bad")).await;
        assert_eq!(response.status, 500);
        assert!(response.body.get("rendered").is_none());
    }

    #[tokio::test]
    async fn test_request_event_emitted() {
        let pipeline = pipeline(vec![EndpointDefinition::new("GET", "/items/:id", json!({}))]);
        let mut rx = pipeline.events.subscribe();

        pipeline.handle(MockRequest::new("get", "/items/3")).await;

        let mut request_event = None;
        while let Ok(event) = rx.try_recv() {
            if let MockEvent::Request { .. } = event {
                request_event = Some(event);
            }
        }
        match request_event.unwrap() {
            MockEvent::Request {
                method,
                path,
                status,
                endpoint,
                ..
            } => {
                assert_eq!(method, "GET");
                assert_eq!(path, "/items/3");
                assert_eq!(status, 200);
                assert_eq!(endpoint.as_deref(), Some("/items/:id"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_does_not_block_other_requests() {
        let pipeline = pipeline(vec![
            EndpointDefinition::new("GET", "/slow", json!({ "slow": true })).with_delay(5_000),
            EndpointDefinition::new("GET", "/fast", json!({ "fast": true })),
        ]);

        let started = Instant::now();
        let slow = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.handle(MockRequest::new("GET", "/slow")).await })
        };
        tokio::task::yield_now().await;

        let fast = pipeline.handle(MockRequest::new("GET", "/fast")).await;
        assert_eq!(fast.body, json!({ "fast": true }));
        assert!(!slow.is_finished());

        let slow = slow.await.unwrap();
        assert_eq!(slow.body, json!({ "slow": true }));
        assert!(started.elapsed() >= Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_request_survives_reload() {
        let pipeline = pipeline(vec![
            EndpointDefinition::new("GET", "/slow", json!({ "v": 1 })).with_delay(1_000),
        ]);

        let slow = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.handle(MockRequest::new("GET", "/slow")).await })
        };
        tokio::task::yield_now().await;

        pipeline.registry().replace(vec![]);
        let after = pipeline.handle(MockRequest::new("GET", "/slow")).await;
        assert_eq!(after.status, 404);

        let slow = slow.await.unwrap();
        assert_eq!(slow.status, 200);
        assert_eq!(slow.body, json!({ "v": 1 }));
    }

    #[test]
    fn test_fault_body_shape() {
        let error = PipelineError::Fault("boom".to_string());
        let body = error.body("/x");
        assert_eq!(error.status(), 500);
        assert_eq!(body["error"], "Internal Server Error");
        assert_eq!(body["message"], "boom");
        assert_eq!(body["path"], "/x");
    }

    #[test]
    fn test_panic_message() {
        let panic = std::panic::catch_unwind(|| panic!("exploded {}", 1)).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "exploded 1");

        let panic = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "static");
    }

    #[test]
    fn test_panic_trace_recorded() {
        install_panic_hook();
        let _ = take_panic_trace();

        let panic = std::panic::catch_unwind(|| panic!("with trace")).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "with trace");

        let trace = take_panic_trace().unwrap();
        assert!(!trace.is_empty());
        assert!(take_panic_trace().is_none());
    }

    #[tokio::test]
    async fn test_invalid_now_format_is_template_error() {
        let pipeline = pipeline(vec![EndpointDefinition::new(
            "GET",
            "/t",
            json!({ "at": "{{now \"%Q\"}}" }),
        )]);

        let response = pipeline.handle(MockRequest::new("GET", "/t")).await;
        assert_eq!(response.status, 500);
        assert_eq!(
            response.body["error"],
            "Internal server error in template processing"
        );
        assert!(response.body.get("path").is_none());
        assert_eq!(pipeline.stats().requests_failed, 1);
    }
}
