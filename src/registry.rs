//! Endpoint registry.
//!
//! Holds the live generation of validated routes. A generation is never
//! mutated: [`EndpointRegistry::replace`] builds a complete new one and
//! publishes it with a single pointer store, so readers always see either
//! the old or the new set, never a mix.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::{ConfigError, EndpointDefinition};
use crate::events::{EventBus, MockEvent};
use crate::matcher::{find_match, Route, RouteMatch};

/// One atomically installed snapshot of all endpoints.
#[derive(Debug, Default)]
pub struct Generation {
    version: u64,
    routes: Vec<Route>,
}

impl Generation {
    /// Monotonic generation number (0 is the initial empty generation).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Routes in registration order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Resolve a request against this generation.
    pub fn find(&self, method: &str, path: &str) -> Option<RouteMatch<'_>> {
        find_match(&self.routes, method, path)
    }

    /// The endpoint definitions of this generation.
    pub fn endpoints(&self) -> Vec<EndpointDefinition> {
        self.routes
            .iter()
            .map(|route| {
                let mut endpoint = route.endpoint.as_ref().clone();
                endpoint.method = Some(route.method.to_string());
                endpoint
            })
            .collect()
    }
}

/// Why an entry was left out of a generation.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error("invalid path pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Registry of the active endpoint generation.
pub struct EndpointRegistry {
    live: ArcSwap<Generation>,
    next_version: AtomicU64,
    events: EventBus,
}

impl EndpointRegistry {
    /// Create a registry with an empty generation.
    pub fn new(events: EventBus) -> Self {
        Self {
            live: ArcSwap::from_pointee(Generation::default()),
            next_version: AtomicU64::new(1),
            events,
        }
    }

    /// The live generation.
    pub fn current(&self) -> Arc<Generation> {
        self.live.load_full()
    }

    /// Validate `endpoints` and install them as the new generation.
    ///
    /// Invalid entries are skipped and reported. Later duplicates of a
    /// `(method, path)` pair replace earlier ones in place.
    pub fn replace(&self, endpoints: Vec<EndpointDefinition>) -> Arc<Generation> {
        if endpoints.is_empty() {
            self.events.warn("No endpoints to register");
        }

        let mut routes: Vec<Route> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let route = match compile_route(endpoint) {
                Ok(route) => route,
                Err((endpoint, reason)) => {
                    self.events.warn(format!(
                        "Skipping invalid endpoint ({}): {}",
                        reason,
                        serde_json::to_string(&endpoint).unwrap_or_default()
                    ));
                    continue;
                }
            };

            self.events
                .info(format!("Registered: {} {}", route.method, route.path));

            match routes
                .iter_mut()
                .find(|existing| existing.method == route.method && existing.path == route.path)
            {
                Some(existing) => {
                    self.events.warn(format!(
                        "Duplicate endpoint {} {}, later definition wins",
                        route.method, route.path
                    ));
                    *existing = route;
                }
                None => routes.push(route),
            }
        }

        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let generation = Arc::new(Generation { version, routes });
        self.live.store(Arc::clone(&generation));
        debug!(version, endpoints = generation.len(), "Installed endpoint generation");

        self.events.info(format!(
            "Total {} endpoints registered",
            generation.len()
        ));
        self.events.emit(MockEvent::EndpointUpdate {
            version,
            endpoints: generation.endpoints(),
        });

        generation
    }
}

fn compile_route(
    endpoint: EndpointDefinition,
) -> Result<Route, (EndpointDefinition, Rejection)> {
    let (method, path) = match endpoint.validate() {
        Ok((method, path)) => (method, path.to_string()),
        Err(e) => return Err((endpoint, e.into())),
    };
    let endpoint = Arc::new(endpoint);
    Route::new(method, &path, Arc::clone(&endpoint))
        .map_err(|e| (endpoint.as_ref().clone(), e.into()))
}
