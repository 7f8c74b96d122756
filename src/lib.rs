//! Mock API Server
//!
//! A declarative HTTP API simulator. Endpoints are described in a YAML file
//! and served with configurable status codes, delays, probability-split
//! success/failure responses and Handlebars-templated bodies.
//!
//! # Features
//!
//! - **Path Routing**: Exact paths first, then `:param` patterns in
//!   configuration order
//! - **Dynamic Templates**: `{{params.id}}`, `{{query.page}}`, `{{body.name}}`,
//!   `{{now}}`, `{{randomId}}` and helpers anywhere in the response
//! - **Failure Simulation**: Split traffic between success and failure
//!   responses by probability
//! - **Latency Simulation**: Per-endpoint or per-branch delays
//! - **Live Reload**: The configuration is swapped atomically while
//!   requests are in flight
//!
//! # Example Configuration
//!
//! ```yaml
//! endpoints:
//!   - method: GET
//!     path: /users/:id
//!     response:
//!       id: "{{params.id}}"
//!       fetchedAt: "{{now}}"
//!   - method: POST
//!     path: /orders
//!     probability: 80
//!     responses:
//!       success:
//!         statusCode: 201
//!         response:
//!           orderId: "{{randomId}}"
//!       failure:
//!         statusCode: 503
//!         delay: 1500
//!         response:
//!           error: "Service unavailable"
//! ```

pub mod config;
pub mod context;
pub mod events;
pub mod loader;
pub mod matcher;
pub mod outcome;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod template;
pub mod watcher;

pub use config::{ApiConfig, BranchConfig, EndpointDefinition, HttpMethod};
pub use events::{EventBus, MockEvent};
pub use loader::{ConfigReloader, EndpointSource, FileSource};
pub use pipeline::{MockRequest, MockResponse, ResponsePipeline};
pub use registry::EndpointRegistry;
pub use server::{build_router, start_server, AppState, ServerConfig};
