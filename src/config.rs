//! Configuration for the mock API server.
//!
//! Defines the endpoint document loaded from YAML: endpoint entries, their
//! direct responses and probability-split branches.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Default status code for responses that do not configure one.
pub const DEFAULT_STATUS: u16 = 200;

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    /// Endpoint definitions in configuration order
    #[serde(default)]
    pub endpoints: Vec<EndpointDefinition>,
}

impl ApiConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&content)?)
    }

    /// Parse configuration from YAML text.
    ///
    /// An empty document is an empty configuration.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Option<Self> = serde_yaml::from_str(content)?;
        Ok(config.unwrap_or_default())
    }

    /// Validate the configuration.
    ///
    /// Returns the problems of every entry that would be skipped at
    /// registration time, indexed by position.
    pub fn validate(&self) -> Vec<(usize, String)> {
        self.endpoints
            .iter()
            .enumerate()
            .filter_map(|(i, endpoint)| endpoint.validate().err().map(|e| (i, e.to_string())))
            .collect()
    }
}

/// A single endpoint definition as written in the configuration.
///
/// `method` and `path` are optional here so that a broken entry can be
/// skipped and reported instead of failing the whole document.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EndpointDefinition {
    /// HTTP method (case-insensitive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Route pattern, `:name` segments are parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Direct response payload (static or templated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,

    /// Status code for the direct response
    #[serde(
        default,
        rename = "statusCode",
        alias = "status",
        skip_serializing_if = "Option::is_none"
    )]
    pub status_code: Option<u16>,

    /// Delay in milliseconds for the direct response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,

    /// Success probability in percent (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,

    /// Success/failure branches used with `probability`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<BranchSet>,
}

impl EndpointDefinition {
    /// Create a definition with a direct response.
    pub fn new(method: &str, path: &str, response: serde_json::Value) -> Self {
        Self {
            method: Some(method.to_string()),
            path: Some(path.to_string()),
            response: Some(response),
            ..Default::default()
        }
    }

    /// Set the direct status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Set the direct delay.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = Some(delay_ms);
        self
    }

    /// Configure a probability split.
    pub fn with_split(
        mut self,
        probability: f64,
        success: Option<BranchConfig>,
        failure: Option<BranchConfig>,
    ) -> Self {
        self.probability = Some(probability);
        self.responses = Some(BranchSet { success, failure });
        self
    }

    /// Status code of the direct response.
    pub fn status(&self) -> u16 {
        self.status_code.unwrap_or(DEFAULT_STATUS)
    }

    /// Delay of the direct response in milliseconds.
    pub fn delay_ms(&self) -> u64 {
        self.delay.unwrap_or(0)
    }

    /// Validate the fields required for registration.
    pub fn validate(&self) -> Result<(HttpMethod, &str), ConfigError> {
        let method = match self.method.as_deref().map(str::trim) {
            None | Some("") => return Err(ConfigError::MissingMethod),
            Some(m) => m.parse::<HttpMethod>()?,
        };
        let path = match self.path.as_deref() {
            None | Some("") => return Err(ConfigError::MissingPath),
            Some(p) => p,
        };
        Ok((method, path))
    }
}

/// Branches of a probability-split endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BranchSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<BranchConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<BranchConfig>,
}

/// One response variant of a probability split.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BranchConfig {
    /// Response payload (static or templated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,

    /// Status code for this branch
    #[serde(
        default,
        rename = "statusCode",
        alias = "status",
        skip_serializing_if = "Option::is_none"
    )]
    pub status_code: Option<u16>,

    /// Delay in milliseconds for this branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl BranchConfig {
    /// Create a branch with a response and status code.
    pub fn new(response: serde_json::Value, status: u16) -> Self {
        Self {
            response: Some(response),
            status_code: Some(status),
            delay: None,
        }
    }
}

/// HTTP verbs an endpoint may be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// Canonical (upper case) name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(HttpMethod::Get),
            "post" => Ok(HttpMethod::Post),
            "put" => Ok(HttpMethod::Put),
            "patch" => Ok(HttpMethod::Patch),
            "delete" => Ok(HttpMethod::Delete),
            "head" => Ok(HttpMethod::Head),
            "options" => Ok(HttpMethod::Options),
            _ => Err(ConfigError::UnknownMethod(s.to_string())),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Problems with a single endpoint entry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("endpoint has no method")]
    MissingMethod,

    #[error("endpoint has no path")]
    MissingPath,

    #[error("unsupported HTTP method: {0}")]
    UnknownMethod(String),
}
