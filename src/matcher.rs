//! Request matching logic.
//!
//! Resolves an incoming method and path to a registered route. Literal
//! paths are checked first; route patterns are scanned afterwards in
//! registration order.

use crate::config::{EndpointDefinition, HttpMethod};
use regex::Regex;
use std::sync::Arc;

/// A validated endpoint with its compiled path pattern.
#[derive(Debug, Clone)]
pub struct Route {
    pub method: HttpMethod,
    pub path: String,
    pub pattern: PathPattern,
    pub endpoint: Arc<EndpointDefinition>,
}

impl Route {
    /// Compile a route for the given method, path and definition.
    pub fn new(
        method: HttpMethod,
        path: &str,
        endpoint: Arc<EndpointDefinition>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            method,
            path: path.to_string(),
            pattern: PathPattern::compile(path)?,
            endpoint,
        })
    }
}

/// Result of matching a request against the routes of a generation.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    /// The matched route
    pub route: &'a Route,
    /// Path parameters in the order they appear in the pattern
    pub params: Vec<(String, String)>,
}

/// Route pattern compiled to an anchored regex.
///
/// Every `:name` token matches exactly one non-empty path segment.
#[derive(Debug, Clone)]
pub struct PathPattern {
    regex: Regex,
    params: Vec<String>,
}

impl PathPattern {
    /// Compile a route pattern such as `/users/:id/posts/:post`.
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let mut source = String::from("^");
        let mut params = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars().peekable();

        while let Some(ch) = chars.next() {
            let starts_param = ch == ':' && chars.peek().is_some_and(|next| *next != '/');
            if !starts_param {
                literal.push(ch);
                continue;
            }

            source.push_str(&regex::escape(&literal));
            literal.clear();

            let mut name = String::new();
            while let Some(&next) = chars.peek() {
                if next == '/' {
                    break;
                }
                name.push(next);
                chars.next();
            }
            params.push(name);
            source.push_str("([^/]+)");
        }

        source.push_str(&regex::escape(&literal));
        source.push('$');

        Ok(Self {
            regex: Regex::new(&source)?,
            params,
        })
    }

    /// Parameter names in declaration order.
    pub fn param_names(&self) -> &[String] {
        &self.params
    }

    /// Match a concrete path, returning the bound parameters.
    pub fn captures(&self, path: &str) -> Option<Vec<(String, String)>> {
        let captures = self.regex.captures(path)?;
        Some(
            self.params
                .iter()
                .zip(captures.iter().skip(1))
                .filter_map(|(name, value)| {
                    value.map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect(),
        )
    }
}

/// Find the route for a request.
///
/// An unknown method never matches.
pub fn find_match<'a>(routes: &'a [Route], method: &str, path: &str) -> Option<RouteMatch<'a>> {
    let method: HttpMethod = method.parse().ok()?;

    // Literal paths first, no parameter extraction
    if let Some(route) = routes
        .iter()
        .find(|route| route.method == method && route.path == path)
    {
        return Some(RouteMatch {
            route,
            params: Vec::new(),
        });
    }

    routes
        .iter()
        .filter(|route| route.method == method)
        .find_map(|route| {
            route
                .pattern
                .captures(path)
                .map(|params| RouteMatch { route, params })
        })
}
