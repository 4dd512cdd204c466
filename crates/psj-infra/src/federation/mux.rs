//! Route table for the mock federation peer.
//!
//! Routes are matched in registration order on method, percent-decoded path
//! segments (`{name}` segments capture) and required query pairs. The table
//! is written while a scenario sets up and read concurrently afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use axum::body::Bytes;
use axum::http::Method;
use axum::response::Response;
use futures::future::BoxFuture;
use percent_encoding::percent_decode_str;
use psj_core::ServerName;
use serde::de::DeserializeOwned;

pub type Handler = Arc<dyn Fn(FederationRequest) -> BoxFuture<'static, Response> + Send + Sync>;

/// An inbound request as handlers see it.
#[derive(Debug, Clone)]
pub struct FederationRequest {
    pub method: Method,
    /// Decoded path segments
    pub segments: Vec<String>,
    pub params: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    /// From the `X-Matrix` authorization header, when present
    pub origin: Option<ServerName>,
    pub body: Bytes,
}

impl FederationRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Capture(String),
}

fn parse_pattern(path: &str) -> Vec<Segment> {
    split_path(path)
        .into_iter()
        .map(|segment| {
            match segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
            {
                Some(name) => Segment::Capture(name.to_string()),
                None => Segment::Literal(segment),
            }
        })
        .collect()
}

fn split_path(path: &str) -> Vec<String> {
    path.trim_start_matches('/')
        .split('/')
        .map(str::to_string)
        .collect()
}

/// Split a raw request path into decoded segments.
pub fn decode_path(raw: &str) -> Vec<String> {
    split_path(raw)
        .into_iter()
        .map(|s| percent_decode_str(&s).decode_utf8_lossy().into_owned())
        .collect()
}

struct Route {
    method: Option<Method>,
    pattern: Vec<Segment>,
    queries: Vec<(String, String)>,
    handler: Handler,
}

impl Route {
    fn matches(
        &self,
        method: &Method,
        segments: &[String],
        query: &[(String, String)],
    ) -> Option<HashMap<String, String>> {
        if self.method.as_ref().is_some_and(|m| m != method) {
            return None;
        }
        if self.pattern.len() != segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (pattern, actual) in self.pattern.iter().zip(segments) {
            match pattern {
                Segment::Literal(lit) if lit == actual => {}
                Segment::Literal(_) => return None,
                Segment::Capture(name) => {
                    params.insert(name.clone(), actual.clone());
                }
            }
        }
        let queries_match = self
            .queries
            .iter()
            .all(|(key, value)| query.iter().any(|(k, v)| k == key && v == value));
        queries_match.then_some(params)
    }
}

#[derive(Default)]
pub struct Mux {
    routes: RwLock<Vec<Arc<Route>>>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_route(&self) -> RouteBuilder<'_> {
        RouteBuilder {
            mux: self,
            method: None,
            path: String::from("/"),
            queries: Vec::new(),
        }
    }

    /// Register `handler` for any method on `path`.
    pub fn handle<F, Fut>(&self, path: &str, handler: F)
    where
        F: Fn(FederationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.new_route().path(path).handler(handler);
    }

    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First matching handler plus captured path parameters.
    pub fn find(
        &self,
        method: &Method,
        segments: &[String],
        query: &[(String, String)],
    ) -> Option<(Handler, HashMap<String, String>)> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes.iter().find_map(|route| {
            route
                .matches(method, segments, query)
                .map(|params| (route.handler.clone(), params))
        })
    }

    fn push(&self, route: Route) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(route));
    }
}

pub struct RouteBuilder<'a> {
    mux: &'a Mux,
    method: Option<Method>,
    path: String,
    queries: Vec<(String, String)>,
}

impl RouteBuilder<'_> {
    pub fn methods(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Path pattern with literal (unencoded) segments and `{name}` captures.
    pub fn path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Require query parameter `key` to equal `value`.
    pub fn queries(mut self, key: &str, value: &str) -> Self {
        self.queries.push((key.to_string(), value.to_string()));
        self
    }

    pub fn handler<F, Fut>(self, handler: F)
    where
        F: Fn(FederationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |req| Box::pin(handler(req)));
        self.mux.push(Route {
            method: self.method,
            pattern: parse_pattern(&self.path),
            queries: self.queries,
            handler,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_decode_path_handles_encoded_room_ids() {
        assert_eq!(
            decode_path("/_matrix/federation/v1/state_ids/%21r%3Ahs1"),
            vec!["_matrix", "federation", "v1", "state_ids", "!r:hs1"]
        );
    }

    #[test]
    fn test_query_predicate_disambiguates_routes() {
        let mux = Mux::new();
        mux.new_route()
            .methods(Method::GET)
            .path("/_matrix/federation/v1/state_ids/!r:hs1")
            .queries("event_id", "$one")
            .handler(|_| async { "one".into_response() });
        mux.new_route()
            .methods(Method::GET)
            .path("/_matrix/federation/v1/state_ids/!r:hs1")
            .queries("event_id", "$two")
            .handler(|_| async { "two".into_response() });

        let segments = decode_path("/_matrix/federation/v1/state_ids/%21r%3Ahs1");
        assert!(mux.find(&Method::GET, &segments, &query(&[("event_id", "$two")])).is_some());
        assert!(mux.find(&Method::GET, &segments, &query(&[("event_id", "$three")])).is_none());
        assert!(mux.find(&Method::PUT, &segments, &query(&[("event_id", "$one")])).is_none());
        assert_eq!(mux.len(), 2);
    }

    #[test]
    fn test_captures_are_returned_as_params() {
        let mux = Mux::new();
        mux.new_route()
            .methods(Method::GET)
            .path("/_matrix/federation/v1/event/{eventId}")
            .handler(|_| async { "ok".into_response() });

        let (_, params) = mux
            .find(&Method::GET, &decode_path("/_matrix/federation/v1/event/%24abc"), &[])
            .unwrap();
        assert_eq!(params.get("eventId").map(String::as_str), Some("$abc"));
    }

    #[test]
    fn test_first_registered_route_wins() {
        let mux = Mux::new();
        mux.handle("/a/{x}", |_| async { "capture".into_response() });
        mux.handle("/a/b", |_| async { "literal".into_response() });

        let segments = decode_path("/a/b");
        let (_, params) = mux.find(&Method::GET, &segments, &[]).unwrap();
        assert_eq!(params.get("x").map(String::as_str), Some("b"));
    }
}
