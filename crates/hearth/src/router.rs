//! # Declarative Routing
//!
//! Actors describe their request surface as a flat table of
//! [`Route`] entries; the runtime compiles the table into a [`Router`] once
//! at spawn. Malformed patterns and ambiguous pairs are rejected there —
//! a broken table is a programming error and must never survive to
//! per-request time.
//!
//! Patterns are literal segments mixed with named parameter segments
//! (`/drafts/:slug`). Matching prefers the candidate with the most literal
//! segments, so `/posts/latest` beats `/posts/:id` for the concrete path
//! `/posts/latest`. Parameter values are extracted positionally as strings;
//! the router performs no type coercion.

use crate::error::HearthError;
use crate::request::Method;
use std::collections::HashMap;

/// One row of an actor's route table. `name` identifies the handler inside
/// [`Actor::handle`](crate::actor::Actor::handle).
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub method: Method,
    pub pattern: &'static str,
    pub name: &'static str,
}

impl Route {
    pub const fn new(method: Method, pattern: &'static str, name: &'static str) -> Self {
        Self {
            method,
            pattern,
            name,
        }
    }

    pub const fn get(pattern: &'static str, name: &'static str) -> Self {
        Self::new(Method::Get, pattern, name)
    }

    pub const fn post(pattern: &'static str, name: &'static str) -> Self {
        Self::new(Method::Post, pattern, name)
    }

    pub const fn put(pattern: &'static str, name: &'static str) -> Self {
        Self::new(Method::Put, pattern, name)
    }

    pub const fn delete(pattern: &'static str, name: &'static str) -> Self {
        Self::new(Method::Delete, pattern, name)
    }

    pub const fn patch(pattern: &'static str, name: &'static str) -> Self {
        Self::new(Method::Patch, pattern, name)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug)]
struct CompiledRoute {
    method: Method,
    segments: Vec<Segment>,
    literal_count: usize,
    name: &'static str,
}

/// Outcome of a dispatch attempt.
#[derive(Debug)]
pub enum Dispatch {
    Matched {
        name: &'static str,
        params: HashMap<String, String>,
    },
    NotFound,
    MethodNotAllowed,
}

/// Compiled, validated route table.
pub struct Router {
    routes: Vec<CompiledRoute>,
}

impl Router {
    /// Compiles and validates a route table. Fails fast on malformed
    /// patterns, duplicate parameter names, and ambiguous pairs (same
    /// method, overlapping patterns that would match a concrete path
    /// equally well).
    pub fn new(routes: &[Route]) -> Result<Self, HearthError> {
        let mut compiled = Vec::with_capacity(routes.len());
        for route in routes {
            compiled.push(compile(route)?);
        }

        for (i, a) in compiled.iter().enumerate() {
            for b in &compiled[i + 1..] {
                if a.method == b.method && ambiguous(a, b) {
                    return Err(HearthError::BadRoute(format!(
                        "ambiguous patterns for {}: '{}' and '{}'",
                        a.method,
                        pattern_of(a),
                        pattern_of(b),
                    )));
                }
            }
        }

        Ok(Self { routes: compiled })
    }

    /// Matches a concrete path against the table. Among matching patterns
    /// for the method, the one with the most literal segments wins. A path
    /// that matches some other method's pattern yields `MethodNotAllowed`.
    pub fn dispatch(&self, method: Method, path: &str) -> Dispatch {
        let segments = split_path(path);
        let mut best: Option<(&CompiledRoute, HashMap<String, String>)> = None;
        let mut other_method_matches = false;

        for route in &self.routes {
            let Some(params) = match_segments(&route.segments, &segments) else {
                continue;
            };
            if route.method != method {
                other_method_matches = true;
                continue;
            }
            let better = match &best {
                Some((current, _)) => route.literal_count > current.literal_count,
                None => true,
            };
            if better {
                best = Some((route, params));
            }
        }

        match best {
            Some((route, params)) => Dispatch::Matched {
                name: route.name,
                params,
            },
            None if other_method_matches => Dispatch::MethodNotAllowed,
            None => Dispatch::NotFound,
        }
    }
}

fn compile(route: &Route) -> Result<CompiledRoute, HearthError> {
    let pattern = route.pattern;
    if !pattern.starts_with('/') {
        return Err(HearthError::BadRoute(format!(
            "pattern '{pattern}' must start with '/'"
        )));
    }

    let mut segments = Vec::new();
    let mut seen_params: Vec<&str> = Vec::new();
    for raw in split_path(pattern) {
        if raw.is_empty() {
            return Err(HearthError::BadRoute(format!(
                "pattern '{pattern}' contains an empty segment"
            )));
        }
        if let Some(name) = raw.strip_prefix(':') {
            if name.is_empty() {
                return Err(HearthError::BadRoute(format!(
                    "pattern '{pattern}' has an unnamed parameter segment"
                )));
            }
            if seen_params.contains(&name) {
                return Err(HearthError::BadRoute(format!(
                    "pattern '{pattern}' repeats parameter ':{name}'"
                )));
            }
            seen_params.push(name);
            segments.push(Segment::Param(name.to_string()));
        } else {
            segments.push(Segment::Literal(raw.to_string()));
        }
    }

    let literal_count = segments
        .iter()
        .filter(|s| matches!(s, Segment::Literal(_)))
        .count();

    Ok(CompiledRoute {
        method: route.method,
        segments,
        literal_count,
        name: route.name,
    })
}

/// Two routes are ambiguous when some concrete path matches both and the
/// literal-preference rule cannot break the tie.
fn ambiguous(a: &CompiledRoute, b: &CompiledRoute) -> bool {
    if a.segments.len() != b.segments.len() || a.literal_count != b.literal_count {
        return false;
    }
    a.segments.iter().zip(&b.segments).all(|(x, y)| match (x, y) {
        (Segment::Literal(l), Segment::Literal(r)) => l == r,
        _ => true,
    })
}

fn pattern_of(route: &CompiledRoute) -> String {
    let mut out = String::new();
    for segment in &route.segments {
        out.push('/');
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Param(name) => {
                out.push(':');
                out.push_str(name);
            }
        }
    }
    out
}

fn split_path(path: &str) -> Vec<&str> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

fn match_segments(pattern: &[Segment], path: &[&str]) -> Option<HashMap<String, String>> {
    if pattern.len() != path.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (segment, concrete) in pattern.iter().zip(path) {
        match segment {
            Segment::Literal(literal) if literal == concrete => {}
            Segment::Literal(_) => return None,
            Segment::Param(name) => {
                params.insert(name.clone(), (*concrete).to_string());
            }
        }
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<Route> {
        vec![
            Route::get("/config", "get_config"),
            Route::put("/config", "put_config"),
            Route::get("/drafts/:slug", "get_draft"),
            Route::get("/drafts/latest", "latest_draft"),
            Route::delete("/drafts/:slug", "delete_draft"),
        ]
    }

    #[test]
    fn extracts_params_positionally() {
        let router = Router::new(&table()).unwrap();
        match router.dispatch(Method::Get, "/drafts/spring-notes") {
            Dispatch::Matched { name, params } => {
                assert_eq!(name, "get_draft");
                assert_eq!(params.get("slug").map(String::as_str), Some("spring-notes"));
            }
            other => panic!("unexpected dispatch: {other:?}"),
        }
    }

    #[test]
    fn prefers_literal_over_param() {
        let router = Router::new(&table()).unwrap();
        match router.dispatch(Method::Get, "/drafts/latest") {
            Dispatch::Matched { name, .. } => assert_eq!(name, "latest_draft"),
            other => panic!("unexpected dispatch: {other:?}"),
        }
    }

    #[test]
    fn unknown_path_is_not_found() {
        let router = Router::new(&table()).unwrap();
        assert!(matches!(
            router.dispatch(Method::Get, "/nope"),
            Dispatch::NotFound
        ));
    }

    #[test]
    fn wrong_method_is_method_not_allowed() {
        let router = Router::new(&table()).unwrap();
        assert!(matches!(
            router.dispatch(Method::Post, "/config"),
            Dispatch::MethodNotAllowed
        ));
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let router = Router::new(&table()).unwrap();
        assert!(matches!(
            router.dispatch(Method::Get, "/config/"),
            Dispatch::Matched { name: "get_config", .. }
        ));
    }

    #[test]
    fn ambiguous_pair_is_rejected_at_construction() {
        let routes = vec![
            Route::get("/a/:x/c", "one"),
            Route::get("/a/b/:y", "two"),
        ];
        assert!(matches!(
            Router::new(&routes),
            Err(HearthError::BadRoute(_))
        ));
    }

    #[test]
    fn malformed_pattern_is_rejected_at_construction() {
        assert!(Router::new(&[Route::get("no-slash", "x")]).is_err());
        assert!(Router::new(&[Route::get("/a/:", "x")]).is_err());
        assert!(Router::new(&[Route::get("/a/:id/b/:id", "x")]).is_err());
    }
}
