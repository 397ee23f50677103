//! Declarative route table and path pattern matcher.
//!
//! The table is an *ordered* list and matching is first-match-wins. A
//! literal path that overlaps a parametric pattern with the same segment
//! count (e.g. `/users/ban-status` vs `/users/{userId}`) must be declared
//! earlier or it becomes unreachable. [`RouteTable::shadowed_routes`]
//! detects such ordering regressions; the constructor logs them and tests
//! assert the default table has none.

use crate::dispatch::HEALTH_HANDLER;
use indexmap::IndexMap;
use tracing::{info, warn};

/// One entry of the route table.
#[derive(Debug, Clone)]
pub struct RouteDef {
    /// Uppercase HTTP method
    pub method: &'static str,
    /// Path template of literal segments and `{name}` placeholders
    pub pattern: &'static str,
    /// Downstream handler id resolved by the dispatcher
    pub handler: &'static str,
    pub requires_auth: bool,
    /// Declarative metadata only; the gateway performs no caching
    pub cacheable: bool,
}

impl RouteDef {
    pub const fn new(
        method: &'static str,
        pattern: &'static str,
        handler: &'static str,
        requires_auth: bool,
        cacheable: bool,
    ) -> Self {
        Self {
            method,
            pattern,
            handler,
            requires_auth,
            cacheable,
        }
    }
}

/// Ordered route table with stage-prefix normalization.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<RouteDef>,
    /// Deployment-stage prefix stripped once before matching, e.g. "/prod"
    stage_prefix: Option<String>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteDef>) -> Self {
        let table = Self {
            routes,
            stage_prefix: None,
        };
        for (earlier, shadowed) in table.shadowed_routes() {
            warn!(
                method = earlier.method,
                earlier = earlier.pattern,
                unreachable = shadowed.pattern,
                "Route ordering defect: later route is shadowed by an earlier one"
            );
        }
        info!(routes_count = table.routes.len(), "Route table loaded");
        table
    }

    pub fn with_stage_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if !prefix.is_empty() {
            self.stage_prefix = Some(prefix);
        }
        self
    }

    pub fn routes(&self) -> &[RouteDef] {
        &self.routes
    }

    /// Strip a single known deployment-stage prefix so route patterns stay
    /// stage-agnostic.
    pub fn normalize_path<'a>(&self, path: &'a str) -> &'a str {
        if let Some(prefix) = &self.stage_prefix {
            if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                if rest.is_empty() {
                    return "/";
                }
                if rest.starts_with('/') {
                    return rest;
                }
            }
        }
        path
    }

    /// First route whose method and pattern match, in declaration order.
    pub fn route_request(&self, method: &str, path: &str) -> Option<&RouteDef> {
        let method = method.to_ascii_uppercase();
        let path = self.normalize_path(path);
        self.routes
            .iter()
            .find(|r| r.method == method && match_path(r.pattern, path))
    }

    /// Whether the matched route is explicitly public. Unknown paths are
    /// treated as requiring auth (fail closed).
    pub fn is_route_public(&self, method: &str, path: &str) -> bool {
        match self.route_request(method, path) {
            Some(route) => !route.requires_auth,
            None => false,
        }
    }

    /// Pairs `(earlier, later)` where every path matching the later route
    /// also matches the earlier one, making the later route unreachable.
    pub fn shadowed_routes(&self) -> Vec<(&RouteDef, &RouteDef)> {
        let mut shadowed = Vec::new();
        for (i, earlier) in self.routes.iter().enumerate() {
            for later in &self.routes[i + 1..] {
                if earlier.method == later.method && subsumes(earlier.pattern, later.pattern) {
                    shadowed.push((earlier, later));
                }
            }
        }
        shadowed
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn is_param(segment: &str) -> bool {
    segment.starts_with('{') && segment.ends_with('}') && segment.len() > 2
}

/// Match a concrete path against a pattern. Segment counts must be equal;
/// a `{name}` segment matches any non-empty concrete segment, anything
/// else must be literally equal.
pub fn match_path(pattern: &str, path: &str) -> bool {
    let mut pattern_segments = segments(pattern);
    let mut path_segments = segments(path);
    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (Some(p), Some(s)) => {
                if !is_param(p) && p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Extract `{name}` parameter values from a matching path, in pattern
/// order. Returns an empty map when the path does not match.
pub fn extract_path_params(pattern: &str, path: &str) -> IndexMap<String, String> {
    let mut params = IndexMap::new();
    if !match_path(pattern, path) {
        return params;
    }
    for (p, s) in segments(pattern).zip(segments(path)) {
        if is_param(p) {
            let name = &p[1..p.len() - 1];
            params.insert(name.to_string(), s.to_string());
        }
    }
    params
}

/// True when every concrete path matching `later` also matches `earlier`.
fn subsumes(earlier: &str, later: &str) -> bool {
    let a: Vec<&str> = segments(earlier).collect();
    let b: Vec<&str> = segments(later).collect();
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .all(|(ea, la)| is_param(ea) || (!is_param(la) && ea == la))
}

/// The Plateful route table. Order matters: literal paths are declared
/// before overlapping parametric ones with the same segment count.
pub fn default_routes() -> Vec<RouteDef> {
    vec![
        // Liveness, answered inline by the dispatcher
        RouteDef::new("GET", "/health", HEALTH_HANDLER, false, false),
        // Feed and posts
        RouteDef::new("GET", "/feed", "posts", false, true),
        RouteDef::new("POST", "/posts", "posts", true, false),
        RouteDef::new("GET", "/posts/{postId}", "posts", false, true),
        RouteDef::new("PUT", "/posts/{postId}", "posts", true, false),
        RouteDef::new("DELETE", "/posts/{postId}", "posts", true, false),
        RouteDef::new("GET", "/posts/{postId}/comments", "posts", false, false),
        RouteDef::new("POST", "/posts/{postId}/comments", "posts", true, false),
        // Recipes
        RouteDef::new("POST", "/recipes", "recipes", true, false),
        RouteDef::new("GET", "/recipes/{recipeId}", "recipes", false, true),
        RouteDef::new("PUT", "/recipes/{recipeId}", "recipes", true, false),
        // Profiles; ban-status must stay ahead of the {userId} pattern
        RouteDef::new("GET", "/users/ban-status", "users", true, false),
        RouteDef::new("GET", "/users/me", "users", true, false),
        RouteDef::new("PUT", "/users/me", "users", true, false),
        RouteDef::new("GET", "/users/{userId}", "users", true, false),
        RouteDef::new("GET", "/users/{userId}/posts", "posts", false, true),
        // Nutrition tracking
        RouteDef::new("GET", "/nutrition/log", "nutrition", true, false),
        RouteDef::new("POST", "/nutrition/log", "nutrition", true, false),
        RouteDef::new("DELETE", "/nutrition/log/{entryId}", "nutrition", true, false),
        // Admin moderation
        RouteDef::new("GET", "/admin/reports", "admin", true, false),
        RouteDef::new("POST", "/admin/users/{userId}/ban", "admin", true, false),
        RouteDef::new("DELETE", "/admin/posts/{postId}", "admin", true, false),
    ]
}
