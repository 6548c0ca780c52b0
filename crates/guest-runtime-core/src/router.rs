//! Route registry.
//!
//! Routes are registered while the startup instance runs the guest's
//! initialization entrypoint ([`RouteTableBuilder`]) and then frozen into an
//! immutable [`RouteTable`] before the first request is served.
//!
//! Pattern syntax:
//! - `:name` captures exactly one non-empty path segment
//! - `:name?` optionally captures one segment, together with its leading `/`
//! - `*` captures the remainder of the path under the name `*`
//! - every other character matches literally
//!
//! Matching scans routes in registration order and the first match wins;
//! there is no specificity ranking.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::Serialize;

use guest_runtime_common::RouteError;

/// Method that matches every verb.
pub const ANY_METHOD: &str = "*";

/// Name under which the wildcard capture is exposed.
pub const WILDCARD_PARAM: &str = "*";

/// A registration request as issued by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub method: String,
    pub pattern: String,
    pub handler_index: u32,
    pub is_protected: bool,
    pub required_role: Option<String>,
}

impl RouteSpec {
    /// A public route.
    pub fn new(method: impl Into<String>, pattern: impl Into<String>, handler_index: u32) -> Self {
        Self {
            method: method.into(),
            pattern: pattern.into(),
            handler_index,
            is_protected: false,
            required_role: None,
        }
    }

    /// Require an authenticated session, optionally with a specific role.
    #[must_use]
    pub fn protected(mut self, required_role: Option<String>) -> Self {
        self.is_protected = true;
        self.required_role = required_role.filter(|role| !role.is_empty());
        self
    }
}

/// A compiled route.
#[derive(Debug, Clone)]
pub struct RouteHandler {
    method: String,
    pattern: String,
    matcher: Regex,
    param_names: Vec<String>,
    handler_index: u32,
    is_protected: bool,
    required_role: Option<String>,
}

impl RouteHandler {
    /// Compile a route.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if the pattern is malformed.
    pub fn compile(spec: RouteSpec) -> Result<Self, RouteError> {
        let (matcher, param_names) = compile_pattern(&spec.pattern)?;

        Ok(Self {
            method: spec.method.to_ascii_uppercase(),
            pattern: spec.pattern,
            matcher,
            param_names,
            handler_index: spec.handler_index,
            is_protected: spec.is_protected,
            required_role: spec.required_role,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Parameter names in the order they appear in the pattern.
    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn handler_index(&self) -> u32 {
        self.handler_index
    }

    pub fn is_protected(&self) -> bool {
        self.is_protected
    }

    pub fn required_role(&self) -> Option<&str> {
        self.required_role.as_deref()
    }

    fn accepts_method(&self, method: &str) -> bool {
        self.method == ANY_METHOD || self.method.eq_ignore_ascii_case(method)
    }

    /// Match `path` and return the percent-decoded parameters.
    fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        let captures = self.matcher.captures(path)?;

        let params = self
            .param_names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                let value = captures.get(i + 1)?.as_str();
                if value.is_empty() && name != WILDCARD_PARAM {
                    return None;
                }
                let decoded = percent_decode_str(value).decode_utf8_lossy().into_owned();
                Some((name.clone(), decoded))
            })
            .collect();

        Some(params)
    }

    /// Serializable summary of this route.
    pub fn info(&self) -> RouteInfo {
        RouteInfo {
            method: self.method.clone(),
            pattern: self.pattern.clone(),
            handler_index: self.handler_index,
            is_protected: self.is_protected,
            required_role: self.required_role.clone(),
        }
    }
}

/// Serializable view of a registered route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub method: String,
    pub pattern: String,
    pub handler_index: u32,
    pub is_protected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
}

/// Result of a successful lookup.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub handler: &'a RouteHandler,
    pub params: HashMap<String, String>,
}

/// Mutable route table, used only during startup.
#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    routes: Vec<RouteHandler>,
}

impl RouteTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and append a route.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if the pattern is malformed.
    pub fn register(&mut self, spec: RouteSpec) -> Result<(), RouteError> {
        let handler = RouteHandler::compile(spec)?;
        tracing::debug!(
            method = %handler.method,
            pattern = %handler.pattern,
            handler_index = handler.handler_index,
            is_protected = handler.is_protected,
            "Route registered"
        );
        self.routes.push(handler);
        Ok(())
    }

    /// Copy of the routes registered so far.
    pub fn routes(&self) -> Vec<RouteHandler> {
        self.routes.clone()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Finish registration.
    pub fn freeze(self) -> RouteTable {
        RouteTable {
            routes: self.routes,
        }
    }
}

/// Immutable route table shared by every request.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: Vec<RouteHandler>,
}

impl RouteTable {
    /// Find the first route, in registration order, matching `method` and `path`.
    ///
    /// `path` must not include the query string.
    pub fn find(&self, method: &str, path: &str) -> Option<RouteMatch<'_>> {
        self.routes
            .iter()
            .filter(|route| route.accepts_method(method))
            .find_map(|route| {
                route.match_path(path).map(|params| RouteMatch {
                    handler: route,
                    params,
                })
            })
    }

    pub fn routes(&self) -> &[RouteHandler] {
        &self.routes
    }

    /// Serializable summaries of every route, in registration order.
    pub fn describe(&self) -> Vec<RouteInfo> {
        self.routes.iter().map(RouteHandler::info).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn invalid(pattern: &str, reason: &str) -> RouteError {
    RouteError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

/// Compile a route pattern into an anchored regex and its parameter names.
fn compile_pattern(pattern: &str) -> Result<(Regex, Vec<String>), RouteError> {
    if pattern.is_empty() {
        return Err(invalid(pattern, "pattern is empty"));
    }

    let mut regex = String::from("^");
    let mut literal = String::new();
    let mut names: Vec<String> = Vec::new();
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ':' => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }

                if name.is_empty() {
                    return Err(invalid(pattern, "parameter name is empty"));
                }
                if names.contains(&name) {
                    return Err(invalid(pattern, &format!("duplicate parameter '{name}'")));
                }

                let optional = chars.next_if_eq(&'?').is_some();
                if optional && literal.ends_with('/') {
                    literal.pop();
                    regex.push_str(&regex::escape(&literal));
                    regex.push_str("(?:/([^/]*))?");
                } else {
                    regex.push_str(&regex::escape(&literal));
                    regex.push_str(if optional { "([^/]*)" } else { "([^/]+)" });
                }
                literal.clear();
                names.push(name);
            }
            '*' => {
                if chars.peek().is_some() {
                    return Err(invalid(pattern, "wildcard must be the last element"));
                }
                if names.iter().any(|n| n == WILDCARD_PARAM) {
                    return Err(invalid(pattern, "more than one wildcard"));
                }
                regex.push_str(&regex::escape(&literal));
                literal.clear();
                regex.push_str("(.*)");
                names.push(WILDCARD_PARAM.to_string());
            }
            '?' => return Err(invalid(pattern, "'?' must follow a parameter name")),
            other => literal.push(other),
        }
    }

    regex.push_str(&regex::escape(&literal));
    regex.push('$');

    let matcher = Regex::new(&regex).map_err(|e| invalid(pattern, &e.to_string()))?;
    Ok((matcher, names))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(routes: &[(&str, &str)]) -> RouteTable {
        let mut builder = RouteTableBuilder::new();
        for (i, (method, pattern)) in routes.iter().enumerate() {
            builder
                .register(RouteSpec::new(*method, *pattern, u32::try_from(i).unwrap()))
                .unwrap();
        }
        builder.freeze()
    }

    #[test]
    fn test_static_route() {
        let routes = table(&[("GET", "/health")]);

        let m = routes.find("GET", "/health").unwrap();
        assert_eq!(m.handler.handler_index(), 0);
        assert!(m.params.is_empty());
        assert!(routes.find("GET", "/health/x").is_none());
        assert!(routes.find("POST", "/health").is_none());
    }

    #[test]
    fn test_registration_order_wins() {
        let routes = table(&[("GET", "/users/me"), ("GET", "/users/:id")]);

        let m = routes.find("GET", "/users/me").unwrap();
        assert_eq!(m.handler.handler_index(), 0);

        let m = routes.find("GET", "/users/7").unwrap();
        assert_eq!(m.handler.handler_index(), 1);
        assert_eq!(m.params["id"], "7");
    }

    #[test]
    fn test_later_static_route_is_shadowed() {
        let routes = table(&[("GET", "/users/:id"), ("GET", "/users/me")]);

        let m = routes.find("GET", "/users/me").unwrap();
        assert_eq!(m.handler.handler_index(), 0);
        assert_eq!(m.params["id"], "me");
    }

    #[test]
    fn test_wildcard_captures_remainder() {
        let routes = table(&[("GET", "/files/*")]);

        let m = routes.find("GET", "/files/a/b/c.txt").unwrap();
        assert_eq!(m.params[WILDCARD_PARAM], "a/b/c.txt");
    }

    #[test]
    fn test_params_are_percent_decoded() {
        let routes = table(&[("GET", "/users/:id")]);

        let m = routes.find("GET", "/users/42%20x").unwrap();
        assert_eq!(m.params["id"], "42 x");
    }

    #[test]
    fn test_encoded_slash_stays_in_one_segment() {
        let routes = table(&[("GET", "/docs/:name")]);

        let m = routes.find("GET", "/docs/a%2Fb").unwrap();
        assert_eq!(m.params["name"], "a/b");
    }

    #[test]
    fn test_multiple_params() {
        let routes = table(&[("GET", "/orgs/:org/repos/:repo")]);

        let m = routes.find("GET", "/orgs/acme/repos/anvil").unwrap();
        assert_eq!(m.params["org"], "acme");
        assert_eq!(m.params["repo"], "anvil");
        assert_eq!(m.handler.param_names(), ["org", "repo"]);
    }

    #[test]
    fn test_optional_param() {
        let routes = table(&[("GET", "/posts/:id?")]);

        let m = routes.find("GET", "/posts").unwrap();
        assert!(!m.params.contains_key("id"));

        let m = routes.find("GET", "/posts/9").unwrap();
        assert_eq!(m.params["id"], "9");

        assert!(routes.find("GET", "/posts/9/comments").is_none());
    }

    #[test]
    fn test_required_param_rejects_empty_segment() {
        let routes = table(&[("GET", "/users/:id")]);
        assert!(routes.find("GET", "/users/").is_none());
    }

    #[test]
    fn test_any_method() {
        let routes = table(&[("*", "/echo")]);

        for method in ["GET", "POST", "DELETE", "PATCH"] {
            assert!(routes.find(method, "/echo").is_some(), "{method}");
        }
    }

    #[test]
    fn test_method_is_case_insensitive() {
        let routes = table(&[("get", "/x")]);
        assert!(routes.find("GET", "/x").is_some());
        assert_eq!(routes.routes()[0].method(), "GET");
    }

    #[test]
    fn test_literal_regex_characters_are_escaped() {
        let routes = table(&[("GET", "/v1.0/items+(all)")]);

        assert!(routes.find("GET", "/v1.0/items+(all)").is_some());
        assert!(routes.find("GET", "/v1x0/items+(all)").is_none());
    }

    #[test]
    fn test_invalid_patterns() {
        for pattern in ["", "/users/:", "/a/:id/:id", "/files/*/x", "/what?", "/x/:/y"] {
            let mut builder = RouteTableBuilder::new();
            let err = builder
                .register(RouteSpec::new("GET", pattern, 0))
                .unwrap_err();
            assert!(
                matches!(err, RouteError::InvalidPattern { .. }),
                "{pattern}: {err}"
            );
        }
    }

    #[test]
    fn test_builder_copy_clear_and_freeze() {
        let mut builder = RouteTableBuilder::new();
        builder.register(RouteSpec::new("GET", "/a", 0)).unwrap();

        let mut copy = builder.routes();
        copy.clear();
        assert_eq!(builder.len(), 1);

        builder.clear();
        assert!(builder.is_empty());

        builder.register(RouteSpec::new("GET", "/b", 1)).unwrap();
        let routes = builder.freeze();
        assert_eq!(routes.len(), 1);
        assert!(routes.find("GET", "/a").is_none());
    }

    #[test]
    fn test_protected_route_metadata() {
        let mut builder = RouteTableBuilder::new();
        builder
            .register(RouteSpec::new("GET", "/admin", 3).protected(Some("admin".into())))
            .unwrap();
        builder
            .register(RouteSpec::new("GET", "/me", 4).protected(Some(String::new())))
            .unwrap();
        let routes = builder.freeze();

        let admin = routes.find("GET", "/admin").unwrap().handler;
        assert!(admin.is_protected());
        assert_eq!(admin.required_role(), Some("admin"));

        let me = routes.find("GET", "/me").unwrap().handler;
        assert!(me.is_protected());
        assert_eq!(me.required_role(), None);
    }

    #[test]
    fn test_describe_serializes_camel_case() {
        let routes = table(&[("POST", "/items")]);
        let json = serde_json::to_value(routes.describe()).unwrap();

        assert_eq!(json[0]["method"], "POST");
        assert_eq!(json[0]["handlerIndex"], 0);
        assert_eq!(json[0]["isProtected"], false);
        assert!(json[0].get("requiredRole").is_none());
    }
}
