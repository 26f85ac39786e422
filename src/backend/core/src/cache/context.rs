//! Request context for policy evaluation.
//!
//! A context is a JSON object addressed by dotted paths (`auth.user.role`,
//! `query.page`, `headers.accept-language`). Well-known roots:
//!
//! | Root       | Content                                  |
//! |------------|------------------------------------------|
//! | `method`   | upper-case HTTP method                   |
//! | `path`     | request path without the query string    |
//! | `status`   | response status, once known              |
//! | `query.*`  | query-string parameters                  |
//! | `headers.*`| request headers, lower-cased names       |
//! | `params.*` | route parameters                         |
//! | `auth.*`   | authentication state supplied by the app |

use axum::http::{HeaderMap, Method, Uri};
use serde_json::{Map, Value};
use url::form_urlencoded;

/// Flat, path-addressable request context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    root: Map<String, Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing JSON value. Non-object values yield an empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(root) => Self { root },
            _ => Self::default(),
        }
    }

    /// Build from the parts of an HTTP request.
    pub fn from_http(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let mut ctx = Self::new()
            .with_method(method.as_str())
            .with_path(uri.path());

        if let Some(query) = uri.query() {
            for (name, value) in form_urlencoded::parse(query.as_bytes()) {
                ctx.set(&format!("query.{}", name), Value::String(value.into_owned()));
            }
        }

        let mut header_map = Map::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                header_map.insert(name.as_str().to_ascii_lowercase(), Value::String(value.to_string()));
            }
        }
        ctx.root.insert("headers".to_string(), Value::Object(header_map));
        ctx
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builders
    // ─────────────────────────────────────────────────────────────────────────

    pub fn with_method(mut self, method: &str) -> Self {
        self.set("method", Value::String(method.to_ascii_uppercase()));
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.set("path", Value::String(path.to_string()));
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.set("status", Value::from(status));
        self
    }

    pub fn with_query(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(&format!("query.{}", name), value.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set(
            &format!("headers.{}", name.to_ascii_lowercase()),
            Value::String(value.to_string()),
        );
        self
    }

    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(&format!("params.{}", name), value.into());
        self
    }

    /// Attach authentication state under `auth`.
    pub fn with_auth(mut self, auth: Value) -> Self {
        self.root.insert("auth".to_string(), auth);
        self
    }

    /// Insert a value at a dotted path, creating intermediate objects.
    pub fn set(&mut self, path: &str, value: Value) {
        let mut segments = path.split('.').peekable();
        let mut current = &mut self.root;

        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                current.insert(segment.to_string(), value);
                return;
            }
            let slot = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            current = match slot {
                Value::Object(map) => map,
                _ => return,
            };
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookups
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolve a dotted path. Missing segments resolve to `None`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.root.get(first)?;

        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Resolve a placeholder name: the dotted path itself, then route
    /// parameters, then query parameters.
    pub fn resolve(&self, name: &str) -> Option<&Value> {
        self.lookup(name)
            .or_else(|| self.lookup(&format!("params.{}", name)))
            .or_else(|| self.lookup(&format!("query.{}", name)))
            .filter(|v| !v.is_null())
    }

    /// Resolve a placeholder as a key fragment.
    pub fn resolve_str(&self, name: &str) -> Option<String> {
        self.resolve(name).map(value_to_key_fragment)
    }

    pub fn method(&self) -> Option<&str> {
        self.lookup("method").and_then(Value::as_str)
    }

    pub fn path(&self) -> Option<&str> {
        self.lookup("path").and_then(Value::as_str)
    }

    pub fn status(&self) -> Option<u16> {
        self.lookup("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
    }

    /// `auth.authenticated` when present, else whether `auth.user` is set.
    pub fn is_authenticated(&self) -> bool {
        match self.lookup("auth.authenticated") {
            Some(flag) => is_truthy(Some(flag)),
            None => is_truthy(self.lookup("auth.user")),
        }
    }

    /// Query parameters as sorted `name=value` pairs.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = match self.lookup("query") {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_key_fragment(v)))
                .collect(),
            _ => Vec::new(),
        };
        pairs.sort();
        pairs
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.lookup("headers")
            .and_then(|h| h.get(name.to_ascii_lowercase()))
            .and_then(Value::as_str)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Templates
    // ─────────────────────────────────────────────────────────────────────────

    /// Substitute `{name}` placeholders. Returns `None` if any placeholder
    /// cannot be resolved, or if a brace is left unclosed.
    pub fn render(&self, template: &str) -> Option<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}')?;
            let name = after[..close].trim();
            out.push_str(&self.resolve_str(name)?);
            rest = &after[close + 1..];
        }

        out.push_str(rest);
        Some(out)
    }
}

/// Truthiness over JSON: absent, null, false, 0, "", [] and {} are falsy.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

/// Render a value as it should appear inside a key.
pub fn value_to_key_fragment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_dotted_lookup() {
        let ctx = RequestContext::from_value(json!({
            "auth": {"user": {"role": "admin", "ids": [7, 8]}},
        }));
        assert_eq!(ctx.lookup("auth.user.role"), Some(&json!("admin")));
        assert_eq!(ctx.lookup("auth.user.ids.1"), Some(&json!(8)));
        assert_eq!(ctx.lookup("auth.user.missing"), None);
        assert_eq!(ctx.lookup("auth.user.role.deeper"), None);
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut ctx = RequestContext::new();
        ctx.set("a.b.c", json!(1));
        assert_eq!(ctx.lookup("a.b.c"), Some(&json!(1)));

        ctx.set("a.b", json!("flat"));
        assert_eq!(ctx.lookup("a.b"), Some(&json!("flat")));
    }

    #[test]
    fn test_from_http() {
        let uri: Uri = "/users?page=2&sort=name".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("Accept-Language", HeaderValue::from_static("en"));

        let ctx = RequestContext::from_http(&Method::GET, &uri, &headers);
        assert_eq!(ctx.method(), Some("GET"));
        assert_eq!(ctx.path(), Some("/users"));
        assert_eq!(ctx.lookup("query.page"), Some(&json!("2")));
        assert_eq!(ctx.header("accept-language"), Some("en"));
        assert_eq!(
            ctx.query_pairs(),
            vec![("page".into(), "2".into()), ("sort".into(), "name".into())]
        );
    }

    #[test]
    fn test_authentication() {
        assert!(!RequestContext::new().is_authenticated());
        assert!(RequestContext::new()
            .with_auth(json!({"user": {"id": 1}}))
            .is_authenticated());
        assert!(!RequestContext::new()
            .with_auth(json!({"authenticated": false, "user": {"id": 1}}))
            .is_authenticated());
    }

    #[test]
    fn test_render_templates() {
        let ctx = RequestContext::new()
            .with_param("id", 42)
            .with_query("lang", "en");

        assert_eq!(ctx.render("user:{id}").as_deref(), Some("user:42"));
        assert_eq!(ctx.render("user:{params.id}:{lang}").as_deref(), Some("user:42:en"));
        assert_eq!(ctx.render("static"), Some("static".to_string()));
        assert_eq!(ctx.render("user:{missing}"), None);
        assert_eq!(ctx.render("user:{id"), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(None));
        assert!(!is_truthy(Some(&json!(null))));
        assert!(!is_truthy(Some(&json!(0))));
        assert!(!is_truthy(Some(&json!(""))));
        assert!(!is_truthy(Some(&json!([]))));
        assert!(is_truthy(Some(&json!("x"))));
        assert!(is_truthy(Some(&json!(1.5))));
        assert!(is_truthy(Some(&json!({"a": 1}))));
    }

    #[test]
    fn test_query_values_are_percent_decoded() {
        let headers = HeaderMap::new();
        let encoded = RequestContext::from_http(&Method::GET, &"/s?q=a%20b".parse().unwrap(), &headers);
        let plus = RequestContext::from_http(&Method::GET, &"/s?q=a+b&tag=%C3%A9t%C3%A9".parse().unwrap(), &headers);

        assert_eq!(encoded.lookup("query.q"), Some(&json!("a b")));
        assert_eq!(plus.lookup("query.q"), Some(&json!("a b")));
        assert_eq!(plus.lookup("query.tag"), Some(&json!("été")));
    }
}
