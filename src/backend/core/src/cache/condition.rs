//! Policy predicates.
//!
//! The grammar is deliberately small: a dotted path tested for truthiness,
//! or a dotted path compared with `==` / `!=` against one literal. There is
//! no `&&`, `||` or negation; compose policies instead.
//!
//! ```text
//! auth.user
//! auth.user.role == 'admin'
//! query.preview != "1"
//! status == 200
//! ```
//!
//! Expressions are parsed once, when the owning policy is built.

use super::context::{is_truthy, RequestContext};
use crate::error::{CacheError, Result};
use serde_json::Value;
use std::fmt;

/// A parsed predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Truthy(String),
    Equals(String, Value),
    NotEquals(String, Value),
}

impl Condition {
    /// Parse an expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(CacheError::invalid_policy("Condition expression is empty"));
        }
        if find_unquoted(expression, "&&").is_some() || find_unquoted(expression, "||").is_some() {
            return Err(CacheError::invalid_policy(format!(
                "Condition '{}' combines predicates; only a single comparison is supported",
                expression
            )));
        }

        if let Some(at) = find_unquoted(expression, "!=") {
            let (path, literal) = (&expression[..at], &expression[at + 2..]);
            return Ok(Self::NotEquals(parse_path(path, expression)?, parse_literal(literal, expression)?));
        }
        if let Some(at) = find_unquoted(expression, "==") {
            let (path, literal) = (&expression[..at], &expression[at + 2..]);
            return Ok(Self::Equals(parse_path(path, expression)?, parse_literal(literal, expression)?));
        }

        Ok(Self::Truthy(parse_path(expression, expression)?))
    }

    /// Evaluate against a context. Unresolvable paths are absent, never errors.
    pub fn evaluate(&self, ctx: &RequestContext) -> bool {
        match self {
            Self::Truthy(path) => is_truthy(ctx.lookup(path)),
            Self::Equals(path, expected) => loosely_equal(ctx.lookup(path), expected),
            Self::NotEquals(path, expected) => !loosely_equal(ctx.lookup(path), expected),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Truthy(path) | Self::Equals(path, _) | Self::NotEquals(path, _) => path,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truthy(path) => write!(f, "{}", path),
            Self::Equals(path, value) => write!(f, "{} == {}", path, value),
            Self::NotEquals(path, value) => write!(f, "{} != {}", path, value),
        }
    }
}

/// Byte offset of the first `operator` that is not inside a quoted literal.
fn find_unquoted(expression: &str, operator: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (at, c) in expression.char_indices() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if expression[at..].starts_with(operator) => return Some(at),
            None => {}
        }
    }
    None
}

fn parse_path(raw: &str, expression: &str) -> Result<String> {
    let path = raw.trim();
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });

    if valid {
        Ok(path.to_string())
    } else {
        Err(CacheError::invalid_policy(format!(
            "Condition '{}' has an invalid path '{}'",
            expression, path
        )))
    }
}

fn parse_literal(raw: &str, expression: &str) -> Result<Value> {
    let literal = raw.trim();

    for quote in ['\'', '"'] {
        if literal.len() >= 2 && literal.starts_with(quote) && literal.ends_with(quote) {
            return Ok(Value::String(literal[1..literal.len() - 1].to_string()));
        }
    }

    match literal {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }

    if let Ok(n) = literal.parse::<i64>() {
        return Ok(Value::from(n));
    }
    if let Some(n) = literal.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        return Ok(Value::Number(n));
    }

    Err(CacheError::invalid_policy(format!(
        "Condition '{}' has an invalid literal '{}'",
        expression, literal
    )))
}

/// Compare a context value with a literal. Strings from query strings and
/// headers compare equal to the numbers and booleans they spell.
fn loosely_equal(actual: Option<&Value>, expected: &Value) -> bool {
    let actual = match actual {
        Some(value) => value,
        None => return expected.is_null(),
    };

    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(s), Value::Number(_) | Value::Bool(_)) => *s == expected.to_string(),
        (Value::Number(_) | Value::Bool(_), Value::String(s)) => actual.to_string() == *s,
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext::from_value(json!({
            "auth": {"user": {"role": "admin"}, "isGuest": false},
            "query": {"page": "2"},
            "status": 200,
        }))
    }

    #[test]
    fn test_parse() {
        assert_eq!(Condition::parse("auth.user").unwrap(), Condition::Truthy("auth.user".into()));
        assert_eq!(
            Condition::parse("auth.user.role == 'admin'").unwrap(),
            Condition::Equals("auth.user.role".into(), json!("admin"))
        );
        assert_eq!(
            Condition::parse(r#"query.preview != "1""#).unwrap(),
            Condition::NotEquals("query.preview".into(), json!("1"))
        );
        assert_eq!(
            Condition::parse("status == 200").unwrap(),
            Condition::Equals("status".into(), json!(200))
        );
    }

    #[test]
    fn test_parse_rejects_composition_and_garbage() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("a && b").is_err());
        assert!(Condition::parse("a || b").is_err());
        assert!(Condition::parse("a == ").is_err());
        assert!(Condition::parse("a b").is_err());
        assert!(Condition::parse("== 'x'").is_err());
    }

    #[test]
    fn test_operators_inside_quotes_are_literal() {
        assert_eq!(
            Condition::parse("a == 'x!=y'").unwrap(),
            Condition::Equals("a".into(), json!("x!=y"))
        );
        assert_eq!(
            Condition::parse(r#"a != "p==q""#).unwrap(),
            Condition::NotEquals("a".into(), json!("p==q"))
        );
        assert_eq!(
            Condition::parse("query.q == 'x && y'").unwrap(),
            Condition::Equals("query.q".into(), json!("x && y"))
        );
    }

    #[test]
    fn test_evaluate() {
        let ctx = ctx();
        assert!(Condition::parse("auth.user").unwrap().evaluate(&ctx));
        assert!(!Condition::parse("auth.isGuest").unwrap().evaluate(&ctx));
        assert!(!Condition::parse("auth.nothing.here").unwrap().evaluate(&ctx));
        assert!(Condition::parse("auth.user.role == 'admin'").unwrap().evaluate(&ctx));
        assert!(Condition::parse("auth.user.role != 'editor'").unwrap().evaluate(&ctx));
        assert!(Condition::parse("status == 200").unwrap().evaluate(&ctx));
    }

    #[test]
    fn test_query_strings_compare_with_numbers() {
        let ctx = ctx();
        assert!(Condition::parse("query.page == 2").unwrap().evaluate(&ctx));
        assert!(Condition::parse("query.page == '2'").unwrap().evaluate(&ctx));
    }

    #[test]
    fn test_missing_path_compares_equal_to_null() {
        let ctx = ctx();
        assert!(Condition::parse("query.missing == null").unwrap().evaluate(&ctx));
        assert!(Condition::parse("query.missing != 'x'").unwrap().evaluate(&ctx));
    }
}
