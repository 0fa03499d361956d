//! Expressions evaluated against an exchange.
//!
//! Processors that need a per-exchange value (correlation keys, throttle
//! rates, sticky keys) take an [`Expression`]. Helpers cover the common cases
//! and any `Fn(&Exchange) -> Option<Value>` closure is an expression too.

use crate::exchange::Exchange;
use serde_json::Value;
use std::sync::Arc;

pub type SharedExpression = Arc<dyn Expression>;

pub trait Expression: Send + Sync {
    /// Evaluates the expression. `None` means the value is absent.
    fn evaluate(&self, exchange: &Exchange) -> Option<Value>;

    /// A short description used in error messages and logs.
    fn describe(&self) -> String {
        String::from("expression")
    }
}

impl<F> Expression for F
where
    F: Fn(&Exchange) -> Option<Value> + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> Option<Value> {
        self(exchange)
    }
}

/// Value of an input header.
pub struct HeaderExpression {
    name: String,
}

impl Expression for HeaderExpression {
    fn evaluate(&self, exchange: &Exchange) -> Option<Value> {
        exchange.header(&self.name).cloned()
    }

    fn describe(&self) -> String {
        format!("header({})", self.name)
    }
}

/// Value of an exchange property stored as a JSON value, string or integer.
pub struct PropertyExpression {
    name: String,
}

impl Expression for PropertyExpression {
    fn evaluate(&self, exchange: &Exchange) -> Option<Value> {
        let properties = exchange.properties();
        if let Some(value) = properties.get::<Value>(&self.name) {
            return Some(value.clone());
        }
        if let Some(value) = properties.get::<String>(&self.name) {
            return Some(Value::String(value.clone()));
        }
        if let Some(value) = properties.get::<u64>(&self.name) {
            return Some(Value::from(*value));
        }
        properties.get::<i64>(&self.name).map(|value| Value::from(*value))
    }

    fn describe(&self) -> String {
        format!("property({})", self.name)
    }
}

/// The input body, or a part of it addressed by a JSON pointer.
pub struct BodyExpression {
    pointer: Option<String>,
}

impl Expression for BodyExpression {
    fn evaluate(&self, exchange: &Exchange) -> Option<Value> {
        let body = exchange.body();
        match &self.pointer {
            None => Some(body.clone()),
            Some(pointer) => body.pointer(pointer).cloned(),
        }
    }

    fn describe(&self) -> String {
        match &self.pointer {
            None => String::from("body"),
            Some(pointer) => format!("body({})", pointer),
        }
    }
}

pub struct ConstantExpression {
    value: Value,
}

impl Expression for ConstantExpression {
    fn evaluate(&self, _exchange: &Exchange) -> Option<Value> {
        Some(self.value.clone())
    }

    fn describe(&self) -> String {
        format!("constant({})", self.value)
    }
}

pub fn header(name: impl Into<String>) -> SharedExpression {
    Arc::new(HeaderExpression { name: name.into() })
}

pub fn property(name: impl Into<String>) -> SharedExpression {
    Arc::new(PropertyExpression { name: name.into() })
}

pub fn body() -> SharedExpression {
    Arc::new(BodyExpression { pointer: None })
}

/// Part of a JSON body addressed by an RFC 6901 pointer such as `/order/id`.
pub fn body_pointer(pointer: impl Into<String>) -> SharedExpression {
    Arc::new(BodyExpression {
        pointer: Some(pointer.into()),
    })
}

pub fn constant(value: impl Into<Value>) -> SharedExpression {
    Arc::new(ConstantExpression {
        value: value.into(),
    })
}

/// Evaluates an expression into a non-empty string key.
///
/// Strings are used as-is, scalars are rendered, `null`, empty strings and
/// absent values yield `None`.
pub fn evaluate_key(expression: &dyn Expression, exchange: &Exchange) -> Option<String> {
    match expression.evaluate(exchange)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Evaluates an expression into a positive integer.
///
/// Accepts JSON integers and strings holding an integer. Anything else,
/// including zero, is reported as an error message.
pub fn evaluate_positive(expression: &dyn Expression, exchange: &Exchange) -> Result<u64, String> {
    let value = expression
        .evaluate(exchange)
        .ok_or_else(|| String::from("evaluated to no value"))?;
    let parsed = match &value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match parsed {
        Some(0) => Err(String::from("must be a positive number, got 0")),
        Some(n) => Ok(n),
        None => Err(format!("'{}' is not a positive integer", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Message;
    use serde_json::json;

    fn exchange() -> Exchange {
        let message = Message::new(json!({"order": {"id": "A-1", "qty": 3}}))
            .with_header("Key", "abc")
            .with_header("Empty", "  ")
            .with_header("Rate", "5");
        Exchange::with_message(message)
    }

    #[test]
    fn test_header_expression() {
        let ex = exchange();
        assert_eq!(evaluate_key(header("key").as_ref(), &ex).as_deref(), Some("abc"));
        assert_eq!(evaluate_key(header("empty").as_ref(), &ex), None);
        assert_eq!(evaluate_key(header("missing").as_ref(), &ex), None);
    }

    #[test]
    fn test_body_pointer_expression() {
        let ex = exchange();
        assert_eq!(
            evaluate_key(body_pointer("/order/id").as_ref(), &ex).as_deref(),
            Some("A-1")
        );
        assert_eq!(
            evaluate_key(body_pointer("/order/qty").as_ref(), &ex).as_deref(),
            Some("3")
        );
    }

    #[test]
    fn test_property_expression() {
        let mut ex = exchange();
        ex.properties_mut().insert("tenant", String::from("t1"));
        ex.properties_mut().insert("limit", 7u64);
        assert_eq!(evaluate_key(property("tenant").as_ref(), &ex).as_deref(), Some("t1"));
        assert_eq!(evaluate_positive(property("limit").as_ref(), &ex), Ok(7));
    }

    #[test]
    fn test_evaluate_positive() {
        let ex = exchange();
        assert_eq!(evaluate_positive(header("rate").as_ref(), &ex), Ok(5));
        assert_eq!(evaluate_positive(constant(2).as_ref(), &ex), Ok(2));
        assert!(evaluate_positive(constant(0).as_ref(), &ex).is_err());
        assert!(evaluate_positive(constant(-1).as_ref(), &ex).is_err());
        assert!(evaluate_positive(header("key").as_ref(), &ex).is_err());
        assert!(evaluate_positive(header("missing").as_ref(), &ex).is_err());
    }

    #[test]
    fn test_closure_expression() {
        let ex = exchange();
        let expr = |ex: &Exchange| ex.header("key").cloned();
        assert_eq!(evaluate_key(&expr, &ex).as_deref(), Some("abc"));
    }
}
