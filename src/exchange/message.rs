use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message headers.
///
/// Keys are unique under case-insensitive comparison and keep the order in
/// which they were first inserted. Re-inserting a key replaces the value in
/// place and keeps the casing of the original key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, Value)>,
}

impl Headers {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(key))
    }

    /// Inserts a header, returning the previous value when the key existed.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(index) => Some(std::mem::replace(&mut self.entries[index].1, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.position(key).map(|index| &self.entries[index].1)
    }

    /// Returns the header as a string slice when it holds a JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.position(key).map(|index| self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A message body together with its headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    body: Value,
    headers: Headers,
}

impl Message {
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
        }
    }

    /// Builder style header insertion.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Value {
        &mut self.body
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = body.into();
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("Correlation-Id", "abc");
        assert_eq!(headers.get_str("correlation-id"), Some("abc"));
        assert_eq!(headers.get_str("CORRELATION-ID"), Some("abc"));
        assert!(headers.contains_key("correlation-ID"));
    }

    #[test]
    fn test_header_reinsert_replaces_in_place() {
        let mut headers = Headers::new();
        headers.insert("first", 1);
        headers.insert("Second", 2);
        headers.insert("third", 3);
        let previous = headers.insert("SECOND", 20);

        assert_eq!(previous, Some(json!(2)));
        assert_eq!(headers.len(), 3);
        let keys: Vec<&str> = headers.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["first", "Second", "third"]);
        assert_eq!(headers.get("second"), Some(&json!(20)));
    }

    #[test]
    fn test_header_remove() {
        let mut headers = Headers::new();
        headers.insert("a", true);
        assert_eq!(headers.remove("A"), Some(json!(true)));
        assert!(headers.is_empty());
        assert_eq!(headers.remove("a"), None);
    }

    #[test]
    fn test_message_builder() {
        let message = Message::new(json!({"order": 7})).with_header("type", "order");
        assert_eq!(message.body()["order"], json!(7));
        assert_eq!(message.header("TYPE"), Some(&json!("order")));
    }
}
