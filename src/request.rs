use std::time::Duration;

use reqwest::Method;

/// One logical request, independent of how many attempts it takes.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Path relative to the client base URL, e.g. `/ping`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Overrides the client-wide timeout for each attempt.
    pub timeout: Option<Duration>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Method;
    use serde_json::json;

    use crate::RequestDescriptor;

    #[test]
    fn builder_keeps_query_order() {
        let request = RequestDescriptor::get("/api/v5/supplier/reportDetailByPeriod")
            .query("dateFrom", "2024-01-01")
            .query("limit", 100_000)
            .query("rrdid", 0);

        assert_eq!(request.method, Method::GET);
        assert_eq!(
            request.query,
            vec![
                ("dateFrom".to_owned(), "2024-01-01".to_owned()),
                ("limit".to_owned(), "100000".to_owned()),
                ("rrdid".to_owned(), "0".to_owned()),
            ]
        );
    }

    #[test]
    fn post_with_body_and_timeout() {
        let request = RequestDescriptor::post("/orders")
            .json(json!({"limit": 10}))
            .timeout(Duration::from_secs(5));

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body, Some(json!({"limit": 10})));
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }
}
