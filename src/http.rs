//! The HTTP collaborator boundary.
//!
//! The engine only needs `do_request(method, url, headers, timeout)` returning
//! a status and a duration. [`ReqwestClient`] is the built-in implementation;
//! anything implementing [`HttpClient`] can replace it (tests use in-memory
//! clients).
use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// A request as written by scenario code. Relative URLs are resolved against
/// the run's target, and default headers are merged in by the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Overrides the run-wide request timeout.
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Method::Post, url).body(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully resolved request handed to the [`HttpClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Time from sending the request until the body was fully received.
    pub duration: Duration,
}

/// Result of one request as seen by scenario code.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    /// `0` when no response was received.
    pub status: u16,
    pub duration: Duration,
    pub error: Option<RequestError>,
}

impl RequestOutcome {
    /// A response arrived with a status in 200-399.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..400).contains(&self.status)
    }
}

pub trait HttpClient: Send + Sync + 'static {
    /// Issue one request. Implementations should honour `request.timeout`; the
    /// engine enforces it as well.
    fn do_request(
        &self,
        request: &HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, RequestError>> + Send;
}

/// [`HttpClient`] backed by a shared, connection-pooling `reqwest::Client`.
///
/// Build it once per run: creating clients per request defeats pooling and
/// severely distorts the measured latency.
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpClient for ReqwestClient {
    async fn do_request(&self, request: &HttpRequest) -> Result<HttpResponse, RequestError> {
        let mut builder = self
            .client
            .request(request.method.into(), &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| request_error(e, request.timeout))?;
        let status = response.status().as_u16();
        // The body is part of the measured time.
        response
            .bytes()
            .await
            .map_err(|e| request_error(e, request.timeout))?;

        Ok(HttpResponse {
            status,
            duration: started.elapsed(),
        })
    }
}

fn request_error(error: reqwest::Error, timeout: Duration) -> RequestError {
    if error.is_timeout() {
        RequestError::Timeout(timeout)
    } else if error.is_connect() {
        RequestError::Connect(error.to_string())
    } else if error.is_builder() {
        RequestError::InvalidRequest(error.to_string())
    } else {
        RequestError::Transport(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_means_response_in_2xx_or_3xx() {
        let outcome = |status, error| RequestOutcome {
            status,
            duration: Duration::from_millis(5),
            error,
        };
        assert!(outcome(200, None).is_success());
        assert!(outcome(302, None).is_success());
        assert!(!outcome(404, None).is_success());
        assert!(!outcome(500, None).is_success());
        assert!(!outcome(0, Some(RequestError::Timeout(Duration::from_secs(1)))).is_success());
    }

    #[test]
    fn request_spec_builder() {
        let spec = RequestSpec::post("/api", "{}")
            .header("Host", "api.example")
            .timeout(Duration::from_secs(30));
        assert_eq!(spec.method, Method::Post);
        assert_eq!(spec.body.as_deref(), Some("{}"));
        assert_eq!(spec.headers, vec![("Host".to_string(), "api.example".to_string())]);
        assert_eq!(spec.timeout, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn unreachable_host_is_a_request_error() {
        let client = ReqwestClient::new();
        let result = client
            .do_request(&HttpRequest {
                method: Method::Get,
                url: "http://127.0.0.1:9/".into(),
                headers: vec![],
                body: None,
                timeout: Duration::from_secs(2),
            })
            .await;
        assert!(result.is_err());
    }
}
