//! Query the Prometheus HTTP API for instant vectors.

use std::collections::HashMap;
use std::ops::Deref;
use std::time::Duration;

use reqwest::{IntoUrl, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config_file::Config;

const QUERY_PATH: &str = "api/v1/query";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const UNKNOWN_API_ERROR: &str = "Unknown Prometheus API error";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client not initialized: open a session before fetching")]
    NotInitialized,
    #[error("Client already has an open session")]
    AlreadyBound,
    #[error("Invalid Prometheus URL: {0}")]
    InvalidUrl(String),
    #[error("Could not build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("Connection to Prometheus failed: {0}")]
    Connection(#[source] reqwest::Error),
    #[error("Prometheus returned status {status}")]
    HttpStatus { status: u16 },
    #[error("Prometheus returned a malformed response body")]
    Decode(#[source] serde_json::Error),
    #[error("Prometheus API error: {message}")]
    Api {
        message: String,
        error_type: Option<String>,
    },
}

/// One series of an instant vector: its labels and latest value.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub labels: HashMap<String, String>,
    pub value: f64,
}

/// A Prometheus API client. Queries need an open [`Session`], which owns the HTTP client
/// and releases it when dropped.
#[derive(Debug)]
pub struct PrometheusClient {
    base_url: Url,
    query_url: Url,
    timeout: Duration,
    http: Option<reqwest::Client>,
}

impl TryFrom<&Config> for PrometheusClient {
    type Error = ClientError;
    fn try_from(value: &Config) -> Result<Self, Self::Error> {
        Self::new(value.prometheus_url.clone())
    }
}

impl PrometheusClient {
    pub fn new(base_url: impl IntoUrl) -> Result<Self, ClientError> {
        let mut base_url = base_url
            .into_url()
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }
        // join() replaces the last path segment unless the base ends in '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let query_url = base_url
            .join(QUERY_PATH)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            base_url,
            query_url,
            timeout: DEFAULT_TIMEOUT,
            http: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn query_url(&self) -> &Url {
        &self.query_url
    }

    pub fn is_bound(&self) -> bool {
        self.http.is_some()
    }

    /// Acquire the HTTP client. It is released when the returned guard is dropped, including
    /// when the future holding it is cancelled.
    ///
    /// Fails with [`ClientError::AlreadyBound`] if a previous guard was leaked.
    pub fn session(&mut self) -> Result<Session<'_>, ClientError> {
        if self.http.is_some() {
            return Err(ClientError::AlreadyBound);
        }

        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(ClientError::ClientBuild)?;
        self.http = Some(http);
        debug!(url = %self.base_url, "opened prometheus session");
        Ok(Session { client: self })
    }

    fn release(&mut self) {
        if self.http.take().is_some() {
            debug!(url = %self.base_url, "closed prometheus session");
        }
    }

    /// Run an instant query and return one [`Sample`] per well-formed series.
    pub async fn fetch_metric(&self, query: &str) -> Result<Vec<Sample>, ClientError> {
        let http = self.http.as_ref().ok_or(ClientError::NotInitialized)?;

        let resp = http
            .get(self.query_url.clone())
            .query(&[("query", query)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                error!(err = %e, query, "HTTP request to Prometheus failed");
                ClientError::Connection(e)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, query, "HTTP error from Prometheus");
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(|e| {
            error!(err = %e, query, "Reading response from Prometheus failed");
            ClientError::Connection(e)
        })?;
        let envelope: Value = serde_json::from_slice(&body).map_err(ClientError::Decode)?;

        // anything but the string "success" is an API error, whatever the field types
        let text = |key: &str| envelope.get(key).and_then(Value::as_str);
        if text("status") != Some("success") {
            return Err(ClientError::Api {
                message: text("error").unwrap_or(UNKNOWN_API_ERROR).to_owned(),
                error_type: text("errorType").map(str::to_owned),
            });
        }

        Ok(normalize(envelope.get("data").unwrap_or(&Value::Null)))
    }
}

/// An open session on a [`PrometheusClient`].
#[derive(Debug)]
pub struct Session<'a> {
    client: &'a mut PrometheusClient,
}

impl Session<'_> {
    /// Release the session now rather than at the end of scope.
    pub fn close(self) {}
}

impl Deref for Session<'_> {
    type Target = PrometheusClient;
    fn deref(&self) -> &Self::Target {
        &*self.client
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.client.release();
    }
}

/// Flatten `data.result` into samples. Malformed series are logged and skipped.
fn normalize(data: &Value) -> Vec<Sample> {
    let Some(result) = data.get("result") else {
        return Vec::new();
    };
    let Some(series) = result.as_array() else {
        warn!(%result, "Prometheus result is not an array");
        return Vec::new();
    };

    series
        .iter()
        .filter_map(|item| match parse_series(item) {
            Ok(sample) => Some(sample),
            Err(reason) => {
                warn!(%item, reason, "Could not parse value from metric item");
                None
            }
        })
        .collect()
}

fn parse_series(item: &Value) -> Result<Sample, &'static str> {
    let labels: HashMap<String, String> = match item.get("metric") {
        None | Some(Value::Null) => HashMap::new(),
        Some(metric) => serde_json::from_value(metric.clone())
            .map_err(|_| "metric labels are not a string map")?,
    };

    let raw = item
        .get("value")
        .and_then(Value::as_array)
        .and_then(|pair| pair.get(1))
        .ok_or("missing sample value")?;
    let value = match raw {
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| "value is not a number")?,
        Value::Number(n) => n.as_f64().ok_or("value is not a number")?,
        _ => return Err("value is not a number"),
    };

    Ok(Sample { labels, value })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn skips_malformed_series() {
        let data = json!({
            "result": [
                {"metric": {"instance": "good"}, "value": [0, "1.23"]},
                {"metric": {"instance": "bad"}, "value": [0, "not-a-float"]},
                {"metric": {"instance": "no-value"}, "value": [0]},
            ]
        });

        let samples = normalize(&data);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels["instance"], "good");
        assert_eq!(samples[0].value, 1.23);
    }

    #[test]
    fn keeps_input_order() {
        let data = json!({
            "resultType": "vector",
            "result": [
                {"metric": {"instance": "node-2"}, "value": [1, "2"]},
                {"value": [1, "3"]},
                {"metric": {"instance": "node-1"}, "value": [1, "1"]},
            ]
        });

        let values: Vec<f64> = normalize(&data).into_iter().map(|s| s.value).collect();
        assert_eq!(values, [2.0, 3.0, 1.0]);
    }

    #[test]
    fn structural_garbage() {
        let data = json!({
            "result": [
                {"metric": {"instance": "a"}},
                {"metric": {"instance": "b"}, "value": "7"},
                {"metric": {"instance": 3}, "value": [0, "1"]},
                {"metric": {"instance": "c"}, "value": [0, null]},
                "not an object",
                {"metric": {"instance": "d"}, "value": [0, 4.5]},
            ]
        });

        let samples = normalize(&data);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels["instance"], "d");
        assert_eq!(samples[0].value, 4.5);
    }

    #[test]
    fn special_float_values() {
        let data = json!({
            "result": [
                {"metric": {}, "value": [0, "NaN"]},
                {"metric": {}, "value": [0, "+Inf"]},
                {"metric": {}, "value": [0, "-Inf"]},
            ]
        });

        let samples = normalize(&data);
        assert_eq!(samples.len(), 3);
        assert!(samples[0].value.is_nan());
        assert_eq!(samples[1].value, f64::INFINITY);
        assert_eq!(samples[2].value, f64::NEG_INFINITY);
    }

    #[test]
    fn missing_result() {
        assert!(normalize(&Value::Null).is_empty());
        assert!(normalize(&json!({})).is_empty());
        assert!(normalize(&json!({"result": {"oops": 1}})).is_empty());
    }

    #[test]
    fn query_url_keeps_base_path() {
        let c = PrometheusClient::new("http://localhost:9090").unwrap();
        assert_eq!(c.query_url().as_str(), "http://localhost:9090/api/v1/query");

        let c = PrometheusClient::new("https://example.com/prometheus/").unwrap();
        assert_eq!(
            c.query_url().as_str(),
            "https://example.com/prometheus/api/v1/query"
        );

        let c = PrometheusClient::new("https://example.com/prometheus").unwrap();
        assert_eq!(
            c.query_url().as_str(),
            "https://example.com/prometheus/api/v1/query"
        );

        assert!(matches!(
            PrometheusClient::new("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn client_build_failure_is_not_a_connection_error() {
        let builder_err = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err();
        assert!(builder_err.is_builder());

        let err = ClientError::ClientBuild(builder_err);
        assert!(!matches!(err, ClientError::Connection(_)));
        assert!(err.to_string().starts_with("Could not build HTTP client"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn session_lifecycle() {
        let mut c = PrometheusClient::new("http://localhost:9090").unwrap();
        assert!(!c.is_bound());

        let session = c.session().unwrap();
        assert!(session.is_bound());
        session.close();
        assert!(!c.is_bound());

        // a leaked guard leaves the client bound; acquiring again is refused
        std::mem::forget(c.session().unwrap());
        assert!(c.is_bound());
        assert!(matches!(c.session(), Err(ClientError::AlreadyBound)));
    }
}
