use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use autorun_core::config::{ServiceConventions, TimeoutSettings};
use autorun_core::model::HealthSnapshot;
use autorun_core::{truncate_chars, HarnessError, HarnessResult};
use reqwest::blocking::Client as HttpClient;
use serde_json::{Map, Value};

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Blocking HTTP view of the candidate service. Every call carries an
/// explicit timeout; failures come back as a printable reason.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    client: HttpClient,
    base_url: String,
    health_url: String,
    chat_url: String,
    request_field: String,
    response_field: String,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl ServiceClient {
    pub fn new(service: &ServiceConventions, timeouts: &TimeoutSettings) -> HarnessResult<Self> {
        let client = HttpClient::builder()
            .connect_timeout(timeouts.port_probe().max(Duration::from_millis(100)))
            .build()
            .map_err(|err| HarnessError::Config(format!("http client: {}", err)))?;
        Ok(Self {
            client,
            base_url: service.base_url(),
            health_url: service.health_url(),
            chat_url: service.chat_url(),
            request_field: service.request_field.clone(),
            response_field: service.response_field.clone(),
            probe_timeout: timeouts.health_probe(),
            request_timeout: timeouts.request(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    pub fn probe_health(&self) -> Result<HealthSnapshot, String> {
        let response = self
            .client
            .get(&self.health_url)
            .header("Accept", "application/json")
            .timeout(self.probe_timeout)
            .send()
            .map_err(|err| format!("GET {} transport error: {}", self.health_url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!(
                "GET {} failed: status={} body={}",
                self.health_url,
                status.as_u16(),
                body_excerpt(response)
            ));
        }
        let value: Value = response
            .json()
            .map_err(|err| format!("GET {} returned invalid JSON: {}", self.health_url, err))?;
        HealthSnapshot::from_value(value).ok_or_else(|| {
            format!(
                "GET {} response lacks service/session_id fields",
                self.health_url
            )
        })
    }

    /// One turn: POST the input, return the service's reply text.
    pub fn send_turn(&self, input: &str) -> Result<String, String> {
        let mut payload = Map::new();
        payload.insert(self.request_field.clone(), Value::String(input.to_string()));
        let response = self
            .client
            .post(&self.chat_url)
            .header("Accept", "application/json")
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    format!(
                        "POST {} timed out after {}ms",
                        self.chat_url,
                        self.request_timeout.as_millis()
                    )
                } else {
                    format!("POST {} transport error: {}", self.chat_url, err)
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!(
                "POST {} failed: status={} body={}",
                self.chat_url,
                status.as_u16(),
                body_excerpt(response)
            ));
        }
        let value: Value = response
            .json()
            .map_err(|err| format!("POST {} returned invalid JSON: {}", self.chat_url, err))?;
        match value.get(&self.response_field) {
            Some(Value::String(text)) => Ok(text.clone()),
            Some(other) => Err(format!(
                "malformed response: '{}' is not a string ({})",
                self.response_field, other
            )),
            None => Err(format!(
                "malformed response: missing '{}' in {}",
                self.response_field,
                truncate_chars(&value.to_string(), MAX_ERROR_BODY_CHARS)
            )),
        }
    }
}

fn body_excerpt(response: reqwest::blocking::Response) -> String {
    response
        .text()
        .map(|value| truncate_chars(&value, MAX_ERROR_BODY_CHARS))
        .unwrap_or_else(|_| "<response body unavailable>".to_string())
}

/// Whether anything accepts TCP connections at `host:port`.
pub fn port_is_open(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}
