//! Neighbor probes over HTTP: `GET http://{host}:{base_port + i}/pendulum`.

use async_trait::async_trait;
use pendulum_env::{EnvError, InstanceId, NeighborReading, NeighborSource};
use std::time::Duration;

/// Reads neighbor positions from their HTTP surface.
pub struct HttpNeighbors {
    client: reqwest::Client,
    host: String,
    base_port: u16,
    timeout: Duration,
}

impl HttpNeighbors {
    /// Neighbor `i` is expected at `host:(base_port + i)`.
    pub fn new(host: impl Into<String>, base_port: u16, timeout: Duration) -> Result<Self, EnvError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnvError::network(e.to_string()))?;
        Ok(Self {
            client,
            host: host.into(),
            base_port,
            timeout,
        })
    }

    pub fn url_for(&self, instance: InstanceId) -> String {
        let port = u32::from(self.base_port) + instance.get();
        format!("http://{}:{}/pendulum", self.host, port)
    }

    fn map_error(&self, instance: InstanceId, err: reqwest::Error) -> EnvError {
        if err.is_timeout() {
            EnvError::Timeout(self.timeout.as_millis() as u64)
        } else if err.is_connect() {
            EnvError::unreachable(instance)
        } else if err.is_decode() {
            EnvError::SerializationError(err.to_string())
        } else {
            EnvError::network(err.to_string())
        }
    }
}

#[async_trait]
impl NeighborSource for HttpNeighbors {
    async fn fetch(&self, instance: InstanceId) -> Result<NeighborReading, EnvError> {
        let response = self
            .client
            .get(self.url_for(instance))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.map_error(instance, e))?;

        response
            .json::<NeighborReading>()
            .await
            .map_err(|e| self.map_error(instance, e))
    }
}
