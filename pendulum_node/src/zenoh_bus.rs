//! Safety channel over a zenoh session.
//!
//! Envelopes travel as JSON strings on a single key expression. Zenoh
//! delivers a publisher's own puts back to its subscriber on the same
//! session, which the quorum counter tolerates.

use async_trait::async_trait;
use pendulum_env::{BusEnvelope, EnvError, InstanceId, MessageBus};
use tracing::{debug, warn};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::Subscriber;
use zenoh::sample::Sample;
use zenoh::Session;

/// A `MessageBus` bound to one zenoh key expression.
pub struct ZenohBus {
    instance: InstanceId,
    topic: String,
    session: Session,
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
}

impl ZenohBus {
    /// Opens a session (optionally connecting to `broker`) and subscribes to `topic`.
    pub async fn connect(
        instance: InstanceId,
        topic: impl Into<String>,
        broker: Option<&str>,
    ) -> Result<Self, EnvError> {
        let topic = topic.into();
        let mut config = zenoh::Config::default();
        if let Some(endpoint) = broker {
            let endpoints = serde_json::to_string(&[endpoint])?;
            config
                .insert_json5("connect/endpoints", &endpoints)
                .map_err(|e| EnvError::network(format!("invalid broker endpoint {endpoint}: {e}")))?;
        }

        let session = zenoh::open(config)
            .await
            .map_err(|e| EnvError::network(format!("failed to open zenoh session: {e}")))?;
        let subscriber = session
            .declare_subscriber(topic.clone())
            .await
            .map_err(|e| EnvError::network(format!("failed to subscribe to {topic}: {e}")))?;

        debug!(%instance, %topic, "zenoh bus ready");
        Ok(Self {
            instance,
            topic,
            session,
            subscriber,
        })
    }
}

/// Decodes one sample payload; anything that isn't an envelope is skipped.
fn decode_payload(raw: &str) -> Option<BusEnvelope> {
    match BusEnvelope::decode(raw) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!(error = %err, payload = raw, "ignoring undecodable safety message");
            None
        }
    }
}

#[async_trait]
impl MessageBus for ZenohBus {
    async fn publish(&self, envelope: BusEnvelope) -> Result<(), EnvError> {
        let payload = envelope.encode()?;
        self.session
            .put(self.topic.as_str(), payload)
            .await
            .map_err(|e| EnvError::network(e.to_string()))
    }

    async fn recv(&self) -> Option<BusEnvelope> {
        loop {
            let sample = match self.subscriber.recv_async().await {
                Ok(sample) => sample,
                Err(err) => {
                    debug!(instance = %self.instance, error = %err, "zenoh subscriber closed");
                    return None;
                }
            };
            let raw = match sample.payload().try_to_string() {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(instance = %self.instance, error = %err, "non-UTF-8 safety payload");
                    continue;
                }
            };
            if let Some(envelope) = decode_payload(&raw) {
                return Some(envelope);
            }
        }
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_payload() {
        let envelope = decode_payload(r#"{"from":3,"body":"HALT triggered by instance 3"}"#).unwrap();
        assert_eq!(envelope.from, InstanceId(3));
        assert!(envelope.body.starts_with("HALT"));

        assert!(decode_payload("HALT").is_none());
        assert!(decode_payload(r#"{"body":"RESTART"}"#).is_none());
    }
}
