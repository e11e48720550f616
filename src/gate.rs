//! Entry point for delayed messages.
//!
//! Turns an outgoing message with a delay request into a cascade publish:
//! validate the delay, encode the routing key, stamp diagnostic headers and
//! hand the message to the dispatcher for the starting level's exchange.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::broker::{BrokerError, Dispatcher, FieldValue, Message, MessageProperties};
use crate::delay::{encode, DelayError, DelayRequest};
use crate::topology::TopologyGeneration;

/// Requested delay in whole seconds, for diagnostics.
pub const DELAY_HEADER: &str = "delay-cascade.delay-in-seconds";

/// When the message entered the cascade, RFC 3339 UTC.
pub const TIME_SENT_HEADER: &str = "delay-cascade.time-sent";

/// Errors from the entry gate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Delay(#[from] DelayError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// A message on its way out, with a delay attached.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Address of the receiving endpoint; closes the routing key.
    pub destination: String,
    pub delay: DelayRequest,
    pub properties: MessageProperties,
    /// Forwarded untouched.
    pub body: Bytes,
}

/// Where a message was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub exchange: String,
    pub routing_key: String,
    pub delay_seconds: i64,
}

/// Publishes delayed messages into one generation of the cascade.
pub struct DelayEntryGate {
    generation: TopologyGeneration,
    dispatcher: Arc<dyn Dispatcher>,
}

impl DelayEntryGate {
    pub fn new(generation: TopologyGeneration, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            generation,
            dispatcher,
        }
    }

    /// Send a delayed message.
    ///
    /// A delay beyond the cascade's range fails before anything is published.
    #[tracing::instrument(name = "gate.send", skip_all, fields(destination = %message.destination))]
    pub async fn send(
        &self,
        message: OutgoingMessage,
        now: DateTime<Utc>,
    ) -> Result<Dispatched, GateError> {
        let delay_seconds = message.delay.delay_seconds(now)?;
        let (routing_key, level) = encode(delay_seconds, &message.destination);
        let exchange = self.generation.level_name(level);

        let mut properties = message.properties;
        properties
            .headers
            .insert(DELAY_HEADER.to_string(), FieldValue::Int(delay_seconds));
        properties.headers.insert(
            TIME_SENT_HEADER.to_string(),
            FieldValue::Text(now.to_rfc3339()),
        );
        if properties.timestamp.is_none() {
            properties.timestamp = u64::try_from(now.timestamp()).ok();
        }

        self.dispatcher
            .publish(
                &exchange,
                Message {
                    routing_key: routing_key.clone(),
                    properties,
                    body: message.body,
                },
            )
            .await?;

        debug!(exchange = %exchange, delay_seconds, level, "Dispatched delayed message");

        Ok(Dispatched {
            exchange,
            routing_key,
            delay_seconds,
        })
    }
}
