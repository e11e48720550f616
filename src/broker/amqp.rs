//! AMQP (RabbitMQ) broker implementation.
//!
//! One channel in publisher-confirm mode is shared by all operations and is
//! reopened from the connection pool when the broker closes it. RabbitMQ
//! closes a channel on any refused declare or publish, so a later call never
//! inherits that failure.
//!
//! Delivery tags belong to the channel that fetched them. When that channel
//! closes, the broker requeues every unsettled message, so tags fetched on it
//! are forgotten rather than replayed on the new channel.

use std::collections::HashSet;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
        QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::{
        AMQPValue, ByteArray, DecimalValue, FieldArray, FieldTable as AmqpFieldTable, LongString,
        ShortString,
    },
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    BrokerAdmin, BrokerError, Dispatcher, Fetched, FieldTable, FieldValue, Message,
    MessageProperties, MessageSource, QueueSpec, Result,
};

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// The shared channel and the delivery tags fetched on it and not yet settled.
#[derive(Default)]
struct ChannelSlot {
    channel: Option<Channel>,
    unsettled: HashSet<u64>,
}

/// RabbitMQ broker speaking AMQP 0-9-1 through lapin.
pub struct AmqpBroker {
    pool: Pool,
    slot: Mutex<ChannelSlot>,
}

impl AmqpBroker {
    /// Connect to the broker and open the first channel.
    ///
    /// Makes a single attempt; binaries wrap this in
    /// [`connect_with_retry`](crate::utils::bootstrap::connect_with_retry).
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self> {
        let manager = Manager::new(url.to_string(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(pool_size.max(1))
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {}", e)))?;

        let broker = Self {
            pool,
            slot: Mutex::new(ChannelSlot::default()),
        };

        // Verify connection
        broker.channel().await?;

        info!(url = %redact(url), "Connected to AMQP");
        Ok(broker)
    }

    /// Current channel, opening a fresh confirm-mode channel if the last one
    /// was closed.
    async fn channel(&self) -> Result<Channel> {
        let mut slot = self.slot.lock().await;
        if let Some(channel) = slot.channel.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            if !slot.unsettled.is_empty() {
                warn!(
                    requeued = slot.unsettled.len(),
                    "AMQP channel closed with unsettled messages; broker requeued them"
                );
            }
            debug!("AMQP channel closed, reopening");
        }
        slot.channel = None;
        slot.unsettled.clear();

        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BrokerError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to enable confirms: {}", e)))?;

        slot.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Channel on which `delivery_tag` can still be settled.
    ///
    /// `None` when the tag was fetched on a channel that has since closed.
    async fn settling_channel(&self, delivery_tag: u64) -> Result<Option<Channel>> {
        let channel = self.channel().await?;
        let mut slot = self.slot.lock().await;
        Ok(slot.unsettled.remove(&delivery_tag).then_some(channel))
    }
}

/// Strip credentials from a broker URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

// ============================================================================
// Conversions
// ============================================================================

fn to_amqp_value(value: &FieldValue) -> AMQPValue {
    match value {
        FieldValue::Bool(v) => AMQPValue::Boolean(*v),
        FieldValue::ShortShortInt(v) => AMQPValue::ShortShortInt(*v),
        FieldValue::ShortShortUInt(v) => AMQPValue::ShortShortUInt(*v),
        FieldValue::ShortInt(v) => AMQPValue::ShortInt(*v),
        FieldValue::ShortUInt(v) => AMQPValue::ShortUInt(*v),
        FieldValue::LongInt(v) => AMQPValue::LongInt(*v),
        FieldValue::LongUInt(v) => AMQPValue::LongUInt(*v),
        FieldValue::Int(v) => AMQPValue::LongLongInt(*v),
        FieldValue::Float(v) => AMQPValue::Float(*v),
        FieldValue::Double(v) => AMQPValue::Double(*v),
        FieldValue::Decimal { scale, value } => AMQPValue::DecimalValue(DecimalValue {
            scale: *scale,
            value: *value,
        }),
        FieldValue::ShortText(s) => AMQPValue::ShortString(ShortString::from(s.as_str())),
        FieldValue::Text(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        FieldValue::RawText(bytes) => AMQPValue::LongString(LongString::from(bytes.clone())),
        FieldValue::ByteArray(bytes) => AMQPValue::ByteArray(ByteArray::from(bytes.clone())),
        FieldValue::Timestamp(v) => AMQPValue::Timestamp(*v),
        FieldValue::Array(values) => {
            let values: Vec<AMQPValue> = values.iter().map(to_amqp_value).collect();
            AMQPValue::FieldArray(FieldArray::from(values))
        }
        FieldValue::Table(table) => AMQPValue::FieldTable(to_amqp_table(table)),
        FieldValue::Void => AMQPValue::Void,
    }
}

fn from_amqp_value(value: &AMQPValue) -> FieldValue {
    match value {
        AMQPValue::Boolean(v) => FieldValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => FieldValue::ShortShortInt(*v),
        AMQPValue::ShortShortUInt(v) => FieldValue::ShortShortUInt(*v),
        AMQPValue::ShortInt(v) => FieldValue::ShortInt(*v),
        AMQPValue::ShortUInt(v) => FieldValue::ShortUInt(*v),
        AMQPValue::LongInt(v) => FieldValue::LongInt(*v),
        AMQPValue::LongUInt(v) => FieldValue::LongUInt(*v),
        AMQPValue::LongLongInt(v) => FieldValue::Int(*v),
        AMQPValue::Float(v) => FieldValue::Float(*v),
        AMQPValue::Double(v) => FieldValue::Double(*v),
        AMQPValue::DecimalValue(d) => FieldValue::Decimal {
            scale: d.scale,
            value: d.value,
        },
        AMQPValue::ShortString(s) => FieldValue::ShortText(s.as_str().to_string()),
        AMQPValue::LongString(s) => match std::str::from_utf8(s.as_bytes()) {
            Ok(text) => FieldValue::Text(text.to_string()),
            Err(_) => FieldValue::RawText(s.as_bytes().to_vec()),
        },
        AMQPValue::FieldArray(values) => {
            FieldValue::Array(values.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::Timestamp(v) => FieldValue::Timestamp(*v),
        AMQPValue::FieldTable(table) => FieldValue::Table(from_amqp_table(table)),
        AMQPValue::ByteArray(bytes) => FieldValue::ByteArray(bytes.as_slice().to_vec()),
        AMQPValue::Void => FieldValue::Void,
    }
}

fn to_amqp_table(table: &FieldTable) -> AmqpFieldTable {
    let mut out = AmqpFieldTable::default();
    for (name, value) in table {
        out.insert(ShortString::from(name.as_str()), to_amqp_value(value));
    }
    out
}

fn from_amqp_table(table: &AmqpFieldTable) -> FieldTable {
    table
        .inner()
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn short(value: &Option<String>) -> Option<ShortString> {
    value.as_deref().map(ShortString::from)
}

fn text(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

fn to_amqp_properties(properties: &MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default().with_delivery_mode(DELIVERY_MODE_PERSISTENT);
    if !properties.headers.is_empty() {
        out = out.with_headers(to_amqp_table(&properties.headers));
    }
    if let Some(v) = short(&properties.content_type) {
        out = out.with_content_type(v);
    }
    if let Some(v) = short(&properties.content_encoding) {
        out = out.with_content_encoding(v);
    }
    if let Some(v) = properties.priority {
        out = out.with_priority(v);
    }
    if let Some(v) = short(&properties.correlation_id) {
        out = out.with_correlation_id(v);
    }
    if let Some(v) = short(&properties.reply_to) {
        out = out.with_reply_to(v);
    }
    if let Some(v) = short(&properties.expiration) {
        out = out.with_expiration(v);
    }
    if let Some(v) = short(&properties.message_id) {
        out = out.with_message_id(v);
    }
    if let Some(v) = properties.timestamp {
        out = out.with_timestamp(v);
    }
    if let Some(v) = short(&properties.kind) {
        out = out.with_kind(v);
    }
    if let Some(v) = short(&properties.user_id) {
        out = out.with_user_id(v);
    }
    if let Some(v) = short(&properties.app_id) {
        out = out.with_app_id(v);
    }
    if let Some(v) = short(&properties.cluster_id) {
        out = out.with_cluster_id(v);
    }
    out
}

fn from_amqp_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        headers: properties
            .headers()
            .as_ref()
            .map(from_amqp_table)
            .unwrap_or_default(),
        content_type: text(properties.content_type()),
        content_encoding: text(properties.content_encoding()),
        priority: *properties.priority(),
        correlation_id: text(properties.correlation_id()),
        reply_to: text(properties.reply_to()),
        expiration: text(properties.expiration()),
        message_id: text(properties.message_id()),
        timestamp: *properties.timestamp(),
        kind: text(properties.kind()),
        user_id: text(properties.user_id()),
        app_id: text(properties.app_id()),
        cluster_id: text(properties.cluster_id()),
    }
}

// ============================================================================
// Trait implementations
// ============================================================================

#[async_trait]
impl BrokerAdmin for AmqpBroker {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                AmqpFieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(exchange = %name, error = %e, "Failed to declare exchange");
                BrokerError::DeclareExchange {
                    name: name.to_string(),
                    message: e.to_string(),
                }
            })?;
        debug!(exchange = %name, "Declared exchange");
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|e| BrokerError::DeleteExchange {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        debug!(exchange = %name, "Deleted exchange");
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                to_amqp_table(&queue.arguments),
            )
            .await
            .map_err(|e| {
                error!(queue = %queue.name, error = %e, "Failed to declare queue");
                BrokerError::DeclareQueue {
                    name: queue.name.clone(),
                    message: e.to_string(),
                }
            })?;
        debug!(queue = %queue.name, "Declared queue");
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|e| BrokerError::DeleteQueue {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        debug!(queue = %name, "Deleted queue");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                AmqpFieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Bind {
                exchange: exchange.to_string(),
                destination: queue.to_string(),
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
        debug!(queue = %queue, exchange = %exchange, pattern = %pattern, "Bound queue");
        Ok(())
    }

    async fn bind_exchange(&self, destination: &str, source: &str, pattern: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .exchange_bind(
                destination,
                source,
                pattern,
                ExchangeBindOptions::default(),
                AmqpFieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Bind {
                exchange: source.to_string(),
                destination: destination.to_string(),
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
        debug!(destination = %destination, source = %source, pattern = %pattern, "Bound exchange");
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for AmqpBroker {
    #[tracing::instrument(name = "broker.publish", skip_all, fields(exchange = %exchange))]
    async fn publish(&self, exchange: &str, message: Message) -> Result<()> {
        let publish_error = |message: String| BrokerError::Publish {
            exchange: exchange.to_string(),
            message,
        };

        let channel = self.channel().await?;
        let confirmation = channel
            .basic_publish(
                exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &message.body,
                to_amqp_properties(&message.properties),
            )
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => {
                debug!(routing_key = %message.routing_key, "Published message");
                Ok(())
            }
            // Mandatory publish came back: no binding matched.
            Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => {
                error!(routing_key = %message.routing_key, "Message reached no queue");
                Err(BrokerError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: message.routing_key.clone(),
                })
            }
            Confirmation::Nack(None) => {
                error!(routing_key = %message.routing_key, "Broker refused message");
                Err(publish_error("broker nacked the message".to_string()))
            }
        }
    }
}

#[async_trait]
impl MessageSource for AmqpBroker {
    async fn fetch(&self, queue: &str) -> Result<Option<Fetched>> {
        let channel = self.channel().await?;
        let got = channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| BrokerError::Fetch {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        let Some(got) = got else {
            return Ok(None);
        };
        let delivery = got.delivery;
        self.slot
            .lock()
            .await
            .unsettled
            .insert(delivery.delivery_tag);

        Ok(Some(Fetched {
            delivery_tag: delivery.delivery_tag,
            message: Message {
                routing_key: delivery.routing_key.as_str().to_string(),
                properties: from_amqp_properties(&delivery.properties),
                body: delivery.data.into(),
            },
        }))
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<()> {
        let Some(channel) = self.settling_channel(delivery_tag).await? else {
            return Err(BrokerError::Settle {
                tag: delivery_tag,
                message: "channel closed before acknowledgement; message was requeued"
                    .to_string(),
            });
        };
        channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Settle {
                tag: delivery_tag,
                message: e.to_string(),
            })
    }

    async fn release(&self, delivery_tag: u64) -> Result<()> {
        let Some(channel) = self.settling_channel(delivery_tag).await? else {
            debug!(delivery_tag, "Delivery already requeued by channel close");
            return Ok(());
        };
        channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|e| BrokerError::Settle {
                tag: delivery_tag,
                message: e.to_string(),
            })
    }
}
