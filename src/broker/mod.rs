//! Broker seams used by the cascade.
//!
//! This module contains:
//! - `BrokerAdmin` trait: declare/delete/bind exchanges and queues
//! - `Dispatcher` trait: confirmed publish to an exchange
//! - `MessageSource` trait: pull messages one at a time for migration
//! - Broker-neutral message and argument types
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::InMemoryBroker;

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur talking to the broker.
///
/// Every variant names the operation and the object it was applied to, so a
/// refusal during provisioning can be traced to the exact level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Failed to declare exchange '{name}': {message}")]
    DeclareExchange { name: String, message: String },

    #[error("Failed to declare queue '{name}': {message}")]
    DeclareQueue { name: String, message: String },

    #[error("Failed to bind '{destination}' to '{exchange}' with '{pattern}': {message}")]
    Bind {
        exchange: String,
        destination: String,
        pattern: String,
        message: String,
    },

    #[error("Failed to delete exchange '{name}': {message}")]
    DeleteExchange { name: String, message: String },

    #[error("Failed to delete queue '{name}': {message}")]
    DeleteQueue { name: String, message: String },

    #[error("Publish to '{exchange}' failed: {message}")]
    Publish { exchange: String, message: String },

    /// The broker accepted the publish but no queue was bound to receive it.
    #[error("Message with routing key '{routing_key}' published to '{exchange}' reached no queue")]
    Unroutable { exchange: String, routing_key: String },

    #[error("Fetch from '{queue}' failed: {message}")]
    Fetch { queue: String, message: String },

    #[error("Settling delivery {tag} failed: {message}")]
    Settle { tag: u64, message: String },
}

// ============================================================================
// Broker-neutral types
// ============================================================================

/// Value of a queue argument or message header.
///
/// Covers every AMQP 0-9-1 field type, so headers survive a fetch and
/// republish unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    ShortShortInt(i8),
    ShortShortUInt(u8),
    ShortInt(i16),
    ShortUInt(u16),
    LongInt(i32),
    LongUInt(u32),
    /// 64-bit signed integer (long-long).
    Int(i64),
    Float(f32),
    Double(f64),
    Decimal { scale: u8, value: u32 },
    ShortText(String),
    /// Long string holding UTF-8 text.
    Text(String),
    /// Long string that is not valid UTF-8.
    RawText(Vec<u8>),
    ByteArray(Vec<u8>),
    Timestamp(u64),
    Array(Vec<FieldValue>),
    Table(FieldTable),
    Void,
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::ShortShortInt(v) => Some(i64::from(*v)),
            FieldValue::ShortShortUInt(v) => Some(i64::from(*v)),
            FieldValue::ShortInt(v) => Some(i64::from(*v)),
            FieldValue::ShortUInt(v) => Some(i64::from(*v)),
            FieldValue::LongInt(v) => Some(i64::from(*v)),
            FieldValue::LongUInt(v) => Some(i64::from(*v)),
            FieldValue::Int(v) => Some(*v),
            FieldValue::ShortText(s) | FieldValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::ShortText(s) | FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// Ordered name/value table, used for queue arguments and message headers.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// A durable queue to declare.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    pub arguments: FieldTable,
}

/// Basic properties carried across a republish.
///
/// Delivery mode is not listed: everything the cascade publishes is
/// persistent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub headers: FieldTable,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    /// The AMQP `type` property.
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

/// A message as published to, or fetched from, the broker.
///
/// The body is opaque to every part of the cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Bytes,
}

/// A message pulled from a queue that still has to be settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub delivery_tag: u64,
    pub message: Message,
}

// ============================================================================
// Traits
// ============================================================================

/// Administrative operations on the broker.
///
/// All exchanges are durable topic exchanges. Deleting an object that does
/// not exist is not an error.
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    async fn delete_exchange(&self, name: &str) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Bind `queue` to `exchange` with a topic pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Bind exchange `destination` to exchange `source` with a topic pattern.
    async fn bind_exchange(&self, destination: &str, source: &str, pattern: &str) -> Result<()>;
}

/// Confirmed publishing.
///
/// Returns only once the broker has taken responsibility for the message.
/// A message that would reach no queue is an error
/// ([`BrokerError::Unroutable`]), never a silent drop.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn publish(&self, exchange: &str, message: Message) -> Result<()>;
}

/// Pull-based access to queued messages.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Take the next message from `queue`, if any. It stays unacknowledged
    /// until settled.
    async fn fetch(&self, queue: &str) -> Result<Option<Fetched>>;

    /// Remove a fetched message for good.
    async fn acknowledge(&self, delivery_tag: u64) -> Result<()>;

    /// Return a fetched message to its queue.
    ///
    /// A message the broker already requeued (its channel was closed) counts
    /// as released.
    async fn release(&self, delivery_tag: u64) -> Result<()>;
}
