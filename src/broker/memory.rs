//! In-memory broker for testing and dry runs.
//!
//! Models just enough of an AMQP 0-9-1 broker for the cascade: durable topic
//! exchanges, exchange-to-exchange and queue bindings with `*`/`#` matching,
//! queue arguments with precondition checks on redeclare, and dead-lettering
//! driven explicitly through [`InMemoryBroker::expire_queue`] instead of a
//! clock.
//!
//! Publishing behaves like a mandatory, confirmed publish: a message that
//! reaches no queue is refused. Publishing to a missing exchange closes the
//! simulated channel, which requeues every unsettled message.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    BrokerAdmin, BrokerError, Dispatcher, Fetched, FieldTable, Message, MessageSource, QueueSpec,
    Result,
};
use crate::topology::{ARG_DEAD_LETTER_EXCHANGE, ARG_MESSAGE_TTL};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Destination {
    Queue(String),
    Exchange(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    source: String,
    destination: Destination,
    pattern: String,
}

#[derive(Debug, Default)]
struct QueueState {
    arguments: FieldTable,
    messages: VecDeque<Message>,
}

#[derive(Debug, Default)]
struct State {
    exchanges: BTreeSet<String>,
    queues: BTreeMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, (String, Message)>,
    /// Tags whose messages went back to their queue when the channel closed.
    requeued: BTreeSet<u64>,
    next_tag: u64,
    fail_on: Option<String>,
}

/// In-memory broker for testing.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation naming `object` fail.
    pub async fn fail_on(&self, object: impl Into<String>) {
        self.state.lock().await.fail_on = Some(object.into());
    }

    pub async fn clear_failure(&self) {
        self.state.lock().await.fail_on = None;
    }

    pub async fn exchange_names(&self) -> Vec<String> {
        self.state.lock().await.exchanges.iter().cloned().collect()
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.state.lock().await.queues.keys().cloned().collect()
    }

    pub async fn binding_count(&self) -> usize {
        self.state.lock().await.bindings.len()
    }

    /// Patterns binding `destination` (queue or exchange) to `source`.
    pub async fn binding_patterns(&self, source: &str, destination: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .bindings
            .iter()
            .filter(|b| b.source == source)
            .filter(|b| match &b.destination {
                Destination::Queue(name) | Destination::Exchange(name) => name == destination,
            })
            .map(|b| b.pattern.clone())
            .collect()
    }

    pub async fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.arguments.clone())
    }

    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub async fn queued_messages(&self, queue: &str) -> Vec<Message> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Simulate the broker closing the channel: every unsettled message goes
    /// back to the head of its queue in delivery order.
    pub async fn close_channel(&self) {
        self.state.lock().await.close_channel();
    }

    /// Put a message straight into a queue, bypassing routing.
    pub async fn enqueue(&self, queue: &str, message: Message) -> Result<()> {
        let mut state = self.state.lock().await;
        let q = state.queues.get_mut(queue).ok_or_else(|| BrokerError::Publish {
            exchange: String::new(),
            message: format!("NOT_FOUND - no queue '{}'", queue),
        })?;
        q.messages.push_back(message);
        Ok(())
    }

    /// Let every message in `queue` reach its TTL.
    ///
    /// Messages are dead-lettered to the queue's dead-letter exchange with
    /// their routing key unchanged. Returns how many were moved.
    pub async fn expire_queue(&self, queue: &str) -> Result<usize> {
        let mut state = self.state.lock().await;

        let Some(q) = state.queues.get_mut(queue) else {
            return Ok(0);
        };
        let dead_letter_exchange = q
            .arguments
            .get(ARG_DEAD_LETTER_EXCHANGE)
            .and_then(|v| v.as_text())
            .map(str::to_string);
        let expired: Vec<Message> = q.messages.drain(..).collect();
        let count = expired.len();

        // Dead-lettering drops what it cannot route, as RabbitMQ does.
        if let Some(exchange) = dead_letter_exchange {
            for message in expired {
                state.route(&exchange, message);
            }
        }

        Ok(count)
    }

    /// TTL of a queue in milliseconds, from its declared arguments.
    pub async fn message_ttl(&self, queue: &str) -> Option<i64> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .and_then(|q| q.arguments.get(ARG_MESSAGE_TTL))
            .and_then(|v| v.as_int())
    }
}

impl State {
    fn check(&self, object: &str) -> std::result::Result<(), String> {
        match &self.fail_on {
            Some(name) if name == object => Err("ACCESS_REFUSED - simulated failure".to_string()),
            _ => Ok(()),
        }
    }

    /// Deliver to every matching queue. Returns how many received a copy.
    fn route(&mut self, exchange: &str, message: Message) -> usize {
        let mut queues = BTreeSet::new();
        let mut visited = BTreeSet::new();
        self.collect_queues(exchange, &message.routing_key, &mut visited, &mut queues);

        let mut delivered = 0;
        for queue in queues {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.messages.push_back(message.clone());
                delivered += 1;
            }
        }
        delivered
    }

    fn close_channel(&mut self) {
        let mut tags: Vec<u64> = self.unacked.keys().copied().collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some((queue, message)) = self.unacked.remove(&tag) {
                if let Some(q) = self.queues.get_mut(&queue) {
                    q.messages.push_front(message);
                }
                self.requeued.insert(tag);
            }
        }
    }

    fn collect_queues(
        &self,
        exchange: &str,
        routing_key: &str,
        visited: &mut BTreeSet<String>,
        queues: &mut BTreeSet<String>,
    ) {
        if !visited.insert(exchange.to_string()) {
            return;
        }
        for binding in self.bindings.iter().filter(|b| b.source == exchange) {
            if !topic_matches(&binding.pattern, routing_key) {
                continue;
            }
            match &binding.destination {
                Destination::Queue(name) => {
                    queues.insert(name.clone());
                }
                Destination::Exchange(name) => {
                    self.collect_queues(name, routing_key, visited, queues);
                }
            }
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => {
                (word == "*" || word == first) && match_words(rest, key_rest)
            }
            None => false,
        },
    }
}

#[async_trait]
impl BrokerAdmin for InMemoryBroker {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .check(name)
            .map_err(|message| BrokerError::DeclareExchange {
                name: name.to_string(),
                message,
            })?;
        state.exchanges.insert(name.to_string());
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .check(name)
            .map_err(|message| BrokerError::DeleteExchange {
                name: name.to_string(),
                message,
            })?;
        state.exchanges.remove(name);
        state.bindings.retain(|b| {
            b.source != name && b.destination != Destination::Exchange(name.to_string())
        });
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .check(&queue.name)
            .map_err(|message| BrokerError::DeclareQueue {
                name: queue.name.clone(),
                message,
            })?;

        match state.queues.get(&queue.name) {
            Some(existing) if existing.arguments != queue.arguments => {
                Err(BrokerError::DeclareQueue {
                    name: queue.name.clone(),
                    message: "PRECONDITION_FAILED - inequivalent arguments".to_string(),
                })
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    QueueState {
                        arguments: queue.arguments.clone(),
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .check(name)
            .map_err(|message| BrokerError::DeleteQueue {
                name: name.to_string(),
                message,
            })?;
        state.queues.remove(name);
        state
            .bindings
            .retain(|b| b.destination != Destination::Queue(name.to_string()));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let bind_error = |message: String| BrokerError::Bind {
            exchange: exchange.to_string(),
            destination: queue.to_string(),
            pattern: pattern.to_string(),
            message,
        };

        state.check(queue).map_err(bind_error)?;
        if !state.exchanges.contains(exchange) {
            return Err(bind_error(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(bind_error(format!("NOT_FOUND - no queue '{}'", queue)));
        }

        let binding = Binding {
            source: exchange.to_string(),
            destination: Destination::Queue(queue.to_string()),
            pattern: pattern.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn bind_exchange(&self, destination: &str, source: &str, pattern: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let bind_error = |message: String| BrokerError::Bind {
            exchange: source.to_string(),
            destination: destination.to_string(),
            pattern: pattern.to_string(),
            message,
        };

        state.check(destination).map_err(bind_error)?;
        for name in [source, destination] {
            if !state.exchanges.contains(name) {
                return Err(bind_error(format!("NOT_FOUND - no exchange '{}'", name)));
            }
        }

        let binding = Binding {
            source: source.to_string(),
            destination: Destination::Exchange(destination.to_string()),
            pattern: pattern.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for InMemoryBroker {
    async fn publish(&self, exchange: &str, message: Message) -> Result<()> {
        let mut state = self.state.lock().await;
        let publish_error = |message: String| BrokerError::Publish {
            exchange: exchange.to_string(),
            message,
        };

        state.check(exchange).map_err(publish_error)?;
        if !state.exchanges.contains(exchange) {
            state.close_channel();
            return Err(publish_error(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }

        let routing_key = message.routing_key.clone();
        if state.route(exchange, message) == 0 {
            return Err(BrokerError::Unroutable {
                exchange: exchange.to_string(),
                routing_key,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSource for InMemoryBroker {
    async fn fetch(&self, queue: &str) -> Result<Option<Fetched>> {
        let mut state = self.state.lock().await;
        state.check(queue).map_err(|message| BrokerError::Fetch {
            queue: queue.to_string(),
            message,
        })?;

        let Some(message) = state.queues.get_mut(queue).and_then(|q| q.messages.pop_front())
        else {
            return Ok(None);
        };

        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        state
            .unacked
            .insert(delivery_tag, (queue.to_string(), message.clone()));

        Ok(Some(Fetched {
            delivery_tag,
            message,
        }))
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.unacked.remove(&delivery_tag).is_some() {
            return Ok(());
        }
        let message = if state.requeued.contains(&delivery_tag) {
            "channel closed before acknowledgement; message was requeued"
        } else {
            "unknown delivery tag"
        };
        Err(BrokerError::Settle {
            tag: delivery_tag,
            message: message.to_string(),
        })
    }

    async fn release(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.requeued.remove(&delivery_tag) {
            return Ok(());
        }
        let (queue, message) =
            state
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| BrokerError::Settle {
                    tag: delivery_tag,
                    message: "unknown delivery tag".to_string(),
                })?;
        if let Some(q) = state.queues.get_mut(&queue) {
            q.messages.push_front(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageProperties;
    use bytes::Bytes;

    fn message(routing_key: &str) -> Message {
        Message {
            routing_key: routing_key.to_string(),
            properties: MessageProperties::default(),
            body: Bytes::from_static(b"payload"),
        }
    }

    fn queue(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_string(),
            arguments: FieldTable::new(),
        }
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("1.#", "1.0.orders"));
        assert!(topic_matches("*.1.#", "0.1.orders"));
        assert!(!topic_matches("*.1.#", "1.0.orders"));
        assert!(topic_matches("#.orders", "0.0.orders"));
        assert!(topic_matches("#.orders", "orders"));
        assert!(!topic_matches("#.orders", "0.0.orders.audit"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("0.#", "0"));
    }

    #[tokio::test]
    async fn test_exchange_to_exchange_routing() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("a").await.unwrap();
        broker.declare_exchange("b").await.unwrap();
        broker.declare_queue(&queue("q")).await.unwrap();
        broker.bind_exchange("b", "a", "x.#").await.unwrap();
        broker.bind_queue("q", "b", "#").await.unwrap();

        broker.publish("a", message("x.y")).await.unwrap();
        assert_eq!(broker.queue_depth("q").await, 1);
    }

    #[tokio::test]
    async fn test_unroutable_publish_is_refused() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("a").await.unwrap();
        broker.declare_queue(&queue("q")).await.unwrap();
        broker.bind_queue("q", "a", "x.#").await.unwrap();

        let err = broker.publish("a", message("z.y")).await.unwrap_err();

        assert_eq!(
            err,
            BrokerError::Unroutable {
                exchange: "a".to_string(),
                routing_key: "z.y".to_string(),
            }
        );
        assert_eq!(broker.queue_depth("q").await, 0);
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_requeues_unsettled() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&queue("q")).await.unwrap();
        for key in ["first", "second"] {
            broker.enqueue("q", message(key)).await.unwrap();
        }
        let first = broker.fetch("q").await.unwrap().unwrap();
        let second = broker.fetch("q").await.unwrap().unwrap();

        let err = broker.publish("missing", message("k")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Publish { .. }));

        assert_eq!(broker.unacked_count().await, 0);
        let keys: Vec<String> = broker
            .queued_messages("q")
            .await
            .into_iter()
            .map(|m| m.routing_key)
            .collect();
        assert_eq!(keys, vec!["first", "second"]);

        // Tags from the closed channel: release is a no-op, ack is refused.
        broker.release(first.delivery_tag).await.unwrap();
        let err = broker.acknowledge(second.delivery_tag).await.unwrap_err();
        assert!(matches!(err, BrokerError::Settle { .. }));
        assert_eq!(broker.queue_depth("q").await, 2);
    }

    #[tokio::test]
    async fn test_redeclare_with_different_arguments_fails() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&queue("q")).await.unwrap();
        broker.declare_queue(&queue("q")).await.unwrap();

        let mut changed = queue("q");
        changed.arguments.insert(ARG_MESSAGE_TTL.to_string(), 1000.into());
        let err = broker.declare_queue(&changed).await.unwrap_err();
        assert!(matches!(err, BrokerError::DeclareQueue { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_objects_is_ok() {
        let broker = InMemoryBroker::new();
        broker.delete_exchange("missing").await.unwrap();
        broker.delete_queue("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_requires_both_ends() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("a").await.unwrap();
        let err = broker.bind_queue("q", "a", "#").await.unwrap_err();
        assert!(matches!(err, BrokerError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_fetch_release_acknowledge() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&queue("q")).await.unwrap();
        broker.enqueue("q", message("k")).await.unwrap();

        let fetched = broker.fetch("q").await.unwrap().unwrap();
        assert_eq!(broker.queue_depth("q").await, 0);
        assert_eq!(broker.unacked_count().await, 1);

        broker.release(fetched.delivery_tag).await.unwrap();
        assert_eq!(broker.queue_depth("q").await, 1);

        let fetched = broker.fetch("q").await.unwrap().unwrap();
        broker.acknowledge(fetched.delivery_tag).await.unwrap();
        assert_eq!(broker.queue_depth("q").await, 0);
        assert_eq!(broker.unacked_count().await, 0);
        assert!(broker.fetch("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_close_requeues_in_delivery_order() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&queue("q")).await.unwrap();
        for key in ["a", "b", "c"] {
            broker.enqueue("q", message(key)).await.unwrap();
        }
        broker.fetch("q").await.unwrap().unwrap();
        broker.fetch("q").await.unwrap().unwrap();

        broker.close_channel().await;

        assert_eq!(broker.unacked_count().await, 0);
        let again = broker.fetch("q").await.unwrap().unwrap();
        assert_eq!(again.message.routing_key, "a");
        assert_eq!(broker.queue_depth("q").await, 2);
    }

    #[tokio::test]
    async fn test_expire_dead_letters_with_same_key() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("dlx").await.unwrap();
        let mut parked = queue("parked");
        parked
            .arguments
            .insert(ARG_DEAD_LETTER_EXCHANGE.to_string(), "dlx".into());
        broker.declare_queue(&parked).await.unwrap();
        broker.declare_queue(&queue("out")).await.unwrap();
        broker.bind_queue("out", "dlx", "#").await.unwrap();

        broker.enqueue("parked", message("1.orders")).await.unwrap();
        assert_eq!(broker.expire_queue("parked").await.unwrap(), 1);

        let out = broker.queued_messages("out").await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].routing_key, "1.orders");
    }

    #[tokio::test]
    async fn test_simulated_failure() {
        let broker = InMemoryBroker::new();
        broker.fail_on("a").await;
        assert!(broker.declare_exchange("a").await.is_err());
        broker.clear_failure().await;
        assert!(broker.declare_exchange("a").await.is_ok());
    }
}
