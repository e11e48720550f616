//! The binary cascade of TTL queues on the broker.
//!
//! Every level `L` in `27..=0` gets a durable topic exchange and a durable
//! queue of the same name. The queue holds messages for `2^L` seconds and
//! dead-letters them into level `L-1` (level 0 dead-letters into the delivery
//! exchange). Two bindings per level split traffic on the level's bit token:
//!
//! ```text
//! exchange L --"*.*…1.#"--> queue L     (bit set: wait 2^L s)
//! exchange L --"*.*…0.#"--> exchange L-1 (bit clear: fall through)
//! ```
//!
//! Names come from a single function of `(level, prefix)` so that two
//! generations of the cascade can live side by side on one broker.

use tracing::{debug, info};

use crate::broker::{BrokerAdmin, FieldTable, QueueSpec, Result};
use crate::delay::MAX_LEVEL;

// ============================================================================
// Queue arguments
// ============================================================================

pub const ARG_MESSAGE_TTL: &str = "x-message-ttl";
pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const ARG_DEAD_LETTER_STRATEGY: &str = "x-dead-letter-strategy";
pub const ARG_QUEUE_TYPE: &str = "x-queue-type";
pub const ARG_QUEUE_MODE: &str = "x-queue-mode";
pub const ARG_OVERFLOW: &str = "x-overflow";

// ============================================================================
// Naming
// ============================================================================

/// Exchange and queue name for a level.
pub fn level_name(level: u8, prefix: &str) -> String {
    format!("{}delay-level-{:02}", prefix, level)
}

/// Name of the exchange released messages are delivered from.
pub fn delivery_exchange_name(prefix: &str) -> String {
    format!("{}delay-delivery", prefix)
}

/// Pattern binding a level's queue to its own exchange: this level's bit is 1.
pub fn queue_binding_key(level: u8) -> String {
    format!("{}1.#", "*.".repeat(usize::from(MAX_LEVEL - level)))
}

/// Pattern binding level `level - 1`'s exchange to level `level`'s: this
/// level's bit is 0. Level 0 uses it for the delivery exchange.
pub fn fall_through_binding_key(level: u8) -> String {
    format!("{}0.#", "*.".repeat(usize::from(MAX_LEVEL - level)))
}

/// Pattern binding an endpoint queue to the delivery exchange.
pub fn destination_binding_key(address: &str) -> String {
    format!("#.{}", address)
}

// ============================================================================
// Generations
// ============================================================================

/// Durability class of the level queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueKind {
    /// Classic queues, optionally in lazy mode.
    Classic { lazy: bool },
    /// Raft-replicated quorum queues with at-least-once dead-lettering.
    #[default]
    Quorum,
}

/// One version of the cascade: a naming prefix and a set of queue arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologyGeneration {
    pub name_prefix: String,
    pub queue_kind: QueueKind,
}

impl TopologyGeneration {
    pub fn new(name_prefix: impl Into<String>, queue_kind: QueueKind) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            queue_kind,
        }
    }

    pub fn level_name(&self, level: u8) -> String {
        level_name(level, &self.name_prefix)
    }

    pub fn delivery_exchange(&self) -> String {
        delivery_exchange_name(&self.name_prefix)
    }

    /// Where a level's queue dead-letters to.
    pub fn dead_letter_target(&self, level: u8) -> String {
        match level {
            0 => self.delivery_exchange(),
            _ => self.level_name(level - 1),
        }
    }

    /// Queue declaration for a level.
    pub fn level_queue(&self, level: u8) -> QueueSpec {
        let mut arguments = FieldTable::new();
        arguments.insert(ARG_MESSAGE_TTL.to_string(), level_ttl_millis(level).into());
        arguments.insert(
            ARG_DEAD_LETTER_EXCHANGE.to_string(),
            self.dead_letter_target(level).into(),
        );

        match self.queue_kind {
            QueueKind::Classic { lazy: true } => {
                arguments.insert(ARG_QUEUE_MODE.to_string(), "lazy".into());
            }
            QueueKind::Classic { lazy: false } => {}
            QueueKind::Quorum => {
                arguments.insert(ARG_QUEUE_TYPE.to_string(), "quorum".into());
                arguments.insert(ARG_DEAD_LETTER_STRATEGY.to_string(), "at-least-once".into());
                arguments.insert(ARG_OVERFLOW.to_string(), "reject-publish".into());
            }
        }

        QueueSpec {
            name: self.level_name(level),
            arguments,
        }
    }
}

/// TTL of a level's queue: `2^level` seconds, in milliseconds.
pub fn level_ttl_millis(level: u8) -> i64 {
    (1i64 << level) * 1000
}

// ============================================================================
// Build / teardown
// ============================================================================

/// Creates and removes one generation of the cascade.
///
/// Runs strictly in order on one administrative connection: later levels
/// dead-letter into exchanges declared earlier. A failed build is left as is;
/// tear it down before retrying.
pub struct TopologyBuilder<'a> {
    admin: &'a dyn BrokerAdmin,
    generation: &'a TopologyGeneration,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(admin: &'a dyn BrokerAdmin, generation: &'a TopologyGeneration) -> Self {
        Self { admin, generation }
    }

    /// Declare every level, the fall-through bindings and the delivery exchange.
    #[tracing::instrument(
        name = "topology.build",
        skip_all,
        fields(prefix = %self.generation.name_prefix)
    )]
    pub async fn build(&self) -> Result<()> {
        for level in (0..=MAX_LEVEL).rev() {
            let name = self.generation.level_name(level);

            self.admin.declare_exchange(&name).await?;
            self.admin
                .declare_queue(&self.generation.level_queue(level))
                .await?;
            self.admin
                .bind_queue(&name, &name, &queue_binding_key(level))
                .await?;

            debug!(level, exchange = %name, "Declared cascade level");
        }

        for level in (1..=MAX_LEVEL).rev() {
            self.admin
                .bind_exchange(
                    &self.generation.level_name(level - 1),
                    &self.generation.level_name(level),
                    &fall_through_binding_key(level),
                )
                .await?;
        }

        let delivery = self.generation.delivery_exchange();
        self.admin.declare_exchange(&delivery).await?;
        self.admin
            .bind_exchange(
                &delivery,
                &self.generation.level_name(0),
                &fall_through_binding_key(0),
            )
            .await?;

        info!(delivery_exchange = %delivery, "Delay cascade built");
        Ok(())
    }

    /// Delete the delivery exchange and every level.
    ///
    /// Objects that are already gone are skipped, so this is safe to repeat.
    #[tracing::instrument(
        name = "topology.tear_down",
        skip_all,
        fields(prefix = %self.generation.name_prefix)
    )]
    pub async fn tear_down(&self) -> Result<()> {
        self.admin
            .delete_exchange(&self.generation.delivery_exchange())
            .await?;

        for level in (0..=MAX_LEVEL).rev() {
            let name = self.generation.level_name(level);
            self.admin.delete_queue(&name).await?;
            self.admin.delete_exchange(&name).await?;
            debug!(level, exchange = %name, "Deleted cascade level");
        }

        info!("Delay cascade torn down");
        Ok(())
    }

    /// Route released messages addressed to `address` into `queue`.
    pub async fn bind_destination(&self, queue: &str, address: &str) -> Result<()> {
        let delivery = self.generation.delivery_exchange();
        let pattern = destination_binding_key(address);
        self.admin.bind_queue(queue, &delivery, &pattern).await?;
        info!(queue = %queue, pattern = %pattern, "Bound destination to delivery exchange");
        Ok(())
    }
}
