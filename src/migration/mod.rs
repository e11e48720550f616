//! Moving parked messages from one cascade generation to another.
//!
//! A message sitting in an old generation's level queue cannot be left there
//! when the cascade is rebuilt under new names or arguments. Migration takes
//! it out, works out how much of its delay is still owed, and publishes it
//! into the new generation so it is released at the same wall-clock instant.
//!
//! Each message walks a small state machine:
//!
//! ```text
//! NotStarted -> Decoded -> Replanned -> Republished -> OriginalRemoved
//! ```
//!
//! The original is only acknowledged after the new copy is confirmed, so a
//! crash between the two yields a duplicate, never a loss.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, Dispatcher, Fetched, Message, MessageSource};
use crate::delay::{self, decode, encode, DecodeError, DelayError, MAX_LEVEL};
use crate::gate::{DELAY_HEADER, TIME_SENT_HEADER};
use crate::topology::TopologyGeneration;

/// Errors raised while migrating a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("Corrupt or foreign message: {0}")]
    Decode(#[from] DecodeError),

    #[error("Message with routing key '{routing_key}' has no '{header}' header")]
    MissingHeader { header: String, routing_key: String },

    #[error("Header '{header}' has unusable value '{value}'")]
    InvalidHeader { header: String, value: String },

    #[error(transparent)]
    Delay(#[from] DelayError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Cannot advance migration from state {state}")]
    InvalidTransition { state: &'static str },

    #[error("Source and target generation share the name prefix '{prefix}'")]
    SameGeneration { prefix: String },
}

impl MigrationError {
    /// Whether the broker itself failed, as opposed to one message being
    /// unusable or unroutable. RabbitMQ closes the channel on such failures
    /// and requeues everything unsettled, so draining cannot continue.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            MigrationError::Broker(error) if !matches!(error, BrokerError::Unroutable { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

// ============================================================================
// Replanning
// ============================================================================

/// Where a message must re-enter the cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replan {
    pub destination: String,
    pub routing_key: String,
    pub starting_level: u8,
    pub remaining_seconds: i64,
}

/// Recompute a parked message's routing key for the time still owed.
///
/// Elapsed time is counted in whole seconds, rounded down, and a send time
/// in the future counts as no time elapsed. Both keep the release instant
/// from moving earlier.
pub fn replan(
    original_delay_seconds: i64,
    original_sent_at: DateTime<Utc>,
    original_routing_key: &str,
    now: DateTime<Utc>,
) -> Result<Replan> {
    let decoded = decode(original_routing_key)?;

    let elapsed = (now - original_sent_at).num_seconds().max(0);
    let remaining_seconds = original_delay_seconds.saturating_sub(elapsed).max(0);
    delay::validate(remaining_seconds)?;

    let (routing_key, starting_level) = encode(remaining_seconds, &decoded.address);

    Ok(Replan {
        destination: decoded.address,
        routing_key,
        starting_level,
        remaining_seconds,
    })
}

/// Original delay and send time of a parked message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalSchedule {
    pub delay_seconds: i64,
    pub sent_at: DateTime<Utc>,
}

impl OriginalSchedule {
    /// Read the schedule from a message.
    ///
    /// The delay comes from the delay header, or from the routing key's bits
    /// when the header is absent. The send time comes from the time-sent
    /// header, or from the AMQP timestamp property.
    pub fn from_message(message: &Message) -> Result<Self> {
        let headers = &message.properties.headers;

        let delay_seconds = match headers.get(DELAY_HEADER) {
            Some(value) => value.as_int().ok_or_else(|| MigrationError::InvalidHeader {
                header: DELAY_HEADER.to_string(),
                value: format!("{:?}", value),
            })?,
            None => decode(&message.routing_key)?.delay_seconds(),
        };

        let sent_at = match headers.get(TIME_SENT_HEADER).and_then(|v| v.as_text()) {
            Some(text) => DateTime::parse_from_rfc3339(text)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|_| MigrationError::InvalidHeader {
                    header: TIME_SENT_HEADER.to_string(),
                    value: text.to_string(),
                })?,
            None => message
                .properties
                .timestamp
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or_else(|| MigrationError::MissingHeader {
                    header: TIME_SENT_HEADER.to_string(),
                    routing_key: message.routing_key.clone(),
                })?,
        };

        Ok(Self {
            delay_seconds,
            sent_at,
        })
    }
}

// ============================================================================
// Per-message state machine
// ============================================================================

/// Progress of one message through migration.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationState {
    NotStarted {
        fetched: Fetched,
    },
    Decoded {
        fetched: Fetched,
        schedule: OriginalSchedule,
    },
    Replanned {
        fetched: Fetched,
        plan: Replan,
    },
    Republished {
        delivery_tag: u64,
        plan: Replan,
    },
    OriginalRemoved {
        plan: Replan,
    },
}

/// What a migration step needs from the outside world.
pub struct MigrationContext<'a> {
    pub source: &'a dyn MessageSource,
    pub dispatcher: &'a dyn Dispatcher,
    pub target: &'a TopologyGeneration,
    pub now: DateTime<Utc>,
}

impl MigrationState {
    pub fn new(fetched: Fetched) -> Self {
        MigrationState::NotStarted { fetched }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MigrationState::NotStarted { .. } => "NotStarted",
            MigrationState::Decoded { .. } => "Decoded",
            MigrationState::Replanned { .. } => "Replanned",
            MigrationState::Republished { .. } => "Republished",
            MigrationState::OriginalRemoved { .. } => "OriginalRemoved",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, MigrationState::OriginalRemoved { .. })
    }

    /// Whether the new copy has been confirmed by the broker.
    pub fn is_republished(&self) -> bool {
        matches!(
            self,
            MigrationState::Republished { .. } | MigrationState::OriginalRemoved { .. }
        )
    }

    pub fn delivery_tag(&self) -> Option<u64> {
        match self {
            MigrationState::NotStarted { fetched }
            | MigrationState::Decoded { fetched, .. }
            | MigrationState::Replanned { fetched, .. } => Some(fetched.delivery_tag),
            MigrationState::Republished { delivery_tag, .. } => Some(*delivery_tag),
            MigrationState::OriginalRemoved { .. } => None,
        }
    }

    /// Take the next step.
    ///
    /// On error the state is unchanged, so the same step can be retried.
    pub async fn advance(&mut self, ctx: &MigrationContext<'_>) -> Result<()> {
        let next = match self {
            MigrationState::NotStarted { fetched } => MigrationState::Decoded {
                schedule: OriginalSchedule::from_message(&fetched.message)?,
                fetched: fetched.clone(),
            },
            MigrationState::Decoded { fetched, schedule } => MigrationState::Replanned {
                plan: replan(
                    schedule.delay_seconds,
                    schedule.sent_at,
                    &fetched.message.routing_key,
                    ctx.now,
                )?,
                fetched: fetched.clone(),
            },
            MigrationState::Replanned { fetched, plan } => {
                let mut message = fetched.message.clone();
                message.routing_key = plan.routing_key.clone();
                ctx.dispatcher
                    .publish(&ctx.target.level_name(plan.starting_level), message)
                    .await?;
                MigrationState::Republished {
                    delivery_tag: fetched.delivery_tag,
                    plan: plan.clone(),
                }
            }
            MigrationState::Republished { delivery_tag, plan } => {
                ctx.source.acknowledge(*delivery_tag).await?;
                MigrationState::OriginalRemoved { plan: plan.clone() }
            }
            MigrationState::OriginalRemoved { .. } => {
                return Err(MigrationError::InvalidTransition {
                    state: "OriginalRemoved",
                })
            }
        };

        *self = next;
        Ok(())
    }

    /// Advance until the original is removed or a step fails.
    pub async fn run_to_completion(&mut self, ctx: &MigrationContext<'_>) -> Result<()> {
        while !self.is_complete() {
            self.advance(ctx).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Batch driver
// ============================================================================

/// A message that could not be migrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFailure {
    pub queue: String,
    pub routing_key: String,
    /// State the message was left in.
    pub state: &'static str,
    pub error: MigrationError,
}

/// Outcome of draining one generation into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub failures: Vec<MigrationFailure>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drains every level queue of one generation into another.
pub struct Migrator<'a> {
    source: &'a dyn MessageSource,
    dispatcher: &'a dyn Dispatcher,
    from: &'a TopologyGeneration,
    to: &'a TopologyGeneration,
}

impl<'a> Migrator<'a> {
    pub fn new(
        source: &'a dyn MessageSource,
        dispatcher: &'a dyn Dispatcher,
        from: &'a TopologyGeneration,
        to: &'a TopologyGeneration,
    ) -> Self {
        Self {
            source,
            dispatcher,
            from,
            to,
        }
    }

    /// Move every parked message, highest level first.
    ///
    /// Messages that cannot be migrated on their own account (corrupt,
    /// missing headers, or reaching no queue in the target) are returned to
    /// their queue once it has been drained and are listed in the report.
    /// Any other broker error aborts the run after releasing what is held.
    #[tracing::instrument(
        name = "migration.run",
        skip_all,
        fields(from = %self.from.name_prefix, to = %self.to.name_prefix)
    )]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<MigrationReport> {
        // Republishing into the queues being drained would never terminate.
        if self.from.name_prefix == self.to.name_prefix {
            return Err(MigrationError::SameGeneration {
                prefix: self.from.name_prefix.clone(),
            });
        }

        let ctx = MigrationContext {
            source: self.source,
            dispatcher: self.dispatcher,
            target: self.to,
            now,
        };
        let mut report = MigrationReport::default();

        for level in (0..=MAX_LEVEL).rev() {
            let queue = self.from.level_name(level);
            let mut held_back = Vec::new();

            loop {
                let fetched = match self.source.fetch(&queue).await {
                    Ok(Some(fetched)) => fetched,
                    Ok(None) => break,
                    Err(e) => {
                        self.release_all(&held_back).await;
                        return Err(e.into());
                    }
                };
                let routing_key = fetched.message.routing_key.clone();
                let mut state = MigrationState::new(fetched);

                match state.run_to_completion(&ctx).await {
                    Ok(()) => {
                        report.migrated += 1;
                        debug!(queue = %queue, routing_key = %routing_key, "Migrated message");
                    }
                    Err(e) => {
                        if !state.is_republished() {
                            held_back.extend(state.delivery_tag());
                        }

                        if e.aborts_run() {
                            error!(
                                queue = %queue,
                                routing_key = %routing_key,
                                state = state.name(),
                                migrated = report.migrated,
                                error = %e,
                                "Broker failure, aborting migration"
                            );
                            self.release_all(&held_back).await;
                            return Err(e);
                        }

                        warn!(
                            queue = %queue,
                            routing_key = %routing_key,
                            state = state.name(),
                            error = %e,
                            "Failed to migrate message"
                        );
                        report.failures.push(MigrationFailure {
                            queue: queue.clone(),
                            routing_key,
                            state: state.name(),
                            error: e,
                        });
                    }
                }
            }

            for tag in held_back {
                self.source.release(tag).await?;
            }
        }

        info!(
            migrated = report.migrated,
            failed = report.failures.len(),
            "Migration finished"
        );
        Ok(report)
    }

    /// Best-effort release before giving up on a run.
    async fn release_all(&self, tags: &[u64]) {
        for &tag in tags {
            if let Err(e) = self.source.release(tag).await {
                warn!(delivery_tag = tag, error = %e, "Failed to release message");
            }
        }
    }
}

#[cfg(test)]
mod tests;
