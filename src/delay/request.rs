//! Delay requests as the dispatch pipeline hands them over.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{validate, DelayError};

/// When an outgoing message may be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayRequest {
    /// Deliver no earlier than this instant.
    NotBefore(DateTime<Utc>),
    /// Deliver no earlier than this long after sending.
    After(Duration),
}

impl DelayRequest {
    /// Whole seconds to wait, rounded up so delivery is never early.
    ///
    /// Instants in the past yield 0. Delays beyond the cascade's range are
    /// rejected rather than clamped.
    pub fn delay_seconds(&self, now: DateTime<Utc>) -> Result<i64, DelayError> {
        let seconds = match self {
            DelayRequest::NotBefore(at) => {
                let millis = (*at - now).num_milliseconds();
                ceil_div(millis, 1000)
            }
            DelayRequest::After(duration) => {
                let whole = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
                if duration.subsec_nanos() > 0 {
                    whole.saturating_add(1)
                } else {
                    whole
                }
            }
        }
        .max(0);

        validate(seconds)?;
        Ok(seconds)
    }
}

fn ceil_div(value: i64, divisor: i64) -> i64 {
    let quotient = value / divisor;
    if value % divisor > 0 {
        quotient + 1
    } else {
        quotient
    }
}
