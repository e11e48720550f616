//! Startup gate for endpoints that use the delay cascade.
//!
//! Refuses to start an endpoint whose settings expect the external timeout
//! manager while that feature is off, so delayed messages would never be
//! released. The decision is a fixed rule table evaluated top to bottom.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// State of the external timeout manager feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutManagerFeature {
    Active,
    #[default]
    Disabled,
    Deactivated,
}

/// Failure reason when the timeout manager is requested but unavailable.
pub const TIMEOUT_MANAGER_NOT_ACTIVE: &str = "timeout manager enabled but feature not active";

/// Result of the startup check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupCheck {
    Success,
    Failure { reason: String },
}

impl StartupCheck {
    pub fn is_success(&self) -> bool {
        matches!(self, StartupCheck::Success)
    }
}

// ============================================================================
// Decision table
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Match<T: 'static> {
    Any,
    Is(T),
    OneOf(&'static [T]),
}

impl<T: PartialEq + Copy + 'static> Match<T> {
    fn matches(&self, value: T) -> bool {
        match self {
            Match::Any => true,
            Match::Is(expected) => *expected == value,
            Match::OneOf(options) => options.contains(&value),
        }
    }
}

struct Rule {
    enable: Match<bool>,
    feature: Match<TimeoutManagerFeature>,
    native_delay: Match<bool>,
    outcome: Option<&'static str>,
}

const RULES: &[Rule] = &[
    Rule {
        enable: Match::Is(false),
        feature: Match::Any,
        native_delay: Match::Any,
        outcome: None,
    },
    Rule {
        enable: Match::Is(true),
        feature: Match::Is(TimeoutManagerFeature::Active),
        native_delay: Match::Any,
        outcome: None,
    },
    Rule {
        enable: Match::Is(true),
        feature: Match::OneOf(&[
            TimeoutManagerFeature::Disabled,
            TimeoutManagerFeature::Deactivated,
        ]),
        native_delay: Match::Any,
        outcome: Some(TIMEOUT_MANAGER_NOT_ACTIVE),
    },
];

/// Check endpoint settings against the decision table.
///
/// The table covers every combination of inputs; the fallback after it
/// takes the conservative failing row and is unreachable while that holds.
pub fn check_settings(
    enable_timeout_manager: bool,
    feature: TimeoutManagerFeature,
    native_delay_supported: bool,
) -> StartupCheck {
    let rule = RULES.iter().find(|rule| {
        rule.enable.matches(enable_timeout_manager)
            && rule.feature.matches(feature)
            && rule.native_delay.matches(native_delay_supported)
    });

    match rule.map(|rule| rule.outcome) {
        Some(None) => StartupCheck::Success,
        Some(Some(reason)) => StartupCheck::Failure {
            reason: reason.to_string(),
        },
        None => StartupCheck::Failure {
            reason: TIMEOUT_MANAGER_NOT_ACTIVE.to_string(),
        },
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Startup flags as they appear in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupSettings {
    /// Use the external timeout manager for delayed delivery.
    pub enable_timeout_manager: Option<bool>,
    /// Legacy inverse of `enable_timeout_manager`.
    pub disable_timeout_manager: Option<bool>,
    pub timeout_manager_feature: TimeoutManagerFeature,
    pub native_delay_supported: bool,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            enable_timeout_manager: None,
            disable_timeout_manager: None,
            timeout_manager_feature: TimeoutManagerFeature::Disabled,
            native_delay_supported: true,
        }
    }
}

impl StartupSettings {
    /// Effective enable flag after folding in the legacy setting.
    ///
    /// The newer flag wins a conflict. With neither set the timeout manager
    /// is off.
    pub fn timeout_manager_enabled(&self) -> bool {
        match (self.enable_timeout_manager, self.disable_timeout_manager) {
            (Some(enable), Some(disable)) if enable == disable => {
                warn!(
                    enable_timeout_manager = enable,
                    disable_timeout_manager = disable,
                    "Conflicting timeout manager flags, using enable_timeout_manager"
                );
                enable
            }
            (Some(enable), _) => enable,
            (None, Some(disable)) => !disable,
            (None, None) => false,
        }
    }

    pub fn check(&self) -> StartupCheck {
        check_settings(
            self.timeout_manager_enabled(),
            self.timeout_manager_feature,
            self.native_delay_supported,
        )
    }
}
