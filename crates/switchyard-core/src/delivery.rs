//! Backpressure policies for outbound delivery.
//!
//! Each event tag can be mapped to a [`DeliveryPolicy`] that decides what
//! happens when a recipient's outbound queue is full. Tags without an
//! override use the configured default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// What to do with an event whose recipient queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Discard the new event for that recipient.
    #[default]
    DropNewest,
    /// Evict the oldest queued event to make room.
    DropOldest,
    /// Wait up to `timeout_ms` for room, then discard.
    Block { timeout_ms: u64 },
}

impl DeliveryPolicy {
    /// Blocking policy with the given timeout.
    #[must_use]
    pub fn block(timeout: Duration) -> Self {
        Self::Block {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Whether delivery under this policy may suspend.
    #[must_use]
    pub fn may_block(&self) -> bool {
        matches!(self, Self::Block { timeout_ms } if *timeout_ms > 0)
    }
}

/// Delivery policies keyed by event tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Policy for tags without an override.
    #[serde(default)]
    pub default: DeliveryPolicy,

    /// Per-tag overrides.
    #[serde(default)]
    pub overrides: HashMap<String, DeliveryPolicy>,
}

impl DeliveryConfig {
    /// Look up the policy for an event tag.
    #[must_use]
    pub fn policy_for(&self, kind: &str) -> DeliveryPolicy {
        self.overrides.get(kind).copied().unwrap_or(self.default)
    }

    /// Set the policy for one tag.
    #[must_use]
    pub fn with_override(mut self, kind: impl Into<String>, policy: DeliveryPolicy) -> Self {
        self.overrides.insert(kind.into(), policy);
        self
    }
}

/// Outcome of delivering one frame to one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Appended to the queue.
    Queued,
    /// Appended after evicting the oldest queued frame.
    Evicted,
    /// Discarded because the queue stayed full.
    Dropped,
    /// The recipient's queue is closed.
    Closed,
}

impl Delivery {
    /// Whether the frame made it into the queue.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Queued | Self::Evicted)
    }
}

/// Aggregate outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Recipients whose queue accepted the frame.
    pub delivered: usize,
    /// Recipients that did not get the frame (full or closed queue).
    pub dropped: usize,
}

impl DeliveryReport {
    pub(crate) fn record(&mut self, outcome: Delivery) {
        if outcome.is_delivered() {
            self.delivered += 1;
        } else {
            self.dropped += 1;
        }
    }

    /// Total recipients attempted.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered + self.dropped
    }
}

impl std::ops::AddAssign for DeliveryReport {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_lookup() {
        let config = DeliveryConfig::default()
            .with_override("MESSAGE_DELETE", DeliveryPolicy::block(Duration::from_millis(250)))
            .with_override("TYPING_START", DeliveryPolicy::DropOldest);

        assert_eq!(config.policy_for("MESSAGE_CREATE"), DeliveryPolicy::DropNewest);
        assert_eq!(config.policy_for("TYPING_START"), DeliveryPolicy::DropOldest);
        assert_eq!(
            config.policy_for("MESSAGE_DELETE"),
            DeliveryPolicy::Block { timeout_ms: 250 }
        );
    }

    #[test]
    fn test_policy_serde() {
        let policy: DeliveryPolicy =
            serde_json::from_str(r#"{"mode":"block","timeout_ms":100}"#).unwrap();
        assert_eq!(policy, DeliveryPolicy::Block { timeout_ms: 100 });
        assert!(policy.may_block());

        let policy: DeliveryPolicy = serde_json::from_str(r#"{"mode":"drop_oldest"}"#).unwrap();
        assert_eq!(policy, DeliveryPolicy::DropOldest);
        assert!(!policy.may_block());
    }

    #[test]
    fn test_report_accumulates() {
        let mut report = DeliveryReport::default();
        report.record(Delivery::Queued);
        report.record(Delivery::Evicted);
        report.record(Delivery::Dropped);
        report.record(Delivery::Closed);

        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 2);
        assert_eq!(report.attempted(), 4);
    }
}
