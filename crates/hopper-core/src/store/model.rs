use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{HopperError, Result};

pub const CPU_METRIC: &str = "cpu";
pub const MEMORY_METRIC: &str = "memory";

/// Longest accepted registration timeout: one year, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// A container image subscribed to a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: i64,
    pub topic: String,
    /// Image started for each batch of the topic.
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
    /// Seconds a non-empty inbox may wait before a batch is forced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub privileged: bool,
    pub creator: String,
}

impl Registration {
    pub fn policy(&self) -> TriggerPolicy {
        TriggerPolicy::new(self.threshold, self.timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRegistration {
    pub topic: String,
    pub container: String,
    #[serde(default)]
    pub threshold: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default = "default_creator")]
    pub creator: String,
}

fn default_creator() -> String {
    "hopper".to_string()
}

impl NewRegistration {
    pub fn new(topic: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            container: container.into(),
            threshold: None,
            timeout: None,
            privileged: false,
            creator: default_creator(),
        }
    }

    pub fn threshold(mut self, threshold: u32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    /// Reject registrations the orchestrator cannot schedule.
    pub fn validate(&self) -> Result<()> {
        crate::paths::validate_topic(&self.topic)?;
        if self.container.trim().is_empty() {
            return Err(HopperError::InvalidRegistration(
                "container must not be empty".into(),
            ));
        }
        if let Some(timeout) = self.timeout {
            if timeout > MAX_TIMEOUT_SECS {
                return Err(HopperError::InvalidRegistration(format!(
                    "timeout {timeout}s exceeds the maximum of {MAX_TIMEOUT_SECS}s"
                )));
            }
        }
        Ok(())
    }
}

/// When a registration fires.
///
/// An unset (or zero) threshold fires on the first file. Without a timeout
/// the registration fires only on its threshold; a zero timeout fires on the
/// next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPolicy {
    pub threshold: usize,
    pub timeout: Option<Duration>,
}

impl TriggerPolicy {
    pub fn new(threshold: Option<u32>, timeout_secs: Option<u64>) -> Self {
        Self {
            threshold: threshold.filter(|t| *t > 0).unwrap_or(1) as usize,
            timeout: timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub topic: String,
    pub container: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub name: String,
    pub value: f64,
}

/// One completed container run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub topic: String,
    pub container: String,
    /// Start time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults() {
        assert_eq!(
            TriggerPolicy::new(None, None),
            TriggerPolicy { threshold: 1, timeout: None }
        );
        assert_eq!(TriggerPolicy::new(Some(0), None).threshold, 1);
        assert_eq!(
            TriggerPolicy::new(Some(100), Some(0)).timeout,
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn new_registration_from_json() {
        let reg: NewRegistration =
            serde_json::from_str(r#"{"topic":"T1","container":"busybox","threshold":5}"#).unwrap();
        assert_eq!(reg, NewRegistration::new("T1", "busybox").threshold(5));
        assert!(serde_json::from_str::<NewRegistration>(r#"{"topic":"T1"}"#).is_err());
    }

    #[test]
    fn validate_bounds_timeout() {
        assert!(NewRegistration::new("T1", "busybox")
            .timeout(MAX_TIMEOUT_SECS)
            .validate()
            .is_ok());
        let err = NewRegistration::new("T1", "busybox")
            .timeout(u64::MAX)
            .validate()
            .unwrap_err();
        assert!(matches!(err, HopperError::InvalidRegistration(_)));
        assert!(err.to_string().contains("exceeds the maximum"));
    }

    #[test]
    fn validate_rejects_bad_topic_and_empty_container() {
        assert!(matches!(
            NewRegistration::new("../up", "busybox").validate(),
            Err(HopperError::InvalidTopic(_))
        ));
        assert!(matches!(
            NewRegistration::new("T1", "  ").validate(),
            Err(HopperError::InvalidRegistration(_))
        ));
    }
}
