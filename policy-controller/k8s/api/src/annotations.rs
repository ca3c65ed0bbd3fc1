//! Annotations that carry policy state on deployments and pods.
//!
//! The controller writes [`PolicyAnnotations`] onto every selected deployment
//! and the admission webhook marks each mutated pod with [`STATUS`]. All
//! encoding of annotation values lives here.

use super::labels::Map;
use std::{fmt, str::FromStr};

/// Requests sidecar injection for a deployment or pod.
pub const INJECT: &str = "sidecar-injector-webhook.cluster-monitor.io/inject";
pub const INJECT_ENABLED: &str = "true";

/// Set once the sidecar has been added.
pub const STATUS: &str = "sidecar-injector-webhook.cluster-monitor.io/status";
pub const STATUS_INJECTED: &str = "injected";

pub const ACTION: &str = "Action";
pub const GROUP_LABEL: &str = "GroupLabel";
pub const LOG_FREQUENCY: &str = "LogFrequency";

/// Every annotation key a policy owns on a workload.
pub const POLICY_KEYS: [&str; 5] = [INJECT, STATUS, ACTION, GROUP_LABEL, LOG_FREQUENCY];

const GROUP_LABEL_SEPARATOR: &str = "--";

/// Policy values as stored on a deployment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyAnnotations {
    pub action: Action,
    pub group_label: GroupLabel,
    pub log_frequency: LogFrequency,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Action {
    /// No action was configured.
    #[default]
    Unset,
    Quarantine,
    Other(String),
}

/// An ordered list of label keys, stored as a `--`-joined string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupLabel(Vec<String>);

/// Seconds between sidecar liveness checks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogFrequency(u32);

/// Returns true if the annotation value enables an option.
pub fn is_truthy(value: &str) -> bool {
    ["y", "yes", "true", "on"]
        .iter()
        .any(|t| value.eq_ignore_ascii_case(t))
}

/// Returns true if the sidecar has already been injected.
pub fn is_injected(annotations: &Map) -> bool {
    annotations
        .get(STATUS)
        .map(|s| s.eq_ignore_ascii_case(STATUS_INJECTED))
        .unwrap_or(false)
}

/// Returns true if the object explicitly requests injection.
pub fn requests_injection(annotations: &Map) -> bool {
    annotations.get(INJECT).map(|v| is_truthy(v)).unwrap_or(false)
}

// === impl PolicyAnnotations ===

impl PolicyAnnotations {
    /// The full annotation set for a selected deployment, including the
    /// inject flag and injected status.
    pub fn to_map(&self) -> Map {
        [
            (INJECT, INJECT_ENABLED.to_string()),
            (STATUS, STATUS_INJECTED.to_string()),
            (ACTION, self.action.to_string()),
            (GROUP_LABEL, self.group_label.to_string()),
            (LOG_FREQUENCY, self.log_frequency.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Reads policy values from a deployment's annotations. Missing or
    /// malformed values fall back to their defaults.
    pub fn from_map(annotations: &Map) -> Self {
        let action = annotations
            .get(ACTION)
            .map(|a| Action::from(a.as_str()))
            .unwrap_or_default();
        let group_label = annotations
            .get(GROUP_LABEL)
            .and_then(|g| g.parse().ok())
            .unwrap_or_default();
        let log_frequency = annotations
            .get(LOG_FREQUENCY)
            .and_then(|f| f.parse().ok())
            .unwrap_or_default();
        Self {
            action,
            group_label,
            log_frequency,
        }
    }
}

// === impl Action ===

impl Action {
    pub const QUARANTINE: &'static str = "quarantine";

    /// Reported pods are quarantined unless the policy names another action.
    pub fn quarantines(&self) -> bool {
        matches!(self, Self::Unset | Self::Quarantine)
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        match s {
            "" => Self::Unset,
            Self::QUARANTINE => Self::Quarantine,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => Ok(()),
            Self::Quarantine => f.write_str(Self::QUARANTINE),
            Self::Other(s) => f.write_str(s),
        }
    }
}

// === impl GroupLabel ===

impl GroupLabel {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::iter::FromIterator<String> for GroupLabel {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self(iter.into_iter().filter(|k| !k.is_empty()).collect())
    }
}

impl fmt::Display for GroupLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(GROUP_LABEL_SEPARATOR))
    }
}

impl FromStr for GroupLabel {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.split(GROUP_LABEL_SEPARATOR)
            .map(|k| k.trim().to_string())
            .collect())
    }
}

// === impl LogFrequency ===

impl LogFrequency {
    pub const DEFAULT_SECS: u32 = 10;

    pub fn from_seconds(secs: u32) -> Self {
        if secs == 0 {
            return Self::default();
        }
        Self(secs)
    }

    pub fn as_secs(&self) -> u32 {
        self.0
    }
}

impl Default for LogFrequency {
    fn default() -> Self {
        Self(Self::DEFAULT_SECS)
    }
}

impl fmt::Display for LogFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for LogFrequency {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self::from_seconds)
    }
}
