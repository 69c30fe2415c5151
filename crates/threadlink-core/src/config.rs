//! Centralized configuration for threadlink.
//!
//! Protocol constants live on unit structs, as associated constants; the
//! tunable subset is gathered in [`HubConfig`].

use crate::error::{Result, ThreadsError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Wire-level protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Recipient that every endpoint accepts.
    pub const WILDCARD: &'static str = "*";
    /// Name of the process-wide discovery broadcast channel.
    pub const MANAGER_CHANNEL: &'static str = "threadsmanager";
    /// Endpoint id every Manager answers on.
    pub const MANAGER_ID: &'static str = "threadsmanager";
    /// Envelope ids remembered per Messenger for duplicate suppression.
    pub const HISTORY_CAPACITY: usize = 10;
}

/// Service discovery timing.
pub struct DiscoveryConfig;

impl DiscoveryConfig {
    pub const SERVICE_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(2000);
}

/// Tunables shared by everything attached to one [`Hub`](crate::Hub).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Ring size of each Messenger's duplicate-suppression history.
    pub history_capacity: usize,
    /// How long `ChildThread::get_service` waits for an unknown service.
    #[serde(with = "duration_millis")]
    pub discovery_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            history_capacity: ProtocolConfig::HISTORY_CAPACITY,
            discovery_timeout: DiscoveryConfig::SERVICE_DISCOVERY_TIMEOUT,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// The three kinds of execution context a [`ChildThread`](crate::ChildThread) can wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ContextKind {
    /// Dedicated worker, one context per adapter.
    Worker,
    /// Shared worker, one context per `src` with a port per connecting adapter.
    SharedWorker,
    /// Windowed/embedded context, only spawnable from another window.
    Window,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Worker => "worker",
            ContextKind::SharedWorker => "sharedworker",
            ContextKind::Window => "window",
        }
    }
}

impl FromStr for ContextKind {
    type Err = ThreadsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "worker" => Ok(ContextKind::Worker),
            "sharedworker" => Ok(ContextKind::SharedWorker),
            "window" => Ok(ContextKind::Window),
            other => Err(ThreadsError::UnknownContextKind {
                kind: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for ContextKind {
    type Error = ThreadsError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ContextKind> for String {
    fn from(kind: ContextKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for ContextKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_kind_roundtrip() {
        for kind in [
            ContextKind::Worker,
            ContextKind::SharedWorker,
            ContextKind::Window,
        ] {
            let parsed: ContextKind = kind.as_str().parse().expect("Should parse");
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn test_unknown_context_kind() {
        let err = "iframe".parse::<ContextKind>().unwrap_err();
        assert!(matches!(err, ThreadsError::UnknownContextKind { kind } if kind == "iframe"));
    }

    #[test]
    fn test_hub_config_from_json() {
        let config: HubConfig =
            serde_json::from_str(r#"{"discovery_timeout": 500, "history_capacity": 32}"#).unwrap();

        assert_eq!(config.discovery_timeout, Duration::from_millis(500));
        assert_eq!(config.history_capacity, 32);
    }

    #[test]
    fn test_defaults_are_reasonable() {
        let config = HubConfig::default();
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.discovery_timeout, Duration::from_millis(2000));
    }
}
