//! Network policy definitions for sandbox containers.

use serde::{Deserialize, Serialize};

/// Network access policy for sandbox containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum NetworkPolicy {
    /// Default bridge network, unrestricted egress
    #[default]
    AllowAll,
    /// No network interface besides loopback
    Deny,
}

impl NetworkPolicy {
    /// Docker `network_mode` for this policy, `None` meaning the daemon default.
    pub fn network_mode(self) -> Option<String> {
        match self {
            Self::AllowAll => None,
            Self::Deny => Some("none".to_string()),
        }
    }
}

impl std::fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllowAll => write!(f, "allow-all"),
            Self::Deny => write!(f, "deny"),
        }
    }
}
