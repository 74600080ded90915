//! Entity platform domains
//!
//! Integrations declare which entity platforms they provide by
//! [`PlatformDomain`]. The set is closed: dispatch happens through a registry
//! keyed by this enum, resolved when an integration is registered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error for a platform domain string that is not known to the hub
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown platform domain: {0}")]
pub struct UnknownPlatformDomain(pub String);

/// An entity platform (the first half of an entity id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformDomain {
    BinarySensor,
    Button,
    Light,
    Number,
    Sensor,
    Switch,
}

impl PlatformDomain {
    /// All known platform domains
    pub const ALL: &'static [PlatformDomain] = &[
        PlatformDomain::BinarySensor,
        PlatformDomain::Button,
        PlatformDomain::Light,
        PlatformDomain::Number,
        PlatformDomain::Sensor,
        PlatformDomain::Switch,
    ];

    /// Domain string as it appears in entity ids
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformDomain::BinarySensor => "binary_sensor",
            PlatformDomain::Button => "button",
            PlatformDomain::Light => "light",
            PlatformDomain::Number => "number",
            PlatformDomain::Sensor => "sensor",
            PlatformDomain::Switch => "switch",
        }
    }

    /// Read-only domains only report state and accept no commands
    pub fn is_readonly(&self) -> bool {
        matches!(self, PlatformDomain::Sensor | PlatformDomain::BinarySensor)
    }
}

impl FromStr for PlatformDomain {
    type Err = UnknownPlatformDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlatformDomain::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| UnknownPlatformDomain(s.to_string()))
    }
}

impl fmt::Display for PlatformDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
