//! Identifier and handshake types
//!
//! This module defines the stream identifiers used by the bridge multiplexer
//! and the parsed form of the device connection banner.

use std::collections::{BTreeMap, BTreeSet};

/// Host-side stream identifier
///
/// Allocated by whichever side opened the stream for its own end. Local ids
/// are never zero and never reused within one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

/// Device-side stream identifier, learned from the OKAY answering an OPEN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteId(pub u32);

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Parsed device banner from the CNXN payload
///
/// Format: `<system-type>:<serial>:<key>=<value>;<key>=<value>;...`, where
/// the `features` property is a comma-separated list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceBanner {
    /// System type, normally `device`, `recovery` or `sideload`
    pub system_type: String,
    /// Properties such as `ro.product.model`
    pub properties: BTreeMap<String, String>,
    /// Advertised protocol features
    pub features: BTreeSet<String>,
}

impl DeviceBanner {
    /// Parse a banner string; unknown pieces are kept as-is
    pub fn parse(banner: &str) -> Self {
        let mut parts = banner.splitn(3, ':');
        let system_type = parts.next().unwrap_or_default().to_string();
        let _serial = parts.next();
        let props = parts.next().unwrap_or_default();

        let mut properties = BTreeMap::new();
        let mut features = BTreeSet::new();

        for entry in props.split(';').filter(|e| !e.is_empty()) {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            if key == "features" {
                features.extend(
                    value
                        .split(',')
                        .filter(|f| !f.is_empty())
                        .map(str::to_string),
                );
            } else {
                properties.insert(key.to_string(), value.to_string());
            }
        }

        Self {
            system_type,
            properties,
            features,
        }
    }

    /// Whether the device advertises a feature
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Human-readable model name, if advertised
    pub fn model(&self) -> Option<&str> {
        self.properties.get("ro.product.model").map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_banner() {
        let banner = DeviceBanner::parse(
            "device::ro.product.name=sargo;ro.product.model=Pixel 3a;ro.product.device=sargo;features=shell_v2,cmd,stat_v2",
        );
        assert_eq!(banner.system_type, "device");
        assert_eq!(banner.model(), Some("Pixel 3a"));
        assert!(banner.has_feature("shell_v2"));
        assert!(banner.has_feature("stat_v2"));
        assert!(!banner.has_feature("abb"));
    }

    #[test]
    fn test_parse_bare_banner() {
        let banner = DeviceBanner::parse("device::");
        assert_eq!(banner.system_type, "device");
        assert!(banner.features.is_empty());
        assert!(banner.properties.is_empty());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(LocalId(3).to_string(), "L3");
        assert_eq!(RemoteId(12).to_string(), "R12");
    }
}
