//! Protocol version registry.
//!
//! 각 프로토콜 버전마다 사용할 수 있는 RPC 서비스 집합을 보관합니다.
//! 호스트와 플러그인이 서로 지원하는 버전 목록을 광고하고, 양쪽에 모두 있는
//! 가장 높은 버전을 선택합니다. 새 버전이 서비스를 추가해도 구 버전만
//! 광고하는 플러그인은 구 서비스 집합으로 그대로 동작합니다.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Environment variable carrying the host's advertised version list.
pub const ENV_PROTOCOL_VERSIONS: &str = "PLUGIN_PROTOCOL_VERSIONS";

/// A named RPC service available at some protocol version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
}

impl ServiceDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedProtocols {
    versions: BTreeMap<u32, Vec<ServiceDescriptor>>,
}

impl Default for VersionedProtocols {
    /// v5: provider + provisioner, v6: provider
    fn default() -> Self {
        Self::new()
            .with_version(
                5,
                vec![ServiceDescriptor::new("provider"), ServiceDescriptor::new("provisioner")],
            )
            .with_version(6, vec![ServiceDescriptor::new("provider")])
    }
}

impl VersionedProtocols {
    pub fn new() -> Self {
        Self {
            versions: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: u32, services: Vec<ServiceDescriptor>) -> Self {
        self.versions.insert(version, services);
        self
    }

    /// Supported versions, ascending.
    pub fn versions(&self) -> Vec<u32> {
        self.versions.keys().copied().collect()
    }

    pub fn highest(&self) -> Option<u32> {
        self.versions.keys().next_back().copied()
    }

    pub fn supports(&self, version: u32) -> bool {
        self.versions.contains_key(&version)
    }

    pub fn services(&self, version: u32) -> Option<&[ServiceDescriptor]> {
        self.versions.get(&version).map(|s| s.as_slice())
    }

    /// Comma separated list, e.g. `"5,6"`.
    pub fn advertise(&self) -> String {
        self.versions
            .keys()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn negotiate(&self, peer: &[u32]) -> Option<u32> {
        negotiate(&self.versions(), peer)
    }
}

/// Highest version present in both lists.
pub fn negotiate(host: &[u32], plugin: &[u32]) -> Option<u32> {
    host.iter().copied().filter(|v| plugin.contains(v)).max()
}

/// `"5, 6"` → `[5, 6]`. 빈 항목은 무시합니다.
pub fn parse_version_list(value: &str) -> Result<Vec<u32>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().map_err(|_| s.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_picks_highest_common() {
        assert_eq!(negotiate(&[1, 2], &[2, 3]), Some(2));
        assert_eq!(negotiate(&[4, 5, 6], &[6, 5]), Some(6));
    }

    #[test]
    fn test_negotiate_without_overlap() {
        assert_eq!(negotiate(&[1], &[2]), None);
        assert_eq!(negotiate(&[], &[1]), None);
    }

    #[test]
    fn test_default_registry() {
        let protocols = VersionedProtocols::default();
        assert_eq!(protocols.versions(), vec![5, 6]);
        assert_eq!(protocols.highest(), Some(6));
        assert_eq!(protocols.advertise(), "5,6");
        assert_eq!(protocols.services(5).unwrap().len(), 2);
        assert_eq!(protocols.services(6).unwrap(), &[ServiceDescriptor::new("provider")]);
        assert!(protocols.services(7).is_none());
    }

    #[test]
    fn test_registry_negotiate() {
        let protocols = VersionedProtocols::new()
            .with_version(1, vec![ServiceDescriptor::new("provider")])
            .with_version(2, vec![ServiceDescriptor::new("provider")]);
        assert_eq!(protocols.negotiate(&[2, 3]), Some(2));
        assert!(protocols.supports(1));
        assert!(!protocols.supports(3));
    }

    #[test]
    fn test_parse_version_list() {
        assert_eq!(parse_version_list("5,6").unwrap(), vec![5, 6]);
        assert_eq!(parse_version_list(" 2 , 3 ,").unwrap(), vec![2, 3]);
        assert_eq!(parse_version_list("").unwrap(), Vec::<u32>::new());
        assert_eq!(parse_version_list("5,x").unwrap_err(), "x");
    }
}
