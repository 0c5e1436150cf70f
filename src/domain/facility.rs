//! Facility bindings: which parking-lot device sits behind which network address
//!
//! The table is loaded once from configuration and never mutated afterwards, so
//! lookups need no synchronization beyond the `Arc` it is shared through.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// One breaker or pay station as the facility-management backend knows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilityInfo {
    /// Backend facility identifier (used as the `{id}` path variable)
    pub facilities_id: String,
    /// Device-level facility identifier reported with car events
    #[serde(default)]
    pub dt_facilities_id: String,
    /// Human readable name
    #[serde(default)]
    pub fname: String,
    /// Device category (e.g. "BREAKER", "PAYSTATION")
    #[serde(default)]
    pub category: String,
    pub ip: String,
    pub port: u16,
    /// Gate the device belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_id: Option<String>,
}

impl FacilityInfo {
    /// Address key in the form a connected socket reports (`[::1]:7979` for IPv6)
    pub fn address(&self) -> String {
        match self.ip.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.ip, self.port),
        }
    }
}

/// Address -> facility lookup used by the inbound dispatcher
pub trait FacilityResolver: Send + Sync {
    /// Returns `None` when no facility is bound to `remote_addr`
    fn resolve(&self, remote_addr: &SocketAddr) -> Option<FacilityInfo>;
}

/// Read-only table of facility bindings keyed by `ip:port`
#[derive(Debug, Default, Clone)]
pub struct FacilityTable {
    by_address: FxHashMap<String, FacilityInfo>,
}

impl FacilityTable {
    pub fn new(facilities: Vec<FacilityInfo>) -> Self {
        let mut by_address = FxHashMap::default();
        for facility in facilities {
            // Last binding wins for duplicated addresses
            by_address.insert(facility.address(), facility);
        }
        Self { by_address }
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn find_by_address(&self, addr: &str) -> Option<&FacilityInfo> {
        match addr.parse::<SocketAddr>() {
            Ok(sock) => self.find_by_socket(&sock),
            Err(_) => self.by_address.get(addr),
        }
    }

    pub fn find_by_socket(&self, addr: &SocketAddr) -> Option<&FacilityInfo> {
        self.by_address.get(&addr.to_string())
    }

    /// All bindings, sorted by address for stable startup order
    pub fn facilities(&self) -> Vec<&FacilityInfo> {
        let mut all: Vec<_> = self.by_address.values().collect();
        all.sort_by(|a, b| a.ip.cmp(&b.ip).then(a.port.cmp(&b.port)));
        all
    }
}

impl FacilityResolver for FacilityTable {
    fn resolve(&self, remote_addr: &SocketAddr) -> Option<FacilityInfo> {
        self.find_by_socket(remote_addr).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facility(id: &str, ip: &str, port: u16) -> FacilityInfo {
        FacilityInfo {
            facilities_id: id.to_string(),
            dt_facilities_id: format!("DT-{id}"),
            fname: "pay station".to_string(),
            category: "PAYSTATION".to_string(),
            ip: ip.to_string(),
            port,
            gate_id: None,
        }
    }

    #[test]
    fn test_lookup_by_address_and_socket() {
        let table = FacilityTable::new(vec![facility("F1", "127.0.0.1", 7979)]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.find_by_address("127.0.0.1:7979").unwrap().facilities_id, "F1");

        let sock: SocketAddr = "127.0.0.1:7979".parse().unwrap();
        assert_eq!(table.find_by_socket(&sock).unwrap().facilities_id, "F1");
    }

    #[test]
    fn test_unknown_address_is_none() {
        let table = FacilityTable::new(vec![facility("F1", "127.0.0.1", 7979)]);
        assert!(table.resolve(&"127.0.0.1:7980".parse().unwrap()).is_none());
        assert!(FacilityTable::default().resolve(&"127.0.0.1:7979".parse().unwrap()).is_none());
    }

    #[test]
    fn test_ipv6_facility_resolves_from_socket() {
        let table = FacilityTable::new(vec![facility("F6", "::1", 7979)]);
        assert_eq!(table.facilities()[0].address(), "[::1]:7979");

        let sock: SocketAddr = "[::1]:7979".parse().unwrap();
        assert_eq!(table.resolve(&sock).unwrap().facilities_id, "F6");
        assert_eq!(table.find_by_address("[0:0:0:0:0:0:0:1]:7979").unwrap().facilities_id, "F6");
        assert!(table.find_by_address("::1:7979").is_none());
    }

    #[test]
    fn test_facilities_sorted() {
        let table = FacilityTable::new(vec![
            facility("F2", "10.0.0.2", 4001),
            facility("F1", "10.0.0.1", 4002),
            facility("F3", "10.0.0.1", 4001),
        ]);
        let ids: Vec<_> = table.facilities().iter().map(|f| f.facilities_id.as_str()).collect();
        assert_eq!(ids, vec!["F3", "F1", "F2"]);
    }

    #[test]
    fn test_deserialize_backend_shape() {
        let json = r#"{"facilitiesId":"F9","dtFacilitiesId":"D9","fname":"in gate",
            "category":"BREAKER","ip":"192.168.20.11","port":4001,"gateId":"G1"}"#;
        let info: FacilityInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.address(), "192.168.20.11:4001");
        assert_eq!(info.gate_id.as_deref(), Some("G1"));
    }
}
