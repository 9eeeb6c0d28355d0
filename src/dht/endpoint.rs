//! Peer endpoint record: the DHT value advertising every way to reach a
//! node (schema v2.0), with legacy `"ip:port"` fallback.

use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::routing::now_secs;

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid endpoint JSON: {0}")]
    Json(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid legacy format (expected 'ip:port'): {0}")]
    BadLegacy(String),

    #[error("invalid address: {0}")]
    BadAddress(String),
}

/// NAT classification from reflexive observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    None,
    Cone,
    Symmetric,
    Unknown,
}

impl NatType {
    /// Hole punching only works without NAT or behind a cone NAT; unknown
    /// is worth an attempt.
    pub fn is_punchable(&self) -> bool {
        matches!(self, NatType::None | NatType::Cone | NatType::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NatType::None => "none",
            NatType::Cone => "cone",
            NatType::Symmetric => "symmetric",
            NatType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv4Info {
    /// `host:port` on the local network.
    pub local: String,
    /// `host:port` observed beyond NAT, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nat_type: Option<NatType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv6Info {
    /// `[host]:port`.
    pub address: String,
    /// "global" | "ula" | "link-local"
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    pub available: bool,
    pub max_peers: u32,
    pub region: String,
    pub uptime: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchInfo {
    pub supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stun_port: Option<u16>,
    pub success_rate: f32,
}

/// Everything a peer advertises about how to reach it.
///
/// Stored in the DHT under the peer's node ID; the connection orchestrator
/// reads it to decide which strategies apply.
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    pub schema_version: String,
    pub node_id: NodeId,
    pub ipv4: Ipv4Info,
    pub ipv6: Option<Ipv6Info>,
    pub relay: Option<RelayInfo>,
    pub punch: Option<PunchInfo>,
    pub timestamp: f64,
}

impl PeerEndpoint {
    pub fn new(node_id: NodeId, ipv4: Ipv4Info) -> Self {
        Self {
            schema_version: "2.0".to_string(),
            node_id,
            ipv4,
            ipv6: None,
            relay: None,
            punch: None,
            timestamp: now_secs(),
        }
    }

    /// Serialize for DHT storage. Absent relay/punch blocks (and blocks
    /// with `available`/`supported` false) are omitted entirely.
    pub fn to_json(&self) -> String {
        let mut ipv4 = json!({ "local": self.ipv4.local });
        if let Some(external) = &self.ipv4.external {
            ipv4["external"] = json!(external);
        }
        if let Some(nat) = &self.ipv4.nat_type {
            ipv4["nat_type"] = json!(nat.as_str());
        }

        let mut value = json!({
            "schema_version": self.schema_version,
            "node_id": self.node_id,
            "ipv4": ipv4,
            "timestamp": self.timestamp,
        });

        if let Some(ipv6) = &self.ipv6 {
            value["ipv6"] = json!({ "address": ipv6.address, "type": ipv6.kind });
        }
        if let Some(relay) = &self.relay {
            if relay.available {
                value["relay"] = serde_json::to_value(relay).unwrap_or(Value::Null);
            }
        }
        if let Some(punch) = &self.punch {
            if punch.supported {
                value["punch"] = serde_json::to_value(punch).unwrap_or(Value::Null);
            }
        }

        value.to_string()
    }

    /// Parse a DHT value. Accepts schema 2.0 documents and 1.0 documents
    /// with only `ipv4.local`.
    pub fn from_json(text: &str) -> Result<Self, EndpointError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EndpointError::Json(e.to_string()))?;

        let node_id = value
            .get("node_id")
            .and_then(Value::as_str)
            .ok_or(EndpointError::MissingField("node_id"))?;
        let node_id = NodeId::parse(node_id).map_err(|e| EndpointError::Json(e.to_string()))?;

        let schema_version = value
            .get("schema_version")
            .and_then(Value::as_str)
            .unwrap_or("1.0")
            .to_string();

        let ipv4_value = value
            .get("ipv4")
            .ok_or(EndpointError::MissingField("ipv4.local"))?;
        let ipv4: Ipv4Info = serde_json::from_value(ipv4_value.clone())
            .map_err(|e| EndpointError::Json(e.to_string()))?;

        let ipv6 = match value.get("ipv6") {
            Some(v) => Some(
                serde_json::from_value(v.clone()).map_err(|e| EndpointError::Json(e.to_string()))?,
            ),
            None => None,
        };

        let relay: Option<RelayInfo> = match value.get("relay") {
            Some(v) if v.get("available").and_then(Value::as_bool).unwrap_or(false) => Some(
                serde_json::from_value(v.clone()).map_err(|e| EndpointError::Json(e.to_string()))?,
            ),
            _ => None,
        };

        let punch: Option<PunchInfo> = match value.get("punch") {
            Some(v) if v.get("supported").and_then(Value::as_bool).unwrap_or(false) => Some(
                serde_json::from_value(v.clone()).map_err(|e| EndpointError::Json(e.to_string()))?,
            ),
            _ => None,
        };

        Ok(Self {
            schema_version,
            node_id,
            ipv4,
            ipv6,
            relay,
            punch,
            timestamp: value
                .get("timestamp")
                .and_then(Value::as_f64)
                .unwrap_or_else(now_secs),
        })
    }

    /// Synthesize a minimal v1.0 record from a legacy `"ip:port"` value.
    pub fn from_legacy_string(node_id: NodeId, value: &str) -> Result<Self, EndpointError> {
        if !value.contains(':') {
            return Err(EndpointError::BadLegacy(value.to_string()));
        }
        Ok(Self {
            schema_version: "1.0".to_string(),
            node_id,
            ipv4: Ipv4Info {
                local: value.to_string(),
                external: None,
                nat_type: None,
            },
            ipv6: None,
            relay: None,
            punch: None,
            timestamp: now_secs(),
        })
    }

    pub fn has_ipv6(&self) -> bool {
        self.ipv6.is_some()
    }

    pub fn supports_relay(&self) -> bool {
        self.relay.as_ref().map(|r| r.available).unwrap_or(false)
    }

    pub fn supports_hole_punching(&self) -> bool {
        self.punch.as_ref().map(|p| p.supported).unwrap_or(false)
    }

    /// `(host, port)` from the IPv4 local address.
    pub fn primary_ipv4_address(&self) -> Result<(String, u16), EndpointError> {
        split_host_port(&self.ipv4.local)
    }

    /// `(host, port)` from the IPv4 external address, when advertised.
    pub fn external_ipv4_address(&self) -> Option<(String, u16)> {
        self.ipv4
            .external
            .as_deref()
            .and_then(|s| split_host_port(s).ok())
    }
}

/// Split `host:port`, keeping IPv6 brackets out of the host part.
pub fn split_host_port(addr: &str) -> Result<(String, u16), EndpointError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| EndpointError::BadAddress(addr.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| EndpointError::BadAddress(addr.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeId {
        NodeId::parse("node-abcd1234abcd1234abcd1234abcd1234").unwrap()
    }

    #[test]
    fn test_v2_roundtrip() {
        let mut ep = PeerEndpoint::new(
            node(),
            Ipv4Info {
                local: "192.168.1.100:8888".into(),
                external: Some("203.0.113.50:12345".into()),
                nat_type: Some(NatType::Cone),
            },
        );
        ep.ipv6 = Some(Ipv6Info {
            address: "[2001:db8::1]:8888".into(),
            kind: "global".into(),
        });
        ep.relay = Some(RelayInfo {
            available: true,
            max_peers: 10,
            region: "eu-central".into(),
            uptime: 0.98,
        });
        ep.punch = Some(PunchInfo {
            supported: true,
            stun_port: Some(8890),
            success_rate: 0.7,
        });

        let parsed = PeerEndpoint::from_json(&ep.to_json()).unwrap();
        assert_eq!(parsed.schema_version, "2.0");
        assert_eq!(parsed.node_id, node());
        assert!(parsed.has_ipv6());
        assert!(parsed.supports_relay());
        assert!(parsed.supports_hole_punching());
        assert_eq!(parsed.ipv4.nat_type, Some(NatType::Cone));
        assert_eq!(parsed.punch.unwrap().stun_port, Some(8890));
    }

    #[test]
    fn test_unavailable_relay_omitted() {
        let mut ep = PeerEndpoint::new(
            node(),
            Ipv4Info {
                local: "10.0.0.1:8888".into(),
                external: None,
                nat_type: None,
            },
        );
        ep.relay = Some(RelayInfo {
            available: false,
            max_peers: 0,
            region: "global".into(),
            uptime: 0.0,
        });

        let text = ep.to_json();
        assert!(!text.contains("\"relay\""));
        let parsed = PeerEndpoint::from_json(&text).unwrap();
        assert!(!parsed.supports_relay());
    }

    #[test]
    fn test_legacy_string() {
        let ep = PeerEndpoint::from_legacy_string(node(), "192.168.1.100:8888").unwrap();
        assert_eq!(ep.schema_version, "1.0");
        assert_eq!(
            ep.primary_ipv4_address().unwrap(),
            ("192.168.1.100".to_string(), 8888)
        );
        assert!(!ep.has_ipv6());
        assert!(PeerEndpoint::from_legacy_string(node(), "nonsense").is_err());
    }

    #[test]
    fn test_missing_ipv4_rejected() {
        let text = format!(r#"{{"schema_version":"2.0","node_id":"{}"}}"#, node());
        assert!(PeerEndpoint::from_json(&text).is_err());
    }

    #[test]
    fn test_split_host_port_ipv6() {
        assert_eq!(
            split_host_port("[2001:db8::1]:8888").unwrap(),
            ("2001:db8::1".to_string(), 8888)
        );
        assert_eq!(
            split_host_port("10.0.0.1:8888").unwrap(),
            ("10.0.0.1".to_string(), 8888)
        );
        assert!(split_host_port("nonsense").is_err());
    }

    #[test]
    fn test_nat_punchability() {
        assert!(NatType::None.is_punchable());
        assert!(NatType::Cone.is_punchable());
        assert!(NatType::Unknown.is_punchable());
        assert!(!NatType::Symmetric.is_punchable());
    }
}
