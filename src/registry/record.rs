use serde::{Deserialize, Serialize};
use std::net::{IpAddr, UdpSocket};
use std::path::PathBuf;

use crate::paths::Paths;

/// Id of the supervisor's own control-plane entry.
pub const HUB_ID: &str = "hub";

pub const DEFAULT_ADVERTISER: &str = "bonjour";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BridgeKind {
    Hub,
    Bridge,
    Dev,
}

impl BridgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeKind::Hub => "hub",
            BridgeKind::Bridge => "bridge",
            BridgeKind::Dev => "dev",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Persisted desired configuration of one worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BridgeRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BridgeKind,
    pub display: String,
    pub port: u16,
    pub pin: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortRange>,
    /// Seconds the engine waits before publishing; opaque to the supervisor.
    #[serde(default)]
    pub autostart: u32,
    #[serde(default = "default_advertiser")]
    pub advertiser: String,
}

fn default_advertiser() -> String {
    DEFAULT_ADVERTISER.to_string()
}

impl BridgeRecord {
    pub fn is_hub(&self) -> bool {
        self.id == HUB_ID
    }

    /// Attach the derived, never-persisted fields.
    pub fn describe(&self, paths: &Paths) -> BridgeInfo {
        let extensions = paths.extensions_dir(&self.id);
        let has_extensions = std::fs::read_dir(&extensions)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);

        BridgeInfo {
            record: self.clone(),
            host: primary_ipv4().map(|ip| ip.to_string()),
            plugins: has_extensions.then_some(extensions),
        }
    }
}

/// A record plus derived runtime facts, as served to clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BridgeInfo {
    #[serde(flatten)]
    pub record: BridgeRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<PathBuf>,
}

/// Turn a display name into a bridge id.
///
/// Lowercases, collapses every run of non-alphanumeric characters into a
/// single `-` and trims dashes from both ends.
pub fn sanitize_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !id.is_empty() {
                id.push('-');
            }
            pending_dash = false;
            id.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }

    id
}

/// `AA:BB:CC:DD:EE:FF`, case-insensitive.
pub fn is_valid_username(username: &str) -> bool {
    let octets: Vec<&str> = username.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Normalise a supplied username, or derive a stable one from the bridge id.
pub fn resolve_username(id: &str, supplied: Option<&str>) -> String {
    match supplied.map(str::trim) {
        Some(u) if is_valid_username(u) => u.to_ascii_uppercase(),
        _ => generate_username(id),
    }
}

/// Deterministic pairing username for an id (FNV-1a over the id bytes).
pub fn generate_username(id: &str) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = id
        .bytes()
        .fold(OFFSET, |acc, b| (acc ^ u64::from(b)).wrapping_mul(PRIME));

    let mut octets = [0u8; 6];
    octets.copy_from_slice(&hash.to_be_bytes()[2..]);
    // locally administered, unicast
    octets[0] = (octets[0] | 0x02) & 0xfe;

    octets
        .iter()
        .map(|o| format!("{o:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Primary non-loopback IPv4 address of this host.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn primary_ipv4() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (ip.is_ipv4() && !ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_separators() {
        assert_eq!(sanitize_id("Kitchen"), "kitchen");
        assert_eq!(sanitize_id("  Living   Room!! "), "living-room");
        assert_eq!(sanitize_id("Garage_Door-2"), "garage-door-2");
        assert_eq!(sanitize_id("---"), "");
    }

    #[test]
    fn username_validation() {
        assert!(is_valid_username("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_username("0a:1b:2c:3d:4e:5f"));
        assert!(!is_valid_username("AA:BB:CC:DD:EE"));
        assert!(!is_valid_username("AA:BB:CC:DD:EE:FG"));
        assert!(!is_valid_username("AAA:BB:CC:DD:EE:F"));
    }

    #[test]
    fn generated_username_is_deterministic_and_valid() {
        let a = generate_username("kitchen");
        let b = generate_username("kitchen");
        let c = generate_username("garage");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(is_valid_username(&a));

        let first = u8::from_str_radix(&a[..2], 16).unwrap();
        assert_eq!(first & 0x01, 0);
        assert_eq!(first & 0x02, 0x02);
    }

    #[test]
    fn resolve_username_prefers_valid_input() {
        assert_eq!(
            resolve_username("kitchen", Some("aa:bb:cc:dd:ee:ff")),
            "AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(
            resolve_username("kitchen", Some("garbage")),
            generate_username("kitchen")
        );
        assert_eq!(resolve_username("kitchen", None), generate_username("kitchen"));
    }

    #[test]
    fn record_wire_shape() {
        let record = BridgeRecord {
            id: "kitchen".into(),
            kind: BridgeKind::Bridge,
            display: "Kitchen".into(),
            port: 51828,
            pin: "031-45-154".into(),
            username: "AA:BB:CC:DD:EE:FF".into(),
            ports: None,
            autostart: 0,
            advertiser: "bonjour".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "bridge");
        assert!(json.get("ports").is_none());

        let parsed: BridgeRecord = serde_json::from_value(serde_json::json!({
            "id": "kitchen",
            "type": "bridge",
            "display": "Kitchen",
            "port": 51828,
            "pin": "031-45-154",
            "username": "AA:BB:CC:DD:EE:FF"
        }))
        .unwrap();
        assert_eq!(parsed.advertiser, DEFAULT_ADVERTISER);
        assert_eq!(parsed.autostart, 0);
    }

    #[test]
    fn describe_reports_extensions_only_when_installed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let record = BridgeRecord {
            id: "kitchen".into(),
            kind: BridgeKind::Bridge,
            display: "Kitchen".into(),
            port: 51828,
            pin: "031-45-154".into(),
            username: generate_username("kitchen"),
            ports: None,
            autostart: 0,
            advertiser: "bonjour".into(),
        };

        assert!(record.describe(&paths).plugins.is_none());

        let ext = paths.extensions_dir("kitchen");
        std::fs::create_dir_all(ext.join("some-extension")).unwrap();
        assert_eq!(record.describe(&paths).plugins, Some(ext));
    }
}
