//! Pipe-delimited ICE server descriptor parsing
//!
//! The device side provisions ICE servers inside the offer payload as
//! compact `url|port|username|credential` strings; username/credential are
//! optional trailing fields.

use webrtc::ice_transport::ice_server::RTCIceServer;

/// A single relay (TURN) or reflection (STUN) server record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerDescriptor {
    /// Host portion as received on the wire
    pub url: String,

    /// Port portion as received on the wire
    pub port: String,

    /// Username for relay authentication
    pub username: Option<String>,

    /// Credential for relay authentication
    pub credential: Option<String>,
}

impl IceServerDescriptor {
    /// Whether this entry is a relay (TURN) server
    pub fn is_relay(&self) -> bool {
        self.url.to_lowercase().contains("turn")
    }

    /// Final transport URL handed to the peer connection
    ///
    /// Relay entries get a `turn:` scheme; reflection entries pass through
    /// unscoped, the transport layer infers the scheme from the URL shape.
    pub fn transport_url(&self) -> String {
        if self.is_relay() {
            format!("turn:{}:{}", self.url, self.port)
        } else {
            format!("{}:{}", self.url, self.port)
        }
    }

    /// Convert to the webrtc-rs ICE server representation
    pub fn to_rtc_ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: vec![self.transport_url()],
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
        }
    }
}

/// Parse a list of pipe-delimited server descriptors
///
/// Entries with an empty url or a non-numeric port are dropped, not
/// errors. Output order follows input order.
pub fn parse_ice_servers(entries: &[String]) -> Vec<IceServerDescriptor> {
    entries
        .iter()
        .filter_map(|entry| {
            let mut fields = entry.split('|');
            let url = fields.next().unwrap_or_default();
            let port = fields.next().unwrap_or_default();
            if url.is_empty() || port.parse::<u16>().is_err() {
                return None;
            }
            let username = fields.next().filter(|s| !s.is_empty());
            let credential = fields.next().filter(|s| !s.is_empty());
            Some(IceServerDescriptor {
                url: url.to_string(),
                port: port.to_string(),
                username: username.map(str::to_string),
                credential: credential.map(str::to_string),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_relay_entry_with_credentials() {
        let servers = parse_ice_servers(&entries(&["turn.example.com|3478|alice|pw123"]));
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].transport_url(), "turn:turn.example.com:3478");
        assert_eq!(servers[0].username.as_deref(), Some("alice"));
        assert_eq!(servers[0].credential.as_deref(), Some("pw123"));
    }

    #[test]
    fn test_relay_detection_is_case_insensitive() {
        let servers = parse_ice_servers(&entries(&["TURN.Example.Com|3478"]));
        assert!(servers[0].is_relay());
        assert_eq!(servers[0].transport_url(), "turn:TURN.Example.Com:3478");
    }

    #[test]
    fn test_reflection_entry_passes_through_unscoped() {
        let servers = parse_ice_servers(&entries(&["stun.example.com|19302"]));
        assert_eq!(servers.len(), 1);
        assert!(!servers[0].is_relay());
        assert_eq!(servers[0].transport_url(), "stun.example.com:19302");
        assert!(servers[0].username.is_none());
        assert!(servers[0].credential.is_none());
    }

    #[test]
    fn test_malformed_entries_are_dropped() {
        assert!(parse_ice_servers(&entries(&["", "8080|a|b"])).is_empty());
        assert!(parse_ice_servers(&entries(&["|3478"])).is_empty());
        assert!(parse_ice_servers(&entries(&["host.example.com|"])).is_empty());
        assert!(parse_ice_servers(&entries(&["host.example.com"])).is_empty());
        assert!(parse_ice_servers(&entries(&["host.example.com|port"])).is_empty());
        assert!(parse_ice_servers(&entries(&["host.example.com|99999"])).is_empty());
    }

    #[test]
    fn test_order_preserved_and_output_bounded() {
        let input = entries(&[
            "turn.example.com|3478|u|c",
            "bogus",
            "stun.example.com|19302",
        ]);
        let servers = parse_ice_servers(&input);
        assert!(servers.len() <= input.len());
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].url, "turn.example.com");
        assert_eq!(servers[1].url, "stun.example.com");
    }

    #[test]
    fn test_empty_optional_fields_become_none() {
        let servers = parse_ice_servers(&entries(&["turn.example.com|3478||"]));
        assert_eq!(servers.len(), 1);
        assert!(servers[0].username.is_none());
        assert!(servers[0].credential.is_none());
    }

    #[test]
    fn test_rtc_ice_server_conversion() {
        let servers = parse_ice_servers(&entries(&["turn.example.com|3478|alice|pw123"]));
        let rtc = servers[0].to_rtc_ice_server();
        assert_eq!(rtc.urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(rtc.username, "alice");
        assert_eq!(rtc.credential, "pw123");
    }
}
