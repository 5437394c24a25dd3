//! Wire address parsing.
//!
//! Addresses arrive in slash-delimited component form, e.g.
//! `/ip4/1.2.3.4/tcp/4001/p2p/QmFoo`. The manager only cares about two
//! pieces: the host-identifying prefix (the first ip/dns component) and an
//! optional embedded peer identity (a trailing `p2p` component). Everything
//! else is carried opaquely.

use std::fmt;
use std::str::FromStr;

use super::id::PeerId;

/// Error type for address parsing.
#[derive(Debug, PartialEq, Eq)]
pub enum AddrError {
    /// Address string was empty or all separators
    Empty,
    /// A component was structurally invalid
    Malformed(&'static str),
}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrError::Empty => write!(f, "empty address"),
            AddrError::Malformed(msg) => write!(f, "malformed address: {}", msg),
        }
    }
}

impl std::error::Error for AddrError {}

/// A parsed wire address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetAddr {
    text: String,
    host: Option<String>,
    peer: Option<PeerId>,
}

/// Component names that carry a host-identifying value.
const HOST_PROTOS: &[&str] = &["ip4", "ip6", "dns", "dns4", "dns6", "dnsaddr"];

/// Component names that take one value argument.
const VALUE_PROTOS: &[&str] = &[
    "ip4", "ip6", "dns", "dns4", "dns6", "dnsaddr", "tcp", "udp", "p2p", "ipfs", "unix", "sni",
];

/// Component names that stand alone.
const MARKER_PROTOS: &[&str] = &["quic", "quic-v1", "ws", "wss", "tls", "webtransport", "p2p-circuit"];

impl NetAddr {
    /// Parse an address from its slash-delimited text form.
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        let mut host = None;
        let mut peer = None;

        let mut parts = s.trim_end_matches('/').split('/');
        // a leading slash yields one empty part
        match parts.next() {
            Some("") | None => {}
            Some(_) => return Err(AddrError::Malformed("missing leading slash")),
        }

        let mut saw_any = false;
        while let Some(proto) = parts.next() {
            if proto.is_empty() {
                return Err(AddrError::Malformed("empty component"));
            }
            saw_any = true;

            if MARKER_PROTOS.contains(&proto) {
                continue;
            }
            if !VALUE_PROTOS.contains(&proto) {
                return Err(AddrError::Malformed("unknown component"));
            }
            let val = match parts.next() {
                Some(v) if !v.is_empty() => v,
                _ => return Err(AddrError::Malformed("component missing value")),
            };
            if HOST_PROTOS.contains(&proto) && host.is_none() {
                host = Some(val.to_string());
            }
            if proto == "p2p" || proto == "ipfs" {
                peer = Some(PeerId::from(val));
            }
        }

        if !saw_any {
            return Err(AddrError::Empty);
        }

        Ok(Self {
            text: s.to_string(),
            host,
            peer,
        })
    }

    /// The host-identifying prefix, if the address has one.
    pub fn host_prefix(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// The peer identity embedded in the address, if any.
    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }
}

impl FromStr for NetAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let a = NetAddr::parse("/ip4/1.2.3.4/tcp/4001").unwrap();
        assert_eq!(a.host_prefix(), Some("1.2.3.4"));
        assert_eq!(a.peer_id(), None);
        assert_eq!(a.to_string(), "/ip4/1.2.3.4/tcp/4001");
    }

    #[test]
    fn test_parse_embedded_peer() {
        let a = NetAddr::parse("/ip4/4.3.2.1/tcp/4001/p2p/QmPeer").unwrap();
        assert_eq!(a.host_prefix(), Some("4.3.2.1"));
        assert_eq!(a.peer_id().map(|p| p.as_str()), Some("QmPeer"));
    }

    #[test]
    fn test_parse_host_only() {
        let a = NetAddr::parse("/ip4/1.2.3.4").unwrap();
        assert_eq!(a.host_prefix(), Some("1.2.3.4"));
    }

    #[test]
    fn test_parse_dns_with_markers() {
        let a = NetAddr::parse("/dns4/node.example.org/tcp/443/wss").unwrap();
        assert_eq!(a.host_prefix(), Some("node.example.org"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(NetAddr::parse(""), Err(AddrError::Empty));
        assert_eq!(NetAddr::parse("/"), Err(AddrError::Empty));
        assert!(NetAddr::parse("1.2.3.4").is_err());
        assert!(NetAddr::parse("/ip4").is_err());
        assert!(NetAddr::parse("/bogus/x").is_err());
    }
}
