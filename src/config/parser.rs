//! Configuration file parser.
//!
//! Parses `section.key = value` configuration files with a custom
//! lightweight parser. Limit sections override the scaled defaults, e.g.:
//!
//! ```text
//! manager.gc_interval_ms = 10000
//! system.conns_inbound = 1024
//! peer_default.fd = 16
//! peer.QmFoo.streams_inbound = 64      # per-key override
//! allowlist.add = "/ip4/1.2.3.4"
//! ```

use std::{fs, io};

use crate::common::addr::NetAddr;
use crate::common::id::{PeerId, ProtocolId};

use super::types::{BaseLimit, LimitConfig};

/// Everything needed to construct a manager, as read from a config file.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub limits: LimitConfig,
    pub gc_interval_ms: u64,
    pub allowlist: Vec<NetAddr>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            limits: LimitConfig::default(),
            gc_interval_ms: 10_000,
            allowlist: Vec::new(),
        }
    }
}

/// Load configuration from a file path.
pub fn load_config(path: &str) -> io::Result<ManagerConfig> {
    let s = fs::read_to_string(path)?;
    parse_config(&s)
}

/// Parse configuration from a string.
pub fn parse_config(s: &str) -> io::Result<ManagerConfig> {
    let mut cfg = ManagerConfig::default();

    for (lineno, line) in s.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((lhs, rhs)) = line.split_once('=') else {
            continue;
        };
        let lhs = lhs.trim();
        let mut val = rhs.trim();
        if let Some((v, _comment)) = val.split_once('#') {
            val = v.trim();
        }

        let Some((section, key)) = lhs.split_once('.') else {
            continue;
        };

        set_config_value(section.trim(), key.trim(), val, &mut cfg).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line {}: {}", lineno + 1, e),
            )
        })?;
    }

    Ok(cfg)
}

/// Set a configuration value based on section, key, and value strings.
fn set_config_value(
    section: &str,
    key: &str,
    val: &str,
    cfg: &mut ManagerConfig,
) -> Result<(), String> {
    macro_rules! parse {
        (u) => {
            val.parse::<u64>().map_err(|e| e.to_string())?
        };
        (s) => {
            val.trim_matches('"').to_string()
        };
    }

    let lc = &mut cfg.limits;
    match section {
        "manager" => match key {
            "gc_interval_ms" => cfg.gc_interval_ms = parse!(u),
            _ => return Err(format!("unknown manager key: {}", key)),
        },
        "allowlist" => match key {
            "add" => {
                let addr = NetAddr::parse(&parse!(s)).map_err(|e| e.to_string())?;
                cfg.allowlist.push(addr);
            }
            _ => return Err(format!("unknown allowlist key: {}", key)),
        },

        // base tiers
        "system" => set_limit_field(&mut lc.system, key, val)?,
        "transient" => set_limit_field(&mut lc.transient, key, val)?,
        "allowlisted_system" => set_limit_field(&mut lc.allowlisted_system, key, val)?,
        "allowlisted_transient" => set_limit_field(&mut lc.allowlisted_transient, key, val)?,
        "service_default" => set_limit_field(&mut lc.service_default, key, val)?,
        "service_peer_default" => set_limit_field(&mut lc.service_peer_default, key, val)?,
        "protocol_default" => set_limit_field(&mut lc.protocol_default, key, val)?,
        "protocol_peer_default" => set_limit_field(&mut lc.protocol_peer_default, key, val)?,
        "peer_default" => set_limit_field(&mut lc.peer_default, key, val)?,
        "conn" => set_limit_field(&mut lc.conn, key, val)?,
        "stream" => set_limit_field(&mut lc.stream, key, val)?,

        // per-key override tiers: the key is "<id>.<field>", where the id
        // itself may contain dots
        "service" => {
            let (id, field) = split_override(key)?;
            let base = lc.service_default;
            set_limit_field(lc.service.entry(id.to_string()).or_insert(base), field, val)?;
        }
        "service_peer" => {
            let (id, field) = split_override(key)?;
            let base = lc.service_peer_default;
            set_limit_field(
                lc.service_peer.entry(id.to_string()).or_insert(base),
                field,
                val,
            )?;
        }
        "protocol" => {
            let (id, field) = split_override(key)?;
            let base = lc.protocol_default;
            set_limit_field(
                lc.protocol.entry(ProtocolId::from(id)).or_insert(base),
                field,
                val,
            )?;
        }
        "protocol_peer" => {
            let (id, field) = split_override(key)?;
            let base = lc.protocol_peer_default;
            set_limit_field(
                lc.protocol_peer.entry(ProtocolId::from(id)).or_insert(base),
                field,
                val,
            )?;
        }
        "peer" => {
            let (id, field) = split_override(key)?;
            let base = lc.peer_default;
            set_limit_field(lc.peer.entry(PeerId::from(id)).or_insert(base), field, val)?;
        }

        _ => return Err(format!("unknown section: {}", section)),
    }
    Ok(())
}

/// Split an override key `<id>.<field>` on its last dot.
fn split_override(key: &str) -> Result<(&str, &str), String> {
    key.rsplit_once('.')
        .ok_or_else(|| format!("override key needs <id>.<field>: {}", key))
}

/// Set one field of a limit vector.
fn set_limit_field(limit: &mut BaseLimit, field: &str, val: &str) -> Result<(), String> {
    let v = val.parse::<i64>().map_err(|e| e.to_string())?;
    if v < 0 {
        return Err(format!("limit must be non-negative: {}", val));
    }
    match field {
        "memory" => limit.memory = v,
        "streams_inbound" => limit.streams_inbound = v,
        "streams_outbound" => limit.streams_outbound = v,
        "streams" => limit.streams = v,
        "conns_inbound" => limit.conns_inbound = v,
        "conns_outbound" => limit.conns_outbound = v,
        "conns" => limit.conns = v,
        "fd" => limit.fd = v,
        _ => return Err(format!("unknown limit field: {}", field)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base_and_manager() {
        let cfg = parse_config(
            "# comment\n\
             manager.gc_interval_ms = 5000\n\
             system.conns_inbound = 64   # trailing comment\n\
             transient.fd = 8\n",
        )
        .unwrap();
        assert_eq!(cfg.gc_interval_ms, 5000);
        assert_eq!(cfg.limits.system.conns_inbound, 64);
        assert_eq!(cfg.limits.transient.fd, 8);
    }

    #[test]
    fn test_parse_overrides_with_dotted_ids() {
        let cfg = parse_config(
            "service.A.svc.streams_inbound = 2\n\
             peer.QmFoo.fd = 1\n\
             protocol_peer./proto/1.0.0.streams = 4\n",
        )
        .unwrap();
        assert_eq!(cfg.limits.service["A.svc"].streams_inbound, 2);
        assert_eq!(cfg.limits.peer[&PeerId::from("QmFoo")].fd, 1);
        assert_eq!(
            cfg.limits.protocol_peer[&ProtocolId::from("/proto/1.0.0")].streams,
            4
        );
    }

    #[test]
    fn test_parse_allowlist() {
        let cfg = parse_config(
            "allowlist.add = \"/ip4/1.2.3.4\"\n\
             allowlist.add = \"/ip4/4.3.2.1/p2p/QmPeer\"\n",
        )
        .unwrap();
        assert_eq!(cfg.allowlist.len(), 2);
        assert_eq!(cfg.allowlist[0].host_prefix(), Some("1.2.3.4"));
        assert_eq!(
            cfg.allowlist[1].peer_id().map(|p| p.as_str()),
            Some("QmPeer")
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_config("system.bogus = 1\n").is_err());
        assert!(parse_config("system.fd = -1\n").is_err());
        assert!(parse_config("nosuch.fd = 1\n").is_err());
        assert!(parse_config("peer.fd = 1\n").is_err()); // missing id
    }
}
