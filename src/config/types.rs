//! Limit configuration type definitions.
//!
//! A [`BaseLimit`] is the limit vector enforced by a single scope. A
//! [`LimitConfig`] carries one vector per scope tier plus per-key override
//! maps. [`DefaultLimitConfig`] holds base vectors and memory-scaling rules
//! and produces a concrete `LimitConfig` once the host's available memory
//! and file-descriptor budget are known.

use std::collections::HashMap;

use crate::common::id::{PeerId, ProtocolId};

/// Limit vector for one scope. All fields are absolute caps; a zero means
/// no capacity for that field. `memory` is in bytes, the rest are counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BaseLimit {
    pub memory: i64,
    pub streams_inbound: i64,
    pub streams_outbound: i64,
    pub streams: i64,
    pub conns_inbound: i64,
    pub conns_outbound: i64,
    pub conns: i64,
    pub fd: i64,
}

/// Memory-limit scaling rule for one tier: `fraction` of the host's
/// available memory, clamped to `[min, max]` bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemoryLimit {
    pub fraction: f64,
    pub min: i64,
    pub max: i64,
}

impl MemoryLimit {
    /// Compute the concrete byte limit for `available` bytes of host memory.
    pub fn compute(&self, available: i64) -> i64 {
        let scaled = (self.fraction * available as f64) as i64;
        scaled.clamp(self.min, self.max)
    }
}

/// Concrete limits for every scope tier, with per-key overrides.
#[derive(Clone, Debug)]
pub struct LimitConfig {
    pub system: BaseLimit,
    pub transient: BaseLimit,
    pub allowlisted_system: BaseLimit,
    pub allowlisted_transient: BaseLimit,
    pub service_default: BaseLimit,
    pub service_peer_default: BaseLimit,
    pub protocol_default: BaseLimit,
    pub protocol_peer_default: BaseLimit,
    pub peer_default: BaseLimit,
    pub conn: BaseLimit,
    pub stream: BaseLimit,

    /// Per-service overrides of `service_default`.
    pub service: HashMap<String, BaseLimit>,
    /// Per-service overrides of `service_peer_default`.
    pub service_peer: HashMap<String, BaseLimit>,
    /// Per-protocol overrides of `protocol_default`.
    pub protocol: HashMap<ProtocolId, BaseLimit>,
    /// Per-protocol overrides of `protocol_peer_default`.
    pub protocol_peer: HashMap<ProtocolId, BaseLimit>,
    /// Per-peer overrides of `peer_default`.
    pub peer: HashMap<PeerId, BaseLimit>,
}

impl LimitConfig {
    pub fn peer_limit(&self, p: &PeerId) -> BaseLimit {
        self.peer.get(p).copied().unwrap_or(self.peer_default)
    }

    pub fn protocol_limit(&self, proto: &ProtocolId) -> BaseLimit {
        self.protocol
            .get(proto)
            .copied()
            .unwrap_or(self.protocol_default)
    }

    pub fn protocol_peer_limit(&self, proto: &ProtocolId) -> BaseLimit {
        self.protocol_peer
            .get(proto)
            .copied()
            .unwrap_or(self.protocol_peer_default)
    }

    pub fn service_limit(&self, svc: &str) -> BaseLimit {
        self.service
            .get(svc)
            .copied()
            .unwrap_or(self.service_default)
    }

    pub fn service_peer_limit(&self, svc: &str) -> BaseLimit {
        self.service_peer
            .get(svc)
            .copied()
            .unwrap_or(self.service_peer_default)
    }
}

impl Default for LimitConfig {
    /// A usable out-of-the-box configuration: the conservative preset
    /// scaled for 1 GiB of memory and 512 file descriptors.
    fn default() -> Self {
        DefaultLimitConfig::conservative().scale(1 << 30, 512)
    }
}

/// Base limits plus memory-scaling rules, prior to knowing the host's
/// resources. Call [`DefaultLimitConfig::scale`] once at startup.
#[derive(Clone, Debug)]
pub struct DefaultLimitConfig {
    pub system_base: BaseLimit,
    pub system_memory: MemoryLimit,

    pub transient_base: BaseLimit,
    pub transient_memory: MemoryLimit,

    pub service_base: BaseLimit,
    pub service_memory: MemoryLimit,

    pub service_peer_base: BaseLimit,
    pub service_peer_memory: MemoryLimit,

    pub protocol_base: BaseLimit,
    pub protocol_memory: MemoryLimit,

    pub protocol_peer_base: BaseLimit,
    pub protocol_peer_memory: MemoryLimit,

    pub peer_base: BaseLimit,
    pub peer_memory: MemoryLimit,

    pub conn_base: BaseLimit,
    pub conn_memory: i64,

    pub stream_base: BaseLimit,
    pub stream_memory: i64,
}

impl DefaultLimitConfig {
    /// The conservative preset. Suitable for hosts sharing resources with
    /// other workloads.
    pub fn conservative() -> Self {
        Self {
            system_base: BaseLimit {
                memory: 0,
                streams_inbound: 4096 << 2,
                streams_outbound: 16384 << 2,
                streams: 16384 << 2,
                conns_inbound: 256 << 2,
                conns_outbound: 1024 << 2,
                conns: 1024 << 2,
                fd: 512 << 2,
            },
            system_memory: MemoryLimit {
                fraction: 0.125,
                min: 128 << 22,
                max: 1 << 32,
            },

            transient_base: BaseLimit {
                memory: 0,
                streams_inbound: 128 << 2,
                streams_outbound: 512 << 2,
                streams: 512 << 2,
                conns_inbound: 32 << 2,
                conns_outbound: 128 << 2,
                conns: 128 << 2,
                fd: 128 << 2,
            },
            transient_memory: MemoryLimit {
                fraction: 1.0,
                min: 64 << 22,
                max: 64 << 22,
            },

            service_base: BaseLimit {
                memory: 0,
                streams_inbound: 2048 << 2,
                streams_outbound: 8192 << 2,
                streams: 8192 << 2,
                ..BaseLimit::default()
            },
            service_memory: MemoryLimit {
                fraction: 0.125 / 4.0,
                min: 64 << 22,
                max: 256 << 22,
            },

            service_peer_base: BaseLimit {
                memory: 0,
                streams_inbound: 256 << 2,
                streams_outbound: 512 << 2,
                streams: 512 << 2,
                ..BaseLimit::default()
            },
            service_peer_memory: MemoryLimit {
                fraction: 0.125 / 16.0,
                min: 16 << 22,
                max: 64 << 22,
            },

            protocol_base: BaseLimit {
                memory: 0,
                streams_inbound: 1024 << 2,
                streams_outbound: 4096 << 2,
                streams: 4096 << 2,
                ..BaseLimit::default()
            },
            protocol_memory: MemoryLimit {
                fraction: 0.125 / 8.0,
                min: 64 << 22,
                max: 128 << 22,
            },

            protocol_peer_base: BaseLimit {
                memory: 0,
                streams_inbound: 128 << 2,
                streams_outbound: 256 << 2,
                streams: 512 << 2,
                ..BaseLimit::default()
            },
            protocol_peer_memory: MemoryLimit {
                fraction: 0.125 / 16.0,
                min: 16 << 22,
                max: 64 << 22,
            },

            peer_base: BaseLimit {
                memory: 0,
                streams_inbound: 512 << 2,
                streams_outbound: 1024 << 2,
                streams: 1024 << 2,
                conns_inbound: 8 << 2,
                conns_outbound: 16 << 2,
                conns: 16 << 2,
                fd: 8 << 2,
            },
            peer_memory: MemoryLimit {
                fraction: 0.125 / 16.0,
                min: 64 << 22,
                max: 128 << 22,
            },

            conn_base: BaseLimit {
                conns_inbound: 1 << 2,
                conns_outbound: 1 << 2,
                conns: 1 << 2,
                fd: 1 << 2,
                ..BaseLimit::default()
            },
            conn_memory: 1 << 22,

            stream_base: BaseLimit {
                streams_inbound: 1 << 2,
                streams_outbound: 1 << 2,
                streams: 1 << 2,
                ..BaseLimit::default()
            },
            stream_memory: 16 << 22,
        }
    }

    /// The generous preset: four times the conservative counts and
    /// four times its memory floors and ceilings. For dedicated hosts.
    pub fn generous() -> Self {
        let mut cfg = Self::conservative();

        fn quadruple(b: &mut BaseLimit) {
            b.streams_inbound <<= 2;
            b.streams_outbound <<= 2;
            b.streams <<= 2;
            b.conns_inbound <<= 2;
            b.conns_outbound <<= 2;
            b.conns <<= 2;
            b.fd <<= 2;
        }
        fn widen(m: &mut MemoryLimit) {
            m.min <<= 2;
            m.max <<= 2;
        }

        quadruple(&mut cfg.system_base);
        quadruple(&mut cfg.transient_base);
        quadruple(&mut cfg.service_base);
        quadruple(&mut cfg.service_peer_base);
        quadruple(&mut cfg.protocol_base);
        quadruple(&mut cfg.protocol_peer_base);
        quadruple(&mut cfg.peer_base);
        quadruple(&mut cfg.conn_base);
        quadruple(&mut cfg.stream_base);

        widen(&mut cfg.system_memory);
        widen(&mut cfg.transient_memory);
        widen(&mut cfg.service_memory);
        widen(&mut cfg.service_peer_memory);
        widen(&mut cfg.protocol_memory);
        widen(&mut cfg.protocol_peer_memory);
        widen(&mut cfg.peer_memory);
        cfg.conn_memory <<= 2;
        cfg.stream_memory <<= 2;

        cfg
    }

    /// Replace the system tier's memory rule and rescale every subordinate
    /// tier's fraction so relative proportions are preserved.
    pub fn with_system_memory(&self, mem_fraction: f64, min: i64, max: i64) -> Self {
        let refactor = mem_fraction / self.system_memory.fraction;
        let mut cfg = self.clone();
        cfg.system_memory = MemoryLimit {
            fraction: mem_fraction,
            min,
            max,
        };
        cfg.transient_memory.fraction *= refactor;
        cfg.service_memory.fraction *= refactor;
        cfg.service_peer_memory.fraction *= refactor;
        cfg.protocol_memory.fraction *= refactor;
        cfg.protocol_peer_memory.fraction *= refactor;
        cfg.peer_memory.fraction *= refactor;
        cfg
    }

    /// Produce concrete limits for a host with `memory` bytes available to
    /// the stack and `num_fds` file descriptors budgeted for it.
    pub fn scale(&self, memory: i64, num_fds: i64) -> LimitConfig {
        fn with_memory(base: BaseLimit, memory: i64) -> BaseLimit {
            BaseLimit { memory, ..base }
        }

        let mut system = with_memory(self.system_base, self.system_memory.compute(memory));
        system.fd = num_fds;

        let mut transient = with_memory(self.transient_base, self.transient_memory.compute(memory));
        transient.fd = transient.fd.min(num_fds);

        LimitConfig {
            system,
            transient,
            allowlisted_system: system,
            allowlisted_transient: transient,
            service_default: with_memory(self.service_base, self.service_memory.compute(memory)),
            service_peer_default: with_memory(
                self.service_peer_base,
                self.service_peer_memory.compute(memory),
            ),
            protocol_default: with_memory(self.protocol_base, self.protocol_memory.compute(memory)),
            protocol_peer_default: with_memory(
                self.protocol_peer_base,
                self.protocol_peer_memory.compute(memory),
            ),
            peer_default: with_memory(self.peer_base, self.peer_memory.compute(memory)),
            conn: with_memory(self.conn_base, self.conn_memory),
            stream: with_memory(self.stream_base, self.stream_memory),
            service: HashMap::new(),
            service_peer: HashMap::new(),
            protocol: HashMap::new(),
            protocol_peer: HashMap::new(),
            peer: HashMap::new(),
        }
    }
}

impl Default for DefaultLimitConfig {
    fn default() -> Self {
        Self::conservative()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_clamps_memory() {
        let cfg = DefaultLimitConfig::conservative();
        let lc = cfg.scale(1 << 30, 100);

        // 0.125 * 1GiB = 128MiB, below the 512MiB floor
        assert_eq!(lc.system.memory, 128 << 22);
        // transient takes the whole gigabyte but caps at 256MiB
        assert_eq!(lc.transient.memory, 64 << 22);
        assert_eq!(lc.system.fd, 100);
        assert_eq!(lc.transient.fd, 100);
        assert_eq!(lc.conn.memory, 1 << 22);
        assert_eq!(lc.stream.memory, 16 << 22);
        // allowlisted tree mirrors the primary one until overridden
        assert_eq!(lc.allowlisted_system, lc.system);
    }

    #[test]
    fn test_scale_large_host() {
        let cfg = DefaultLimitConfig::conservative();
        let lc = cfg.scale(64 << 30, 8192);

        // 0.125 * 64GiB = 8GiB, above the 4GiB cap
        assert_eq!(lc.system.memory, 1 << 32);
        assert_eq!(lc.system.fd, 8192);
        // transient base fd (512) is below the host budget, keep it
        assert_eq!(lc.transient.fd, 512);
    }

    #[test]
    fn test_generous_is_strictly_wider() {
        let c = DefaultLimitConfig::conservative();
        let g = DefaultLimitConfig::generous();
        assert_eq!(g.system_base.streams, c.system_base.streams << 2);
        assert_eq!(g.system_memory.max, c.system_memory.max << 2);
        assert_eq!(g.conn_memory, c.conn_memory << 2);
    }

    #[test]
    fn test_with_system_memory_preserves_proportions() {
        let cfg = DefaultLimitConfig::conservative();
        let ratio = cfg.service_memory.fraction / cfg.system_memory.fraction;

        let scaled = cfg.with_system_memory(0.25, 1 << 30, 1 << 33);
        assert_eq!(scaled.system_memory.fraction, 0.25);
        let new_ratio = scaled.service_memory.fraction / scaled.system_memory.fraction;
        assert!((ratio - new_ratio).abs() < 1e-9);
    }

    #[test]
    fn test_overrides_fall_back_to_defaults() {
        let mut lc = LimitConfig::default();
        let special = BaseLimit {
            streams_inbound: 7,
            ..BaseLimit::default()
        };
        lc.peer.insert(PeerId::from("A"), special);

        assert_eq!(lc.peer_limit(&PeerId::from("A")), special);
        assert_eq!(lc.peer_limit(&PeerId::from("B")), lc.peer_default);
        assert_eq!(lc.service_limit("nosuch"), lc.service_default);
    }
}
