//! Per-scope resource accounting.
//!
//! A [`Resources`] account holds the usage counters of one scope and checks
//! prospective additions against the scope's limit vector. Checks are
//! all-or-nothing: either every field of a delta fits and all of them are
//! committed, or nothing is mutated and the first failing field is
//! reported.

use log::error;

use crate::common::error::{ResourceError, ResourceKind};
use crate::config::types::BaseLimit;

/// Direction of a connection or stream relative to the local host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Point-in-time usage of a scope. The same shape serves as the delta
/// vector charged and released along scope chains.
///
/// Total streams and connections are the sums of the directional fields;
/// they are checked against the total limits but not stored separately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScopeStat {
    pub streams_inbound: i64,
    pub streams_outbound: i64,
    pub conns_inbound: i64,
    pub conns_outbound: i64,
    pub fd: i64,
    pub memory: i64,
}

impl ScopeStat {
    /// The charge for one stream.
    pub fn stream(dir: Direction) -> Self {
        match dir {
            Direction::Inbound => Self {
                streams_inbound: 1,
                ..Self::default()
            },
            Direction::Outbound => Self {
                streams_outbound: 1,
                ..Self::default()
            },
        }
    }

    /// The charge for one connection, optionally consuming a file
    /// descriptor.
    pub fn conn(dir: Direction, use_fd: bool) -> Self {
        let mut stat = match dir {
            Direction::Inbound => Self {
                conns_inbound: 1,
                ..Self::default()
            },
            Direction::Outbound => Self {
                conns_outbound: 1,
                ..Self::default()
            },
        };
        if use_fd {
            stat.fd = 1;
        }
        stat
    }

    /// The charge for a memory reservation of `n` bytes.
    pub fn memory(n: i64) -> Self {
        Self {
            memory: n,
            ..Self::default()
        }
    }

    pub fn streams(&self) -> i64 {
        self.streams_inbound + self.streams_outbound
    }

    pub fn conns(&self) -> i64 {
        self.conns_inbound + self.conns_outbound
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Priority tags for memory reservations. A reservation of priority `p`
/// only succeeds while a scope's memory usage stays within
/// `(p+1)/256` of its limit, so low-priority users are shed first under
/// pressure.
pub const PRIORITY_LOW: u8 = 101;
pub const PRIORITY_MEDIUM: u8 = 152;
pub const PRIORITY_HIGH: u8 = 203;
pub const PRIORITY_ALWAYS: u8 = 255;

/// Usage counters checked against a limit vector.
#[derive(Debug)]
pub struct Resources {
    limit: BaseLimit,
    used: ScopeStat,
}

impl Resources {
    pub fn new(limit: BaseLimit) -> Self {
        Self {
            limit,
            used: ScopeStat::default(),
        }
    }

    pub fn limit(&self) -> &BaseLimit {
        &self.limit
    }

    pub fn stat(&self) -> ScopeStat {
        self.used
    }

    /// Test-and-add `delta` against the limit vector. Every field is
    /// verified before any is committed; on failure nothing is mutated and
    /// the first failing field is reported against `label`.
    pub fn reserve(
        &mut self,
        label: &str,
        delta: &ScopeStat,
        prio: u8,
    ) -> Result<(), ResourceError> {
        let lim = &self.limit;
        let used = &self.used;

        if delta.memory > 0 {
            // the priority threshold scales the limit; 255 admits up to the
            // full limit
            let threshold = ((1 + prio as i128) * lim.memory as i128 / 256) as i64;
            if used.memory + delta.memory > threshold {
                return Err(limit_err(
                    label,
                    ResourceKind::Memory,
                    used.memory,
                    delta.memory,
                    lim.memory,
                ));
            }
        }
        if delta.streams_inbound > 0 && used.streams_inbound + delta.streams_inbound > lim.streams_inbound
        {
            return Err(limit_err(
                label,
                ResourceKind::StreamsInbound,
                used.streams_inbound,
                delta.streams_inbound,
                lim.streams_inbound,
            ));
        }
        if delta.streams_outbound > 0
            && used.streams_outbound + delta.streams_outbound > lim.streams_outbound
        {
            return Err(limit_err(
                label,
                ResourceKind::StreamsOutbound,
                used.streams_outbound,
                delta.streams_outbound,
                lim.streams_outbound,
            ));
        }
        if delta.streams() > 0 && used.streams() + delta.streams() > lim.streams {
            return Err(limit_err(
                label,
                ResourceKind::Streams,
                used.streams(),
                delta.streams(),
                lim.streams,
            ));
        }
        if delta.conns_inbound > 0 && used.conns_inbound + delta.conns_inbound > lim.conns_inbound {
            return Err(limit_err(
                label,
                ResourceKind::ConnsInbound,
                used.conns_inbound,
                delta.conns_inbound,
                lim.conns_inbound,
            ));
        }
        if delta.conns_outbound > 0
            && used.conns_outbound + delta.conns_outbound > lim.conns_outbound
        {
            return Err(limit_err(
                label,
                ResourceKind::ConnsOutbound,
                used.conns_outbound,
                delta.conns_outbound,
                lim.conns_outbound,
            ));
        }
        if delta.conns() > 0 && used.conns() + delta.conns() > lim.conns {
            return Err(limit_err(
                label,
                ResourceKind::Conns,
                used.conns(),
                delta.conns(),
                lim.conns,
            ));
        }
        if delta.fd > 0 && used.fd + delta.fd > lim.fd {
            return Err(limit_err(label, ResourceKind::Fd, used.fd, delta.fd, lim.fd));
        }

        // all fields fit, commit
        self.used.streams_inbound += delta.streams_inbound;
        self.used.streams_outbound += delta.streams_outbound;
        self.used.conns_inbound += delta.conns_inbound;
        self.used.conns_outbound += delta.conns_outbound;
        self.used.fd += delta.fd;
        self.used.memory += delta.memory;
        Ok(())
    }

    /// Subtract `delta` from the usage counters. Each field must stay
    /// non-negative; an underflow is a programmer error and panics in
    /// debug builds, clamps to zero in release.
    pub fn release(&mut self, label: &str, delta: &ScopeStat) {
        self.used.streams_inbound =
            sub_clamped(label, "streams-inbound", self.used.streams_inbound, delta.streams_inbound);
        self.used.streams_outbound = sub_clamped(
            label,
            "streams-outbound",
            self.used.streams_outbound,
            delta.streams_outbound,
        );
        self.used.conns_inbound =
            sub_clamped(label, "conns-inbound", self.used.conns_inbound, delta.conns_inbound);
        self.used.conns_outbound = sub_clamped(
            label,
            "conns-outbound",
            self.used.conns_outbound,
            delta.conns_outbound,
        );
        self.used.fd = sub_clamped(label, "fd", self.used.fd, delta.fd);
        self.used.memory = sub_clamped(label, "memory", self.used.memory, delta.memory);
    }
}

fn limit_err(label: &str, kind: ResourceKind, current: i64, delta: i64, limit: i64) -> ResourceError {
    ResourceError::LimitExceeded {
        scope: label.to_string(),
        kind,
        current,
        delta,
        limit,
    }
}

fn sub_clamped(label: &str, field: &str, current: i64, delta: i64) -> i64 {
    let v = current - delta;
    debug_assert!(
        v >= 0,
        "usage underflow on {}: {} {} - {}",
        label,
        field,
        current,
        delta
    );
    if v < 0 {
        error!(
            "usage underflow on {}: {} {} - {}, clamping to zero",
            label, field, current, delta
        );
        0
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit() -> BaseLimit {
        BaseLimit {
            memory: 4096,
            streams_inbound: 2,
            streams_outbound: 2,
            streams: 3,
            conns_inbound: 2,
            conns_outbound: 2,
            conns: 3,
            fd: 1,
        }
    }

    #[test]
    fn test_reserve_and_release() {
        let mut rc = Resources::new(limit());
        rc.reserve("t", &ScopeStat::conn(Direction::Inbound, true), PRIORITY_ALWAYS)
            .unwrap();
        assert_eq!(rc.stat().conns_inbound, 1);
        assert_eq!(rc.stat().fd, 1);

        rc.release("t", &ScopeStat::conn(Direction::Inbound, true));
        assert!(rc.stat().is_zero());
    }

    #[test]
    fn test_reserve_reports_first_failing_field() {
        let mut rc = Resources::new(limit());
        rc.reserve("t", &ScopeStat::conn(Direction::Inbound, true), PRIORITY_ALWAYS)
            .unwrap();

        // fd is exhausted; a second fd-bearing conn must fail on fd and
        // leave the counters untouched
        let before = rc.stat();
        let err = rc
            .reserve("t", &ScopeStat::conn(Direction::Inbound, true), PRIORITY_ALWAYS)
            .unwrap_err();
        match err {
            ResourceError::LimitExceeded { kind, current, limit, .. } => {
                assert_eq!(kind, ResourceKind::Fd);
                assert_eq!(current, 1);
                assert_eq!(limit, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(rc.stat(), before);
    }

    #[test]
    fn test_total_cap_binds_across_directions() {
        let mut rc = Resources::new(limit());
        rc.reserve("t", &ScopeStat::stream(Direction::Inbound), PRIORITY_ALWAYS)
            .unwrap();
        rc.reserve("t", &ScopeStat::stream(Direction::Inbound), PRIORITY_ALWAYS)
            .unwrap();
        rc.reserve("t", &ScopeStat::stream(Direction::Outbound), PRIORITY_ALWAYS)
            .unwrap();

        // directional capacity remains outbound, but the total cap of 3 is
        // reached
        let err = rc
            .reserve("t", &ScopeStat::stream(Direction::Outbound), PRIORITY_ALWAYS)
            .unwrap_err();
        assert!(matches!(
            err,
            ResourceError::LimitExceeded {
                kind: ResourceKind::Streams,
                ..
            }
        ));
    }

    #[test]
    fn test_memory_priority_threshold() {
        let mut rc = Resources::new(limit());

        // priority 127 admits up to half the 4096-byte limit
        assert!(rc.reserve("t", &ScopeStat::memory(2048), 127).is_ok());
        assert!(rc.reserve("t", &ScopeStat::memory(1), 127).is_err());

        // max priority admits up to the full limit
        assert!(rc.reserve("t", &ScopeStat::memory(2048), PRIORITY_ALWAYS).is_ok());
        assert!(rc.reserve("t", &ScopeStat::memory(1), PRIORITY_ALWAYS).is_err());

        rc.release("t", &ScopeStat::memory(4096));
        assert!(rc.stat().is_zero());
    }

    #[test]
    fn test_zero_limit_means_no_capacity() {
        let mut rc = Resources::new(BaseLimit::default());
        assert!(rc
            .reserve("t", &ScopeStat::stream(Direction::Inbound), PRIORITY_ALWAYS)
            .is_err());
        // a zero delta against a zero limit is fine
        assert!(rc.reserve("t", &ScopeStat::default(), PRIORITY_ALWAYS).is_ok());
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_release_clamps_underflow() {
        let mut rc = Resources::new(limit());
        rc.release("t", &ScopeStat::memory(100));
        assert_eq!(rc.stat().memory, 0);
    }
}
