//! Unified error types for resource accounting.

use std::fmt;

/// The limit fields a scope enforces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Memory,
    StreamsInbound,
    StreamsOutbound,
    Streams,
    ConnsInbound,
    ConnsOutbound,
    Conns,
    Fd,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::StreamsInbound => "streams-inbound",
            ResourceKind::StreamsOutbound => "streams-outbound",
            ResourceKind::Streams => "streams",
            ResourceKind::ConnsInbound => "conns-inbound",
            ResourceKind::ConnsOutbound => "conns-outbound",
            ResourceKind::Conns => "conns",
            ResourceKind::Fd => "fd",
        };
        f.write_str(s)
    }
}

/// Error type for scope and handle operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceError {
    /// An acquisition would exceed a limit along the scope chain.
    /// Carries enough detail to diagnose which scope and field tripped.
    LimitExceeded {
        scope: String,
        kind: ResourceKind,
        current: i64,
        delta: i64,
        limit: i64,
    },
    /// A handle transition that is not legal in its current state
    /// (e.g. attaching a peer twice).
    InvalidTransition(&'static str),
    /// The peer id presented on SetPeer does not satisfy the allowlist
    /// entry that admitted the connection.
    AllowlistMismatch,
    /// Operation on a closed manager or a retired scope.
    Closed,
}

impl ResourceError {
    /// True for the recoverable "over limit" case; callers typically back
    /// off or shed load on this and treat everything else as a bug.
    pub fn is_limit(&self) -> bool {
        matches!(self, ResourceError::LimitExceeded { .. })
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::LimitExceeded {
                scope,
                kind,
                current,
                delta,
                limit,
            } => write!(
                f,
                "resource limit exceeded: {} {}: current {} + delta {} over limit {}",
                scope, kind, current, delta, limit
            ),
            ResourceError::InvalidTransition(msg) => write!(f, "invalid transition: {}", msg),
            ResourceError::AllowlistMismatch => {
                write!(f, "peer id does not match allowlist entry")
            }
            ResourceError::Closed => write!(f, "resource manager closed"),
        }
    }
}

impl std::error::Error for ResourceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_error_display() {
        let e = ResourceError::LimitExceeded {
            scope: "peer:A".into(),
            kind: ResourceKind::ConnsInbound,
            current: 2,
            delta: 1,
            limit: 2,
        };
        let s = e.to_string();
        assert!(s.contains("peer:A"));
        assert!(s.contains("conns-inbound"));
        assert!(e.is_limit());
        assert!(!ResourceError::Closed.is_limit());
    }
}
