//! Accounting scopes and transactional chain reservation.
//!
//! A [`Scope`] is a named accounting unit: one [`Resources`] account, a
//! reference count governing lifetime, a done flag, and an edge list — the
//! ordered ancestor scopes (leaf to root, terminating at the system scope)
//! that must also be charged whenever this scope is charged.
//!
//! Handles charge *chains*: flat, ordered lists of scopes walked left to
//! right, taking one scope lock at a time. A failed reservation rolls back
//! the committed prefix, so a chain reservation is atomic without ever
//! holding two locks.

use std::fmt;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::error::ResourceError;
use crate::common::id::{PeerId, ProtocolId};
use crate::config::types::BaseLimit;

use super::account::{Resources, ScopeStat, PRIORITY_ALWAYS};

/// Identity of an accounting scope, used in diagnostics and errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScopeName {
    System,
    Transient,
    AllowlistedSystem,
    AllowlistedTransient,
    Peer(PeerId),
    Protocol(ProtocolId),
    Service(String),
    ProtocolPeer(ProtocolId, PeerId),
    ServicePeer(String, PeerId),
    Conn(u64),
    Stream(u64),
}

impl fmt::Display for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeName::System => write!(f, "system"),
            ScopeName::Transient => write!(f, "transient"),
            ScopeName::AllowlistedSystem => write!(f, "allowlisted-system"),
            ScopeName::AllowlistedTransient => write!(f, "allowlisted-transient"),
            ScopeName::Peer(p) => write!(f, "peer:{}", p),
            ScopeName::Protocol(proto) => write!(f, "protocol:{}", proto),
            ScopeName::Service(svc) => write!(f, "service:{}", svc),
            ScopeName::ProtocolPeer(proto, p) => write!(f, "protocol:{}.peer:{}", proto, p),
            ScopeName::ServicePeer(svc, p) => write!(f, "service:{}.peer:{}", svc, p),
            ScopeName::Conn(n) => write!(f, "conn-{}", n),
            ScopeName::Stream(n) => write!(f, "stream-{}", n),
        }
    }
}

struct ScopeState {
    rc: Resources,
    ref_cnt: i64,
    done: bool,
}

/// A named accounting unit in the scope DAG.
pub struct Scope {
    name: ScopeName,
    label: String,
    edges: Vec<Arc<Scope>>,
    state: Mutex<ScopeState>,
}

impl Scope {
    /// Create a scope. Takes one reference on each edge; the references are
    /// returned when the scope is retired.
    pub fn new(name: ScopeName, limit: BaseLimit, edges: Vec<Arc<Scope>>) -> Arc<Self> {
        for e in &edges {
            e.inc_ref();
        }
        let label = name.to_string();
        debug!("scope created: {}", label);
        Arc::new(Self {
            name,
            label,
            edges,
            state: Mutex::new(ScopeState {
                rc: Resources::new(limit),
                ref_cnt: 0,
                done: false,
            }),
        })
    }

    pub fn name(&self) -> &ScopeName {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The flattened ancestor list, leaf to root.
    pub fn edges(&self) -> &[Arc<Scope>] {
        &self.edges
    }

    /// Charge `delta` against this scope alone.
    pub fn reserve(&self, delta: &ScopeStat, prio: u8) -> Result<(), ResourceError> {
        let mut st = self.state.lock();
        if st.done {
            return Err(ResourceError::Closed);
        }
        st.rc.reserve(&self.label, delta, prio)
    }

    /// Return `delta` to this scope alone. A no-op once the scope is done:
    /// retired state has already been discarded.
    pub fn release(&self, delta: &ScopeStat) {
        let mut st = self.state.lock();
        if st.done {
            return;
        }
        st.rc.release(&self.label, delta);
    }

    pub fn inc_ref(&self) {
        self.state.lock().ref_cnt += 1;
    }

    pub fn dec_ref(&self) {
        let mut st = self.state.lock();
        st.ref_cnt -= 1;
        debug_assert!(st.ref_cnt >= 0, "refcount underflow on {}", self.label);
        if st.ref_cnt < 0 {
            st.ref_cnt = 0;
        }
    }

    pub fn ref_count(&self) -> i64 {
        self.state.lock().ref_cnt
    }

    pub fn stat(&self) -> ScopeStat {
        self.state.lock().rc.stat()
    }

    /// Usage, limit, and refcount under one lock acquisition.
    pub fn snapshot(&self) -> (ScopeStat, BaseLimit, i64) {
        let st = self.state.lock();
        (st.rc.stat(), *st.rc.limit(), st.ref_cnt)
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// Unconditionally retire the scope; all further operations fail.
    pub fn mark_done(&self) {
        self.state.lock().done = true;
    }

    /// Retire the scope if it is idle: unreferenced with an all-zero usage
    /// vector. Returns true when this call retired it; the caller then
    /// returns the scope's edge references via [`Scope::dec_ref`].
    pub fn retire_if_idle(&self) -> bool {
        let mut st = self.state.lock();
        if st.done || st.ref_cnt > 0 || !st.rc.stat().is_zero() {
            return false;
        }
        st.done = true;
        true
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").field("name", &self.label).finish()
    }
}

/// Reserve `delta` across every scope of `chain`, left to right, one lock
/// at a time. On failure the committed prefix is rolled back and the
/// original error is returned; no scope's usage changes.
pub fn reserve_chain(
    chain: &[Arc<Scope>],
    delta: &ScopeStat,
    prio: u8,
) -> Result<(), ResourceError> {
    for (i, scope) in chain.iter().enumerate() {
        if let Err(e) = scope.reserve(delta, prio) {
            for undo in &chain[..i] {
                undo.release(delta);
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Release `delta` across every scope of `chain`. Release cannot fail, so
/// traversal order is immaterial; right-to-left is the dual of the reserve
/// walk.
pub fn release_chain(chain: &[Arc<Scope>], delta: &ScopeStat) {
    for scope in chain.iter().rev() {
        scope.release(delta);
    }
}

fn chain_contains(chain: &[Arc<Scope>], scope: &Arc<Scope>) -> bool {
    chain.iter().any(|s| Arc::ptr_eq(s, scope))
}

/// Transfer a reservation of `delta` from chain `from` to chain `to`.
/// Scopes present in both chains are never touched, so their usage never
/// dips during the transfer. On failure `from` is left fully charged and
/// the limit error propagates.
pub fn migrate(
    from: &[Arc<Scope>],
    to: &[Arc<Scope>],
    delta: &ScopeStat,
) -> Result<(), ResourceError> {
    let only_to: Vec<Arc<Scope>> = to
        .iter()
        .filter(|s| !chain_contains(from, s))
        .cloned()
        .collect();
    let only_from: Vec<Arc<Scope>> = from
        .iter()
        .filter(|s| !chain_contains(to, s))
        .cloned()
        .collect();

    reserve_chain(&only_to, delta, PRIORITY_ALWAYS)?;
    release_chain(&only_from, delta);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::account::Direction;

    fn limit(streams_inbound: i64) -> BaseLimit {
        BaseLimit {
            memory: 1 << 20,
            streams_inbound,
            streams_outbound: 64,
            streams: 64,
            conns_inbound: 64,
            conns_outbound: 64,
            conns: 64,
            fd: 64,
        }
    }

    fn three_scopes() -> (Arc<Scope>, Arc<Scope>, Arc<Scope>) {
        let root = Scope::new(ScopeName::System, limit(64), vec![]);
        let mid = Scope::new(ScopeName::Transient, limit(1), vec![root.clone()]);
        let leaf = Scope::new(
            ScopeName::Peer(PeerId::from("A")),
            limit(64),
            vec![root.clone()],
        );
        (leaf, mid, root)
    }

    #[test]
    fn test_edges_hold_references() {
        let (leaf, mid, root) = three_scopes();
        // two children each took one reference on the root
        assert_eq!(root.ref_count(), 2);
        assert_eq!(mid.ref_count(), 0);
        assert_eq!(leaf.ref_count(), 0);
    }

    #[test]
    fn test_chain_reserve_is_atomic() {
        let (leaf, mid, root) = three_scopes();
        let chain = vec![leaf.clone(), mid.clone(), root.clone()];
        let delta = ScopeStat::stream(Direction::Inbound);

        reserve_chain(&chain, &delta, PRIORITY_ALWAYS).unwrap();

        // mid allows one inbound stream; the second reservation fails there
        // and must leave every scope unchanged
        let err = reserve_chain(&chain, &delta, PRIORITY_ALWAYS).unwrap_err();
        match err {
            ResourceError::LimitExceeded { scope, .. } => assert_eq!(scope, "transient"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(leaf.stat().streams_inbound, 1);
        assert_eq!(mid.stat().streams_inbound, 1);
        assert_eq!(root.stat().streams_inbound, 1);

        release_chain(&chain, &delta);
        assert!(leaf.stat().is_zero());
        assert!(mid.stat().is_zero());
        assert!(root.stat().is_zero());
    }

    #[test]
    fn test_migrate_leaves_shared_scopes_untouched() {
        let (leaf, mid, root) = three_scopes();
        let from = vec![mid.clone(), root.clone()];
        let to = vec![leaf.clone(), root.clone()];
        let delta = ScopeStat::conn(Direction::Inbound, true);

        reserve_chain(&from, &delta, PRIORITY_ALWAYS).unwrap();
        let root_before = root.stat();

        migrate(&from, &to, &delta).unwrap();

        assert_eq!(root.stat(), root_before);
        assert!(mid.stat().is_zero());
        assert_eq!(leaf.stat().conns_inbound, 1);
    }

    #[test]
    fn test_migrate_failure_restores_source() {
        let root = Scope::new(ScopeName::System, limit(64), vec![]);
        let mid = Scope::new(ScopeName::Transient, limit(64), vec![root.clone()]);
        // target scope with zero capacity
        let full = Scope::new(
            ScopeName::Peer(PeerId::from("A")),
            BaseLimit::default(),
            vec![root.clone()],
        );

        let from = vec![mid.clone(), root.clone()];
        let to = vec![full.clone(), root.clone()];
        let delta = ScopeStat::stream(Direction::Inbound);

        reserve_chain(&from, &delta, PRIORITY_ALWAYS).unwrap();
        let err = migrate(&from, &to, &delta).unwrap_err();
        assert!(err.is_limit());

        assert_eq!(mid.stat().streams_inbound, 1);
        assert_eq!(root.stat().streams_inbound, 1);
        assert!(full.stat().is_zero());
    }

    #[test]
    fn test_done_scope_refuses_reservations() {
        let root = Scope::new(ScopeName::System, limit(64), vec![]);
        root.mark_done();
        let err = root
            .reserve(&ScopeStat::stream(Direction::Inbound), PRIORITY_ALWAYS)
            .unwrap_err();
        assert_eq!(err, ResourceError::Closed);
        // release on a retired scope is a no-op
        root.release(&ScopeStat::stream(Direction::Inbound));
        assert!(root.stat().is_zero());
    }

    #[test]
    fn test_retire_if_idle() {
        let root = Scope::new(ScopeName::System, limit(64), vec![]);
        let peer = Scope::new(
            ScopeName::Peer(PeerId::from("A")),
            limit(64),
            vec![root.clone()],
        );

        peer.inc_ref();
        assert!(!peer.retire_if_idle()); // referenced

        peer.dec_ref();
        peer.reserve(&ScopeStat::memory(16), PRIORITY_ALWAYS).unwrap();
        assert!(!peer.retire_if_idle()); // in use

        peer.release(&ScopeStat::memory(16));
        assert!(peer.retire_if_idle());
        assert!(!peer.retire_if_idle()); // already done
        assert!(peer.is_done());
    }
}
