//! Connection lifecycle handle.
//!
//! A connection starts against the transient/system pair (or the
//! allowlisted pair when its address matches the allowlist) and is
//! re-charged against its peer's scopes once the peer is known. The handle
//! carries its own account, limited by the `conn` tier, in addition to the
//! chain it is charged against.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::addr::NetAddr;
use crate::common::error::ResourceError;
use crate::common::id::PeerId;
use crate::metrics::METRICS;
use crate::scope::account::{Direction, Resources, ScopeStat, PRIORITY_ALWAYS};
use crate::scope::scope::{migrate, release_chain, reserve_chain, Scope, ScopeName};

use super::allowlist::Admission;
use super::ResourceManager;

struct ConnState {
    done: bool,
    rc: Resources,
    chain: Vec<Arc<Scope>>,
    peer: Option<PeerId>,
}

/// Lifecycle handle for one connection. Dropping the handle releases its
/// charge, but callers that care about the error flow should call
/// [`ConnHandle::done`] explicitly.
pub struct ConnHandle {
    mgr: Arc<ResourceManager>,
    label: String,
    dir: Direction,
    use_fd: bool,
    addr: NetAddr,
    admission: Admission,
    state: Mutex<ConnState>,
}

impl ConnHandle {
    pub(crate) fn open(
        mgr: &Arc<ResourceManager>,
        dir: Direction,
        use_fd: bool,
        addr: &NetAddr,
    ) -> Result<Self, ResourceError> {
        mgr.ensure_open()?;

        let admission = mgr.allowlist().admit(addr);
        let (transient, system) = mgr.roots_for(admission);
        let label = ScopeName::Conn(mgr.next_conn_id()).to_string();

        let mut rc = Resources::new(mgr.limits().conn);
        let delta = ScopeStat::conn(dir, use_fd);
        if let Err(e) = rc.reserve(&label, &delta, PRIORITY_ALWAYS) {
            METRICS.conns_blocked.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let chain = vec![transient, system];
        if let Err(e) = reserve_chain(&chain, &delta, PRIORITY_ALWAYS) {
            METRICS.conns_blocked.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        for scope in &chain {
            scope.inc_ref();
        }

        METRICS.conns_allowed.fetch_add(1, Ordering::Relaxed);
        if admission != Admission::None {
            METRICS.allowlisted_conns.fetch_add(1, Ordering::Relaxed);
        }
        debug!("{}: opened ({:?}, fd={}, addr={})", label, dir, use_fd, addr);

        Ok(Self {
            mgr: mgr.clone(),
            label,
            dir,
            use_fd,
            addr: addr.clone(),
            admission,
            state: Mutex::new(ConnState {
                done: false,
                rc,
                chain,
                peer: None,
            }),
        })
    }

    /// Attach the connection to its peer, migrating the charge from the
    /// transient scope to the peer scope. On failure the connection stays
    /// transient; the caller may retry with another peer or discard it.
    pub fn set_peer(&self, p: &PeerId) -> Result<(), ResourceError> {
        let mut st = self.state.lock();
        if st.done {
            return Err(ResourceError::InvalidTransition("handle already done"));
        }
        if st.peer.is_some() {
            return Err(ResourceError::InvalidTransition(
                "connection already attached to a peer",
            ));
        }
        if self.admission == Admission::PeerConditional
            && !self.mgr.allowlist().admit_peer(&self.addr, p)
        {
            METRICS.allowlist_mismatches.fetch_add(1, Ordering::Relaxed);
            return Err(ResourceError::AllowlistMismatch);
        }

        let peer_scope = self.mgr.peer_scope(p)?;
        let system = self.mgr.system_for(self.admission);
        let to = vec![peer_scope.clone(), system];

        let delta = st.rc.stat();
        if let Err(e) = migrate(&st.chain, &to, &delta) {
            peer_scope.dec_ref();
            METRICS.peers_blocked.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        // references on scopes leaving the chain are returned; the peer
        // scope entered carrying the reference the registry took for us
        for scope in &st.chain {
            if !to.iter().any(|s| Arc::ptr_eq(s, scope)) {
                scope.dec_ref();
            }
        }
        st.chain = to;
        st.peer = Some(p.clone());

        METRICS.peers_attached.fetch_add(1, Ordering::Relaxed);
        debug!("{}: attached to peer {}", self.label, p);
        Ok(())
    }

    /// Reserve `n` bytes along the current chain at the given priority.
    pub fn reserve_memory(&self, n: i64, prio: u8) -> Result<(), ResourceError> {
        let mut st = self.state.lock();
        if st.done {
            return Err(ResourceError::InvalidTransition("handle already done"));
        }
        let delta = ScopeStat::memory(n);
        st.rc.reserve(&self.label, &delta, prio)?;
        if let Err(e) = reserve_chain(&st.chain, &delta, prio) {
            st.rc.release(&self.label, &delta);
            METRICS.memory_blocked.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        METRICS.memory_reserved.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Return `n` previously reserved bytes.
    pub fn release_memory(&self, n: i64) {
        let mut st = self.state.lock();
        if st.done {
            return;
        }
        let delta = ScopeStat::memory(n);
        st.rc.release(&self.label, &delta);
        release_chain(&st.chain, &delta);
    }

    /// Release the connection's entire charge along its current chain and
    /// return the chain references. Idempotent.
    pub fn done(&self) {
        let mut st = self.state.lock();
        if st.done {
            return;
        }
        let delta = st.rc.stat();
        release_chain(&st.chain, &delta);
        for scope in st.chain.drain(..) {
            scope.dec_ref();
        }
        st.rc.release(&self.label, &delta);
        st.done = true;
        debug!("{}: done", self.label);
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// The peer this connection is attached to, if any.
    pub fn peer(&self) -> Option<PeerId> {
        self.state.lock().peer.clone()
    }

    /// The connection's own usage (its conn charge plus memory held).
    pub fn stat(&self) -> ScopeStat {
        self.state.lock().rc.stat()
    }

    pub fn name(&self) -> &str {
        &self.label
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn uses_fd(&self) -> bool {
        self.use_fd
    }

    pub fn addr(&self) -> &NetAddr {
        &self.addr
    }

    /// True when the connection was admitted through the allowlist.
    pub fn is_allowlisted(&self) -> bool {
        self.admission != Admission::None
    }
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandle")
            .field("name", &self.label)
            .field("addr", &self.addr)
            .field("done", &self.is_done())
            .finish()
    }
}

impl Drop for ConnHandle {
    fn drop(&mut self) {
        self.done();
    }
}
