//! Stream lifecycle handle.
//!
//! A stream is opened against its peer plus the transient/system pair and
//! sheds the transient scope when it attaches to a protocol or service.
//! Protocol and service attachment are independent: a stream may carry
//! both, in either order, and each inserts its scopes in front of the
//! chain it found.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::error::ResourceError;
use crate::common::id::{PeerId, ProtocolId};
use crate::metrics::METRICS;
use crate::scope::account::{Direction, Resources, ScopeStat, PRIORITY_ALWAYS};
use crate::scope::scope::{migrate, release_chain, reserve_chain, Scope, ScopeName};

use super::ResourceManager;

struct StreamState {
    done: bool,
    rc: Resources,
    chain: Vec<Arc<Scope>>,
    peer_scope: Arc<Scope>,
    proto: Option<ProtocolId>,
    svc: Option<String>,
}

/// Lifecycle handle for one stream. Dropping the handle releases its
/// charge; [`StreamHandle::done`] does the same explicitly.
pub struct StreamHandle {
    mgr: Arc<ResourceManager>,
    label: String,
    dir: Direction,
    peer: PeerId,
    state: Mutex<StreamState>,
}

impl StreamHandle {
    pub(crate) fn open(
        mgr: &Arc<ResourceManager>,
        p: &PeerId,
        dir: Direction,
    ) -> Result<Self, ResourceError> {
        let peer_scope = mgr.peer_scope(p)?;
        let label = ScopeName::Stream(mgr.next_stream_id()).to_string();

        let mut rc = Resources::new(mgr.limits().stream);
        let delta = ScopeStat::stream(dir);
        if let Err(e) = rc.reserve(&label, &delta, PRIORITY_ALWAYS) {
            peer_scope.dec_ref();
            METRICS.streams_blocked.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let chain = vec![
            peer_scope.clone(),
            mgr.transient().clone(),
            mgr.system().clone(),
        ];
        if let Err(e) = reserve_chain(&chain, &delta, PRIORITY_ALWAYS) {
            peer_scope.dec_ref();
            METRICS.streams_blocked.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        // the peer scope entered the chain with the registry's reference;
        // the roots need their own
        mgr.transient().inc_ref();
        mgr.system().inc_ref();

        METRICS.streams_allowed.fetch_add(1, Ordering::Relaxed);
        debug!("{}: opened ({:?}, peer {})", label, dir, p);

        Ok(Self {
            mgr: mgr.clone(),
            label,
            dir,
            peer: p.clone(),
            state: Mutex::new(StreamState {
                done: false,
                rc,
                chain,
                peer_scope,
                proto: None,
                svc: None,
            }),
        })
    }

    /// Attach the stream to a protocol. The protocol and
    /// protocol-peer scopes join the chain and the transient scope leaves
    /// it. On failure the stream's chain is unchanged.
    pub fn set_protocol(&self, proto: &ProtocolId) -> Result<(), ResourceError> {
        let mut st = self.state.lock();
        if st.done {
            return Err(ResourceError::InvalidTransition("handle already done"));
        }
        if st.proto.is_some() {
            return Err(ResourceError::InvalidTransition("protocol already set"));
        }

        let (proto_scope, pp_scope) =
            self.mgr.protocol_scopes(proto, &self.peer, &st.peer_scope)?;

        let mut to = vec![pp_scope.clone(), proto_scope.clone()];
        to.extend(
            st.chain
                .iter()
                .filter(|s| !matches!(s.name(), ScopeName::Transient))
                .cloned(),
        );

        let delta = st.rc.stat();
        if let Err(e) = migrate(&st.chain, &to, &delta) {
            pp_scope.dec_ref();
            proto_scope.dec_ref();
            METRICS.protocols_blocked.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        for scope in &st.chain {
            if !to.iter().any(|s| Arc::ptr_eq(s, scope)) {
                scope.dec_ref();
            }
        }
        st.chain = to;
        st.proto = Some(proto.clone());

        METRICS.protocols_attached.fetch_add(1, Ordering::Relaxed);
        debug!("{}: attached to protocol {}", self.label, proto);
        Ok(())
    }

    /// Attach the stream to a service. Analogous to
    /// [`StreamHandle::set_protocol`]; protocol scopes already in the
    /// chain are unaffected.
    pub fn set_service(&self, svc: &str) -> Result<(), ResourceError> {
        let mut st = self.state.lock();
        if st.done {
            return Err(ResourceError::InvalidTransition("handle already done"));
        }
        if st.svc.is_some() {
            return Err(ResourceError::InvalidTransition("service already set"));
        }

        let (svc_scope, sp_scope) = self.mgr.service_scopes(svc, &self.peer)?;

        let mut to = vec![sp_scope.clone(), svc_scope.clone()];
        to.extend(
            st.chain
                .iter()
                .filter(|s| !matches!(s.name(), ScopeName::Transient))
                .cloned(),
        );

        let delta = st.rc.stat();
        if let Err(e) = migrate(&st.chain, &to, &delta) {
            sp_scope.dec_ref();
            svc_scope.dec_ref();
            METRICS.services_blocked.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        for scope in &st.chain {
            if !to.iter().any(|s| Arc::ptr_eq(s, scope)) {
                scope.dec_ref();
            }
        }
        st.chain = to;
        st.svc = Some(svc.to_string());

        METRICS.services_attached.fetch_add(1, Ordering::Relaxed);
        debug!("{}: attached to service {}", self.label, svc);
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

    /// Release the stream's entire charge along its current chain and
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

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// The protocol this stream is attached to, if any.
    pub fn protocol(&self) -> Option<ProtocolId> {
        self.state.lock().proto.clone()
    }

    /// The service this stream is attached to, if any.
    pub fn service(&self) -> Option<String> {
        self.state.lock().svc.clone()
    }

    /// The stream's own usage (its stream charge plus memory held).
    pub fn stat(&self) -> ScopeStat {
        self.state.lock().rc.stat()
    }

    pub fn name(&self) -> &str {
        &self.label
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("name", &self.label)
            .field("peer", &self.peer)
            .field("done", &self.is_done())
            .finish()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.done();
    }
}
