//! The resource manager.
//!
//! This module contains:
//! - `allowlist`: operator-approved address matching
//! - `registry`: dynamic scope registry and garbage collection
//! - `conn`: connection lifecycle handles
//! - `stream`: stream lifecycle handles
//!
//! The manager owns the root scopes (system and transient, plus the
//! allowlisted pair), the registry, and an optional background GC task.
//! All operations are safe to call from any thread; none performs I/O and
//! each completes after at most one lock pair per scope in the chain.

pub mod allowlist;
pub mod conn;
pub(crate) mod registry;
pub mod stream;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;

use crate::common::addr::NetAddr;
use crate::common::error::ResourceError;
use crate::common::id::{PeerId, ProtocolId};
use crate::config::parser::ManagerConfig;
use crate::config::types::{BaseLimit, LimitConfig};
use crate::metrics::METRICS;
use crate::scope::account::{Direction, ScopeStat};
use crate::scope::scope::{Scope, ScopeName};

use allowlist::{Admission, Allowlist};
use registry::Registry;

// Re-export the user-facing surface
pub use conn::ConnHandle;
pub use stream::StreamHandle;

/// Construction options beyond the limit configuration.
#[derive(Default)]
pub struct ManagerOptions {
    /// Interval of the background GC task. `None` disables it; `gc` can
    /// still be driven manually. Setting an interval requires a running
    /// tokio runtime.
    pub gc_interval: Option<Duration>,
    /// Approved addresses admitted against the allowlisted limit tree.
    pub allowlist: Vec<NetAddr>,
}

/// Read-only snapshot of one scope, handed to view observers. Copied out
/// under the scope's lock; retaining it past the observer is harmless but
/// it goes stale immediately.
pub struct ScopeView {
    name: String,
    stat: ScopeStat,
    limit: BaseLimit,
    ref_count: i64,
}

impl ScopeView {
    fn of(scope: &Scope) -> Self {
        let (stat, limit, ref_count) = scope.snapshot();
        Self {
            name: scope.label().to_string(),
            stat,
            limit,
            ref_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stat(&self) -> &ScopeStat {
        &self.stat
    }

    pub fn limit(&self) -> &BaseLimit {
        &self.limit
    }

    /// The scope's reference count at snapshot time. For dynamic scopes
    /// this includes the temporary reference held by the view itself.
    pub fn ref_count(&self) -> i64 {
        self.ref_count
    }
}

/// Registry population, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManagerStat {
    pub peers: usize,
    pub protocols: usize,
    pub services: usize,
    pub protocol_peers: usize,
    pub service_peers: usize,
}

/// The resource manager. Owns the root scopes and the dynamic scope
/// registry; hands out connection and stream handles.
pub struct ResourceManager {
    limits: LimitConfig,
    system: Arc<Scope>,
    transient: Arc<Scope>,
    allowlisted_system: Arc<Scope>,
    allowlisted_transient: Arc<Scope>,
    allowlist: Allowlist,
    registry: Mutex<Registry>,
    next_conn: AtomicU64,
    next_stream: AtomicU64,
    closed: AtomicBool,
    gc_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ResourceManager {
    /// Create a manager with default options: no allowlist, no background
    /// GC. Usable without an async runtime.
    pub fn new(limits: LimitConfig) -> Arc<Self> {
        Self::with_options(limits, ManagerOptions::default())
    }

    /// Create a manager from a parsed configuration file.
    pub fn from_config(cfg: &ManagerConfig) -> Arc<Self> {
        let opts = ManagerOptions {
            gc_interval: (cfg.gc_interval_ms > 0)
                .then(|| Duration::from_millis(cfg.gc_interval_ms)),
            allowlist: cfg.allowlist.clone(),
        };
        Self::with_options(cfg.limits.clone(), opts)
    }

    pub fn with_options(limits: LimitConfig, opts: ManagerOptions) -> Arc<Self> {
        let system = Scope::new(ScopeName::System, limits.system, vec![]);
        system.inc_ref();
        let transient = Scope::new(ScopeName::Transient, limits.transient, vec![system.clone()]);
        transient.inc_ref();
        let allowlisted_system = Scope::new(
            ScopeName::AllowlistedSystem,
            limits.allowlisted_system,
            vec![],
        );
        allowlisted_system.inc_ref();
        let allowlisted_transient = Scope::new(
            ScopeName::AllowlistedTransient,
            limits.allowlisted_transient,
            vec![allowlisted_system.clone()],
        );
        allowlisted_transient.inc_ref();

        let mgr = Arc::new(Self {
            limits,
            system,
            transient,
            allowlisted_system,
            allowlisted_transient,
            allowlist: Allowlist::new(&opts.allowlist),
            registry: Mutex::new(Registry::default()),
            next_conn: AtomicU64::new(0),
            next_stream: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            gc_task: Mutex::new(None),
        });
        if let Some(every) = opts.gc_interval {
            mgr.spawn_gc(every);
        }
        mgr
    }

    fn spawn_gc(self: &Arc<Self>, every: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(mgr) = weak.upgrade() else { break };
                if mgr.closed.load(Ordering::SeqCst) {
                    break;
                }
                mgr.gc();
            }
        });
        *self.gc_task.lock() = Some(task);
    }

    /// Acquire a handle for a connection. The address decides whether the
    /// charge lands on the primary or the allowlisted limit tree.
    pub fn open_connection(
        self: &Arc<Self>,
        dir: Direction,
        use_fd: bool,
        addr: &NetAddr,
    ) -> Result<ConnHandle, ResourceError> {
        ConnHandle::open(self, dir, use_fd, addr)
    }

    /// Acquire a handle for a stream to `p`.
    pub fn open_stream(
        self: &Arc<Self>,
        p: &PeerId,
        dir: Direction,
    ) -> Result<StreamHandle, ResourceError> {
        StreamHandle::open(self, p, dir)
    }

    /// Sweep the registry for idle scopes.
    pub fn gc(&self) {
        let collected = self.registry.lock().gc();
        METRICS.gc_runs.fetch_add(1, Ordering::Relaxed);
        METRICS
            .scopes_collected
            .fetch_add(collected as u64, Ordering::Relaxed);
        if collected > 0 {
            debug!("gc: collected {} idle scopes", collected);
        }
    }

    /// Close the manager: stop the GC task, invalidate every dynamic
    /// scope, and retire the roots. Idempotent; all subsequent operations
    /// fail with [`ResourceError::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.gc_task.lock().take() {
            task.abort();
        }
        {
            let mut reg = self.registry.lock();
            reg.gc();
            reg.clear();
        }
        self.system.mark_done();
        self.transient.mark_done();
        self.allowlisted_system.mark_done();
        self.allowlisted_transient.mark_done();
        info!("resource manager closed");
    }

    /// Registry population snapshot.
    pub fn stat(&self) -> ManagerStat {
        let reg = self.registry.lock();
        ManagerStat {
            peers: reg.peer.len(),
            protocols: reg.proto.len(),
            services: reg.svc.len(),
            protocol_peers: reg.proto_peer.len(),
            service_peers: reg.svc_peer.len(),
        }
    }

    pub fn view_system<T>(&self, f: impl FnOnce(&ScopeView) -> T) -> Result<T, ResourceError> {
        self.ensure_open()?;
        Ok(f(&ScopeView::of(&self.system)))
    }

    pub fn view_transient<T>(&self, f: impl FnOnce(&ScopeView) -> T) -> Result<T, ResourceError> {
        self.ensure_open()?;
        Ok(f(&ScopeView::of(&self.transient)))
    }

    pub fn view_allowlisted_system<T>(
        &self,
        f: impl FnOnce(&ScopeView) -> T,
    ) -> Result<T, ResourceError> {
        self.ensure_open()?;
        Ok(f(&ScopeView::of(&self.allowlisted_system)))
    }

    pub fn view_allowlisted_transient<T>(
        &self,
        f: impl FnOnce(&ScopeView) -> T,
    ) -> Result<T, ResourceError> {
        self.ensure_open()?;
        Ok(f(&ScopeView::of(&self.allowlisted_transient)))
    }

    /// View the peer scope, creating it if needed. The scope holds a
    /// temporary reference for the duration of the view.
    pub fn view_peer<T>(
        &self,
        p: &PeerId,
        f: impl FnOnce(&ScopeView) -> T,
    ) -> Result<T, ResourceError> {
        self.ensure_open()?;
        let scope = self
            .registry
            .lock()
            .peer_scope(p, &self.limits, &self.system);
        let out = f(&ScopeView::of(&scope));
        scope.dec_ref();
        Ok(out)
    }

    /// View the protocol scope, creating it if needed.
    pub fn view_protocol<T>(
        &self,
        proto: &ProtocolId,
        f: impl FnOnce(&ScopeView) -> T,
    ) -> Result<T, ResourceError> {
        self.ensure_open()?;
        let scope = self
            .registry
            .lock()
            .protocol_scope(proto, &self.limits, &self.system);
        let out = f(&ScopeView::of(&scope));
        scope.dec_ref();
        Ok(out)
    }

    /// View the service scope, creating it if needed.
    pub fn view_service<T>(
        &self,
        svc: &str,
        f: impl FnOnce(&ScopeView) -> T,
    ) -> Result<T, ResourceError> {
        self.ensure_open()?;
        let scope = self
            .registry
            .lock()
            .service_scope(svc, &self.limits, &self.system);
        let out = f(&ScopeView::of(&scope));
        scope.dec_ref();
        Ok(out)
    }

    // --- internals shared with the handle modules ---

    pub(crate) fn ensure_open(&self) -> Result<(), ResourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ResourceError::Closed);
        }
        Ok(())
    }

    pub(crate) fn limits(&self) -> &LimitConfig {
        &self.limits
    }

    pub(crate) fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    pub(crate) fn system(&self) -> &Arc<Scope> {
        &self.system
    }

    pub(crate) fn transient(&self) -> &Arc<Scope> {
        &self.transient
    }

    /// The (transient, system) pair a new connection charges, depending on
    /// how the allowlist classified its address.
    pub(crate) fn roots_for(&self, admission: Admission) -> (Arc<Scope>, Arc<Scope>) {
        match admission {
            Admission::None => (self.transient.clone(), self.system.clone()),
            _ => (
                self.allowlisted_transient.clone(),
                self.allowlisted_system.clone(),
            ),
        }
    }

    pub(crate) fn system_for(&self, admission: Admission) -> Arc<Scope> {
        match admission {
            Admission::None => self.system.clone(),
            _ => self.allowlisted_system.clone(),
        }
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_stream_id(&self) -> u64 {
        self.next_stream.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get-or-create the peer scope, taking a reference for the caller.
    pub(crate) fn peer_scope(&self, p: &PeerId) -> Result<Arc<Scope>, ResourceError> {
        self.ensure_open()?;
        Ok(self
            .registry
            .lock()
            .peer_scope(p, &self.limits, &self.system))
    }

    /// Get-or-create the protocol and (protocol, peer) scopes, taking one
    /// reference on each for the caller.
    pub(crate) fn protocol_scopes(
        &self,
        proto: &ProtocolId,
        p: &PeerId,
        peer_scope: &Arc<Scope>,
    ) -> Result<(Arc<Scope>, Arc<Scope>), ResourceError> {
        self.ensure_open()?;
        let mut reg = self.registry.lock();
        let proto_scope = reg.protocol_scope(proto, &self.limits, &self.system);
        let pp_scope =
            reg.protocol_peer_scope(&proto_scope, proto, peer_scope, p, &self.limits, &self.system);
        Ok((proto_scope, pp_scope))
    }

    /// Get-or-create the service and (service, peer) scopes, taking one
    /// reference on each for the caller.
    pub(crate) fn service_scopes(
        &self,
        svc: &str,
        p: &PeerId,
    ) -> Result<(Arc<Scope>, Arc<Scope>), ResourceError> {
        self.ensure_open()?;
        let mut reg = self.registry.lock();
        let svc_scope = reg.service_scope(svc, &self.limits, &self.system);
        let sp_scope = reg.service_peer_scope(&svc_scope, svc, p, &self.limits, &self.system);
        Ok((svc_scope, sp_scope))
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits() -> LimitConfig {
        LimitConfig {
            system: BaseLimit {
                memory: 16384,
                streams_inbound: 3,
                streams_outbound: 3,
                streams: 6,
                conns_inbound: 3,
                conns_outbound: 3,
                conns: 6,
                fd: 2,
            },
            transient: BaseLimit {
                memory: 4096,
                streams_inbound: 1,
                streams_outbound: 1,
                streams: 2,
                conns_inbound: 1,
                conns_outbound: 1,
                conns: 2,
                fd: 1,
            },
            ..LimitConfig::default()
        }
    }

    #[test]
    fn test_baseline_refcounts() {
        let mgr = ResourceManager::new(small_limits());
        // the manager's own hold plus the transient scope's edge
        mgr.view_system(|s| assert_eq!(s.ref_count(), 2)).unwrap();
        mgr.view_transient(|s| assert_eq!(s.ref_count(), 1)).unwrap();
        mgr.view_allowlisted_system(|s| assert_eq!(s.ref_count(), 2))
            .unwrap();
        mgr.view_allowlisted_transient(|s| assert_eq!(s.ref_count(), 1))
            .unwrap();
    }

    #[test]
    fn test_view_creates_and_releases_dynamic_scope() {
        let mgr = ResourceManager::new(small_limits());
        let p = PeerId::from("A");

        // inside the view the scope carries the view's temporary reference
        mgr.view_peer(&p, |s| {
            assert_eq!(s.ref_count(), 1);
            assert_eq!(s.name(), "peer:A");
            assert!(s.stat().is_zero());
        })
        .unwrap();

        assert_eq!(mgr.stat().peers, 1);
        mgr.gc();
        assert_eq!(mgr.stat().peers, 0);
    }

    #[test]
    fn test_closed_manager_refuses_everything() {
        let mgr = ResourceManager::new(small_limits());
        mgr.close();
        mgr.close(); // idempotent

        let addr = NetAddr::parse("/ip4/1.2.3.4").unwrap();
        assert!(matches!(
            mgr.open_connection(Direction::Inbound, false, &addr),
            Err(ResourceError::Closed)
        ));
        assert!(matches!(
            mgr.open_stream(&PeerId::from("A"), Direction::Inbound),
            Err(ResourceError::Closed)
        ));
        assert!(mgr.view_system(|_| ()).is_err());
    }

    #[test]
    fn test_stat_counts_registry_population() {
        let mgr = ResourceManager::new(small_limits());
        let conn = mgr
            .open_connection(
                Direction::Inbound,
                false,
                &NetAddr::parse("/ip4/1.2.3.4").unwrap(),
            )
            .unwrap();
        conn.set_peer(&PeerId::from("A")).unwrap();

        let stream = mgr.open_stream(&PeerId::from("A"), Direction::Inbound).unwrap();
        stream.set_protocol(&ProtocolId::from("/x/1")).unwrap();
        stream.set_service("echo").unwrap();

        let st = mgr.stat();
        assert_eq!(st.peers, 1);
        assert_eq!(st.protocols, 1);
        assert_eq!(st.services, 1);
        assert_eq!(st.protocol_peers, 1);
        assert_eq!(st.service_peers, 1);

        stream.done();
        conn.done();
        mgr.gc();
        assert_eq!(mgr.stat(), ManagerStat::default());
    }
}
