//! Dynamic scope registry.
//!
//! Peer, protocol, service, and the composite protocol-peer and
//! service-peer scopes are materialised on demand, reference-counted, and
//! garbage-collected once idle. All five maps live under the manager's
//! registry lock; a reference is always taken under that lock so a
//! concurrent sweep can never race a get-or-create.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use log::debug;

use crate::common::id::{PeerId, ProtocolId};
use crate::config::types::LimitConfig;
use crate::scope::scope::{Scope, ScopeName};

#[derive(Default)]
pub(crate) struct Registry {
    pub peer: HashMap<PeerId, Arc<Scope>>,
    pub proto: HashMap<ProtocolId, Arc<Scope>>,
    pub svc: HashMap<String, Arc<Scope>>,
    pub proto_peer: HashMap<(ProtocolId, PeerId), Arc<Scope>>,
    pub svc_peer: HashMap<(String, PeerId), Arc<Scope>>,
}

impl Registry {
    /// Look up or create the peer scope, taking one reference for the
    /// caller.
    pub fn peer_scope(
        &mut self,
        p: &PeerId,
        limits: &LimitConfig,
        system: &Arc<Scope>,
    ) -> Arc<Scope> {
        let scope = self
            .peer
            .entry(p.clone())
            .or_insert_with(|| {
                Scope::new(
                    ScopeName::Peer(p.clone()),
                    limits.peer_limit(p),
                    vec![system.clone()],
                )
            })
            .clone();
        scope.inc_ref();
        scope
    }

    /// Look up or create the protocol scope, taking one reference for the
    /// caller.
    pub fn protocol_scope(
        &mut self,
        proto: &ProtocolId,
        limits: &LimitConfig,
        system: &Arc<Scope>,
    ) -> Arc<Scope> {
        let scope = self
            .proto
            .entry(proto.clone())
            .or_insert_with(|| {
                Scope::new(
                    ScopeName::Protocol(proto.clone()),
                    limits.protocol_limit(proto),
                    vec![system.clone()],
                )
            })
            .clone();
        scope.inc_ref();
        scope
    }

    /// Look up or create the service scope, taking one reference for the
    /// caller.
    pub fn service_scope(
        &mut self,
        svc: &str,
        limits: &LimitConfig,
        system: &Arc<Scope>,
    ) -> Arc<Scope> {
        let scope = self
            .svc
            .entry(svc.to_string())
            .or_insert_with(|| {
                Scope::new(
                    ScopeName::Service(svc.to_string()),
                    limits.service_limit(svc),
                    vec![system.clone()],
                )
            })
            .clone();
        scope.inc_ref();
        scope
    }

    /// Look up or create the per-(protocol, peer) scope. Its edges are the
    /// protocol and peer scopes plus the system root, so the parents stay
    /// alive while the child does.
    pub fn protocol_peer_scope(
        &mut self,
        proto_scope: &Arc<Scope>,
        proto: &ProtocolId,
        peer_scope: &Arc<Scope>,
        p: &PeerId,
        limits: &LimitConfig,
        system: &Arc<Scope>,
    ) -> Arc<Scope> {
        let scope = self
            .proto_peer
            .entry((proto.clone(), p.clone()))
            .or_insert_with(|| {
                Scope::new(
                    ScopeName::ProtocolPeer(proto.clone(), p.clone()),
                    limits.protocol_peer_limit(proto),
                    vec![proto_scope.clone(), peer_scope.clone(), system.clone()],
                )
            })
            .clone();
        scope.inc_ref();
        scope
    }

    /// Look up or create the per-(service, peer) scope. Its edges are the
    /// service scope plus the system root.
    pub fn service_peer_scope(
        &mut self,
        svc_scope: &Arc<Scope>,
        svc: &str,
        p: &PeerId,
        limits: &LimitConfig,
        system: &Arc<Scope>,
    ) -> Arc<Scope> {
        let scope = self
            .svc_peer
            .entry((svc.to_string(), p.clone()))
            .or_insert_with(|| {
                Scope::new(
                    ScopeName::ServicePeer(svc.to_string(), p.clone()),
                    limits.service_peer_limit(svc),
                    vec![svc_scope.clone(), system.clone()],
                )
            })
            .clone();
        scope.inc_ref();
        scope
    }

    /// Remove every idle scope. Composite children are swept before their
    /// parents and their edge references returned in between, so a parent
    /// idled only by a child's removal is collected in the same pass.
    /// Returns the number of scopes collected.
    pub fn gc(&mut self) -> usize {
        let mut collected = 0;
        let mut orphaned_edges: Vec<Arc<Scope>> = Vec::new();

        sweep(&mut self.proto_peer, &mut orphaned_edges, &mut collected);
        sweep(&mut self.svc_peer, &mut orphaned_edges, &mut collected);
        for e in orphaned_edges.drain(..) {
            e.dec_ref();
        }

        sweep(&mut self.peer, &mut orphaned_edges, &mut collected);
        sweep(&mut self.proto, &mut orphaned_edges, &mut collected);
        sweep(&mut self.svc, &mut orphaned_edges, &mut collected);
        for e in orphaned_edges {
            e.dec_ref();
        }

        collected
    }

    /// Retire every dynamic scope. Used when the manager closes.
    pub fn clear(&mut self) {
        for scope in self
            .proto_peer
            .drain()
            .map(|(_, s)| s)
            .chain(self.svc_peer.drain().map(|(_, s)| s))
            .chain(self.peer.drain().map(|(_, s)| s))
            .chain(self.proto.drain().map(|(_, s)| s))
            .chain(self.svc.drain().map(|(_, s)| s))
        {
            scope.mark_done();
        }
    }
}

fn sweep<K: Eq + Hash>(
    map: &mut HashMap<K, Arc<Scope>>,
    orphaned_edges: &mut Vec<Arc<Scope>>,
    collected: &mut usize,
) {
    map.retain(|_, scope| {
        if scope.retire_if_idle() {
            debug!("gc: collected {}", scope.label());
            orphaned_edges.extend(scope.edges().iter().cloned());
            *collected += 1;
            false
        } else {
            true
        }
    });
}
