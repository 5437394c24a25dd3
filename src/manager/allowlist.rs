//! Operator-approved address allowlist.
//!
//! Matching is a pure function with no accounting side effect: the manager
//! consults the allowlist when a connection is opened and again when a
//! conditionally admitted connection attaches its peer. Admitted
//! connections are charged to the allowlisted system/transient pair, an
//! independent limit tree, so hostile unlisted traffic cannot starve
//! known-good peers.

use crate::common::addr::NetAddr;
use crate::common::id::PeerId;

/// Outcome of matching a connection address against the allowlist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Address not in the allowlist; use the primary limit tree.
    None,
    /// Host matched an entry without a peer constraint.
    Unconditional,
    /// Host matched only peer-constrained entries. SetPeer must present
    /// one of the constrained peer ids or the attachment fails.
    PeerConditional,
}

struct AllowEntry {
    host: String,
    peer: Option<PeerId>,
}

/// The configured set of approved addresses.
#[derive(Default)]
pub struct Allowlist {
    entries: Vec<AllowEntry>,
}

impl Allowlist {
    /// Build an allowlist from approved addresses. Addresses without a
    /// host-identifying prefix cannot match anything and are ignored.
    pub fn new(addrs: &[NetAddr]) -> Self {
        let entries = addrs
            .iter()
            .filter_map(|a| {
                a.host_prefix().map(|h| AllowEntry {
                    host: h.to_string(),
                    peer: a.peer_id().cloned(),
                })
            })
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Match a connection address against the set.
    pub fn admit(&self, addr: &NetAddr) -> Admission {
        let Some(host) = addr.host_prefix() else {
            return Admission::None;
        };
        let mut conditional = false;
        for e in &self.entries {
            if e.host != host {
                continue;
            }
            match &e.peer {
                None => return Admission::Unconditional,
                Some(_) => conditional = true,
            }
        }
        if conditional {
            Admission::PeerConditional
        } else {
            Admission::None
        }
    }

    /// Check the peer id chosen for a conditionally admitted connection.
    pub fn admit_peer(&self, addr: &NetAddr, peer: &PeerId) -> bool {
        let Some(host) = addr.host_prefix() else {
            return false;
        };
        self.entries
            .iter()
            .any(|e| e.host == host && e.peer.as_ref() == Some(peer))
    }
}
