//! Global metrics collection using atomic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics structure.
#[derive(Default)]
pub struct Metrics {
    pub conns_allowed: AtomicU64,
    pub conns_blocked: AtomicU64,
    pub streams_allowed: AtomicU64,
    pub streams_blocked: AtomicU64,
    pub peers_attached: AtomicU64,
    pub peers_blocked: AtomicU64,
    pub protocols_attached: AtomicU64,
    pub protocols_blocked: AtomicU64,
    pub services_attached: AtomicU64,
    pub services_blocked: AtomicU64,
    pub memory_reserved: AtomicU64,
    pub memory_blocked: AtomicU64,
    pub allowlisted_conns: AtomicU64,
    pub allowlist_mismatches: AtomicU64,
    pub gc_runs: AtomicU64,
    pub scopes_collected: AtomicU64,
}

/// Global metrics singleton.
pub static METRICS: once_cell::sync::Lazy<&'static Metrics> =
    once_cell::sync::Lazy::new(|| Box::leak(Box::new(Metrics::default())));

impl Metrics {
    /// Render metrics in Prometheus exposition format.
    pub fn render_prometheus(&self) -> String {
        let g = |name: &str, help: &str, val: u64| -> String {
            format!(
                "# HELP {0} {1}\n# TYPE {0} counter\n{0} {2}\n",
                name, help, val
            )
        };
        let mut s = String::with_capacity(2048);
        s.push_str(&g(
            "veles_conns_allowed_total",
            "Connections admitted",
            self.conns_allowed.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_conns_blocked_total",
            "Connections refused over limits",
            self.conns_blocked.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_streams_allowed_total",
            "Streams admitted",
            self.streams_allowed.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_streams_blocked_total",
            "Streams refused over limits",
            self.streams_blocked.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_peers_attached_total",
            "Successful peer attachments",
            self.peers_attached.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_peers_blocked_total",
            "Peer attachments refused",
            self.peers_blocked.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_protocols_attached_total",
            "Successful protocol attachments",
            self.protocols_attached.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_protocols_blocked_total",
            "Protocol attachments refused",
            self.protocols_blocked.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_services_attached_total",
            "Successful service attachments",
            self.services_attached.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_services_blocked_total",
            "Service attachments refused",
            self.services_blocked.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_memory_reserved_total",
            "Memory reservations granted",
            self.memory_reserved.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_memory_blocked_total",
            "Memory reservations refused",
            self.memory_blocked.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_allowlisted_conns_total",
            "Connections admitted via the allowlist",
            self.allowlisted_conns.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_allowlist_mismatches_total",
            "Peer attachments refused by allowlist constraints",
            self.allowlist_mismatches.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_gc_runs_total",
            "Garbage collection sweeps",
            self.gc_runs.load(Ordering::Relaxed),
        ));
        s.push_str(&g(
            "veles_scopes_collected_total",
            "Idle scopes collected",
            self.scopes_collected.load(Ordering::Relaxed),
        ));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_prometheus() {
        let m = Metrics::default();
        m.conns_allowed.fetch_add(3, Ordering::Relaxed);
        let out = m.render_prometheus();
        assert!(out.contains("veles_conns_allowed_total 3"));
        assert!(out.contains("# TYPE veles_gc_runs_total counter"));
    }
}
