//! 4.G Change tracker.
//!
//! Collapses a sequence of `(previous, current)` service deltas so the
//! reconciler sees, per service, the oldest `previous` and the newest
//! `current` observed since the last drain. A service whose batch collapses
//! to `previous == current` is dropped entirely — it is a no-op for this
//! pass.

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::types::ServiceDescriptor;

/// Identifies a service (not a service *port* — the change tracker works at
/// the whole-service granularity, since one control-plane event touches
/// every port on a service at once).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServiceIdentity {
    namespace: String,
    name: String,
}

fn identity_of(desc: &ServiceDescriptor) -> ServiceIdentity {
    ServiceIdentity {
        namespace: desc.namespace.clone(),
        name: desc.name.clone(),
    }
}

/// One drained record: the oldest pre-state and newest post-state for a
/// service in the batch that just ended. Either side may be absent — `None`
/// previous means the service didn't exist before the batch, `None` current
/// means it doesn't exist after.
#[derive(Debug, Clone)]
pub struct ServiceChange {
    pub previous: Option<ServiceDescriptor>,
    pub current: Option<ServiceDescriptor>,
}

/// Guarded by its own lock (`serviceChangesLock` in `spec.md` §5); never
/// held at the same time as the service-map lock or the port-map lock.
#[derive(Default)]
pub struct ChangeTracker {
    pending: Mutex<AHashMap<ServiceIdentity, ServiceChange>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one `(previous, current)` observation. At least one of the
    /// two must be `Some` — the caller decides identity from whichever is
    /// present, preferring `current`.
    pub fn update(&self, previous: Option<ServiceDescriptor>, current: Option<ServiceDescriptor>) {
        let identity = match current.as_ref().or(previous.as_ref()) {
            Some(desc) => identity_of(desc),
            None => return,
        };

        let mut pending = self.pending.lock();
        match pending.get_mut(&identity) {
            Some(existing) => {
                existing.current = current;
            }
            None => {
                pending.insert(
                    identity,
                    ServiceChange {
                        previous,
                        current,
                    },
                );
            }
        }

        if let Some(entry) = pending.get(&identity) {
            if entry.previous == entry.current {
                pending.remove(&identity);
            }
        }
    }

    /// Atomically swaps out the pending map and returns everything it held.
    /// The reconciler calls this once at the start of each reconciliation
    /// pass; anything reported via `update` afterward starts a fresh batch.
    pub fn drain(&self) -> Vec<ServiceChange> {
        let mut pending = self.pending.lock();
        std::mem::take(&mut *pending).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    fn svc(name: &str, port: u16) -> ServiceDescriptor {
        ServiceDescriptor {
            namespace: "default".into(),
            name: name.into(),
            cluster_ip: Some("10.0.0.1".parse().unwrap()),
            external_ips: vec![],
            load_balancer_ips: vec![],
            ports: vec![crate::types::ServicePortSpec {
                port_name: "http".into(),
                protocol: Protocol::Tcp,
                port,
                node_port: 0,
            }],
            headless: false,
            session_affinity: None,
        }
    }

    #[test]
    fn add_then_delete_in_same_batch_is_dropped() {
        let tracker = ChangeTracker::new();
        let svc = svc("web", 80);
        tracker.update(None, Some(svc.clone()));
        tracker.update(Some(svc), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn keeps_oldest_previous_and_newest_current() {
        let tracker = ChangeTracker::new();
        let v1 = svc("web", 80);
        let v2 = svc("web", 81);
        let v3 = svc("web", 82);

        tracker.update(Some(v1.clone()), Some(v2.clone()));
        tracker.update(Some(v2), Some(v3.clone()));

        let drained = tracker.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].previous, Some(v1));
        assert_eq!(drained[0].current, Some(v3));
    }

    #[test]
    fn no_op_update_never_enters_the_batch() {
        let tracker = ChangeTracker::new();
        let v1 = svc("web", 80);
        tracker.update(Some(v1.clone()), Some(v1));
        assert!(tracker.is_empty());
    }

    #[test]
    fn drain_empties_and_starts_a_fresh_batch() {
        let tracker = ChangeTracker::new();
        tracker.update(None, Some(svc("web", 80)));
        assert_eq!(tracker.drain().len(), 1);
        assert!(tracker.is_empty());

        tracker.update(None, Some(svc("api", 80)));
        assert_eq!(tracker.drain().len(), 1);
    }

    #[test]
    fn independent_services_tracked_separately() {
        let tracker = ChangeTracker::new();
        tracker.update(None, Some(svc("web", 80)));
        tracker.update(None, Some(svc("api", 80)));
        assert_eq!(tracker.drain().len(), 2);
    }
}
