//! Session status notifications for other node services.

use std::sync::{Arc, RwLock};

use crate::{NodeId, SessionId};

/// Observes session lifecycle events on one node.
///
/// Callbacks run synchronously on the task that caused the event and must
/// not block.
pub trait SessionStatusListener: Send + Sync + 'static {
    /// The session ended on this node and will not come back.
    fn disconnected(&self, session: &SessionId);

    /// The session finished moving from this node to `node`.
    fn relocated(&self, session: &SessionId, node: NodeId);
}

/// The set of registered [`SessionStatusListener`]s.
#[derive(Default)]
pub struct StatusListeners {
    listeners: RwLock<Vec<Arc<dyn SessionStatusListener>>>,
}

impl StatusListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn SessionStatusListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn SessionStatusListener>> {
        self.listeners
            .read()
            .map(|listeners| listeners.clone())
            .unwrap_or_default()
    }

    pub fn notify_disconnected(&self, session: &SessionId) {
        for listener in self.snapshot() {
            listener.disconnected(session);
        }
    }

    pub fn notify_relocated(&self, session: &SessionId, node: NodeId) {
        for listener in self.snapshot() {
            listener.relocated(session, node);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SessionStatusListener for Recorder {
        fn disconnected(&self, session: &SessionId) {
            self.events.lock().unwrap().push(format!("gone {session}"));
        }

        fn relocated(&self, session: &SessionId, node: NodeId) {
            self.events.lock().unwrap().push(format!("moved {session} {node}"));
        }
    }

    #[test]
    fn test_notify_reaches_every_listener() {
        let listeners = StatusListeners::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        listeners.register(a.clone());
        listeners.register(b.clone());

        let id = SessionId::new(NodeId(1), 1);
        listeners.notify_relocated(&id, NodeId(2));
        listeners.notify_disconnected(&id);

        for r in [a, b] {
            let events = r.events.lock().unwrap();
            assert_eq!(events.len(), 2);
            assert!(events[0].starts_with("moved"));
            assert!(events[0].ends_with("node-2"));
            assert!(events[1].starts_with("gone"));
        }
    }
}
