//! Per-session fan-out of events to live listeners

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::events::SessionEvent;

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
struct BusState {
    next_id: u64,
    sessions: HashMap<String, Vec<(u64, Listener)>>,
}

/// Publish/subscribe bus keyed by session id.
///
/// Publishing with no listeners is a no-op. Listeners are invoked outside the
/// lock, so a listener may unsubscribe itself or others while being called.
#[derive(Clone, Default)]
pub struct SessionBus {
    state: Arc<Mutex<BusState>>,
}

impl SessionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Dropping the returned subscription unsubscribes it.
    pub fn subscribe<F>(&self, session_id: &str, listener: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .push((id, Arc::new(listener)));

        Subscription {
            state: Arc::clone(&self.state),
            session_id: session_id.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Subscribe with a channel receiver instead of a callback.
    pub fn subscribe_channel(
        &self,
        session_id: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(session_id, move |event| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    pub fn publish(&self, session_id: &str, event: &SessionEvent) {
        let listeners: Vec<Listener> = match self.state.lock().sessions.get(session_id) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map_or(0, |l| l.len())
    }

    /// Number of sessions with at least one listener
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

/// Registration guard returned by [`SessionBus::subscribe`]
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    state: Arc<Mutex<BusState>>,
    session_id: String,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Remove the listener. Idempotent.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock();
        if let Some(list) = state.sessions.get_mut(&self.session_id) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                state.sessions.remove(&self.session_id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
