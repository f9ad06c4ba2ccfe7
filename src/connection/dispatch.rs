use dbus_message_parser::message::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Outcome of a signal callback. An `Err` is logged at the dispatch boundary
/// and never stops the event loop.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A signal callback. Runs synchronously on the task driving the event loop,
/// so it must not block indefinitely or it starves every other subscription.
pub type SignalCallback = Box<dyn FnMut(&Message) -> CallbackResult + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SubscriptionId(u64);

struct SignalHandler {
    id: SubscriptionId,
    interface: String,
    member: String,
    // One lock per subscription: at most one dispatch in flight at a time.
    callback: Arc<Mutex<SignalCallback>>,
}

/// Routing table from object path to signal subscriptions.
#[derive(Default)]
pub(crate) struct DispatchTable {
    next_id: u64,
    signals: HashMap<String, Vec<SignalHandler>>,
}

impl DispatchTable {
    pub(crate) fn add_signal(
        &mut self,
        path: String,
        interface: String,
        member: String,
        callback: SignalCallback,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let handler = SignalHandler {
            id,
            interface,
            member,
            callback: Arc::new(Mutex::new(callback)),
        };
        self.signals.entry(path).or_default().push(handler);
        id
    }

    pub(crate) fn remove_signal(&mut self, id: SubscriptionId) {
        for handlers in self.signals.values_mut() {
            handlers.retain(|handler| handler.id != id);
        }
        self.signals.retain(|_, handlers| !handlers.is_empty());
    }

    /// Callbacks matching a signal frame, cloned out so the table lock is not
    /// held while they run.
    pub(crate) fn matching(
        &self,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Vec<Arc<Mutex<SignalCallback>>> {
        match self.signals.get(path) {
            Some(handlers) => handlers
                .iter()
                .filter(|handler| handler.interface == interface && handler.member == member)
                .map(|handler| handler.callback.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.signals.clear();
    }
}
